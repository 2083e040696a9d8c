//! Transfer configuration loaded via `ortho-config`.
//!
//! [`TransferConfig`] describes how the push protocol reaches a peer: which
//! receiver program to run, how much stream data to buffer before the
//! transport applies backpressure, and the SSH settings used when the peer is
//! a remote host. Values merge defaults, configuration files, and
//! environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default name of the receiver program run on the peer.
pub const DEFAULT_PROGRAM: &str = "ferry-volume";

/// Default capacity of the buffer between stream serialisation and the
/// transport sink.
pub const DEFAULT_STREAM_BUFFER_BYTES: usize = 64 * 1024;

/// Push transport settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FERRY",
    discovery(
        app_name = "ferry",
        env_var = "FERRY_CONFIG_PATH",
        config_file_name = "ferry.toml",
        dotfile_name = ".ferry.toml",
        project_file_name = "ferry.toml"
    )
)]
pub struct TransferConfig {
    /// Receiver program invoked on the peer.
    #[ortho_config(default = DEFAULT_PROGRAM.to_owned())]
    pub program: String,
    /// Bytes buffered ahead of the transport sink. Writes block once the
    /// buffer and the pipe behind it are full.
    #[ortho_config(default = DEFAULT_STREAM_BUFFER_BYTES)]
    pub stream_buffer_bytes: usize,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port on the peer.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Whether to force batch mode so SSH never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_owned(),
            stream_buffer_bytes: DEFAULT_STREAM_BUFFER_BYTES,
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("root"),
            ssh_port: 22,
            ssh_batch_mode: true,
        }
    }
}

/// Errors raised while loading or validating [`TransferConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required value is empty or out of range.
    #[error("invalid {field}: set FERRY_{env_suffix} or add {field} to ferry.toml", env_suffix = field.to_uppercase())]
    InvalidField {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Layered sources could not be merged.
    #[error("transfer configuration parsing failed: {0}")]
    Parse(String),
}

impl TransferConfig {
    /// Ensures every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for empty strings, a zero buffer
    /// size, or a zero port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.program, "program")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        if self.stream_buffer_bytes == 0 {
            return Err(Self::invalid("stream_buffer_bytes"));
        }
        if self.ssh_port == 0 {
            return Err(Self::invalid("ssh_port"));
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("ferry")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(Self::invalid(field));
        }
        Ok(())
    }

    fn invalid(field: &str) -> ConfigError {
        ConfigError::InvalidField {
            field: field.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::EnvGuard;
    use rstest::{fixture, rstest};

    #[fixture]
    fn base_config() -> TransferConfig {
        TransferConfig::default()
    }

    #[rstest]
    fn defaults_validate(base_config: TransferConfig) {
        assert!(base_config.validate().is_ok());
    }

    #[rstest]
    #[case::program("program")]
    #[case::ssh_bin("ssh_bin")]
    #[case::ssh_user("ssh_user")]
    fn blank_strings_are_rejected(base_config: TransferConfig, #[case] field: &str) {
        for invalid in ["", "   "] {
            let mut cfg = base_config.clone();
            match field {
                "program" => cfg.program = invalid.to_owned(),
                "ssh_bin" => cfg.ssh_bin = invalid.to_owned(),
                _ => cfg.ssh_user = invalid.to_owned(),
            }
            let err = cfg.validate().expect_err("blank value should fail");
            assert_eq!(
                err,
                ConfigError::InvalidField {
                    field: field.to_owned()
                }
            );
        }
    }

    #[rstest]
    fn zero_buffer_is_rejected(base_config: TransferConfig) {
        let cfg = TransferConfig {
            stream_buffer_bytes: 0,
            ..base_config
        };
        let err = cfg.validate().expect_err("zero buffer should fail");
        assert!(err.to_string().contains("FERRY_STREAM_BUFFER_BYTES"));
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_var("FERRY_PROGRAM", "/opt/ferry/bin/ferry-volume").await;

        let cfg = TransferConfig::load_without_cli_args().expect("config should load");

        assert_eq!(cfg.program, "/opt/ferry/bin/ferry-volume");
        assert_eq!(cfg.stream_buffer_bytes, DEFAULT_STREAM_BUFFER_BYTES);
    }
}
