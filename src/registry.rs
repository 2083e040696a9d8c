//! Durable volume registry.
//!
//! The registry maps volume names to their mount paths and records which
//! pool the service is bound to. It lives in a TOML file at the service's
//! config location. Changes go through [`Registry::update`], which holds an
//! advisory lock on a sibling `.lock` file while it reloads, edits, and
//! rewrites the file, so processes sharing the registry merge their changes.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::file_lock::FileLock;
use crate::pool::{PoolName, VolumeName};

const APP_NAME: &str = "ferry";
const REGISTRY_ENV_VAR: &str = "FERRY_REGISTRY_PATH";
const REGISTRY_FILE_NAME: &str = "volumes.toml";
const REGISTRY_DOTFILE_NAME: &str = ".ferry-volumes.toml";

/// Errors raised while loading or saving the registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is not valid TOML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the TOML does not describe a registry.
    #[error("invalid registry in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Pool a service is bound to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolDescriptor {
    /// Host-unique pool name.
    pub name: PoolName,
    /// Directory the pool mounts filesystems under.
    pub mount_root: Utf8PathBuf,
}

/// Registered volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeRecord {
    /// Where the volume's filesystem is mounted.
    pub mount_path: Utf8PathBuf,
}

/// Name to filesystem mapping persisted by a volume service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Registry {
    /// Pool recorded when the service last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolDescriptor>,
    /// Registered volumes keyed by name.
    #[serde(default)]
    pub volumes: BTreeMap<VolumeName, VolumeRecord>,
}

impl Registry {
    /// Reads the registry at `path`. A missing or empty file yields an empty
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the file cannot be read or does not
    /// describe a registry.
    pub fn load(path: &Utf8Path) -> Result<Self, RegistryError> {
        if !path_exists(path)? {
            return Ok(Self::default());
        }
        let contents = read_file(path)?;
        let value = parse_toml(path, &contents)?;
        if !value.is_table() {
            return Err(RegistryError::InvalidStructure {
                path: path.to_path_buf(),
                message: String::from("registry root is not a table"),
            });
        }
        value
            .try_into()
            .map_err(|err: toml::de::Error| RegistryError::InvalidStructure {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }

    /// Writes the registry to `path`, creating parent directories. The file
    /// is replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when rendering or writing fails.
    pub fn save(&self, path: &Utf8Path) -> Result<(), RegistryError> {
        let (parent, file_name) = split_path(path)?;
        let dir = open_parent(parent)?;

        let rendered = toml::to_string_pretty(self).map_err(|err| RegistryError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let temporary = format!(".{file_name}.{}.tmp", Uuid::new_v4());
        dir.write(&temporary, rendered)
            .map_err(|err| io_error(path, &err))?;
        dir.rename(&temporary, &dir, file_name)
            .map_err(|err| io_error(path, &err))
    }

    /// Reloads the registry at `path` under an exclusive lock, applies
    /// `change`, and saves the result when it differs from what was on disk.
    ///
    /// The lock is held from the reload until the save completes, so
    /// concurrent updates from other processes are never lost.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the lock cannot be taken or the
    /// registry cannot be loaded or saved.
    pub fn update(path: &Utf8Path, change: impl FnOnce(&mut Self)) -> Result<Self, RegistryError> {
        let (parent, file_name) = split_path(path)?;
        let dir = open_parent(parent)?;
        let lock_name = Utf8PathBuf::from(format!("{file_name}.lock"));
        let _lock = FileLock::acquire(&dir, &lock_name)
            .map_err(|err| io_error(&parent.join(&lock_name), &err))?;

        let current = Self::load(path)?;
        let mut updated = current.clone();
        change(&mut updated);
        if updated != current {
            updated.save(path)?;
        }
        Ok(updated)
    }

    /// Looks up a volume.
    #[must_use]
    pub fn get(&self, volume: &VolumeName) -> Option<&VolumeRecord> {
        self.volumes.get(volume)
    }

    /// Adds or replaces a volume entry.
    pub fn register(&mut self, volume: VolumeName, mount_path: Utf8PathBuf) {
        self.volumes.insert(volume, VolumeRecord { mount_path });
    }
}

/// Default registry location found with `ortho-config` discovery: the first
/// existing candidate, else the last candidate in the search order.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidStructure`] when discovery yields no
/// candidates, or [`RegistryError::Io`] when probing a candidate fails.
pub fn default_registry_path() -> Result<Utf8PathBuf, RegistryError> {
    let discovery = ConfigDiscovery::builder(APP_NAME)
        .env_var(REGISTRY_ENV_VAR)
        .config_file_name(REGISTRY_FILE_NAME)
        .dotfile_name(REGISTRY_DOTFILE_NAME)
        .project_file_name(REGISTRY_FILE_NAME)
        .build();
    let candidates = discovery.utf8_candidates();
    for candidate in &candidates {
        if path_exists(candidate)? {
            return Ok(candidate.clone());
        }
    }
    candidates
        .last()
        .cloned()
        .ok_or_else(|| RegistryError::InvalidStructure {
            path: Utf8PathBuf::from(REGISTRY_FILE_NAME),
            message: String::from("no registry location candidates were discovered"),
        })
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), RegistryError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| RegistryError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("registry path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn open_parent(parent: &Utf8Path) -> Result<Dir, RegistryError> {
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn path_exists(path: &Utf8Path) -> Result<bool, RegistryError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(file_name).map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

fn read_file(path: &Utf8Path) -> Result<String, RegistryError> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, RegistryError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }
    toml::from_str(contents).map_err(|err| RegistryError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
