//! Serialises environment mutation across unit tests.

use std::env;
use std::ffi::OsString;

use tokio::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Holds the environment lock and restores the variable's previous value on
/// drop.
pub struct EnvGuard {
    key: String,
    previous: Option<OsString>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets `key` while holding the global lock.
    pub async fn set_var(key: &str, value: &str) -> Self {
        let guard = ENV_LOCK.lock().await;
        let previous = env::var_os(key);
        // SAFETY: callers hold ENV_LOCK, so no other test touches the
        // environment concurrently.
        unsafe { env::set_var(key, value) };
        Self {
            key: key.to_owned(),
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: the lock is still held until `_guard` drops after this.
        match &self.previous {
            Some(value) => unsafe { env::set_var(&self.key, value) },
            None => unsafe { env::remove_var(&self.key) },
        }
    }
}
