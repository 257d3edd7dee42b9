//! Engine configuration.
//!
//! Every timeout and interval is explicit: a run's behavior is fully
//! determined by its inputs, with no process-wide defaults hiding in the
//! engine. Values come from defaults, an optional TOML file, and `VIGIL_*`
//! environment overrides, in that order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Durations serialized as humantime strings ("30s", "1m 30s") in TOML.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Defaults applied to watches built through [`EngineConfig::watch_spec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDefaults {
    /// Deadline for a single log watch.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for WatchDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

/// Polling bounds for the completion signal of a verified operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionDefaults {
    /// Deadline for the completion signal to be observed.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Interval between completion polls.
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for CompletionDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(2),
        }
    }
}

/// SSH transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOptions {
    /// Login user; node ids are used verbatim as hosts when unset.
    #[serde(default)]
    pub user: Option<String>,
    /// Private key passed to ssh with `-i`.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// ssh ConnectTimeout, in whole seconds.
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: None,
            identity_file: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub watch: WatchDefaults,
    #[serde(default)]
    pub completion: CompletionDefaults,
    #[serde(default)]
    pub ssh: SshOptions,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| EngineError::config(format!("{}: {e}", path.display())))
    }

    /// Apply `VIGIL_*` environment overrides on top of this configuration.
    ///
    /// Recognized variables: `VIGIL_WATCH_TIMEOUT`, `VIGIL_COMPLETION_TIMEOUT`,
    /// `VIGIL_COMPLETION_INTERVAL`, `VIGIL_SSH_USER`, `VIGIL_SSH_IDENTITY`,
    /// `VIGIL_SSH_CONNECT_TIMEOUT`. Duration values use humantime syntax.
    pub fn with_env_overrides(mut self) -> Result<Self, EngineError> {
        if let Some(timeout) = env_duration("VIGIL_WATCH_TIMEOUT")? {
            self.watch.timeout = timeout;
        }
        if let Some(timeout) = env_duration("VIGIL_COMPLETION_TIMEOUT")? {
            self.completion.timeout = timeout;
        }
        if let Some(interval) = env_duration("VIGIL_COMPLETION_INTERVAL")? {
            self.completion.interval = interval;
        }
        if let Ok(user) = std::env::var("VIGIL_SSH_USER") {
            self.ssh.user = Some(user);
        }
        if let Ok(identity) = std::env::var("VIGIL_SSH_IDENTITY") {
            self.ssh.identity_file = Some(PathBuf::from(identity));
        }
        if let Some(timeout) = env_duration("VIGIL_SSH_CONNECT_TIMEOUT")? {
            self.ssh.connect_timeout = timeout;
        }
        Ok(self)
    }

    /// Build a watch spec with the configured default timeout.
    pub fn watch_spec(
        &self,
        node: crate::types::NodeId,
        path: impl Into<String>,
        pattern: &str,
    ) -> Result<crate::types::WatchSpec, EngineError> {
        crate::types::WatchSpec::new(node, path, pattern, self.watch.timeout)
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>, EngineError> {
    match std::env::var(name) {
        Ok(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| EngineError::config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
