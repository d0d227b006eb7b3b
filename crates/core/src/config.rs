//! Agent configuration (config.toml in the agent home directory)

use std::path::{Path, PathBuf};

use crate::chunker::ChunkConfig;
use crate::error::SyncError;

/// Name of the config file inside the agent home
pub const CONFIG_FILE: &str = "config.toml";

/// Name of the ignore file at the sync root (itself synchronized)
pub const SYNCIGNORE_FILE: &str = ".syncignore";

/// esync agent configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory that is kept in sync
    pub sync_folder: PathBuf,
    /// Base URL of the metadata server
    pub server_url: String,
    /// Bearer token issued at registration
    pub auth_token: String,
    /// Machine name used in conflict file names
    pub machine_name: String,

    /// Content-defined chunking parameters
    pub cdc: ChunkConfig,

    /// Number of transfer worker threads
    pub worker_count: usize,
    /// Retry attempts per retryable failure
    pub max_retries: u32,
    /// Backoff cap in seconds
    pub retry_max_delay_secs: u64,
    /// Interval between full scans in seconds
    pub scan_interval_secs: u64,
    /// Watcher debounce window in milliseconds
    pub debounce_ms: u64,
    /// Quiet period after the last watcher event before emission
    pub settle_ms: u64,
    /// Per-request connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-request read timeout in seconds
    pub read_timeout_secs: u64,

    /// Extra ignore patterns (gitignore-style), in addition to .syncignore
    pub ignore_patterns: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sync_folder: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("EsyncFolder"),
            server_url: String::new(),
            auth_token: String::new(),
            machine_name: default_machine_name(),
            cdc: ChunkConfig::default(),
            worker_count: 4,
            max_retries: 5,
            retry_max_delay_secs: 60,
            scan_interval_secs: 300,
            debounce_ms: 250,
            settle_ms: 3000,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            ignore_patterns: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Agent home directory (`$ESYNC_HOME` or `~/.esync`)
    #[must_use]
    pub fn home_dir() -> PathBuf {
        if let Ok(home) = std::env::var("ESYNC_HOME") {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".esync")
    }

    /// Load config from the given agent home.
    ///
    /// # Errors
    /// Returns `SyncError::Config` if the file is missing or unparsable.
    pub fn load(home: &Path) -> Result<Self, SyncError> {
        let path = home.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path).map_err(|_| {
            SyncError::Config(format!("not initialized: {} missing", path.display()))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write config to the given agent home, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, home: &Path) -> Result<(), SyncError> {
        std::fs::create_dir_all(home)
            .map_err(|e| SyncError::Config(format!("cannot create {}: {e}", home.display())))?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(home.join(CONFIG_FILE), content)
            .map_err(|e| SyncError::Config(format!("cannot write config: {e}")))?;
        Ok(())
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.server_url.is_empty() {
            return Err(SyncError::Config("server_url is not set".into()));
        }
        if self.worker_count == 0 {
            return Err(SyncError::Config("worker_count must be at least 1".into()));
        }
        if self.cdc.min_size == 0 || self.cdc.min_size > self.cdc.avg_size
            || self.cdc.avg_size > self.cdc.max_size
        {
            return Err(SyncError::Config(
                "cdc sizes must satisfy 0 < min <= avg <= max".into(),
            ));
        }
        Ok(())
    }
}

/// Hostname-derived machine name, restricted to `[A-Za-z0-9_-]`
#[must_use]
pub fn default_machine_name() -> String {
    sanitize_machine_name(&hostname())
}

/// Sanitize a machine name to `[A-Za-z0-9_-]{3,32}` for conflict file names
#[must_use]
pub fn sanitize_machine_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    while name.len() < 3 {
        name.push('0');
    }
    name
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into the buffer
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "machine".to_string()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "machine".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.scan_interval_secs, 300);
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.settle_ms, 3000);
        assert_eq!(config.cdc.min_size, 1024 * 1024);
        assert_eq!(config.cdc.avg_size, 4 * 1024 * 1024);
        assert_eq!(config.cdc.max_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
server_url = "https://sync.example.com"
auth_token = "tok"
worker_count = 2

[cdc]
min_size = 1024
avg_size = 4096
max_size = 8192
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server_url, "https://sync.example.com");
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.cdc.avg_size, 4096);
        // Unset keys fall back to defaults
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let home = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.server_url = "http://localhost:8080".to_string();
        config.auth_token = "secret".to_string();
        config.save(home.path()).unwrap();

        let loaded = AgentConfig::load(home.path()).unwrap();
        assert_eq!(loaded.server_url, config.server_url);
        assert_eq!(loaded.auth_token, config.auth_token);
    }

    #[test]
    fn test_load_missing_is_config_error() {
        let home = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(home.path()).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_sanitize_machine_name() {
        assert_eq!(sanitize_machine_name("laptop-01"), "laptop-01");
        assert_eq!(sanitize_machine_name("bad name!@#"), "badname");
        assert_eq!(sanitize_machine_name("a"), "a00");
        let long = "x".repeat(64);
        assert_eq!(sanitize_machine_name(&long).len(), 32);
    }
}
