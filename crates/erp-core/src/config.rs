use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ErpError, ErpResult};

/// Top-level service configuration (loaded from erp.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpConfig {
    pub daemon: DaemonConfig,
    pub hsm: HsmConfig,
    pub blob_store: BlobStoreConfig,
    pub seeder: SeederConfig,
}

impl ErpConfig {
    /// Reject combinations the runtime cannot work with.
    pub fn validate(&self) -> ErpResult<()> {
        if self.hsm.max_session_count == 0 {
            return Err(ErpError::Configuration(
                "hsm.max_session_count must be at least 1".into(),
            ));
        }
        if self.hsm.connect_attempts == 0 {
            return Err(ErpError::Configuration(
                "hsm.connect_attempts must be at least 1".into(),
            ));
        }
        self.seeder.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address for admin, VAU, and health endpoints
    pub listen: String,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".into(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HsmBackend {
    Mock,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    pub backend: HsmBackend,
    /// Upper bound of concurrently open sessions (default: 5)
    pub max_session_count: usize,
    /// How long `acquire` waits for a free session (default: 5000 ms)
    pub acquire_timeout_ms: u64,
    /// Connect attempts per acquisition before giving up (default: 2)
    pub connect_attempts: u32,
    /// Device-side idle timeout; keep-alive runs at a quarter of it (default: 900 s)
    pub idle_timeout_secs: u64,
    /// Regular TEE token refresh interval (default: 1500 s)
    pub tee_token_refresh_secs: u64,
    /// Refresh interval after a failed update (default: 10 s)
    pub tee_token_retry_secs: u64,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            backend: HsmBackend::Mock,
            max_session_count: 5,
            acquire_timeout_ms: 5000,
            connect_attempts: 2,
            idle_timeout_secs: 900,
            tee_token_refresh_secs: 1500,
            tee_token_retry_secs: 10,
        }
    }
}

impl HsmConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tee_token_refresh(&self) -> Duration {
        Duration::from_secs(self.tee_token_refresh_secs)
    }

    pub fn tee_token_retry(&self) -> Duration {
        Duration::from_secs(self.tee_token_retry_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// `:memory:`, a `.json` file, or a RocksDB directory
    pub path: PathBuf,
    /// Build/release tag of the running process (default: crate version)
    pub release: String,
    /// Periodic cache rebuild interval; disabled when unset
    pub refresh_interval_secs: Option<u64>,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/erp/blobs.json"),
            release: env!("CARGO_PKG_VERSION").into(),
            refresh_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeederConfig {
    /// Bytes fetched from the HSM per refill (default: 320)
    pub block_size: usize,
    /// Bytes handed out per seed (default: 32)
    pub seed_bytes: usize,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            block_size: 320,
            seed_bytes: 32,
        }
    }
}

impl SeederConfig {
    pub fn validate(&self) -> ErpResult<()> {
        if self.seed_bytes == 0 || self.block_size < self.seed_bytes {
            return Err(ErpError::Configuration(format!(
                "seeder block size {} cannot hold seeds of {} bytes",
                self.block_size, self.seed_bytes
            )));
        }
        if self.block_size % self.seed_bytes != 0 {
            return Err(ErpError::Configuration(format!(
                "seeder block size {} is not a multiple of seed size {}",
                self.block_size, self.seed_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
listen = "0.0.0.0:8443"
log_level = "debug"
log_format = "json"

[hsm]
backend = "mock"
max_session_count = 8
acquire_timeout_ms = 250
connect_attempts = 3
idle_timeout_secs = 60

[blob_store]
path = "/tmp/blobs.json"
release = "1.12.0"
refresh_interval_secs = 30

[seeder]
block_size = 640
seed_bytes = 64
"#;
        let config: ErpConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.listen, "0.0.0.0:8443");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.hsm.backend, HsmBackend::Mock);
        assert_eq!(config.hsm.max_session_count, 8);
        assert_eq!(config.hsm.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.hsm.connect_attempts, 3);
        assert_eq!(config.hsm.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.hsm.tee_token_retry_secs, 10);
        assert_eq!(config.blob_store.release, "1.12.0");
        assert_eq!(config.blob_store.refresh_interval_secs, Some(30));
        assert_eq!(config.seeder.block_size, 640);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: ErpConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.hsm.backend, HsmBackend::Mock);
        assert_eq!(config.hsm.max_session_count, 5);
        assert_eq!(config.hsm.connect_attempts, 2);
        assert_eq!(config.seeder.block_size, 320);
        assert_eq!(config.seeder.seed_bytes, 32);
        assert_eq!(config.blob_store.release, env!("CARGO_PKG_VERSION"));
        assert!(config.blob_store.refresh_interval_secs.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_production_backend_parses() {
        let config: ErpConfig = toml::from_str("[hsm]\nbackend = \"production\"").unwrap();
        assert_eq!(config.hsm.backend, HsmBackend::Production);
    }

    #[test]
    fn test_seeder_block_must_be_multiple_of_seed() {
        let seeder = SeederConfig {
            block_size: 100,
            seed_bytes: 32,
        };
        assert!(matches!(
            seeder.validate(),
            Err(ErpError::Configuration(_))
        ));

        let seeder = SeederConfig {
            block_size: 16,
            seed_bytes: 32,
        };
        assert!(seeder.validate().is_err());
    }

    #[test]
    fn test_zero_sessions_rejected() {
        let mut config = ErpConfig::default();
        config.hsm.max_session_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erp.toml");
        let mut config = ErpConfig::default();
        config.hsm.max_session_count = 3;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded: ErpConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.hsm.max_session_count, 3);
        assert_eq!(loaded.blob_store.path, config.blob_store.path);
    }
}
