use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ssdp: SsdpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

/// Expiration and scheduling knobs for the per-host caches
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_dhcp_expiration")]
    pub dhcp_expiration_secs: u32,
    #[serde(default = "default_ssdp_expiration")]
    pub ssdp_expiration_secs: u32,
    #[serde(default = "default_flow_expiration")]
    pub flow_expiration_secs: u32,
    /// DNS answers with a shorter TTL are kept this long
    #[serde(default = "default_dns_min_ttl")]
    pub dns_min_ttl_secs: u32,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_match_interval")]
    pub match_interval_secs: u64,
    #[serde(default = "default_host_inactive_after")]
    pub host_inactive_after_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsdpConfig {
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_description_bytes")]
    pub max_description_bytes: usize,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/etc/device-ident/DeviceProfiles.json")
}

fn default_dhcp_expiration() -> u32 {
    86_400
}

fn default_ssdp_expiration() -> u32 {
    3_600
}

fn default_flow_expiration() -> u32 {
    7_200
}

fn default_dns_min_ttl() -> u32 {
    60
}

fn default_prune_interval() -> u64 {
    300
}

fn default_match_interval() -> u64 {
    60
}

fn default_host_inactive_after() -> u64 {
    604_800
}

fn default_report_interval() -> u64 {
    3_600
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/device-ident/hosts.db")
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_max_description_bytes() -> usize {
    65_536
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dhcp_expiration_secs: default_dhcp_expiration(),
            ssdp_expiration_secs: default_ssdp_expiration(),
            flow_expiration_secs: default_flow_expiration(),
            dns_min_ttl_secs: default_dns_min_ttl(),
            prune_interval_secs: default_prune_interval(),
            match_interval_secs: default_match_interval(),
            host_inactive_after_secs: default_host_inactive_after(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            max_description_bytes: default_max_description_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.flow_expiration_secs, 7_200);
        assert_eq!(config.cache.report_interval_secs, 3_600);
        assert_eq!(config.api.listen, "[::]:8054");
        assert_eq!(config.ssdp.max_description_bytes, 65_536);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [catalog]
            path = "/tmp/profiles.json"

            [cache]
            dns_min_ttl_secs = 120
            prune_interval_secs = 30
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.catalog.path, PathBuf::from("/tmp/profiles.json"));
        assert_eq!(config.cache.dns_min_ttl_secs, 120);
        assert_eq!(config.cache.prune_interval_secs, 30);
        assert_eq!(config.cache.match_interval_secs, 60);
        assert_eq!(config.store.db_path, PathBuf::from("/var/lib/device-ident/hosts.db"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load("/nonexistent/identd.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
