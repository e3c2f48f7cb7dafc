use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use crate::portfolio::sanitize_owner_address;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub indexer: IndexerConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path = std::env::var("PORTFOLIO_API_CONFIG")
            .unwrap_or_else(|_| "config/api.toml".to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("PORTFOLIO_API_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/api.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        assert!(
            !self.database.url.is_empty(),
            "Database URL must be specified"
        );
        assert!(
            self.server.port > 0,
            "Server port must be greater than zero"
        );
        self.chain.ensure_bounds()?;
        self.storage.ensure_bounds()?;
        self.indexer.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        self.auth.ensure_bounds()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        assert!(self.port < 65535, "HTTP port must be below 65535");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Address of the deployed portfolio registry.
    pub contract_address: String,
    pub request_timeout_ms: Option<u64>,
    /// Block explorer base used to build links for relayed transactions.
    pub explorer_url: Option<String>,
    #[serde(default = "ChainConfig::default_log_chunk_size")]
    pub log_chunk_size: u64,
    #[serde(default = "ChainConfig::default_max_lookback_chunks")]
    pub max_lookback_chunks: u32,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(3_000);
        assert!(millis >= 100, "RPC timeout must be at least 100ms");
        assert!(millis <= 60_000, "RPC timeout cannot exceed 60 seconds");
        Duration::from_millis(millis)
    }

    fn ensure_bounds(&mut self) -> Result<()> {
        assert!(!self.rpc_url.is_empty(), "RPC URL must be specified");
        self.contract_address = sanitize_owner_address(&self.contract_address)
            .context("Invalid portfolio contract address")?;
        if self.log_chunk_size == 0 || self.log_chunk_size > 10_000 {
            return Err(anyhow!(
                "Log chunk size must be within 1..=10000, got {}",
                self.log_chunk_size
            ));
        }
        if self.max_lookback_chunks == 0 || self.max_lookback_chunks > 10_000 {
            return Err(anyhow!(
                "Max lookback chunks must be within 1..=10000, got {}",
                self.max_lookback_chunks
            ));
        }
        Ok(())
    }

    const fn default_log_chunk_size() -> u64 {
        1_000
    }

    const fn default_max_lookback_chunks() -> u32 {
        100
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// IPFS HTTP API used for uploads.
    pub api_url: String,
    /// Public HTTP gateway used for downloads and avatar links.
    pub gateway_url: String,
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "StorageConfig::default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(15_000);
        assert!(millis >= 100, "Storage timeout must be at least 100ms");
        assert!(millis <= 120_000, "Storage timeout cannot exceed 2 minutes");
        Duration::from_millis(millis)
    }

    fn ensure_bounds(&self) -> Result<()> {
        assert!(!self.api_url.is_empty(), "IPFS API URL must be specified");
        assert!(
            !self.gateway_url.is_empty(),
            "IPFS gateway URL must be specified"
        );
        assert!(
            self.max_document_bytes >= 1024,
            "Document size limit must be at least 1KiB"
        );
        assert!(
            self.max_document_bytes <= 16 * 1024 * 1024,
            "Document size limit exceeds 16MiB"
        );
        Ok(())
    }

    const fn default_max_document_bytes() -> usize {
        1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u64,
    /// Block the registry was deployed at; scanning starts here.
    #[serde(default)]
    pub start_block: u64,
}

impl IndexerConfig {
    pub fn poll_interval(&self) -> Duration {
        assert!(
            self.poll_interval_ms >= 100,
            "Poll interval must be >= 100ms"
        );
        assert!(
            self.poll_interval_ms <= 60_000,
            "Poll interval must be <= 60 seconds"
        );
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ensure_bounds(&self) -> Result<()> {
        assert!(self.batch_size > 0, "Batch size must be positive");
        assert!(self.batch_size <= 10_000, "Batch size exceeds upper bound");
        assert!(
            self.start_block < 1_000_000_000_000,
            "Start block sanity check failed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub documents_max_capacity: u64,
    pub documents_ttl_seconds: u64,
    pub portfolios_max_capacity: u64,
    pub portfolios_ttl_seconds: u64,
}

impl CacheConfig {
    fn ensure_bounds(&self) -> Result<()> {
        assert!(
            self.documents_max_capacity >= 100,
            "Document cache capacity must be at least 100"
        );
        assert!(
            self.documents_ttl_seconds <= 86_400,
            "Document cache TTL cannot exceed one day"
        );
        assert!(
            self.portfolios_max_capacity >= 100,
            "Portfolio cache capacity must be at least 100"
        );
        assert!(
            self.portfolios_ttl_seconds <= 3_600,
            "Portfolio cache TTL cannot exceed one hour"
        );
        Ok(())
    }
}

/// Owner signature checks for private reads.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "AuthConfig::default_max_signature_age_seconds")]
    pub max_signature_age_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_signature_age_seconds: Self::default_max_signature_age_seconds(),
        }
    }
}

impl AuthConfig {
    fn ensure_bounds(&self) -> Result<()> {
        if self.max_signature_age_seconds == 0 || self.max_signature_age_seconds > 86_400 {
            return Err(anyhow!(
                "Signature age must be within 1..=86400 seconds, got {}",
                self.max_signature_age_seconds
            ));
        }
        Ok(())
    }

    const fn default_max_signature_age_seconds() -> u64 {
        300
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
