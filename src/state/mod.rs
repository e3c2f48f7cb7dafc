use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::config::{AuthConfig, CacheConfig};
use crate::models::portfolio::PublicPortfolioView;
use crate::portfolio::PortfolioDocument;
use crate::rpc::RpcClient;
use crate::service::PortfolioService;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub cache: Arc<ApiCache>,
    pub rpc: RpcClient,
    pub portfolios: PortfolioService,
    pub start_time: Instant,
    pub last_indexed_block: Arc<AtomicU64>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(
        database: DatabaseConnection,
        cache: Arc<ApiCache>,
        rpc: RpcClient,
        portfolios: PortfolioService,
        last_indexed_block: Arc<AtomicU64>,
        auth: AuthConfig,
    ) -> Self {
        assert!(
            cache.document_capacity >= 100,
            "Document cache capacity must be configured"
        );
        assert!(
            Arc::strong_count(&last_indexed_block) >= 1,
            "Indexer state must be shared"
        );
        Self {
            database,
            cache,
            rpc,
            portfolios,
            start_time: Instant::now(),
            last_indexed_block,
            auth,
        }
    }
}

pub struct ApiCache {
    /// Documents keyed by content URI. Content addressing makes them immutable.
    pub documents: Cache<String, Arc<PortfolioDocument>>,
    /// Public views keyed by user name.
    pub public_portfolios: Cache<String, Arc<PublicPortfolioView>>,
    /// Owner address to user name, from event scans.
    pub owner_names: Cache<String, String>,
    pub document_capacity: u64,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.documents_max_capacity >= 100,
            "Document cache capacity threshold"
        );
        assert!(
            config.portfolios_max_capacity >= 100,
            "Portfolio cache capacity threshold"
        );

        let documents = Cache::builder()
            .max_capacity(config.documents_max_capacity)
            .time_to_live(Duration::from_secs(config.documents_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.documents_ttl_seconds / 2 + 1))
            .build();

        let public_portfolios = Cache::builder()
            .max_capacity(config.portfolios_max_capacity)
            .time_to_live(Duration::from_secs(config.portfolios_ttl_seconds))
            .build();

        let owner_names = Cache::builder()
            .max_capacity(config.portfolios_max_capacity)
            .time_to_live(Duration::from_secs(config.portfolios_ttl_seconds))
            .build();

        Self {
            documents,
            public_portfolios,
            owner_names,
            document_capacity: config.documents_max_capacity,
        }
    }
}
