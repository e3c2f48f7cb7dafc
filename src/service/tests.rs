use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

use super::*;
use crate::abi::{CREATE_PORTFOLIO, DELETE_MY_PORTFOLIO, UPDATE_PORTFOLIO_HASH, selector};
use crate::config::CacheConfig;
use crate::portfolio::AvatarUpload;

const OWNER: &str = "0x00000000000000000000000000000000000000aa";
const STRANGER: &str = "0x00000000000000000000000000000000000000bb";
const CONTRACT: &str = "0x00000000000000000000000000000000000000cc";
const AMOY_CHAIN_ID: u64 = 80_002;

#[derive(Default)]
struct FakeChain {
    by_owner: Mutex<HashMap<String, PortfolioRecord>>,
    by_name: Mutex<HashMap<String, PortfolioRecord>>,
    private_reverts: bool,
    logs: Vec<PortfolioCreatedLog>,
    head: u64,
    log_queries: AtomicUsize,
    chain_id_queries: AtomicUsize,
    sent: Mutex<Vec<String>>,
}

impl FakeChain {
    fn with_portfolio(user_name: &str, uri: &str, is_private: bool) -> Self {
        let record = record(uri, is_private);
        let chain = Self::default();
        chain
            .by_owner
            .lock()
            .unwrap()
            .insert(OWNER.to_string(), record.clone());
        chain
            .by_name
            .lock()
            .unwrap()
            .insert(user_name.to_string(), record);
        chain
    }
}

#[async_trait]
impl PortfolioChain for FakeChain {
    async fn my_portfolio(&self, owner: &str) -> Result<PortfolioRecord, ContractError> {
        self.by_owner
            .lock()
            .unwrap()
            .get(owner)
            .cloned()
            .ok_or(ContractError::NotFound)
    }

    async fn portfolio_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<PortfolioRecord, ContractError> {
        let record = self
            .by_name
            .lock()
            .unwrap()
            .get(user_name)
            .cloned()
            .ok_or(ContractError::NotFound)?;
        if record.is_private && self.private_reverts {
            return Err(ContractError::Private);
        }
        Ok(record)
    }

    async fn latest_block(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn chain_id(&self) -> Result<u64> {
        self.chain_id_queries.fetch_add(1, Ordering::SeqCst);
        Ok(AMOY_CHAIN_ID)
    }

    async fn created_events(
        &self,
        owner: Option<&str>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PortfolioCreatedLog>> {
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .logs
            .iter()
            .filter(|log| owner.is_none_or(|o| o == log.owner))
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn send_raw_transaction(&self, raw_transaction: &str) -> Result<String> {
        self.sent.lock().unwrap().push(raw_transaction.to_string());
        Ok("0xhash".to_string())
    }

    fn contract_address(&self) -> &str {
        CONTRACT
    }
}

#[derive(Default)]
struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<(String, String)>>,
    downloads: AtomicUsize,
    fail_downloads: bool,
}

impl MemoryStore {
    fn with_document(uri: &str, document: &PortfolioDocument) -> Self {
        let store = Self::default();
        store
            .blobs
            .lock()
            .unwrap()
            .insert(uri.to_string(), document.to_json().unwrap());
        store
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn upload(&self, file_name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((file_name.to_string(), content_type.to_string()));
        let uri = format!("ipfs://Qm{}/{file_name}", uploads.len());
        self.blobs.lock().unwrap().insert(uri.clone(), bytes);
        Ok(uri)
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_downloads {
            return Err(anyhow!("gateway timeout"));
        }
        self.blobs
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("{uri} not pinned"))
    }

    fn gateway_url(&self) -> &str {
        "https://ipfs.io"
    }
}

fn record(uri: &str, is_private: bool) -> PortfolioRecord {
    PortfolioRecord {
        eth_address: OWNER.to_string(),
        ipfs_document_hash: uri.to_string(),
        is_private,
        exists: true,
        created_at: 1_700_000_000,
        last_updated: 1_700_000_000,
    }
}

fn document(name: &str) -> PortfolioDocument {
    PortfolioDocument {
        name: name.to_string(),
        role: "Engineer".to_string(),
        projects: "Compiler, Kernel".to_string(),
        avatar_url: "ipfs://QmOldAvatar".to_string(),
        ..PortfolioDocument::default()
    }
}

fn form(name: &str) -> PortfolioForm {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "role": "Engineer",
        "isPrivate": false,
    }))
    .unwrap()
}

fn png_avatar() -> AvatarUpload {
    AvatarUpload {
        file_name: "ada.png".to_string(),
        content_type: "image/png".to_string(),
        data: BASE64_STANDARD.encode([0x89, 0x50, 0x4e, 0x47]),
    }
}

fn cache() -> Arc<ApiCache> {
    Arc::new(ApiCache::new(&CacheConfig {
        documents_max_capacity: 100,
        documents_ttl_seconds: 60,
        portfolios_max_capacity: 100,
        portfolios_ttl_seconds: 60,
    }))
}

fn service(chain: Arc<FakeChain>, store: Arc<MemoryStore>) -> PortfolioService {
    PortfolioService::new(
        chain,
        store,
        cache(),
        ServiceSettings {
            explorer_url: Some("https://amoy.polygonscan.com/".to_string()),
            log_chunk_size: 1_000,
            max_lookback_chunks: 100,
        },
    )
}

fn created_log(owner: &str, user_name: &str, block_number: u64) -> PortfolioCreatedLog {
    PortfolioCreatedLog {
        owner: owner.to_string(),
        user_name: user_name.to_string(),
        block_number,
        log_index: 0,
        tx_hash: format!("0x{block_number:x}"),
    }
}

#[tokio::test]
async fn owner_portfolio_renders_document() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, Arc::clone(&store));

    let view = service
        .owner_portfolio(OWNER, OwnerAccess::Anonymous)
        .await
        .unwrap()
        .expect("portfolio exists");
    assert_eq!(view.document.name, "ada");
    assert_eq!(view.profile.projects_list, vec!["Compiler", "Kernel"]);
    assert_eq!(view.profile.avatar_url, "https://ipfs.io/ipfs/QmOldAvatar");

    service.owner_portfolio(OWNER, OwnerAccess::Anonymous).await.unwrap();
    assert_eq!(store.downloads.load(Ordering::SeqCst), 1, "document cached by URI");
}

#[tokio::test]
async fn missing_or_cleared_record_never_downloads() {
    let chain = Arc::new(FakeChain::default());
    let mut cleared = record("ipfs://QmStale", false);
    cleared.exists = false;
    chain
        .by_owner
        .lock()
        .unwrap()
        .insert(STRANGER.to_string(), cleared);
    let store = Arc::new(MemoryStore::default());
    let service = service(chain, Arc::clone(&store));

    for owner in [OWNER, STRANGER] {
        let view = service
            .owner_portfolio(owner, OwnerAccess::Anonymous)
            .await
            .unwrap();
        assert!(view.is_none());
    }
    assert_eq!(store.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn private_portfolio_is_refused_without_download() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", true));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, Arc::clone(&store));

    let err = service.public_portfolio_by_name("ada").await.unwrap_err();
    assert!(matches!(err, ServiceError::Private(_)));
    assert_eq!(store.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn private_owner_view_requires_verified_caller() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", true));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, Arc::clone(&store));

    let err = service
        .owner_portfolio(OWNER, OwnerAccess::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Private(_)));
    assert_eq!(store.downloads.load(Ordering::SeqCst), 0);

    let view = service
        .owner_portfolio(OWNER, OwnerAccess::Verified)
        .await
        .unwrap()
        .expect("owner sees private portfolio");
    assert!(view.record.is_private);
    assert_eq!(view.document.role, "Engineer");
}

#[tokio::test]
async fn private_revert_from_registry_maps_to_private() {
    let mut chain = FakeChain::with_portfolio("ada", "ipfs://QmDoc", true);
    chain.private_reverts = true;
    let service = service(Arc::new(chain), Arc::new(MemoryStore::default()));

    let err = service.public_portfolio_by_name("ada").await.unwrap_err();
    assert!(matches!(err, ServiceError::Private(_)));
}

#[tokio::test]
async fn download_failure_is_a_storage_error() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore {
        fail_downloads: true,
        ..MemoryStore::default()
    });
    let service = service(chain, store);

    let err = service.public_portfolio_by_name("ada").await.unwrap_err();
    assert!(matches!(err, ServiceError::Storage(_)));
}

#[tokio::test]
async fn reverse_lookup_walks_back_in_chunks() {
    let mut chain = FakeChain::with_portfolio("ada", "ipfs://QmDoc", false);
    chain.head = 5_500;
    chain.logs = vec![created_log(OWNER, "ada", 1_200)];
    let chain = Arc::new(chain);
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(Arc::clone(&chain), store);

    let view = service.public_portfolio_by_owner(OWNER, None).await.unwrap();
    assert_eq!(view.user_name, "ada");
    // [4500,5500] [3499,4499] [2498,3498] [1497,2497] [496,1496]
    assert_eq!(chain.log_queries.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn reverse_lookup_prefers_latest_event() {
    let mut chain = FakeChain::with_portfolio("ada-v2", "ipfs://QmDoc", false);
    chain.head = 900;
    chain.logs = vec![
        created_log(OWNER, "ada", 100),
        created_log(OWNER, "ada-v2", 800),
    ];
    let service = service(
        Arc::new(chain),
        Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada-v2"))),
    );

    assert_eq!(
        service.resolve_user_name(OWNER).await.unwrap().as_deref(),
        Some("ada-v2")
    );
}

#[tokio::test]
async fn reverse_lookup_stops_at_lookback_bound() {
    let mut chain = FakeChain::default();
    chain.head = 1_000_000;
    let chain = Arc::new(chain);
    let service = service(Arc::clone(&chain), Arc::new(MemoryStore::default()));

    let err = service.public_portfolio_by_owner(OWNER, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert_eq!(chain.log_queries.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn stale_indexed_name_falls_back_to_scan() {
    let mut chain = FakeChain::with_portfolio("ada", "ipfs://QmDoc", false);
    let mut foreign = record("ipfs://QmOther", false);
    foreign.eth_address = STRANGER.to_string();
    chain
        .by_name
        .lock()
        .unwrap()
        .insert("taken".to_string(), foreign);
    chain.head = 10;
    chain.logs = vec![created_log(OWNER, "ada", 3)];
    let chain = Arc::new(chain);
    let store = MemoryStore::with_document("ipfs://QmDoc", &document("ada"));
    store
        .blobs
        .lock()
        .unwrap()
        .insert("ipfs://QmOther".to_string(), document("taken").to_json().unwrap());
    let service = service(Arc::clone(&chain), Arc::new(store));

    let view = service
        .public_portfolio_by_owner(OWNER, Some("taken".to_string()))
        .await
        .unwrap();
    assert_eq!(view.user_name, "ada");
    assert_eq!(chain.log_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_uploads_document_once_and_encodes_call() {
    let chain = Arc::new(FakeChain::default());
    let store = Arc::new(MemoryStore::default());
    let service = service(chain, Arc::clone(&store));

    let prepared = service.prepare_create(OWNER, form("ada")).await.unwrap();
    assert_eq!(store.upload_count(), 1);
    assert_eq!(prepared.action, "create");
    assert_eq!(prepared.chain_id, "0x13882");
    assert_eq!(prepared.to, CONTRACT);
    assert_eq!(prepared.from, OWNER);
    assert!(prepared.avatar_uri.is_none());

    let data = abi::decode_hex_data(&prepared.data).unwrap();
    assert_eq!(&data[..4], &selector(CREATE_PORTFOLIO));

    let (file_name, content_type) = store.uploads.lock().unwrap()[0].clone();
    assert!(file_name.starts_with("portfolio-") && file_name.ends_with(".json"));
    assert_eq!(content_type, "application/json");

    let uri = prepared.document_uri.expect("document uri");
    let stored = store.blobs.lock().unwrap().get(&uri).cloned().unwrap();
    let document = PortfolioDocument::from_json(&stored).unwrap();
    assert_eq!(document.name, "ada");
    assert_eq!(document.avatar_url, "");
}

#[tokio::test]
async fn create_with_avatar_uploads_avatar_first() {
    let chain = Arc::new(FakeChain::default());
    let store = Arc::new(MemoryStore::default());
    let service = service(chain, Arc::clone(&store));

    let mut with_avatar = form("ada");
    with_avatar.avatar = Some(png_avatar());

    let prepared = service.prepare_create(OWNER, with_avatar).await.unwrap();
    assert_eq!(store.upload_count(), 2);
    assert_eq!(store.uploads.lock().unwrap()[0].0, "ada.png");

    let avatar_uri = prepared.avatar_uri.expect("avatar uploaded");
    let stored = store
        .blobs
        .lock()
        .unwrap()
        .get(prepared.document_uri.as_ref().unwrap())
        .cloned()
        .unwrap();
    assert_eq!(PortfolioDocument::from_json(&stored).unwrap().avatar_url, avatar_uri);
}

#[tokio::test]
async fn create_is_refused_when_portfolio_exists() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore::default());
    let service = service(chain, Arc::clone(&store));

    let err = service.prepare_create(OWNER, form("ada")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(store.upload_count(), 0);
}

#[tokio::test]
async fn invalid_form_is_rejected_before_upload() {
    let service_store = Arc::new(MemoryStore::default());
    let service = service(Arc::new(FakeChain::default()), Arc::clone(&service_store));

    let err = service.prepare_create(OWNER, form("   ")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));

    let mut with_avatar = form("   ");
    with_avatar.avatar = Some(png_avatar());
    let err = service.prepare_create(OWNER, with_avatar).await.unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    assert_eq!(service_store.upload_count(), 0);
}

#[tokio::test]
async fn invalid_update_form_pins_nothing() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, Arc::clone(&store));

    let mut with_avatar = form("ada");
    with_avatar.bg_color = Some("teal".to_string());
    with_avatar.avatar = Some(png_avatar());
    let err = service.prepare_update(OWNER, with_avatar).await.unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    assert_eq!(store.upload_count(), 0);
}

#[tokio::test]
async fn chain_id_is_fetched_once_per_service() {
    let chain = Arc::new(FakeChain::default());
    let service = service(Arc::clone(&chain), Arc::new(MemoryStore::default()));

    for name in ["ada", "bob"] {
        let prepared = service.prepare_create(OWNER, form(name)).await.unwrap();
        assert_eq!(prepared.chain_id, "0x13882");
    }
    assert_eq!(chain.chain_id_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_replaces_document_and_keeps_avatar() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, Arc::clone(&store));

    let prepared = service.prepare_update(OWNER, form("Ada L.")).await.unwrap();
    assert_eq!(prepared.action, "update");
    assert_eq!(store.upload_count(), 1);

    let data = abi::decode_hex_data(&prepared.data).unwrap();
    assert_eq!(&data[..4], &selector(UPDATE_PORTFOLIO_HASH));
    let expected = abi::encode_update_portfolio_hash("ada", prepared.document_uri.as_ref().unwrap());
    assert_eq!(data, expected, "registry key stays the original name");

    let stored = store
        .blobs
        .lock()
        .unwrap()
        .get(prepared.document_uri.as_ref().unwrap())
        .cloned()
        .unwrap();
    let replaced = PortfolioDocument::from_json(&stored).unwrap();
    assert_eq!(replaced.name, "Ada L.");
    assert_eq!(replaced.avatar_url, "ipfs://QmOldAvatar");
    assert_eq!(replaced.projects, "", "content is replaced, not merged");
}

#[tokio::test]
async fn update_and_delete_require_existing_portfolio() {
    let store = Arc::new(MemoryStore::default());
    let service = service(Arc::new(FakeChain::default()), Arc::clone(&store));

    assert!(matches!(
        service.prepare_update(OWNER, form("ada")).await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
    assert!(matches!(
        service.prepare_delete(OWNER).await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
    assert_eq!(store.upload_count(), 0);
}

#[tokio::test]
async fn delete_encodes_selector_only() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let service = service(chain, Arc::new(MemoryStore::default()));

    let prepared = service.prepare_delete(OWNER).await.unwrap();
    assert_eq!(prepared.action, "delete");
    assert_eq!(prepared.chain_id, "0x13882");
    assert_eq!(prepared.data, encode_hex_data(&selector(DELETE_MY_PORTFOLIO)));
    assert!(prepared.document_uri.is_none());
}

#[tokio::test]
async fn delete_evicts_cached_public_view() {
    let chain = Arc::new(FakeChain::with_portfolio("ada", "ipfs://QmDoc", false));
    let store = Arc::new(MemoryStore::with_document("ipfs://QmDoc", &document("ada")));
    let service = service(chain, store);

    service.public_portfolio_by_name("ada").await.unwrap();
    assert!(service.cache.public_portfolios.get("ada").await.is_some());

    service.prepare_delete(OWNER).await.unwrap();
    assert!(service.cache.public_portfolios.get("ada").await.is_none());
}

#[tokio::test]
async fn submit_relays_and_links_explorer() {
    let chain = Arc::new(FakeChain::default());
    let service = service(Arc::clone(&chain), Arc::new(MemoryStore::default()));

    let submitted = service.submit_transaction("0xf86b01").await.unwrap();
    assert_eq!(submitted.tx_hash, "0xhash");
    assert_eq!(
        submitted.explorer_url.as_deref(),
        Some("https://amoy.polygonscan.com/tx/0xhash")
    );
    assert_eq!(chain.sent.lock().unwrap().as_slice(), ["0xf86b01"]);

    assert!(matches!(
        service.submit_transaction("not-hex").await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
}
