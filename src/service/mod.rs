//! Reconciliation of the on-chain pointer with the off-chain document.
//!
//! Every read follows the same sequence: resolve the record on chain, branch
//! on existence and privacy, download the referenced document and render it.
//! Writes upload the replacement document first and hand back the contract
//! call for the owner's wallet to sign. Calls inside one operation are issued
//! sequentially and are never retried.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::abi::{
    self, PortfolioRecord, encode_create_portfolio, encode_delete_my_portfolio, encode_hex_data,
    encode_update_portfolio_hash,
};
use crate::models::portfolio::{
    OwnerPortfolioView, PortfolioProfileView, PortfolioRecordView, PreparedTransaction,
    PublicPortfolioView, SubmittedTransaction,
};
use crate::portfolio::{PortfolioDocument, PortfolioForm, canonicalize_user_name};
use crate::rpc::{ContractError, PortfolioCreatedLog, format_quantity};
use crate::state::ApiCache;
use crate::storage::ContentStore;

const DOCUMENT_CONTENT_TYPE: &str = "application/json";

/// Chain-facing operations the service needs from the registry.
#[async_trait]
pub trait PortfolioChain: Send + Sync {
    /// `getMyPortfolio()` evaluated with `msg.sender = owner`.
    async fn my_portfolio(&self, owner: &str) -> Result<PortfolioRecord, ContractError>;

    async fn portfolio_by_user_name(&self, user_name: &str)
    -> Result<PortfolioRecord, ContractError>;

    async fn latest_block(&self) -> Result<u64>;

    async fn chain_id(&self) -> Result<u64>;

    async fn created_events(
        &self,
        owner: Option<&str>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PortfolioCreatedLog>>;

    async fn send_raw_transaction(&self, raw_transaction: &str) -> Result<String>;

    fn contract_address(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Private(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("Chain request failed: {0:#}")]
    Chain(anyhow::Error),
    #[error("Content storage request failed: {0:#}")]
    Storage(anyhow::Error),
}

impl ServiceError {
    fn from_contract(err: ContractError, subject: &str) -> Self {
        match err {
            ContractError::NotFound => Self::NotFound(format!("Portfolio not found for {subject}")),
            ContractError::Private => Self::Private("This portfolio is private".to_string()),
            ContractError::Decode(inner) | ContractError::Rpc(inner) => Self::Chain(inner),
        }
    }
}

/// Whether the caller of an owner read has proven control of the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerAccess {
    Verified,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub explorer_url: Option<String>,
    pub log_chunk_size: u64,
    pub max_lookback_chunks: u32,
}

#[derive(Clone)]
pub struct PortfolioService {
    chain: Arc<dyn PortfolioChain>,
    store: Arc<dyn ContentStore>,
    cache: Arc<ApiCache>,
    settings: ServiceSettings,
    chain_id: Arc<OnceCell<u64>>,
}

impl PortfolioService {
    pub fn new(
        chain: Arc<dyn PortfolioChain>,
        store: Arc<dyn ContentStore>,
        cache: Arc<ApiCache>,
        settings: ServiceSettings,
    ) -> Self {
        assert!(settings.log_chunk_size > 0, "Log chunk size must be positive");
        assert!(
            settings.max_lookback_chunks > 0,
            "Lookback chunk count must be positive"
        );
        Self {
            chain,
            store,
            cache,
            settings,
            chain_id: Arc::new(OnceCell::new()),
        }
    }

    /// The caller's own record, or `None` when no portfolio exists.
    pub async fn owner_record(&self, owner: &str) -> Result<Option<PortfolioRecord>, ServiceError> {
        match self.chain.my_portfolio(owner).await {
            Ok(record) if record.exists => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(ContractError::NotFound) => Ok(None),
            Err(err) => Err(ServiceError::from_contract(err, owner)),
        }
    }

    /// The owner's full view. A private portfolio is only rendered for a
    /// caller that has proven control of `owner`.
    pub async fn owner_portfolio(
        &self,
        owner: &str,
        access: OwnerAccess,
    ) -> Result<Option<OwnerPortfolioView>, ServiceError> {
        let Some(record) = self.owner_record(owner).await? else {
            debug!("No portfolio exists for {owner}");
            return Ok(None);
        };
        if record.is_private && access != OwnerAccess::Verified {
            return Err(ServiceError::Private(
                "This portfolio is private; sign the owner challenge to read it".to_string(),
            ));
        }
        let document = self.load_document(&record.ipfs_document_hash).await?;
        let profile = PortfolioProfileView::from_document(&document, self.store.gateway_url());
        Ok(Some(OwnerPortfolioView {
            record: PortfolioRecordView::from(&record),
            document: (*document).clone(),
            profile,
        }))
    }

    pub async fn public_portfolio_by_name(
        &self,
        user_name: &str,
    ) -> Result<Arc<PublicPortfolioView>, ServiceError> {
        let user_name = canonicalize_user_name(user_name)
            .map_err(|err| ServiceError::Invalid(err.to_string()))?;
        if let Some(cached) = self.cache.public_portfolios.get(&user_name).await {
            return Ok(cached);
        }

        let record = self.public_record(&user_name).await?;
        let view = Arc::new(self.render_public(&user_name, &record).await?);
        self.cache
            .public_portfolios
            .insert(user_name, Arc::clone(&view))
            .await;
        Ok(view)
    }

    /// Public view for an owner address. `indexed_name` is the owner directory
    /// entry when one exists; a stale entry falls back to an event scan.
    pub async fn public_portfolio_by_owner(
        &self,
        owner: &str,
        indexed_name: Option<String>,
    ) -> Result<Arc<PublicPortfolioView>, ServiceError> {
        if let Some(user_name) = indexed_name {
            match self.public_owned_by(owner, &user_name).await {
                Err(ServiceError::NotFound(_)) => {
                    debug!("Indexed name {user_name} no longer belongs to {owner}");
                }
                other => return other,
            }
        }

        let user_name = self.resolve_user_name(owner).await?.ok_or_else(|| {
            ServiceError::NotFound("Portfolio not found for this address".to_string())
        })?;
        self.public_owned_by(owner, &user_name).await
    }

    async fn public_owned_by(
        &self,
        owner: &str,
        user_name: &str,
    ) -> Result<Arc<PublicPortfolioView>, ServiceError> {
        let view = self.public_portfolio_by_name(user_name).await?;
        if !view.record.eth_address.eq_ignore_ascii_case(owner) {
            return Err(ServiceError::NotFound(format!(
                "Portfolio {user_name} is not owned by {owner}"
            )));
        }
        Ok(view)
    }

    async fn public_record(&self, user_name: &str) -> Result<PortfolioRecord, ServiceError> {
        let record = self
            .chain
            .portfolio_by_user_name(user_name)
            .await
            .map_err(|err| ServiceError::from_contract(err, user_name))?;
        if !record.exists {
            return Err(ServiceError::NotFound("Portfolio not found".to_string()));
        }
        // The registry is expected to refuse private reads; never rely on it.
        if record.is_private {
            return Err(ServiceError::Private("This portfolio is private".to_string()));
        }
        Ok(record)
    }

    async fn render_public(
        &self,
        user_name: &str,
        record: &PortfolioRecord,
    ) -> Result<PublicPortfolioView, ServiceError> {
        let document = self.load_document(&record.ipfs_document_hash).await?;
        Ok(PublicPortfolioView {
            user_name: user_name.to_string(),
            record: PortfolioRecordView::from(record),
            profile: PortfolioProfileView::from_document(&document, self.store.gateway_url()),
        })
    }

    /// Reverse lookup of an owner's user name from `PortfolioCreated` events,
    /// walking backwards from the chain head one chunk at a time.
    pub async fn resolve_user_name(&self, owner: &str) -> Result<Option<String>, ServiceError> {
        if let Some(cached) = self.cache.owner_names.get(owner).await {
            return Ok(Some(cached));
        }

        let chunk = self.settings.log_chunk_size;
        let mut to_block = self.chain.latest_block().await.map_err(ServiceError::Chain)?;

        for _ in 0..self.settings.max_lookback_chunks {
            let from_block = to_block.saturating_sub(chunk);
            let logs = self
                .chain
                .created_events(Some(owner), from_block, to_block)
                .await
                .map_err(ServiceError::Chain)?;

            if let Some(latest) = logs
                .into_iter()
                .filter(|log| log.owner.eq_ignore_ascii_case(owner))
                .max_by_key(|log| (log.block_number, log.log_index))
            {
                debug!(
                    "Resolved {owner} to {} at block {}",
                    latest.user_name, latest.block_number
                );
                self.cache
                    .owner_names
                    .insert(owner.to_string(), latest.user_name.clone())
                    .await;
                return Ok(Some(latest.user_name));
            }

            if from_block == 0 {
                break;
            }
            to_block = from_block - 1;
        }

        Ok(None)
    }

    pub async fn prepare_create(
        &self,
        owner: &str,
        form: PortfolioForm,
    ) -> Result<PreparedTransaction, ServiceError> {
        if self.owner_record(owner).await?.is_some() {
            return Err(ServiceError::Conflict(
                "Portfolio already exists; update it instead".to_string(),
            ));
        }

        let is_private = form.is_private;
        let avatar = decode_avatar(&form)?;
        let mut document = form
            .into_document(String::new())
            .map_err(|err| ServiceError::Invalid(err.to_string()))?;
        let avatar_uri = self.upload_avatar(avatar).await?;
        document.avatar_url = avatar_uri.clone().unwrap_or_default();
        let document_uri = self.upload_document(&document).await?;

        info!("Prepared portfolio creation for {owner} at {document_uri}");
        self.prepared(
            "create",
            owner,
            encode_create_portfolio(&document.name, &document_uri, is_private),
            Some(document_uri),
            avatar_uri,
        )
        .await
    }

    /// Replaces the whole document. The existing avatar is carried over unless
    /// a new one is supplied.
    pub async fn prepare_update(
        &self,
        owner: &str,
        form: PortfolioForm,
    ) -> Result<PreparedTransaction, ServiceError> {
        let record = self.owner_record(owner).await?.ok_or_else(|| {
            ServiceError::NotFound("No portfolio to update; create one first".to_string())
        })?;
        let existing = self.load_document(&record.ipfs_document_hash).await?;

        let avatar = decode_avatar(&form)?;
        let mut document = form
            .into_document(String::new())
            .map_err(|err| ServiceError::Invalid(err.to_string()))?;
        let uploaded_avatar = self.upload_avatar(avatar).await?;
        document.avatar_url = uploaded_avatar
            .clone()
            .unwrap_or_else(|| existing.avatar_url.clone());

        // The registry keys records by the name they were created with.
        let user_name = if existing.name.trim().is_empty() {
            document.name.clone()
        } else {
            existing.name.clone()
        };

        let document_uri = self.upload_document(&document).await?;
        self.invalidate_public(&user_name).await;

        info!("Prepared portfolio update for {owner} at {document_uri}");
        self.prepared(
            "update",
            owner,
            encode_update_portfolio_hash(&user_name, &document_uri),
            Some(document_uri),
            uploaded_avatar,
        )
        .await
    }

    /// Off-chain content is left in place; only the on-chain record goes.
    pub async fn prepare_delete(&self, owner: &str) -> Result<PreparedTransaction, ServiceError> {
        let record = self
            .owner_record(owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound("No portfolio to delete".to_string()))?;

        if let Some(user_name) = self.cache.owner_names.get(owner).await {
            self.invalidate_public(&user_name).await;
        }
        match self.load_document(&record.ipfs_document_hash).await {
            Ok(document) => self.invalidate_public(&document.name).await,
            Err(err) => debug!("Could not resolve cached name for {owner}: {err}"),
        }
        self.cache.owner_names.invalidate(owner).await;

        self.prepared("delete", owner, encode_delete_my_portfolio(), None, None)
            .await
    }

    pub async fn submit_transaction(
        &self,
        raw_transaction: &str,
    ) -> Result<SubmittedTransaction, ServiceError> {
        if abi::decode_hex_data(raw_transaction).is_err() {
            return Err(ServiceError::Invalid(
                "Raw transaction must be hex encoded".to_string(),
            ));
        }
        let tx_hash = self
            .chain
            .send_raw_transaction(raw_transaction)
            .await
            .map_err(ServiceError::Chain)?;
        let explorer_url = self
            .settings
            .explorer_url
            .as_deref()
            .map(|base| format!("{}/tx/{tx_hash}", base.trim_end_matches('/')));
        info!("Relayed transaction {tx_hash}");
        Ok(SubmittedTransaction {
            tx_hash,
            explorer_url,
        })
    }

    async fn load_document(&self, uri: &str) -> Result<Arc<PortfolioDocument>, ServiceError> {
        if uri.trim().is_empty() {
            return Err(ServiceError::Storage(anyhow::anyhow!(
                "Portfolio record has an empty document pointer"
            )));
        }
        if let Some(cached) = self.cache.documents.get(uri).await {
            return Ok(cached);
        }

        let bytes = self.store.download(uri).await.map_err(|err| {
            warn!("Failed to download portfolio document {uri}: {err:#}");
            ServiceError::Storage(err)
        })?;
        let document = Arc::new(PortfolioDocument::from_json(&bytes).map_err(ServiceError::Storage)?);
        self.cache
            .documents
            .insert(uri.to_string(), Arc::clone(&document))
            .await;
        Ok(document)
    }

    async fn upload_avatar(
        &self,
        avatar: Option<DecodedAvatar>,
    ) -> Result<Option<String>, ServiceError> {
        let Some(avatar) = avatar else {
            return Ok(None);
        };
        let uri = self
            .store
            .upload(&avatar.file_name, &avatar.content_type, avatar.bytes)
            .await
            .map_err(ServiceError::Storage)?;
        Ok(Some(uri))
    }

    async fn invalidate_public(&self, user_name: &str) {
        if let Ok(key) = canonicalize_user_name(user_name) {
            self.cache.public_portfolios.invalidate(&key).await;
        }
    }

    async fn chain_id(&self) -> Result<u64, ServiceError> {
        self.chain_id
            .get_or_try_init(|| self.chain.chain_id())
            .await
            .copied()
            .map_err(ServiceError::Chain)
    }

    async fn upload_document(&self, document: &PortfolioDocument) -> Result<String, ServiceError> {
        let bytes = document.to_json().map_err(ServiceError::Storage)?;
        let file_name = format!("portfolio-{}.json", Utc::now().timestamp_millis());
        self.store
            .upload(&file_name, DOCUMENT_CONTENT_TYPE, bytes)
            .await
            .map_err(ServiceError::Storage)
    }

    async fn prepared(
        &self,
        action: &'static str,
        owner: &str,
        calldata: Vec<u8>,
        document_uri: Option<String>,
        avatar_uri: Option<String>,
    ) -> Result<PreparedTransaction, ServiceError> {
        let chain_id = self.chain_id().await?;
        Ok(PreparedTransaction {
            action,
            chain_id: format_quantity(chain_id),
            from: owner.to_string(),
            to: self.chain.contract_address().to_string(),
            data: encode_hex_data(&calldata),
            document_uri,
            avatar_uri,
        })
    }
}

struct DecodedAvatar {
    file_name: String,
    content_type: String,
    bytes: Vec<u8>,
}

fn decode_avatar(form: &PortfolioForm) -> Result<Option<DecodedAvatar>, ServiceError> {
    let Some(avatar) = &form.avatar else {
        return Ok(None);
    };
    let bytes = avatar
        .decode()
        .map_err(|err| ServiceError::Invalid(err.to_string()))?;
    Ok(Some(DecodedAvatar {
        file_name: avatar.file_name.clone(),
        content_type: avatar.content_type.clone(),
        bytes,
    }))
}

#[cfg(test)]
mod tests;
