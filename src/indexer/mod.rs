use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use sea_orm::EntityTrait;
use sea_orm::IntoActiveModel;
use sea_orm::TransactionTrait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::entities::indexer_checkpoint;
use crate::entities::portfolio_owner;
use crate::entities::prelude::*;
use crate::rpc::{PortfolioCreatedLog, RpcClient};
use crate::state::ApiCache;

const MAX_WINDOWS_PER_TICK: usize = 256;
/// Width of the `portfolio_owners.user_name` column.
const MAX_INDEXED_NAME_LEN: usize = 256;

/// Follows `PortfolioCreated` events into the `portfolio_owners` directory so
/// address lookups don't have to scan the chain backwards.
pub struct OwnerIndexer {
    database: DatabaseConnection,
    rpc: RpcClient,
    config: IndexerConfig,
    contract_address: String,
    last_indexed_block: Arc<AtomicU64>,
    cache: Arc<ApiCache>,
}

impl OwnerIndexer {
    pub fn new(
        database: DatabaseConnection,
        rpc: RpcClient,
        config: IndexerConfig,
        contract_address: String,
        last_indexed_block: Arc<AtomicU64>,
        cache: Arc<ApiCache>,
    ) -> Self {
        assert!(config.batch_size > 0, "Indexer batch size must be positive");
        assert!(
            !contract_address.is_empty(),
            "Indexer needs a contract address"
        );
        assert!(
            Arc::strong_count(&last_indexed_block) >= 1,
            "Indexer state must be shared"
        );
        Self {
            database,
            rpc,
            config,
            contract_address,
            last_indexed_block,
            cache,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting owner indexer for {}", self.contract_address);
        let mut checkpoint = self.load_checkpoint().await?;
        self.last_indexed_block
            .store(checkpoint, AtomicOrdering::SeqCst);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Indexer shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting indexer loop");
                            break;
                        }
                    }
                }
                _ = sleep(self.config.poll_interval()) => {
                    match self.tick(checkpoint).await {
                        Ok(next) => checkpoint = next,
                        Err(err) => warn!("Indexer tick failed at block {checkpoint}: {err:#}"),
                    }
                }
            }
        }

        Ok(())
    }

    async fn tick(&mut self, current: u64) -> Result<u64> {
        let latest = self.rpc.fetch_latest_block_number().await?;
        if latest < current {
            warn!("Chain head {latest} is behind checkpoint {current}; waiting");
            return Ok(current);
        }
        if latest == current {
            debug!("Indexer up to date at block {current}");
            return Ok(current);
        }

        let mut processed = current;
        for (from_block, to_block) in scan_windows(current + 1, latest, self.config.batch_size)
            .into_iter()
            .take(MAX_WINDOWS_PER_TICK)
        {
            let logs = self
                .rpc
                .fetch_portfolio_created_logs(None, from_block, to_block)
                .await?;
            if !logs.is_empty() {
                self.apply_logs(logs).await?;
            }
            self.persist_checkpoint(to_block).await?;
            processed = to_block;
            self.last_indexed_block
                .store(processed, AtomicOrdering::SeqCst);
        }

        Ok(processed)
    }

    async fn apply_logs(&self, logs: Vec<PortfolioCreatedLog>) -> Result<()> {
        let entries = latest_per_owner(indexable(logs));
        if entries.is_empty() {
            return Ok(());
        }
        let mut touched_names = Vec::with_capacity(entries.len() * 2);

        let txn = self.database.begin().await?;
        for log in &entries {
            let created_block = to_i64(log.block_number, "block number")?;
            let log_index = to_i64(log.log_index, "log index")?;
            let existing = PortfolioOwner::find_by_id(log.owner.clone())
                .one(&txn)
                .await?;

            let (mut model, is_new) = match existing {
                Some(record) => {
                    if (record.created_block, record.log_index) >= (created_block, log_index) {
                        continue;
                    }
                    touched_names.push(record.user_name.clone());
                    (record.into_active_model(), false)
                }
                None => (
                    portfolio_owner::ActiveModel {
                        owner_address: Set(log.owner.clone()),
                        ..Default::default()
                    },
                    true,
                ),
            };

            model.user_name = Set(log.user_name.clone());
            model.created_block = Set(created_block);
            model.log_index = Set(log_index);
            model.tx_hash = Set(log.tx_hash.clone());
            model.indexed_at = Set(fixed_now());
            let written = if is_new {
                model.insert(&txn).await.map(|_| ())
            } else {
                model.update(&txn).await.map(|_| ())
            };
            written.with_context(|| format!("Failed to record portfolio owner {}", log.owner))?;
            touched_names.push(log.user_name.clone());
        }
        txn.commit().await?;

        for log in &entries {
            self.cache.owner_names.invalidate(&log.owner).await;
        }
        for name in &touched_names {
            self.cache.public_portfolios.invalidate(name).await;
        }
        info!("Indexed {} portfolio owner(s)", entries.len());
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<u64> {
        let maybe_checkpoint = IndexerCheckpoint::find_by_id(self.contract_address.clone())
            .one(&self.database)
            .await
            .with_context(|| format!("Failed to query checkpoint for {}", self.contract_address))?;

        if let Some(record) = maybe_checkpoint {
            assert!(record.last_block_number >= 0, "Negative checkpoint stored");
            return Ok(record.last_block_number as u64);
        }

        let initial = self.config.start_block.saturating_sub(1);
        self.persist_checkpoint(initial).await?;
        Ok(initial)
    }

    async fn persist_checkpoint(&self, block: u64) -> Result<()> {
        let last_block_number = to_i64(block, "checkpoint block")?;
        let now = fixed_now();
        let existing = IndexerCheckpoint::find_by_id(self.contract_address.clone())
            .one(&self.database)
            .await?;

        let written = match existing {
            Some(model) => {
                let mut checkpoint = model.into_active_model();
                checkpoint.last_block_number = Set(last_block_number);
                checkpoint.updated_at = Set(now);
                checkpoint.update(&self.database).await.map(|_| ())
            }
            None => indexer_checkpoint::ActiveModel {
                contract_address: Set(self.contract_address.clone()),
                last_block_number: Set(last_block_number),
                updated_at: Set(now),
            }
            .insert(&self.database)
            .await
            .map(|_| ()),
        };
        written.with_context(|| format!("Failed to update checkpoint to block {block}"))?;
        Ok(())
    }
}

/// Directory lookup used by address routes before falling back to a scan.
pub async fn indexed_user_name(
    database: &DatabaseConnection,
    owner: &str,
) -> Result<Option<String>, DbErr> {
    let record = PortfolioOwner::find_by_id(owner.to_string())
        .one(database)
        .await?;
    Ok(record.map(|model| model.user_name))
}

/// Inclusive block windows covering `from..=to`.
fn scan_windows(from_block: u64, to_block: u64, batch_size: u64) -> Vec<(u64, u64)> {
    assert!(batch_size > 0, "Batch size must be positive");
    let mut windows = Vec::new();
    let mut start = from_block;
    while start <= to_block {
        let end = start.saturating_add(batch_size - 1).min(to_block);
        windows.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}

/// Drops entries the directory cannot store. The registry accepts any string,
/// so oversized names are possible on chain.
fn indexable(logs: Vec<PortfolioCreatedLog>) -> Vec<PortfolioCreatedLog> {
    logs.into_iter()
        .filter(|log| {
            let fits = log.user_name.chars().count() <= MAX_INDEXED_NAME_LEN;
            if !fits {
                warn!(
                    "Skipping portfolio owner {} at block {}: user name too long",
                    log.owner, log.block_number
                );
            }
            fits
        })
        .collect()
}

/// Keeps only the most recent creation per owner.
fn latest_per_owner(logs: Vec<PortfolioCreatedLog>) -> Vec<PortfolioCreatedLog> {
    let mut latest: HashMap<String, PortfolioCreatedLog> = HashMap::new();
    for log in logs {
        match latest.get(&log.owner) {
            Some(seen) if (seen.block_number, seen.log_index) >= (log.block_number, log.log_index) => {}
            _ => {
                latest.insert(log.owner.clone(), log);
            }
        }
    }
    let mut entries: Vec<_> = latest.into_values().collect();
    entries.sort_by_key(|log| (log.block_number, log.log_index));
    entries
}

fn to_i64(value: u64, label: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{label} {value} overflows i64"))
}

fn fixed_now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}
