use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::abi::{
    self, PortfolioRecord, decode_created_user_name, decode_hex_data, decode_portfolio_record,
    decode_revert_reason, encode_hex_data, owner_topic, portfolio_created_topic, topic_to_address,
};
use crate::service::PortfolioChain;

pub const MAX_LOGS_PER_QUERY: usize = 10_000;

/// Failure of a read against the portfolio registry.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("Portfolio not found")]
    NotFound,
    #[error("Private portfolio")]
    Private,
    #[error("Malformed contract response: {0:#}")]
    Decode(anyhow::Error),
    #[error("RPC call failed: {0:#}")]
    Rpc(anyhow::Error),
}

#[derive(Clone)]
pub struct RpcClient {
    inner: HttpClient,
    timeout: Duration,
    contract_address: String,
}

impl RpcClient {
    pub fn new(endpoint: &str, contract_address: &str, timeout: Duration) -> Result<Self> {
        assert!(!endpoint.is_empty(), "RPC endpoint must be provided");
        assert!(
            !contract_address.is_empty(),
            "Contract address must be provided"
        );
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .with_context(|| format!("Failed to build RPC client for {endpoint}"))?;

        Ok(Self {
            inner: client,
            timeout,
            contract_address: contract_address.to_string(),
        })
    }

    pub fn timeout(&self) -> Duration {
        assert!(
            self.timeout >= Duration::from_millis(100),
            "Timeout invariant broken"
        );
        assert!(
            self.timeout <= Duration::from_secs(60),
            "Timeout exceeds maximum bound"
        );
        self.timeout
    }

    pub async fn fetch_latest_block_number(&self) -> Result<u64> {
        let response: String = self
            .inner
            .request("eth_blockNumber", rpc_params![])
            .await
            .context("RPC call eth_blockNumber failed")?;
        let block_number = parse_quantity(&response)?;
        if block_number >= 1_000_000_000_000 {
            return Err(anyhow!("Node reported implausible block height {block_number}"));
        }
        Ok(block_number)
    }

    pub async fn fetch_chain_id(&self) -> Result<u64> {
        let response: String = self
            .inner
            .request("eth_chainId", rpc_params![])
            .await
            .context("RPC call eth_chainId failed")?;
        let chain_id = parse_quantity(&response)?;
        if chain_id == 0 {
            return Err(anyhow!("Node reported chain id 0"));
        }
        Ok(chain_id)
    }

    /// Read-only call against the registry. `from` sets `msg.sender` for
    /// functions that resolve the caller's own record.
    pub async fn call(&self, from: Option<&str>, data: &[u8]) -> Result<Vec<u8>, ContractError> {
        let mut request = json!({
            "to": self.contract_address,
            "data": encode_hex_data(data),
        });
        if let Some(from) = from {
            request["from"] = json!(from);
        }

        let response: Result<String, ClientError> = self
            .inner
            .request("eth_call", rpc_params![request, "latest"])
            .await;

        match response {
            Ok(hex) => decode_hex_data(&hex).map_err(ContractError::Decode),
            Err(ClientError::Call(object)) => {
                let revert_data = object
                    .data()
                    .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok())
                    .and_then(|hex| decode_hex_data(&hex).ok());
                Err(classify_call_failure(object.message(), revert_data.as_deref()))
            }
            Err(other) => Err(ContractError::Rpc(
                anyhow!(other).context("RPC call eth_call failed"),
            )),
        }
    }

    pub async fn fetch_portfolio_created_logs(
        &self,
        owner: Option<&str>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PortfolioCreatedLog>> {
        assert!(from_block <= to_block, "Log range must be ordered");
        let owner_filter = owner.map(owner_topic).transpose()?;
        let filter = json!({
            "address": self.contract_address,
            "topics": [portfolio_created_topic(), owner_filter],
            "fromBlock": format_quantity(from_block),
            "toBlock": format_quantity(to_block),
        });

        let raw_logs: Vec<RawLog> = self
            .inner
            .request("eth_getLogs", rpc_params![filter])
            .await
            .with_context(|| format!("RPC call eth_getLogs failed for {from_block}..={to_block}"))?;
        decode_created_logs(&raw_logs)
    }

    pub async fn send_raw_transaction(&self, raw_transaction: &str) -> Result<String> {
        let payload = decode_hex_data(raw_transaction)?;
        if payload.is_empty() {
            return Err(anyhow!("Raw transaction cannot be empty"));
        }
        let tx_hash: String = self
            .inner
            .request("eth_sendRawTransaction", rpc_params![encode_hex_data(&payload)])
            .await
            .context("RPC call eth_sendRawTransaction failed")?;
        check_tx_hash(tx_hash)
    }
}

#[async_trait]
impl PortfolioChain for RpcClient {
    async fn my_portfolio(&self, owner: &str) -> Result<PortfolioRecord, ContractError> {
        let output = self
            .call(Some(owner), &abi::encode_get_my_portfolio())
            .await?;
        decode_portfolio_record(&output).map_err(ContractError::Decode)
    }

    async fn portfolio_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<PortfolioRecord, ContractError> {
        let output = self
            .call(None, &abi::encode_get_portfolio_by_username(user_name))
            .await?;
        decode_portfolio_record(&output).map_err(ContractError::Decode)
    }

    async fn latest_block(&self) -> Result<u64> {
        self.fetch_latest_block_number().await
    }

    async fn chain_id(&self) -> Result<u64> {
        self.fetch_chain_id().await
    }

    async fn created_events(
        &self,
        owner: Option<&str>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PortfolioCreatedLog>> {
        self.fetch_portfolio_created_logs(owner, from_block, to_block)
            .await
    }

    async fn send_raw_transaction(&self, raw_transaction: &str) -> Result<String> {
        RpcClient::send_raw_transaction(self, raw_transaction).await
    }

    fn contract_address(&self) -> &str {
        &self.contract_address
    }
}

/// Maps a JSON-RPC call failure onto the registry's known revert reasons.
/// Any revert without a recognizable reason is treated as a missing record.
pub fn classify_call_failure(message: &str, revert_data: Option<&[u8]>) -> ContractError {
    let reason = revert_data.and_then(decode_revert_reason);
    let text = reason.as_deref().unwrap_or(message);

    if text.contains("Private portfolio") || message.contains("Private portfolio") {
        return ContractError::Private;
    }
    if text.contains("Portfolio not found") || message.contains("Portfolio not found") {
        return ContractError::NotFound;
    }
    if message.contains("execution reverted") || reason.is_some() {
        debug!("Treating revert as missing portfolio: {text}");
        return ContractError::NotFound;
    }
    ContractError::Rpc(anyhow!("{message}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioCreatedLog {
    pub owner: String,
    pub user_name: String,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    log_index: Option<String>,
    transaction_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

/// Decodes a log batch. Entries that cannot be decoded are skipped so a
/// single malformed event never blocks the range it sits in.
fn decode_created_logs(raw_logs: &[RawLog]) -> Result<Vec<PortfolioCreatedLog>> {
    if raw_logs.len() > MAX_LOGS_PER_QUERY {
        return Err(anyhow!(
            "Node returned {} logs, above the {MAX_LOGS_PER_QUERY} per query limit",
            raw_logs.len()
        ));
    }

    let mut logs = Vec::with_capacity(raw_logs.len());
    for raw in raw_logs.iter().filter(|raw| !raw.removed) {
        match decode_created_log(raw) {
            Ok(log) => logs.push(log),
            Err(err) => warn!(
                "Skipping undecodable PortfolioCreated log in tx {}: {err:#}",
                raw.transaction_hash.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
    Ok(logs)
}

fn check_tx_hash(tx_hash: String) -> Result<String> {
    let digits = tx_hash.strip_prefix("0x").unwrap_or_default();
    if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("Node returned malformed transaction hash {tx_hash:?}"));
    }
    Ok(tx_hash)
}

fn decode_created_log(raw: &RawLog) -> Result<PortfolioCreatedLog> {
    let owner_topic = raw
        .topics
        .get(1)
        .ok_or_else(|| anyhow!("PortfolioCreated log is missing the owner topic"))?;
    let owner = topic_to_address(owner_topic)?;
    let data = decode_hex_data(&raw.data)?;
    let user_name = decode_created_user_name(&data)?;
    let block_number = raw
        .block_number
        .as_deref()
        .map(parse_quantity)
        .transpose()?
        .ok_or_else(|| anyhow!("PortfolioCreated log is missing a block number"))?;
    let log_index = raw
        .log_index
        .as_deref()
        .map(parse_quantity)
        .transpose()?
        .unwrap_or(0);

    Ok(PortfolioCreatedLog {
        owner,
        user_name,
        block_number,
        log_index,
        tx_hash: raw.transaction_hash.clone().unwrap_or_default(),
    })
}

pub fn parse_quantity(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("Quantity {trimmed} is missing 0x prefix"))?;
    if digits.is_empty() {
        return Err(anyhow!("Quantity {trimmed} has no digits"));
    }
    u64::from_str_radix(digits, 16).map_err(|err| anyhow!("Invalid quantity {trimmed}: {err}"))
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}
