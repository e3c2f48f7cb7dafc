use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::config::StorageConfig;

pub const IPFS_SCHEME: &str = "ipfs://";

/// Opaque blob store addressed by the URIs it hands back on upload.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upload(&self, file_name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String>;

    async fn download(&self, uri: &str) -> Result<Vec<u8>>;

    fn gateway_url(&self) -> &str;
}

#[derive(Clone)]
pub struct IpfsStore {
    client: Client,
    api_url: String,
    gateway_url: String,
    max_download_bytes: usize,
}

impl IpfsStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        assert!(!config.api_url.is_empty(), "IPFS API URL must be provided");
        assert!(
            !config.gateway_url.is_empty(),
            "IPFS gateway URL must be provided"
        );
        let timeout = config.request_timeout();
        assert!(
            timeout >= Duration::from_millis(100),
            "Storage timeout below 100ms is unsafe"
        );

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build IPFS HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            max_download_bytes: config.max_document_bytes,
        })
    }
}

#[async_trait]
impl ContentStore for IpfsStore {
    async fn upload(&self, file_name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String> {
        assert!(!file_name.is_empty(), "Upload file name must be provided");
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .with_context(|| format!("Invalid content type {content_type}"))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/api/v0/add?pin=true", self.api_url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("IPFS upload of {file_name} failed"))?
            .error_for_status()
            .with_context(|| format!("IPFS rejected upload of {file_name}"))?;

        let added: AddResponse = response
            .json()
            .await
            .context("Failed to decode IPFS add response")?;
        if added.hash.is_empty() {
            return Err(anyhow!("IPFS returned empty content hash for {file_name}"));
        }

        debug!("Uploaded {file_name} ({size} bytes) as {}", added.hash);
        Ok(format!("{IPFS_SCHEME}{}", added.hash))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let path = content_path(uri)?;
        let url = format!("{}/ipfs/{path}", self.gateway_url);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("IPFS download of {uri} failed"))?
            .error_for_status()
            .with_context(|| format!("IPFS gateway rejected {uri}"))?;

        if let Some(length) = response.content_length() {
            if length > self.max_download_bytes as u64 {
                return Err(anyhow!(
                    "Content {uri} is {length} bytes, above {} byte limit",
                    self.max_download_bytes
                ));
            }
        }

        // Chunked responses carry no length, so the cap is enforced while reading.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed to read body of {uri}"))?
        {
            if body.len() + chunk.len() > self.max_download_bytes {
                return Err(anyhow!(
                    "Content {uri} exceeds {} byte limit",
                    self.max_download_bytes
                ));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn gateway_url(&self) -> &str {
        &self.gateway_url
    }
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Extracts `<cid>[/path]` from `ipfs://`, `/ipfs/` or bare CID forms.
pub fn content_path(uri: &str) -> Result<&str> {
    let trimmed = uri.trim();
    let path = trimmed
        .strip_prefix(IPFS_SCHEME)
        .or_else(|| trimmed.strip_prefix("/ipfs/"))
        .unwrap_or(trimmed)
        .trim_start_matches('/');
    if path.is_empty() {
        return Err(anyhow!("Content URI {uri} has no content identifier"));
    }
    if path.contains("://") || path.contains("..") || path.chars().any(char::is_whitespace) {
        return Err(anyhow!("Unsupported content URI {uri}"));
    }
    Ok(path)
}

pub fn gateway_url_for(uri: &str, gateway_url: &str) -> String {
    if uri.starts_with("https://") || uri.starts_with("http://") {
        return uri.to_string();
    }
    match content_path(uri) {
        Ok(path) => format!("{}/ipfs/{path}", gateway_url.trim_end_matches('/')),
        Err(_) => uri.to_string(),
    }
}
