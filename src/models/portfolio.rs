use serde::Serialize;

use crate::abi::PortfolioRecord;
use crate::portfolio::{PortfolioDocument, resolve_avatar_url, split_list};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioRecordView {
    pub eth_address: String,
    pub ipfs_document_hash: String,
    pub is_private: bool,
    pub created_at: u64,
    pub last_updated: u64,
}

impl From<&PortfolioRecord> for PortfolioRecordView {
    fn from(record: &PortfolioRecord) -> Self {
        Self {
            eth_address: record.eth_address.clone(),
            ipfs_document_hash: record.ipfs_document_hash.clone(),
            is_private: record.is_private,
            created_at: record.created_at,
            last_updated: record.last_updated,
        }
    }
}

/// Render-ready portfolio content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioProfileView {
    pub name: String,
    pub role: String,
    pub location: String,
    pub email: String,
    pub website: String,
    pub github: String,
    pub linkedin: String,
    pub twitter: String,
    pub about: String,
    pub bg_color: String,
    pub avatar_url: String,
    pub education_list: Vec<String>,
    pub experience_list: Vec<String>,
    pub projects_list: Vec<String>,
    pub certifications_list: Vec<String>,
}

impl PortfolioProfileView {
    pub fn from_document(document: &PortfolioDocument, gateway_url: &str) -> Self {
        Self {
            name: document.name.clone(),
            role: document.role.clone(),
            location: document.location.clone(),
            email: document.email.clone(),
            website: document.website.clone(),
            github: document.github.clone(),
            linkedin: document.linkedin.clone(),
            twitter: document.twitter.clone(),
            about: document.about.clone(),
            bg_color: document.bg_color.clone(),
            avatar_url: resolve_avatar_url(&document.avatar_url, &document.name, gateway_url),
            education_list: split_list(&document.education),
            experience_list: split_list(&document.experience),
            projects_list: split_list(&document.projects),
            certifications_list: split_list(&document.certifications),
        }
    }
}

/// What the owner sees: raw document for editing plus the rendered profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerPortfolioView {
    pub record: PortfolioRecordView,
    pub document: PortfolioDocument,
    pub profile: PortfolioProfileView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPortfolioView {
    pub user_name: String,
    pub record: PortfolioRecordView,
    pub profile: PortfolioProfileView,
}

/// Unsigned contract call for the owner's wallet to sign and broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedTransaction {
    pub action: &'static str,
    /// EIP-155 chain id as a hex quantity, as wallets expect it.
    pub chain_id: String,
    pub from: String,
    pub to: String,
    pub data: String,
    pub document_uri: Option<String>,
    pub avatar_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedTransaction {
    pub tx_hash: String,
    pub explorer_url: Option<String>,
}
