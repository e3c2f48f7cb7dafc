use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};

pub const OWNER_ADDRESS_BYTES: usize = 20;
pub const MAX_USER_NAME_LEN: usize = 64;
pub const MAX_SHORT_FIELD_LEN: usize = 256;
pub const MAX_LONG_FIELD_LEN: usize = 4096;
pub const MAX_AVATAR_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_BG_COLOR: &str = "#f5f5f5";

/// Off-chain half of a portfolio, stored as JSON in content storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortfolioDocument {
    pub name: String,
    pub role: String,
    pub location: String,
    pub email: String,
    pub website: String,
    pub github: String,
    pub linkedin: String,
    pub twitter: String,
    pub education: String,
    pub experience: String,
    pub projects: String,
    pub certifications: String,
    pub about: String,
    pub bg_color: String,
    pub avatar_url: String,
}

impl Default for PortfolioDocument {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: String::new(),
            location: String::new(),
            email: String::new(),
            website: String::new(),
            github: String::new(),
            linkedin: String::new(),
            twitter: String::new(),
            education: String::new(),
            experience: String::new(),
            projects: String::new(),
            certifications: String::new(),
            about: String::new(),
            bg_color: DEFAULT_BG_COLOR.to_string(),
            avatar_url: String::new(),
        }
    }
}

impl PortfolioDocument {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| anyhow!("Malformed portfolio document: {err}"))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| anyhow!("Failed to encode portfolio document: {err}"))
    }
}

/// Request body for creating or replacing a portfolio.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioForm {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub github: String,
    #[serde(default)]
    pub linkedin: String,
    #[serde(default)]
    pub twitter: String,
    #[serde(default)]
    pub education: String,
    #[serde(default)]
    pub experience: String,
    #[serde(default)]
    pub projects: String,
    #[serde(default)]
    pub certifications: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub bg_color: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    /// Base64 encoded image bytes to upload as the new avatar.
    #[serde(default)]
    pub avatar: Option<AvatarUpload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: String,
}

impl AvatarUpload {
    pub fn decode(&self) -> Result<Vec<u8>> {
        if !self.content_type.starts_with("image/") {
            return Err(anyhow!(
                "Avatar content type {} is not an image",
                self.content_type
            ));
        }
        let bytes = BASE64_STANDARD
            .decode(self.data.trim())
            .map_err(|err| anyhow!("Failed to decode avatar as base64: {err}"))?;
        if bytes.is_empty() {
            return Err(anyhow!("Avatar cannot be empty"));
        }
        if bytes.len() > MAX_AVATAR_BYTES {
            return Err(anyhow!("Avatar exceeds {MAX_AVATAR_BYTES} byte limit"));
        }
        Ok(bytes)
    }
}

impl PortfolioForm {
    /// Validates the form and builds the document to upload. The avatar URI is
    /// filled in by the caller once any upload has completed.
    pub fn into_document(self, avatar_url: String) -> Result<PortfolioDocument> {
        let name = canonicalize_user_name(&self.name)?;
        Ok(PortfolioDocument {
            name,
            role: bounded_field("role", &self.role, MAX_SHORT_FIELD_LEN)?,
            location: bounded_field("location", &self.location, MAX_SHORT_FIELD_LEN)?,
            email: bounded_field("email", &self.email, MAX_SHORT_FIELD_LEN)?,
            website: bounded_field("website", &self.website, MAX_SHORT_FIELD_LEN)?,
            github: bounded_field("github", &self.github, MAX_SHORT_FIELD_LEN)?,
            linkedin: bounded_field("linkedin", &self.linkedin, MAX_SHORT_FIELD_LEN)?,
            twitter: bounded_field("twitter", &self.twitter, MAX_SHORT_FIELD_LEN)?,
            education: bounded_field("education", &self.education, MAX_LONG_FIELD_LEN)?,
            experience: bounded_field("experience", &self.experience, MAX_LONG_FIELD_LEN)?,
            projects: bounded_field("projects", &self.projects, MAX_LONG_FIELD_LEN)?,
            certifications: bounded_field(
                "certifications",
                &self.certifications,
                MAX_LONG_FIELD_LEN,
            )?,
            about: bounded_field("about", &self.about, MAX_LONG_FIELD_LEN)?,
            bg_color: normalize_bg_color(self.bg_color.as_deref())?,
            avatar_url,
        })
    }
}

pub fn sanitize_owner_address(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Owner address cannot be empty"));
    }
    let raw = strip_hex_prefix(trimmed);
    if raw.len() != OWNER_ADDRESS_BYTES * 2 {
        return Err(anyhow!(
            "Owner address must be {OWNER_ADDRESS_BYTES} bytes of hex"
        ));
    }
    if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("Owner address contains non-hex characters"));
    }
    Ok(format!("0x{}", raw.to_ascii_lowercase()))
}

pub fn canonicalize_user_name(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Name cannot be empty"));
    }
    if trimmed.chars().count() > MAX_USER_NAME_LEN {
        return Err(anyhow!("Name exceeds {MAX_USER_NAME_LEN} character limit"));
    }
    Ok(trimmed.to_string())
}

pub fn normalize_bg_color(value: Option<&str>) -> Result<String> {
    let Some(color) = value.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(DEFAULT_BG_COLOR.to_string());
    };
    let digits = color
        .strip_prefix('#')
        .ok_or_else(|| anyhow!("Background color must start with '#'"))?;
    if !matches!(digits.len(), 3 | 6) || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("Unsupported background color: {color}"));
    }
    Ok(format!("#{}", digits.to_ascii_lowercase()))
}

fn bounded_field(label: &str, value: &str, limit: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.chars().count() > limit {
        return Err(anyhow!("Field {label} exceeds {limit} character limit"));
    }
    Ok(trimmed.to_string())
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Avatar to display: the stored content URI through the HTTP gateway, or a
/// generated initials avatar when none was uploaded.
pub fn resolve_avatar_url(avatar_uri: &str, name: &str, gateway_url: &str) -> String {
    let trimmed = avatar_uri.trim();
    if !trimmed.is_empty() {
        return crate::storage::gateway_url_for(trimmed, gateway_url);
    }
    format!(
        "https://ui-avatars.com/api/?name={}&size=200&background=1f2937&color=fff&bold=true",
        encode_query_component(name)
    )
}

fn encode_query_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'!' | b'~' | b'*'
            | b'\'' | b'(' | b')' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}
