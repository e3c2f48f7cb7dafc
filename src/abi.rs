//! Solidity ABI encoding for the portfolio registry contract.
//!
//! Only the handful of shapes the contract actually uses are supported:
//! dynamic strings, booleans, addresses and `uint256` values that fit in a
//! `u64`. Decoders bounds-check every offset and never panic on hostile input.

use anyhow::{Result, anyhow};
use sha3::{Digest, Keccak256};

pub const WORD: usize = 32;
pub const SELECTOR_LEN: usize = 4;
pub const MAX_DECODED_STRING_LEN: usize = 64 * 1024;

pub const GET_MY_PORTFOLIO: &str = "getMyPortfolio()";
pub const GET_PORTFOLIO_BY_USERNAME: &str = "getPortfolioByUsername(string)";
pub const CREATE_PORTFOLIO: &str = "createPortfolio(string,string,bool)";
pub const UPDATE_PORTFOLIO_HASH: &str = "updatePortfolioHash(string,string)";
pub const DELETE_MY_PORTFOLIO: &str = "deleteMyPortfolio()";
pub const PORTFOLIO_CREATED_EVENT: &str = "PortfolioCreated(address,string)";
const REVERT_ERROR: &str = "Error(string)";

/// On-chain half of a portfolio, as returned by the registry view functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioRecord {
    pub eth_address: String,
    pub ipfs_document_hash: String,
    pub is_private: bool,
    pub exists: bool,
    pub created_at: u64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Token<'a> {
    Str(&'a str),
    Bool(bool),
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn selector(signature: &str) -> [u8; SELECTOR_LEN] {
    assert!(!signature.is_empty(), "Function signature must be provided");
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; SELECTOR_LEN];
    out.copy_from_slice(&hash[..SELECTOR_LEN]);
    out
}

pub fn encode_call(signature: &str, tokens: &[Token<'_>]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend(encode_tokens(tokens));
    out
}

fn encode_tokens(tokens: &[Token<'_>]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Bool(value) => head.extend_from_slice(&uint_word(u64::from(*value))),
            Token::Str(value) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                tail.extend_from_slice(&uint_word(value.len() as u64));
                tail.extend_from_slice(value.as_bytes());
                let padding = (WORD - value.len() % WORD) % WORD;
                tail.extend(std::iter::repeat_n(0u8, padding));
            }
        }
    }

    head.extend(tail);
    head
}

fn uint_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn encode_get_my_portfolio() -> Vec<u8> {
    encode_call(GET_MY_PORTFOLIO, &[])
}

pub fn encode_get_portfolio_by_username(user_name: &str) -> Vec<u8> {
    encode_call(GET_PORTFOLIO_BY_USERNAME, &[Token::Str(user_name)])
}

pub fn encode_create_portfolio(user_name: &str, document_uri: &str, is_private: bool) -> Vec<u8> {
    encode_call(
        CREATE_PORTFOLIO,
        &[
            Token::Str(user_name),
            Token::Str(document_uri),
            Token::Bool(is_private),
        ],
    )
}

pub fn encode_update_portfolio_hash(user_name: &str, document_uri: &str) -> Vec<u8> {
    encode_call(
        UPDATE_PORTFOLIO_HASH,
        &[Token::Str(user_name), Token::Str(document_uri)],
    )
}

pub fn encode_delete_my_portfolio() -> Vec<u8> {
    encode_call(DELETE_MY_PORTFOLIO, &[])
}

/// Decodes the `(address,string,bool,bool,uint256,uint256)` struct returned
/// by `getMyPortfolio` and `getPortfolioByUsername`.
pub fn decode_portfolio_record(data: &[u8]) -> Result<PortfolioRecord> {
    let base = read_offset(data, 0)?;
    let eth_address = read_address(data, base)?;
    let string_offset = read_offset(data, base + WORD)?;
    let ipfs_document_hash = read_string(data, base + string_offset)?;
    let is_private = read_bool(data, base + 2 * WORD)?;
    let exists = read_bool(data, base + 3 * WORD)?;
    let created_at = read_u64(data, base + 4 * WORD)?;
    let last_updated = read_u64(data, base + 5 * WORD)?;

    Ok(PortfolioRecord {
        eth_address,
        ipfs_document_hash,
        is_private,
        exists,
        created_at,
        last_updated,
    })
}

/// Extracts the message of a Solidity `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let revert_selector = selector(REVERT_ERROR);
    if data.len() < SELECTOR_LEN || data[..SELECTOR_LEN] != revert_selector {
        return None;
    }
    decode_single_string(&data[SELECTOR_LEN..]).ok()
}

pub fn portfolio_created_topic() -> String {
    format!("0x{}", hex::encode(keccak256(PORTFOLIO_CREATED_EVENT.as_bytes())))
}

/// Left-pads a 20-byte address into an indexed event topic.
pub fn owner_topic(address: &str) -> Result<String> {
    let raw = address.trim_start_matches("0x").trim_start_matches("0X");
    let bytes = hex::decode(raw).map_err(|err| anyhow!("Invalid owner address: {err}"))?;
    if bytes.len() != 20 {
        return Err(anyhow!("Owner address must be 20 bytes, got {}", bytes.len()));
    }
    Ok(format!("0x{}{}", "0".repeat(24), hex::encode(bytes)))
}

pub fn topic_to_address(topic: &str) -> Result<String> {
    let raw = topic.trim_start_matches("0x");
    let bytes = hex::decode(raw).map_err(|err| anyhow!("Invalid topic encoding: {err}"))?;
    if bytes.len() != WORD {
        return Err(anyhow!("Topic must be 32 bytes, got {}", bytes.len()));
    }
    read_address(&bytes, 0)
}

/// Decodes the non-indexed `userName` of a `PortfolioCreated` log.
pub fn decode_created_user_name(data: &[u8]) -> Result<String> {
    decode_single_string(data)
}

fn decode_single_string(data: &[u8]) -> Result<String> {
    let offset = read_offset(data, 0)?;
    read_string(data, offset)
}

pub fn decode_hex_data(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    let raw = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(raw).map_err(|err| anyhow!("Invalid hex payload: {err}"))
}

pub fn encode_hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn read_word(data: &[u8], offset: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(WORD)
        .ok_or_else(|| anyhow!("ABI offset overflow at {offset}"))?;
    data.get(offset..end)
        .ok_or_else(|| anyhow!("ABI data truncated: need {end} bytes, have {}", data.len()))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let word = read_word(data, offset)?;
    if word[..WORD - 8].iter().any(|byte| *byte != 0) {
        return Err(anyhow!("uint256 at offset {offset} exceeds u64 range"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(buf))
}

fn read_offset(data: &[u8], offset: usize) -> Result<usize> {
    let value = read_u64(data, offset)?;
    let value = usize::try_from(value).map_err(|_| anyhow!("ABI offset {value} overflows usize"))?;
    if value > data.len() {
        return Err(anyhow!("ABI offset {value} points past end of data"));
    }
    Ok(value)
}

fn read_bool(data: &[u8], offset: usize) -> Result<bool> {
    match read_u64(data, offset)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(anyhow!("Invalid bool value {other} at offset {offset}")),
    }
}

fn read_address(data: &[u8], offset: usize) -> Result<String> {
    let word = read_word(data, offset)?;
    if word[..12].iter().any(|byte| *byte != 0) {
        return Err(anyhow!("Address at offset {offset} has dirty high bytes"));
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

fn read_string(data: &[u8], offset: usize) -> Result<String> {
    let len = read_u64(data, offset)?;
    let len = usize::try_from(len).map_err(|_| anyhow!("String length {len} overflows usize"))?;
    if len > MAX_DECODED_STRING_LEN {
        return Err(anyhow!(
            "String length {len} exceeds {MAX_DECODED_STRING_LEN} byte limit"
        ));
    }
    let start = offset + WORD;
    let bytes = data
        .get(start..start + len)
        .ok_or_else(|| anyhow!("String body truncated at offset {start}"))?;
    String::from_utf8(bytes.to_vec()).map_err(|err| anyhow!("String is not UTF-8: {err}"))
}
