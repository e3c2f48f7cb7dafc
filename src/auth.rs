//! Proof that a caller controls an owner address.
//!
//! The wallet signs a short challenge with `personal_sign` (EIP-191). The
//! gateway recovers the signer from the signature and compares it with the
//! address in the request path. Challenges carry their issue time and expire
//! after a configurable window.

use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

use crate::abi::{decode_hex_data, keccak256};
use crate::portfolio::sanitize_owner_address;

const SIGNATURE_LEN: usize = 65;
/// Clock skew tolerated for challenges issued slightly in the future.
const MAX_CLOCK_SKEW_SECONDS: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed owner signature: {0}")]
    Malformed(String),
    #[error("Owner challenge has expired")]
    Expired,
    #[error("Signature does not belong to {0}")]
    WrongSigner(String),
}

/// Text the owner's wallet signs to read a private portfolio.
pub fn owner_challenge(owner: &str, issued_at: u64) -> String {
    format!("dPortfolio owner access\naddress: {owner}\nissued: {issued_at}")
}

/// `keccak256("\x19Ethereum Signed Message:\n" ++ len ++ message)`
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut payload = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    payload.extend_from_slice(message.as_bytes());
    keccak256(&payload)
}

/// Address that produced a 65-byte `r || s || v` signature over `message`.
pub fn recover_signer(message: &str, signature_hex: &str) -> Result<String> {
    let bytes = decode_hex_data(signature_hex)?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(anyhow!(
            "Signature must be {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        ));
    }

    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|err| anyhow!("Invalid signature scalars: {err}"))?;
    let v = bytes[64];
    let parity = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(anyhow!("Unsupported recovery byte {other}")),
    };
    let recovery_id =
        RecoveryId::from_byte(parity).ok_or_else(|| anyhow!("Invalid recovery id {parity}"))?;

    let digest = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|err| anyhow!("Signer recovery failed: {err}"))?;
    Ok(address_of(&key))
}

/// Checks that `signature_hex` is the owner's signature over the challenge
/// issued at `issued_at`, and that the challenge is no older than `max_age`.
pub fn verify_owner_signature(
    owner: &str,
    issued_at: u64,
    signature_hex: &str,
    now: u64,
    max_age_seconds: u64,
) -> Result<(), AuthError> {
    let owner =
        sanitize_owner_address(owner).map_err(|err| AuthError::Malformed(err.to_string()))?;
    if issued_at > now.saturating_add(MAX_CLOCK_SKEW_SECONDS)
        || now.saturating_sub(issued_at) > max_age_seconds
    {
        return Err(AuthError::Expired);
    }

    let signer = recover_signer(&owner_challenge(&owner, issued_at), signature_hex)
        .map_err(|err| AuthError::Malformed(format!("{err:#}")))?;
    if signer != owner {
        return Err(AuthError::WrongSigner(owner));
    }
    Ok(())
}

fn address_of(key: &VerifyingKey) -> String {
    let point = key.as_affine().to_encoded_point(false);
    // Uncompressed SEC1 points start with a 0x04 tag byte.
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}
