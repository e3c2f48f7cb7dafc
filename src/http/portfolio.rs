use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tracing::warn;

use crate::auth::verify_owner_signature;
use crate::indexer::indexed_user_name;
use crate::models::portfolio::{OwnerPortfolioView, PreparedTransaction, PublicPortfolioView};
use crate::portfolio::{PortfolioForm, sanitize_owner_address};
use crate::service::OwnerAccess;
use crate::state::AppState;

use super::HttpError;

pub const OWNER_SIGNATURE_HEADER: &str = "x-portfolio-signature";
pub const OWNER_ISSUED_AT_HEADER: &str = "x-portfolio-issued-at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/portfolios/name/{user_name}", get(get_by_name))
        .route("/portfolios/address/{address}", get(get_by_address))
        .route(
            "/accounts/{address}/portfolio",
            get(get_own)
                .post(prepare_create)
                .put(prepare_update)
                .delete(prepare_delete),
        )
}

async fn get_by_name(
    Path(user_name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PublicPortfolioView>, HttpError> {
    let view = state.portfolios.public_portfolio_by_name(&user_name).await?;
    Ok(Json((*view).clone()))
}

async fn get_by_address(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PublicPortfolioView>, HttpError> {
    let owner = owner_from_path(&address)?;

    // A directory outage only costs us the fast path.
    let indexed = match indexed_user_name(&state.database, &owner).await {
        Ok(name) => name,
        Err(err) => {
            warn!("Owner directory lookup failed for {owner}: {err}");
            None
        }
    };

    let view = state
        .portfolios
        .public_portfolio_by_owner(&owner, indexed)
        .await?;
    Ok(Json((*view).clone()))
}

async fn get_own(
    Path(address): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<OwnerPortfolioView>, HttpError> {
    let owner = owner_from_path(&address)?;
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    let access = owner_access(
        &headers,
        &owner,
        now,
        state.auth.max_signature_age_seconds,
    )?;
    let view = state
        .portfolios
        .owner_portfolio(&owner, access)
        .await?
        .ok_or_else(|| {
            HttpError::new(
                StatusCode::NOT_FOUND,
                format!("No portfolio exists for {owner}"),
            )
        })?;
    Ok(Json(view))
}

async fn prepare_create(
    Path(address): Path<String>,
    State(state): State<AppState>,
    Json(form): Json<PortfolioForm>,
) -> Result<(StatusCode, Json<PreparedTransaction>), HttpError> {
    let owner = owner_from_path(&address)?;
    let prepared = state.portfolios.prepare_create(&owner, form).await?;
    Ok((StatusCode::CREATED, Json(prepared)))
}

async fn prepare_update(
    Path(address): Path<String>,
    State(state): State<AppState>,
    Json(form): Json<PortfolioForm>,
) -> Result<Json<PreparedTransaction>, HttpError> {
    let owner = owner_from_path(&address)?;
    let prepared = state.portfolios.prepare_update(&owner, form).await?;
    Ok(Json(prepared))
}

async fn prepare_delete(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PreparedTransaction>, HttpError> {
    let owner = owner_from_path(&address)?;
    let prepared = state.portfolios.prepare_delete(&owner).await?;
    Ok(Json(prepared))
}

/// Requests without signature headers are anonymous. Requests that carry them
/// must prove ownership or are refused.
fn owner_access(
    headers: &HeaderMap,
    owner: &str,
    now: u64,
    max_age_seconds: u64,
) -> Result<OwnerAccess, HttpError> {
    let header = |name: &str| {
        headers
            .get(name)
            .map(|value| {
                value
                    .to_str()
                    .map_err(|_| HttpError::bad_request(format!("Header {name} must be ASCII")))
            })
            .transpose()
    };

    match (header(OWNER_SIGNATURE_HEADER)?, header(OWNER_ISSUED_AT_HEADER)?) {
        (None, None) => Ok(OwnerAccess::Anonymous),
        (Some(signature), Some(issued_at)) => {
            let issued_at = issued_at.trim().parse::<u64>().map_err(|_| {
                HttpError::bad_request(format!("{OWNER_ISSUED_AT_HEADER} must be unix seconds"))
            })?;
            verify_owner_signature(owner, issued_at, signature, now, max_age_seconds)
                .map_err(|err| HttpError::new(StatusCode::UNAUTHORIZED, err.to_string()))?;
            Ok(OwnerAccess::Verified)
        }
        _ => Err(HttpError::bad_request(format!(
            "{OWNER_SIGNATURE_HEADER} and {OWNER_ISSUED_AT_HEADER} must be sent together"
        ))),
    }
}

fn owner_from_path(address: &str) -> Result<String, HttpError> {
    sanitize_owner_address(address).map_err(|err| HttpError::bad_request(err.to_string()))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use k256::ecdsa::SigningKey;

    use super::*;
    use crate::abi::encode_hex_data;
    use crate::auth::{owner_challenge, personal_message_hash};

    const OWNER: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";
    const NOW: u64 = 1_760_000_000;

    fn signed_headers(owner: &str, issued_at: u64) -> HeaderMap {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = SigningKey::from_slice(&secret).unwrap();
        let digest = personal_message_hash(&owner_challenge(owner, issued_at));
        let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(27 + recovery_id.to_byte());

        let mut headers = HeaderMap::new();
        headers.insert(
            OWNER_SIGNATURE_HEADER,
            HeaderValue::from_str(&encode_hex_data(&bytes)).unwrap(),
        );
        headers.insert(OWNER_ISSUED_AT_HEADER, HeaderValue::from(issued_at));
        headers
    }

    #[test]
    fn missing_headers_mean_anonymous_access() {
        let access = owner_access(&HeaderMap::new(), OWNER, NOW, 300).unwrap();
        assert_eq!(access, OwnerAccess::Anonymous);
    }

    #[test]
    fn valid_owner_signature_is_verified() {
        let headers = signed_headers(OWNER, NOW - 5);
        let access = owner_access(&headers, OWNER, NOW, 300).unwrap();
        assert_eq!(access, OwnerAccess::Verified);
    }

    #[test]
    fn signature_for_another_address_is_unauthorized() {
        let stranger = "0x00000000000000000000000000000000000000aa";
        let headers = signed_headers(stranger, NOW);
        let err = owner_access(&headers, stranger, NOW, 300).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn lone_signature_header_is_a_bad_request() {
        let mut headers = signed_headers(OWNER, NOW);
        headers.remove(OWNER_ISSUED_AT_HEADER);
        let err = owner_access(&headers, OWNER, NOW, 300).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
