use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::models::portfolio::SubmittedTransaction;
use crate::state::AppState;

use super::HttpError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(submit_transaction))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTransactionRequest {
    /// Signed transaction bytes, 0x-prefixed hex.
    raw_transaction: String,
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(payload): Json<SubmitTransactionRequest>,
) -> Result<(StatusCode, Json<SubmittedTransaction>), HttpError> {
    if payload.raw_transaction.trim().is_empty() {
        return Err(HttpError::bad_request("rawTransaction must not be empty"));
    }
    let submitted = state
        .portfolios
        .submit_transaction(&payload.raw_transaction)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}
