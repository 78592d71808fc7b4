//! Read side of the credit ledger for the calling user.

use atelier_core::types::Credits;
use atelier_db::models::credit::TransactionHistoryQuery;
use atelier_pipeline::ledger::HistoryQuery;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub credits: Credits,
}

/// GET /api/v1/credits
pub async fn balance(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<impl IntoResponse> {
    let credits = state.ledger.balance(user.user_id).await?;
    Ok(Json(DataResponse {
        data: BalanceResponse { credits },
    }))
}

/// GET /api/v1/credits/stats
pub async fn stats(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<impl IntoResponse> {
    let stats = state.ledger.stats(user.user_id).await?;
    Ok(Json(DataResponse { data: stats }))
}

/// GET /api/v1/credits/transactions
///
/// Newest first. `pageSize` is clamped to 100; `type` must be a known
/// transaction kind.
pub async fn transactions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<TransactionHistoryQuery>,
) -> AppResult<impl IntoResponse> {
    let query = HistoryQuery::from_params(&params)?;
    let page = state.ledger.history(user.user_id, &query).await?;
    Ok(Json(DataResponse { data: page }))
}
