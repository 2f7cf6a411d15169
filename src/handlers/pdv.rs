//! Read-side PDV endpoints.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};

use super::{api_error, ApiError};
use crate::error::Error;
use crate::models::api::{PdvListQuery, PdvListResponse};
use crate::models::PdvMeta;
use crate::services::blob_store::MAX_LIST_LIMIT;
use crate::AppState;

const DEFAULT_LIST_LIMIT: u64 = 100;

/// GET /v1/pdv/{address}?from=&limit=
///
/// Stored ids newest first. `limit` defaults to 100 and may not exceed 1000.
pub async fn list_pdv(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<PdvListQuery>,
) -> Result<Json<PdvListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit > MAX_LIST_LIMIT as u64 {
        return Err(api_error(Error::invalid(format!(
            "limit must not exceed {}",
            MAX_LIST_LIMIT
        ))));
    }
    let from = usize::try_from(query.from).map_err(|_| api_error(Error::invalid("from out of range")))?;

    let ids = state
        .blobs
        .list(&address, from, limit as usize)
        .await
        .map_err(api_error)?;
    Ok(Json(PdvListResponse { ids }))
}

/// GET /v1/pdv/{address}/{id}
///
/// The decrypted payload exactly as submitted.
pub async fn get_pdv(
    State(state): State<AppState>,
    Path((address, id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state.blobs.read(&address, id).await.map_err(api_error)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], data))
}

/// GET /v1/pdv/{address}/{id}/meta
pub async fn get_pdv_meta(
    State(state): State<AppState>,
    Path((address, id)): Path<(String, u64)>,
) -> Result<Json<PdvMeta>, ApiError> {
    state
        .index
        .get_pdv_meta(&address, id)
        .await
        .map(Json)
        .map_err(api_error)
}
