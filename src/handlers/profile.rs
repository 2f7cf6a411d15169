use axum::{
    extract::{Path, State},
    Json,
};
use tracing::debug;

use super::{api_error, ApiError};
use crate::models::Profile;
use crate::AppState;

/// GET /v1/profile/{address}
///
/// Served through the profile cache; 404 when the address has no profile.
pub async fn get_profile(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    debug!(address = %address, "Fetching profile");
    state.profiles.get(&address).await.map(Json).map_err(api_error)
}
