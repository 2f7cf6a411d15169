pub mod health;
pub mod pdv;
pub mod profile;

use axum::{extract::DefaultBodyLimit, http::StatusCode, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::Error;
use crate::models::api::ErrorResponse;
use crate::AppState;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a pipeline error onto an HTTP status and body.
pub fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::Invalid(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::FORBIDDEN,
        Error::AlreadyExists => StatusCode::CONFLICT,
        Error::Transient(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::Corrupt | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }

    let message = match err {
        Error::Unauthorized => "access denied".to_string(),
        other => other.to_string(),
    };
    (status, Json(ErrorResponse { error: message }))
}

pub fn build_router(state: AppState, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .route("/v1/profile/{address}", get(profile::get_profile))
        .route("/v1/pdv/{address}", get(pdv::list_pdv))
        .route("/v1/pdv/{address}/{id}", get(pdv::get_pdv))
        .route("/v1/pdv/{address}/{id}/meta", get(pdv::get_pdv_meta))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` fires.
///
/// A server error cancels `shutdown`, taking the jobs down with it.
pub fn start_server(listener: TcpListener, app: Router, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let graceful = shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;
        if let Err(e) = served {
            error!("HTTP server failed: {}", e);
            shutdown.cancel();
        }
    })
}
