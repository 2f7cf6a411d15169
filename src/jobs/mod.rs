pub mod chain_tail;
pub mod pdv_ingest;
pub mod rewards_distribution;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `duration`; returns `true` if `shutdown` fired first.
pub(crate) async fn sleep_or_cancelled(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
