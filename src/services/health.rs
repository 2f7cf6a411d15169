//! Dependency health probes, run in parallel with a per-probe deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use tracing::warn;

use crate::error::Result;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type Probe = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    /// Probe name to `"ok"` or the failure
    pub checks: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct HealthChecker {
    probes: Vec<(String, Probe)>,
    timeout: Option<Duration>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn probe<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.probes
            .push((name.into(), Box::new(move || Box::pin(f()))));
        self
    }

    pub async fn check(&self) -> HealthReport {
        let timeout = self.timeout.unwrap_or(PROBE_TIMEOUT);
        let results = join_all(self.probes.iter().map(|(name, probe)| async move {
            let outcome = match tokio::time::timeout(timeout, probe()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timed out".to_string()),
            };
            (name.clone(), outcome)
        }))
        .await;

        let mut healthy = true;
        let mut checks = BTreeMap::new();
        for (name, outcome) in results {
            match outcome {
                Ok(()) => {
                    checks.insert(name, "ok".to_string());
                }
                Err(e) => {
                    warn!(probe = %name, error = %e, "Health probe failed");
                    healthy = false;
                    checks.insert(name, e);
                }
            }
        }
        HealthReport { healthy, checks }
    }
}
