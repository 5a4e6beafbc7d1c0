//! Cold start mitigation for serverless deployments.
//!
//! On a freshly started instance the first connection to a target was observed to
//! take much longer than later ones (DNS, TLS handshakes). The first HTTP probe handled
//! by an instance therefore sends one throwaway request to the target before the timed
//! probe runs.
//!
//! The check ("is there a client yet?") and the act ("store one, warm up") are not one
//! critical section. Two concurrent first requests can both see a cold instance, both
//! warm up and both report a cold start; the client stored last is kept. The client is
//! stored before the warm-up request goes out, so later requests see a warm instance
//! even while that request is in flight, and even if it fails.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use reqwest::Client;

use crate::error::ProbeError;
use crate::probe::http::normalize_target;

/// Timeout of the shared warm-up client.
pub const WARMUP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Process wide warm state, shared by every request of an instance.
#[derive(Debug, Default)]
pub struct WarmState {
    client: ArcSwapOption<Client>,
}

impl WarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_warm(&self) -> bool {
        self.client.load().is_some()
    }

    /// Returns whether this invocation was the cold one.
    ///
    /// When cold, issues a GET to `target` bounded by `deadline` and discards the
    /// response. A target without scheme is requested over plain HTTP, like the probe
    /// itself. A transport error or an expired deadline fails the invocation.
    pub async fn mitigate(&self, target: &str, deadline: Duration) -> Result<bool, ProbeError> {
        if self.is_warm() {
            return Ok(false);
        }

        tracing::info!(url = target, "Cold start detected, making an initial request to the target");
        let client = Client::builder()
            .timeout(WARMUP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| ProbeError::WarmupFailed(e.to_string()))?;
        let client = Arc::new(client);
        self.client.store(Some(client.clone()));

        match tokio::time::timeout(deadline, client.get(normalize_target(target)).send()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(ProbeError::WarmupFailed(e.to_string())),
            Err(_) => Err(ProbeError::WarmupFailed(format!(
                "deadline of {:.1}s exceeded",
                deadline.as_secs_f64()
            ))),
        }
    }
}
