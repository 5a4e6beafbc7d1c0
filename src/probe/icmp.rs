use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::Registry;
use tokio::process::Command;

use super::Prober;
use crate::config::Module;
use crate::metrics::{PROBE_ICMP_DURATION_METRIC, record_gauge};

/// Sends a single echo request through the system `ping` executable, which holds the
/// privileges needed for raw ICMP sockets.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    program: String,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self::with_program("ping")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(
        &self,
        target: &str,
        _module: &Module,
        deadline: Duration,
        registry: &Registry,
    ) -> bool {
        if !valid_host(target) {
            tracing::error!(host = target, "Invalid ICMP target");
            return false;
        }

        let wait_seconds = deadline.as_secs().max(1).to_string();
        let start = Instant::now();
        let status = Command::new(&self.program)
            .args(["-c", "1", "-W", &wait_seconds, target])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        let elapsed = start.elapsed().as_secs_f64();

        match status {
            Ok(status) if status.success() => {
                record_gauge(
                    registry,
                    PROBE_ICMP_DURATION_METRIC,
                    "Duration of icmp request by phase",
                    elapsed,
                );
                true
            }
            Ok(status) => {
                tracing::error!(host = target, code = ?status.code(), "No echo reply received");
                false
            }
            Err(e) => {
                tracing::error!(host = target, program = %self.program, error = %e, "Unable to run ping");
                false
            }
        }
    }
}

/// Host names and IP literals only, so the target can never be read as a flag.
fn valid_host(target: &str) -> bool {
    !target.is_empty()
        && !target.starts_with('-')
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
}
