pub mod dns;
pub mod http;
pub mod icmp;
pub mod tcp;

use std::fmt::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::Registry;

use crate::config::Module;
use crate::error::ProbeError;
use crate::metrics::{PROBE_DURATION_METRIC, PROBE_SUCCESS_METRIC, register_gauge};

pub use dns::DnsProber;
pub use http::HttpProber;
pub use icmp::IcmpProber;
pub use tcp::TcpProber;

/// A probing capability.
///
/// Attempts one protocol exchange against `target` and reports whether it satisfied the
/// module's success criteria. Diagnostics go into `registry`. A failure of any kind is
/// `false`; implementations should give up once `deadline` has passed, the dispatcher
/// enforces it regardless.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        target: &str,
        module: &Module,
        deadline: Duration,
        registry: &Registry,
    ) -> bool;
}

/// The closed set of probing capabilities a module can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Http,
    Tcp,
    Dns,
    Icmp,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Http => "http",
            Capability::Tcp => "tcp",
            Capability::Dns => "dns",
            Capability::Icmp => "icmp",
        }
    }
}

impl FromStr for Capability {
    type Err = ProbeError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "http" => Ok(Capability::Http),
            "tcp" => Ok(Capability::Tcp),
            "dns" => Ok(Capability::Dns),
            "icmp" => Ok(Capability::Icmp),
            _ => Err(ProbeError::UnknownCapability(tag.to_string())),
        }
    }
}

/// One implementation per [`Capability`].
#[derive(Clone)]
pub struct ProberSet {
    http: Arc<dyn Prober>,
    tcp: Arc<dyn Prober>,
    dns: Arc<dyn Prober>,
    icmp: Arc<dyn Prober>,
}

impl ProberSet {
    pub fn new(
        http: Arc<dyn Prober>,
        tcp: Arc<dyn Prober>,
        dns: Arc<dyn Prober>,
        icmp: Arc<dyn Prober>,
    ) -> Self {
        Self {
            http,
            tcp,
            dns,
            icmp,
        }
    }

    pub fn get(&self, capability: Capability) -> Arc<dyn Prober> {
        match capability {
            Capability::Http => self.http.clone(),
            Capability::Tcp => self.tcp.clone(),
            Capability::Dns => self.dns.clone(),
            Capability::Icmp => self.icmp.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub duration_seconds: f64,
}

/// Runs the prober for `capability` and records `probe_success` and
/// `probe_duration_seconds`.
///
/// The prober runs on its own task so that a timeout or a panic inside it is reported
/// as an unsuccessful probe. Only registering the two gauges can fail.
pub async fn dispatch(
    probers: &ProberSet,
    capability: Capability,
    target: &str,
    module: &Module,
    deadline: Duration,
    registry: &Registry,
) -> Result<ProbeOutcome, ProbeError> {
    let success_gauge = register_gauge(
        registry,
        PROBE_SUCCESS_METRIC,
        "Displays whether or not the probe was a success",
    )
    .map_err(|e| ProbeError::Encoding(e.to_string()))?;
    let duration_gauge = register_gauge(
        registry,
        PROBE_DURATION_METRIC,
        "Returns how long the probe took to complete in seconds",
    )
    .map_err(|e| ProbeError::Encoding(e.to_string()))?;

    let prober = probers.get(capability);
    let task_target = target.to_string();
    let task_module = module.clone();
    let task_registry = registry.clone();

    let start = Instant::now();
    let handle = tokio::spawn(async move {
        prober
            .probe(&task_target, &task_module, deadline, &task_registry)
            .await
    });
    let abort = handle.abort_handle();

    let success = match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(success)) => success,
        Ok(Err(e)) => {
            tracing::error!(prober = capability.as_str(), error = %e, "Prober aborted");
            false
        }
        Err(_) => {
            abort.abort();
            tracing::error!(
                prober = capability.as_str(),
                timeout_seconds = deadline.as_secs_f64(),
                "Probe timed out"
            );
            false
        }
    };
    let duration_seconds = start.elapsed().as_secs_f64();

    duration_gauge.set(duration_seconds);
    if success {
        success_gauge.set(1.0);
        tracing::info!(duration_seconds, "Probe succeeded");
    } else {
        tracing::error!(duration_seconds, "Probe failed");
    }

    Ok(ProbeOutcome {
        success,
        duration_seconds,
    })
}

/// Formats an error together with its chain of sources.
pub(crate) fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, ": {}", src);
        err = src;
    }
    s
}
