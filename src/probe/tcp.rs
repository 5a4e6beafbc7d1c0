use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::Registry;
use tokio::net::TcpStream;
use trust_dns_resolver::TokioAsyncResolver;

use super::{Prober, report};
use crate::config::Module;
use crate::metrics::{PROBE_DNS_LOOKUP_TIME_METRIC, PROBE_IP_PROTOCOL_METRIC, record_gauge};

/// Succeeds once a TCP connection to `host:port` is established.
/// The host is resolved through the configured name servers.
pub struct TcpProber {
    resolver: TokioAsyncResolver,
}

impl TcpProber {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(
        &self,
        target: &str,
        _module: &Module,
        deadline: Duration,
        registry: &Registry,
    ) -> bool {
        let Some((host, port)) = split_host_port(target) else {
            tracing::error!(address = target, "Target is not of the form host:port");
            return false;
        };

        let start = Instant::now();
        let ip = match tokio::time::timeout(deadline, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => match lookup.iter().next() {
                Some(ip) => ip,
                None => {
                    tracing::error!(address = target, "Resolution returned no addresses");
                    return false;
                }
            },
            Ok(Err(e)) => {
                tracing::error!(address = target, error = %report(&e), "Error resolving address");
                return false;
            }
            Err(_) => {
                tracing::error!(address = target, "Timed out resolving address");
                return false;
            }
        };
        record_gauge(
            registry,
            PROBE_DNS_LOOKUP_TIME_METRIC,
            "Returns the time taken for probe dns lookup in seconds",
            start.elapsed().as_secs_f64(),
        );
        record_gauge(
            registry,
            PROBE_IP_PROTOCOL_METRIC,
            "Specifies whether probe ip protocol is IP4 or IP6",
            if ip.is_ipv4() { 4.0 } else { 6.0 },
        );

        let addr = SocketAddr::new(ip, port);
        let remaining = deadline.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                tracing::info!(%addr, "Successfully dialed");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(%addr, error = %e, "Error dialing target");
                false
            }
            Err(_) => {
                tracing::error!(%addr, "Timed out dialing target");
                false
            }
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some((host, port))
    }
}
