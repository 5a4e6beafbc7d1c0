use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};

/// Default invocation-wide deadline.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_file: String,
    pub listen_addr: String,
    pub port: u16,
    pub probe_timeout: Duration,
    pub dns_hosts: Vec<String>,
}

/// Load the process settings from environment variables.
/// `CONFIG_FILE` points at the probe module file, which is read again on every invocation.
/// `LISTEN_ADDR` and `PORT` control the listener, `PROBE_TIMEOUT_SECONDS` the invocation
/// deadline and `DNS_HOSTS` the name servers used by the DNS prober.
pub fn load_app_config() -> Result<AppConfig, String> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yml".to_string());
    let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());

    let port = match env::var("PORT") {
        Ok(port) => port
            .parse()
            .map_err(|_| format!("Invalid PORT \"{port}\""))?,
        Err(_) => 8080,
    };

    let probe_timeout = match env::var("PROBE_TIMEOUT_SECONDS") {
        Ok(secs) => secs
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .ok_or_else(|| format!("Invalid PROBE_TIMEOUT_SECONDS \"{secs}\""))?,
        Err(_) => DEFAULT_PROBE_TIMEOUT,
    };

    let dns_hosts = parse_dns_hosts(
        &env::var("DNS_HOSTS").unwrap_or_else(|_| "1.1.1.1,8.8.8.8".to_string()),
    );

    tracing::info!(?dns_hosts, "Using DNS hosts");

    Ok(AppConfig {
        config_file,
        listen_addr,
        port,
        probe_timeout,
        dns_hosts,
    })
}

fn parse_dns_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Setup a TLS connector that accepts invalid certificates.
/// Only used to read the peer certificate of HTTPS targets, never to trust it.
pub fn setup_tls_connector() -> Result<TokioTlsConnector, native_tls::Error> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    let connector = builder.build()?;
    Ok(TokioTlsConnector::from(connector))
}

/// Setup a DNS resolver using the provided DNS hosts
/// This function creates a `TokioAsyncResolver` configured with the specified DNS hosts.
/// It sets the resolver options to have 2 attempts and a timeout of 100 milliseconds.
/// Caching is disabled so every probe performs a real lookup.
/// # Arguments
/// * `dns_hosts` - A slice of strings representing DNS host IPs (e.g., "1.1.1.1")
/// # Returns
/// A `Result` containing a `TokioAsyncResolver` if successful, or an error if a host is not an IP.
pub fn setup_resolver(
    dns_hosts: &[String],
) -> Result<TokioAsyncResolver, std::net::AddrParseError> {
    let servers = dns_hosts
        .iter()
        .map(|host| host.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 53)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(resolver_for_servers(&servers))
}

/// Builds a resolver that only asks the given name servers.
pub fn resolver_for_servers(servers: &[SocketAddr]) -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_millis(100);
    opts.cache_size = 0;

    let mut name_servers = NameServerConfigGroup::new();

    for server in servers {
        name_servers.push(NameServerConfig {
            socket_addr: *server,
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    TokioAsyncResolver::tokio(resolver_config, opts)
}
