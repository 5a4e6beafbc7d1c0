use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::Registry;
use regex::Regex;
use reqwest::Method;
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::TokioAsyncResolver;
use url::Url;
use x509_parser::parse_x509_certificate;

use super::{Prober, report};
use crate::config::{HttpProbe, Module};
use crate::metrics::{
    PROBE_DNS_LOOKUP_TIME_METRIC, PROBE_FAILED_DUE_TO_REGEX_METRIC,
    PROBE_HTTP_CONTENT_LENGTH_METRIC, PROBE_HTTP_SSL_EARLIEST_EXPIRY_METRIC,
    PROBE_HTTP_SSL_ENABLED_METRIC, PROBE_HTTP_STATUS_METRIC, PROBE_HTTP_VERSION_METRIC,
    record_gauge,
};

const USER_AGENT: &str = "cloudprobe/1.0";

pub struct HttpProbeResult {
    pub url: String,
    pub dns_time: Option<f64>,
    pub http_status: u16,
    pub http_version: f64,
    pub is_tls: bool,
    pub cert_expiry: Option<i64>,
    pub content_length: Option<u64>,
    pub body: String,
}

/// Probes HTTP(S) targets with reqwest.
///
/// The target host is resolved through `resolver` and the request is pinned to the
/// resolved address, so the timed lookup is the one the connection uses.
pub struct HttpProber {
    connector: TokioTlsConnector,
    resolver: TokioAsyncResolver,
}

impl HttpProber {
    /// `connector` is only used to read the peer certificate of HTTPS targets.
    pub fn new(connector: TokioTlsConnector, resolver: TokioAsyncResolver) -> Self {
        Self {
            connector,
            resolver,
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        target: &str,
        module: &Module,
        deadline: Duration,
        registry: &Registry,
    ) -> bool {
        let conf = &module.http;
        let result = match probe_url(&self.connector, &self.resolver, target, conf, deadline).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(url = target, error = %e, "HTTP request failed");
                return false;
            }
        };
        evaluate(&result, conf, registry)
    }
}

/// Records the diagnostics of `result` and checks them against the module's criteria.
pub fn evaluate(result: &HttpProbeResult, conf: &HttpProbe, registry: &Registry) -> bool {
    if let Some(dns_time) = result.dns_time {
        record_gauge(
            registry,
            PROBE_DNS_LOOKUP_TIME_METRIC,
            "Returns the time taken for probe dns lookup in seconds",
            dns_time,
        );
    }
    record_gauge(
        registry,
        PROBE_HTTP_STATUS_METRIC,
        "Response HTTP status code",
        f64::from(result.http_status),
    );
    record_gauge(
        registry,
        PROBE_HTTP_VERSION_METRIC,
        "Returns the version of HTTP of the probe response",
        result.http_version,
    );
    record_gauge(
        registry,
        PROBE_HTTP_SSL_ENABLED_METRIC,
        "Indicates if SSL was used for the final redirect",
        if result.is_tls { 1.0 } else { 0.0 },
    );
    if let Some(length) = result.content_length {
        record_gauge(
            registry,
            PROBE_HTTP_CONTENT_LENGTH_METRIC,
            "Length of http content response",
            length as f64,
        );
    }
    if let Some(expiry) = result.cert_expiry {
        record_gauge(
            registry,
            PROBE_HTTP_SSL_EARLIEST_EXPIRY_METRIC,
            "Returns earliest SSL cert expiry in unixtime",
            expiry as f64,
        );
    }

    let mut success = status_accepted(result.http_status, &conf.valid_status_codes);
    if !success {
        tracing::error!(
            url = %result.url,
            status = result.http_status,
            accepted = ?conf.valid_status_codes,
            "Invalid HTTP response status code"
        );
    }

    if conf.fail_if_ssl && result.is_tls {
        tracing::error!(url = %result.url, "Final request was over SSL");
        success = false;
    }
    if conf.fail_if_not_ssl && !result.is_tls {
        tracing::error!(url = %result.url, "Final request was not over SSL");
        success = false;
    }

    if !conf.fail_if_body_matches_regexp.is_empty()
        || !conf.fail_if_body_not_matches_regexp.is_empty()
    {
        let body_ok = body_matches(&result.body, conf);
        record_gauge(
            registry,
            PROBE_FAILED_DUE_TO_REGEX_METRIC,
            "Indicates if probe failed due to regex",
            if body_ok { 0.0 } else { 1.0 },
        );
        success = success && body_ok;
    }

    success
}

/// No configured codes means any 2xx status is accepted.
fn status_accepted(status: u16, valid_status_codes: &[u16]) -> bool {
    if valid_status_codes.is_empty() {
        (200..=299).contains(&status)
    } else {
        valid_status_codes.contains(&status)
    }
}

/// A match of a fail pattern fails the body before the expect patterns are looked at.
fn body_matches(body: &str, conf: &HttpProbe) -> bool {
    for pattern in &conf.fail_if_body_matches_regexp {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(body) => {
                tracing::error!(regexp = %pattern, "Body matched regular expression");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(regexp = %pattern, error = %e, "Could not compile regular expression");
                return false;
            }
        }
    }
    for pattern in &conf.fail_if_body_not_matches_regexp {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(body) => {
                tracing::error!(regexp = %pattern, "Body did not match regular expression");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(regexp = %pattern, error = %e, "Could not compile regular expression");
                return false;
            }
        }
    }
    true
}

/// The host of `url` without the brackets of an IPv6 literal.
fn bare_host(url: &Url) -> Option<String> {
    url.host().map(|host| match host {
        url::Host::Domain(domain) => domain.to_string(),
        url::Host::Ipv4(ip) => ip.to_string(),
        url::Host::Ipv6(ip) => ip.to_string(),
    })
}

/// Targets without a scheme are probed over plain HTTP.
pub(crate) fn normalize_target(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

/// Resolves `host` and returns the first address together with the lookup time.
/// IP literals come back without a query.
async fn resolve_host(
    host: &str,
    resolver: &TokioAsyncResolver,
    deadline: Duration,
) -> Result<(IpAddr, f64), String> {
    let start = Instant::now();
    let lookup = tokio::time::timeout(deadline, resolver.lookup_ip(host))
        .await
        .map_err(|_| format!("resolving \"{host}\" timed out"))?
        .map_err(|e| report(&e))?;
    let duration = start.elapsed().as_secs_f64();

    let ip = lookup
        .iter()
        .next()
        .ok_or_else(|| format!("no addresses found for \"{host}\""))?;
    Ok((ip, duration))
}

/// Returns the `notAfter` of the peer certificate as unix seconds.
async fn get_cert_expiry(
    host: &str,
    port: u16,
    connector: &TokioTlsConnector,
    resolver: &TokioAsyncResolver,
) -> Option<i64> {
    let ip = resolver.lookup_ip(host).await.ok()?.iter().next()?;
    let stream = tokio::net::TcpStream::connect(SocketAddr::new(ip, port)).await.ok()?;
    let tls_stream = connector.connect(host, stream).await.ok()?;

    // Extract certificate in blocking context
    let cert_der = tokio::task::spawn_blocking(move || {
        let cert = tls_stream.get_ref().peer_certificate().ok().flatten()?;
        cert.to_der().ok()
    })
    .await
    .ok()??;

    let (_, parsed) = parse_x509_certificate(&cert_der).ok()?;
    Some(parsed.validity().not_after.timestamp())
}

fn http_version(version: reqwest::Version) -> f64 {
    match version {
        reqwest::Version::HTTP_09 => 0.9,
        reqwest::Version::HTTP_10 => 1.0,
        reqwest::Version::HTTP_11 => 1.1,
        reqwest::Version::HTTP_2 => 2.0,
        reqwest::Version::HTTP_3 => 3.0,
        _ => 0.0,
    }
}

pub async fn probe_url(
    connector: &TokioTlsConnector,
    resolver: &TokioAsyncResolver,
    target: &str,
    conf: &HttpProbe,
    deadline: Duration,
) -> Result<HttpProbeResult, String> {
    let url = normalize_target(target);
    let parsed_url = Url::parse(&url).map_err(|e| format!("invalid target \"{url}\": {e}"))?;
    let host = bare_host(&parsed_url)
        .ok_or_else(|| format!("target \"{url}\" has no host"))?;
    let port = parsed_url.port_or_known_default().unwrap_or(80);

    let start = Instant::now();
    let (ip, dns_time) = resolve_host(&host, resolver, deadline).await?;

    let client = reqwest::Client::builder()
        .timeout(deadline.saturating_sub(start.elapsed()))
        .user_agent(USER_AGENT)
        .resolve(&host, SocketAddr::new(ip, port))
        .build()
        .map_err(|e| report(&e))?;

    let method = Method::from_bytes(conf.method.to_uppercase().as_bytes())
        .map_err(|_| format!("invalid method \"{}\"", conf.method))?;
    let mut request = client.request(method, parsed_url.clone());
    for (name, value) in &conf.headers {
        request = request.header(name, value);
    }
    if let Some(auth) = &conf.basic_auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }

    let response = request.send().await.map_err(|e| report(&e))?;
    let http_status = response.status().as_u16();
    let http_version = http_version(response.version());
    let content_length = response.content_length();
    let final_url = response.url().clone();
    let is_tls = final_url.scheme() == "https";

    let body = response.text().await.map_err(|e| report(&e))?;

    let cert_expiry = if is_tls {
        let host = bare_host(&final_url).unwrap_or(host);
        let port = final_url.port_or_known_default().unwrap_or(443);
        get_cert_expiry(&host, port, connector, resolver).await
    } else {
        None
    };

    Ok(HttpProbeResult {
        url,
        dns_time: Some(dns_time),
        http_status,
        http_version,
        is_tls,
        cert_expiry,
        content_length,
        body,
    })
}
