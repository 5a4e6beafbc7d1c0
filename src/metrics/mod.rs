//! Per-invocation metrics: gauge registration and exposition encoding.

use prometheus::{Encoder, Gauge, ProtobufEncoder, Registry, TextEncoder};

use crate::error::ProbeError;

pub const PROBE_SUCCESS_METRIC: &str = "probe_success";
pub const PROBE_DURATION_METRIC: &str = "probe_duration_seconds";
pub const COLD_START_METRIC: &str = "cloud_function_cold_start";
pub const PROBE_HTTP_STATUS_METRIC: &str = "probe_http_status_code";
pub const PROBE_HTTP_VERSION_METRIC: &str = "probe_http_version";
pub const PROBE_HTTP_SSL_ENABLED_METRIC: &str = "probe_http_ssl";
pub const PROBE_HTTP_CONTENT_LENGTH_METRIC: &str = "probe_http_content_length";
pub const PROBE_HTTP_SSL_EARLIEST_EXPIRY_METRIC: &str = "probe_ssl_earliest_cert_expiry";
pub const PROBE_DNS_LOOKUP_TIME_METRIC: &str = "probe_dns_lookup_time_seconds";
pub const PROBE_FAILED_DUE_TO_REGEX_METRIC: &str = "probe_failed_due_to_regex";
pub const PROBE_IP_PROTOCOL_METRIC: &str = "probe_ip_protocol";
pub const PROBE_DNS_ANSWER_RRS_METRIC: &str = "probe_dns_answer_rrs";
pub const PROBE_ICMP_DURATION_METRIC: &str = "probe_icmp_duration_seconds";

const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";
const PROTOBUF_PROTO: &str = "io.prometheus.client.MetricFamily";
const TEXT_VERSION: &str = "0.0.4";

/// Creates a gauge and registers it with the invocation registry.
pub fn register_gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Registers a gauge and sets it in one go.
/// Used by the probers, whose diagnostics must never fail the probe itself.
pub fn record_gauge(registry: &Registry, name: &str, help: &str, value: f64) {
    match register_gauge(registry, name, help) {
        Ok(gauge) => gauge.set(value),
        Err(e) => tracing::warn!(metric = name, error = %e, "Unable to register gauge"),
    }
}

/// Exposition formats this endpoint can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Protobuf,
}

impl Format {
    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Text => prometheus::TEXT_FORMAT,
            Format::Protobuf => prometheus::PROTOBUF_FORMAT,
        }
    }
}

/// Picks the exposition format from an `Accept` header.
///
/// The supported entry with the highest `q` wins, ties go to the one listed first.
/// Delimited protobuf and `text/plain` (unversioned or version 0.0.4) are supported;
/// anything else, and a header without a supported entry, gets the text format.
pub fn negotiate(accept: Option<&str>) -> Format {
    let Some(accept) = accept else {
        return Format::Text;
    };

    let mut best: Option<(f64, Format)> = None;
    for candidate in accept.split(',') {
        let mut parts = candidate.split(';').map(str::trim);
        let media_type = parts.next().unwrap_or_default();

        let mut quality = 1.0;
        let mut proto = None;
        let mut encoding = None;
        let mut version = None;
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                let value = value.trim();
                match key.trim() {
                    "q" => quality = value.parse().unwrap_or(0.0),
                    "proto" => proto = Some(value),
                    "encoding" => encoding = Some(value),
                    "version" => version = Some(value),
                    _ => {}
                }
            }
        }

        let format = if media_type.eq_ignore_ascii_case(PROTOBUF_MEDIA_TYPE) {
            if proto == Some(PROTOBUF_PROTO) && encoding == Some("delimited") {
                Format::Protobuf
            } else {
                continue;
            }
        } else if media_type.eq_ignore_ascii_case("text/plain") {
            if matches!(version, None | Some(TEXT_VERSION)) {
                Format::Text
            } else {
                continue;
            }
        } else {
            continue;
        };

        if quality > 0.0 && best.is_none_or(|(best_quality, _)| quality > best_quality) {
            best = Some((quality, format));
        }
    }
    best.map_or(Format::Text, |(_, format)| format)
}

#[derive(Debug)]
pub struct Encoded {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Gathers every gauge registered for this invocation and serializes it.
/// Families come out sorted by name, so identical values give identical bytes.
pub fn encode(registry: &Registry, accept: Option<&str>) -> Result<Encoded, ProbeError> {
    let metric_families = registry.gather();
    let format = negotiate(accept);
    let mut body = Vec::new();

    let result = match format {
        Format::Text => TextEncoder::new().encode(&metric_families, &mut body),
        Format::Protobuf => ProtobufEncoder::new().encode(&metric_families, &mut body),
    };
    result.map_err(|e| {
        tracing::debug!(error = %e, "Unable to encode metrics");
        ProbeError::Encoding(e.to_string())
    })?;

    Ok(Encoded {
        content_type: format.content_type(),
        body,
    })
}
