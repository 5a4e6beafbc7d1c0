//! The probe endpoint.
//!
//! - `/probe` and `/` - run one probe of a configured module and return its metrics
//! - `/{prober}` - run one probe with the prober options inlined as YAML in `config`
//! - `/healthz` - liveness

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode, header::ACCEPT, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::Registry;
use url::form_urlencoded;

use crate::cold_start::WarmState;
use crate::config::{ConfigLoader, Module, resolve_module};
use crate::error::ProbeError;
use crate::metrics::{COLD_START_METRIC, Encoded, encode, register_gauge};
use crate::overrides::apply_http_overrides;
use crate::probe::{Capability, ProberSet, dispatch};

/// Header Prometheus sends with the scrape timeout of the job.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Subtracted from the scrape timeout so the response makes it back in time.
const SCRAPE_TIMEOUT_OFFSET: f64 = 0.5;

/// Everything a request needs. Only the warm state outlives a request.
#[derive(Clone)]
pub struct AppState {
    loader: Arc<dyn ConfigLoader>,
    probers: ProberSet,
    warm: Arc<WarmState>,
    timeout: Duration,
}

impl AppState {
    pub fn new(
        loader: Arc<dyn ConfigLoader>,
        probers: ProberSet,
        warm: Arc<WarmState>,
        timeout: Duration,
    ) -> Self {
        Self {
            loader,
            probers,
            warm,
            timeout,
        }
    }

    pub fn warm_state(&self) -> &Arc<WarmState> {
        &self.warm
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(probe))
        .route("/probe", get(probe))
        .route("/healthz", get(healthz))
        .route("/{prober}", get(inline_probe))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn probe(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    respond(run_probe(&state, query.as_deref().unwrap_or_default(), &headers).await)
}

async fn inline_probe(
    State(state): State<AppState>,
    Path(prober): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    respond(run_inline_probe(&state, &prober, query.as_deref().unwrap_or_default(), &headers).await)
}

fn respond(result: Result<Encoded, ProbeError>) -> Response {
    match result {
        Ok(encoded) => (
            StatusCode::OK,
            [(CONTENT_TYPE, encoded.content_type)],
            encoded.body,
        )
            .into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(error = %e, "Probe request failed");
            } else {
                tracing::debug!(error = %e, "Rejected probe request");
            }
            e.into_response()
        }
    }
}

/// Runs the whole pipeline for one invocation: load the modules, resolve the module,
/// apply overrides and mitigate a cold start for HTTP modules, probe, encode.
pub async fn run_probe(
    state: &AppState,
    query: &str,
    headers: &HeaderMap,
) -> Result<Encoded, ProbeError> {
    let started = Instant::now();
    let deadline = invocation_deadline(state.timeout, headers);
    let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let config = state.loader.load().map_err(|e| {
        tracing::error!(error = %e, "Error loading config");
        ProbeError::from(e)
    })?;
    let mut module = resolve_module(&config, first_param(&params, "module").unwrap_or_default())?;

    let target = first_param(&params, "target")
        .filter(|target| !target.is_empty())
        .ok_or(ProbeError::MissingTarget)?;

    let capability: Capability = module.prober.parse()?;

    let cold_start = if capability == Capability::Http {
        apply_http_overrides(&params, &mut module.http)?;
        state
            .warm
            .mitigate(target, deadline.saturating_sub(started.elapsed()))
            .await?
    } else {
        false
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    let probe_deadline = module.timeout.map_or(remaining, |timeout| timeout.min(remaining));

    tracing::info!(
        prober = capability.as_str(),
        url = target,
        timeout_seconds = probe_deadline.as_secs_f64(),
        "Beginning probe"
    );

    let registry = Registry::new();
    let cold_start_gauge = register_gauge(
        &registry,
        COLD_START_METRIC,
        "Displays whether or not the cloud function was cold started",
    )
    .map_err(|e| ProbeError::Encoding(e.to_string()))?;
    cold_start_gauge.set(if cold_start { 1.0 } else { 0.0 });

    dispatch(
        &state.probers,
        capability,
        target,
        &module,
        probe_deadline,
        &registry,
    )
    .await?;

    let accept = accept_header(headers);
    encode(&registry, accept.as_deref())
}

/// Runs a probe whose prober options arrive inline.
///
/// The prober comes from the path, its options from the `config` query parameter as
/// YAML. No module file is read, no overrides are applied and no cold start is
/// mitigated.
pub async fn run_inline_probe(
    state: &AppState,
    prober: &str,
    query: &str,
    headers: &HeaderMap,
) -> Result<Encoded, ProbeError> {
    let deadline = invocation_deadline(state.timeout, headers);
    let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let target = first_param(&params, "target")
        .filter(|target| !target.is_empty())
        .ok_or(ProbeError::MissingTarget)?;
    let inline_config = first_param(&params, "config")
        .filter(|config| !config.is_empty())
        .ok_or(ProbeError::MissingInlineConfig)?;

    let capability: Capability = prober.parse()?;
    let module = inline_module(capability, inline_config)?;

    tracing::info!(
        prober = capability.as_str(),
        url = target,
        timeout_seconds = deadline.as_secs_f64(),
        "Beginning inline probe"
    );

    let registry = Registry::new();
    dispatch(&state.probers, capability, target, &module, deadline, &registry).await?;

    let accept = accept_header(headers);
    encode(&registry, accept.as_deref())
}

/// Builds a module for `capability` from the YAML options of that prober alone.
fn inline_module(capability: Capability, inline_config: &str) -> Result<Module, ProbeError> {
    let invalid = |e: serde_yaml::Error| ProbeError::InvalidInlineConfig(e.to_string());
    let mut module = Module {
        prober: capability.as_str().to_string(),
        ..Default::default()
    };
    match capability {
        Capability::Http => module.http = serde_yaml::from_str(inline_config).map_err(invalid)?,
        Capability::Tcp => module.tcp = serde_yaml::from_str(inline_config).map_err(invalid)?,
        Capability::Dns => module.dns = serde_yaml::from_str(inline_config).map_err(invalid)?,
        Capability::Icmp => module.icmp = serde_yaml::from_str(inline_config).map_err(invalid)?,
    }
    Ok(module)
}

fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// All `Accept` headers joined into one preference list.
fn accept_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

/// The configured timeout, lowered to the scrape timeout of the caller when it sent one.
/// A scrape timeout at or below the offset is used as is.
fn invocation_deadline(timeout: Duration, headers: &HeaderMap) -> Duration {
    let scrape_timeout = headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0);

    match scrape_timeout {
        Some(seconds) => {
            let seconds = if seconds > SCRAPE_TIMEOUT_OFFSET {
                seconds - SCRAPE_TIMEOUT_OFFSET
            } else {
                seconds
            };
            Duration::try_from_secs_f64(seconds).map_or(timeout, |scrape| scrape.min(timeout))
        }
        None => timeout,
    }
}
