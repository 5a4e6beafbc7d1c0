//! End-to-end tests of the probe endpoint against local target servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION},
    routing::get,
};
use base64::Engine;
use cloudprobe::cold_start::WarmState;
use cloudprobe::config::Config;
use cloudprobe::config::app_config::{resolver_for_servers, setup_tls_connector};
use cloudprobe::handler::{AppState, router};
use cloudprobe::probe::{DnsProber, HttpProber, IcmpProber, ProberSet, TcpProber};
use tower::ServiceExt;
use url::form_urlencoded;

const TEST_USERNAME: &str = "test";
const TEST_PASSWORD: &str = "testPassword";

const MODULES: &str = r#"
modules:
  http_2xx:
    prober: http
    timeout: 5s
  tcp_connect:
    prober: tcp
  udp_ping:
    prober: udp
"#;

struct Targets {
    simple: String,
    basic_auth: String,
    client_error: String,
    server_error: String,
    body: String,
    hits: Arc<AtomicUsize>,
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

fn authorized(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    decoded == format!("{TEST_USERNAME}:{TEST_PASSWORD}").as_bytes()
}

async fn start_targets() -> Targets {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let app = Router::new()
        .route(
            "/simple",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "ok\n"
                }
            }),
        )
        .route(
            "/basic-auth",
            get(|headers: HeaderMap| async move {
                if authorized(&headers) {
                    (StatusCode::OK, "authorized\n")
                } else {
                    (StatusCode::UNAUTHORIZED, "authorization failed\n")
                }
            }),
        )
        .route(
            "/client-error",
            get(|| async { (StatusCode::IM_A_TEAPOT, "client error\n") }),
        )
        .route(
            "/server-error",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "server error\n") }),
        )
        .route("/body", get(|| async { "this will fail\n" }));

    let addr = serve(app).await;
    Targets {
        simple: format!("http://{addr}/simple"),
        basic_auth: format!("http://{addr}/basic-auth"),
        client_error: format!("http://{addr}/client-error"),
        server_error: format!("http://{addr}/server-error"),
        body: format!("http://{addr}/body"),
        hits,
    }
}

fn app_state(warm: Arc<WarmState>) -> AppState {
    let config: Config = serde_yaml::from_str(MODULES).unwrap();
    // Targets are IP literals, so lookups never reach this name server.
    let resolver = resolver_for_servers(&["127.0.0.1:53".parse().unwrap()]);
    let probers = ProberSet::new(
        Arc::new(HttpProber::new(setup_tls_connector().unwrap(), resolver.clone())),
        Arc::new(TcpProber::new(resolver.clone())),
        Arc::new(DnsProber::new(resolver)),
        Arc::new(IcmpProber::new()),
    );
    AppState::new(Arc::new(config), probers, warm, Duration::from_secs(10))
}

/// A state whose instance already handled a request, so no warm-up request is made.
async fn warm_state(targets: &Targets) -> AppState {
    let warm = Arc::new(WarmState::new());
    warm.mitigate(&targets.simple, Duration::from_secs(5))
        .await
        .unwrap();
    app_state(warm)
}

async fn get_probe(state: &AppState, params: &[(&str, &str)]) -> (StatusCode, String, String) {
    get_path(state, "/probe", params, &[]).await
}

async fn get_path(
    state: &AppState,
    path: &str,
    params: &[(&str, &str)],
    headers: &[(&str, &str)],
) -> (StatusCode, String, String) {
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    let mut request = Request::builder().uri(format!("{path}?{query}"));
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = router(state.clone())
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8_lossy(&body).into_owned())
}

async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_handler_cases() {
    let targets = start_targets().await;
    let state = warm_state(&targets).await;
    let unreachable = format!("http://{}/", closed_port().await);

    let cases: Vec<(&str, &str, &str, Vec<(&str, &str)>, &str, StatusCode)> = vec![
        ("valid target", targets.simple.as_str(), "http_2xx", vec![], "probe_success 1", StatusCode::OK),
        ("default module", targets.simple.as_str(), "", vec![], "probe_success 1", StatusCode::OK),
        ("invalid module", targets.simple.as_str(), "http_invalid", vec![], "Unknown module", StatusCode::BAD_REQUEST),
        ("unreachable target", unreachable.as_str(), "http_2xx", vec![], "probe_success 0", StatusCode::OK),
        ("no target", "", "http_2xx", vec![], "Target parameter is missing", StatusCode::BAD_REQUEST),
        ("unknown prober", targets.simple.as_str(), "udp_ping", vec![], "Unknown prober \"udp\"", StatusCode::BAD_REQUEST),
        ("simple status code overwrite", targets.simple.as_str(), "", vec![("http_valid_status_codes", "200")], "probe_success 1", StatusCode::OK),
        ("status code overwrite excludes default", targets.simple.as_str(), "", vec![("http_valid_status_codes", "201")], "probe_success 0", StatusCode::OK),
        ("special notation status code", targets.client_error.as_str(), "", vec![("http_valid_status_codes", "4xx")], "probe_success 1", StatusCode::OK),
        ("special notation rejects other class", targets.server_error.as_str(), "", vec![("http_valid_status_codes", "4xx")], "probe_success 0", StatusCode::OK),
        ("default rejects client error", targets.client_error.as_str(), "", vec![], "probe_success 0", StatusCode::OK),
        ("comma separated codes", targets.server_error.as_str(), "", vec![("http_valid_status_codes", "500,501,502,503")], "probe_success 1", StatusCode::OK),
        ("white space comma separated codes", targets.server_error.as_str(), "", vec![("http_valid_status_codes", "500, 501, 502, 503")], "probe_success 1", StatusCode::OK),
        ("malformed status code", targets.simple.as_str(), "", vec![("http_valid_status_codes", "2x")], "Can not convert status code \"2x\"", StatusCode::BAD_REQUEST),
        ("positive expect regexp test", targets.simple.as_str(), "", vec![("http_expect_regexp", "[oO][kK]")], "probe_success 1", StatusCode::OK),
        ("negative expect regexp test", targets.simple.as_str(), "", vec![("http_expect_regexp", "fail")], "probe_success 0", StatusCode::OK),
        ("empty expect regexp test", targets.simple.as_str(), "", vec![("http_expect_regexp", "")], "probe_success 1", StatusCode::OK),
        ("invalid expect regexp test", targets.simple.as_str(), "", vec![("http_expect_regexp", "*")], "probe_success 0", StatusCode::OK),
        ("positive fail on regexp test", targets.simple.as_str(), "", vec![("http_fail_on_regexp", "[oO][kK]")], "probe_success 0", StatusCode::OK),
        ("negative fail on regexp test", targets.simple.as_str(), "", vec![("http_fail_on_regexp", "fail")], "probe_success 1", StatusCode::OK),
        ("empty fail on regexp test", targets.simple.as_str(), "", vec![("http_fail_on_regexp", "")], "probe_success 1", StatusCode::OK),
        ("confusing regexp test", targets.simple.as_str(), "", vec![("http_expect_regexp", "ok"), ("http_fail_on_regexp", "ok")], "probe_success 0", StatusCode::OK),
        ("fail pattern wins", targets.body.as_str(), "", vec![("http_expect_regexp", "fail"), ("http_fail_on_regexp", "fail")], "probe_success 0", StatusCode::OK),
        ("positive basic auth test", targets.basic_auth.as_str(), "", vec![("http_basic_auth_username", TEST_USERNAME), ("http_basic_auth_password", TEST_PASSWORD)], "probe_success 1", StatusCode::OK),
        ("negative basic auth test", targets.basic_auth.as_str(), "", vec![("http_basic_auth_username", "myUsername"), ("http_basic_auth_password", "myPassword")], "probe_success 0", StatusCode::OK),
        ("only username basic auth test", targets.basic_auth.as_str(), "", vec![("http_basic_auth_username", TEST_USERNAME)], "probe_success 0", StatusCode::OK),
        ("validate that login is not possible for user", targets.basic_auth.as_str(), "", vec![("http_basic_auth_username", "myUser"), ("http_basic_auth_password", "myPassword"), ("http_valid_status_codes", "401")], "probe_success 1", StatusCode::OK),
        ("unknown overrides are ignored", targets.simple.as_str(), "", vec![("http_method", "DELETE")], "probe_success 1", StatusCode::OK),
    ];

    for (name, target, module, overrides, body_contains, expected_status) in cases {
        let mut params = vec![("target", target), ("module", module)];
        params.extend(overrides);

        let (status, _, body) = get_probe(&state, &params).await;
        assert_eq!(status, expected_status, "{name}: unexpected status, body: {body}");
        assert!(body.contains(body_contains), "{name}: body {body:?} does not contain {body_contains:?}");
    }
}

#[tokio::test]
async fn test_unknown_module_wins_over_overrides() {
    let targets = start_targets().await;
    let state = warm_state(&targets).await;

    let (status, _, body) = get_probe(
        &state,
        &[
            ("target", targets.simple.as_str()),
            ("module", "nope"),
            ("http_valid_status_codes", "garbage"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Unknown module"));
}

#[tokio::test]
async fn test_missing_target_makes_no_network_calls() {
    let targets = start_targets().await;
    let state = app_state(Arc::new(WarmState::new()));

    let (status, _, body) = get_probe(&state, &[("module", "http_2xx")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Target parameter is missing");
    assert_eq!(targets.hits.load(Ordering::SeqCst), 0);
    assert!(!state.warm_state().is_warm());
}

#[tokio::test]
async fn test_cold_start_then_warm() {
    let targets = start_targets().await;
    let state = app_state(Arc::new(WarmState::new()));

    let (status, content_type, body) = get_probe(&state, &[("target", targets.simple.as_str())]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, prometheus::TEXT_FORMAT);
    assert!(body.contains("cloud_function_cold_start 1"), "{body}");
    assert!(body.contains("probe_success 1"), "{body}");
    assert_eq!(targets.hits.load(Ordering::SeqCst), 2);

    let (status, _, body) = get_probe(&state, &[("target", targets.simple.as_str())]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("cloud_function_cold_start 0"), "{body}");
    assert!(body.contains("probe_success 1"), "{body}");
    assert_eq!(targets.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_warmup_fails_invocation() {
    let state = app_state(Arc::new(WarmState::new()));
    let unreachable = format!("http://{}/", closed_port().await);

    let (status, _, body) = get_probe(&state, &[("target", unreachable.as_str())]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.starts_with("Unable to make a cold start request"), "{body}");
}

#[tokio::test]
async fn test_tcp_module_skips_cold_start() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let state = app_state(Arc::new(WarmState::new()));

    let (status, _, body) = get_probe(
        &state,
        &[
            ("target", addr.as_str()),
            ("module", "tcp_connect"),
            ("http_valid_status_codes", "garbage"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("probe_success 1"), "{body}");
    assert!(body.contains("cloud_function_cold_start 0"), "{body}");
    assert!(!state.warm_state().is_warm());
}

#[tokio::test]
async fn test_protobuf_negotiation() {
    let targets = start_targets().await;
    let state = warm_state(&targets).await;

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri(format!("/probe?target={}", targets.simple))
                .header(
                    "accept",
                    "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;encoding=delimited;q=0.7,text/plain;version=0.0.4;q=0.3",
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        prometheus::PROTOBUF_FORMAT
    );
}

#[tokio::test]
async fn test_target_without_scheme_on_cold_instance() {
    let targets = start_targets().await;
    let state = app_state(Arc::new(WarmState::new()));
    let target = targets.simple.trim_start_matches("http://");

    let (status, _, body) = get_probe(&state, &[("target", target)]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body.contains("cloud_function_cold_start 1"), "{body}");
    assert!(body.contains("probe_success 1"), "{body}");
    assert_eq!(targets.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_huge_scrape_timeout_still_answers() {
    let targets = start_targets().await;
    let state = warm_state(&targets).await;

    let (status, _, body) = get_path(
        &state,
        "/probe",
        &[("target", targets.simple.as_str())],
        &[("x-prometheus-scrape-timeout-seconds", "1e300")],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body.contains("probe_success 1"), "{body}");
}

#[tokio::test]
async fn test_text_preferred_by_quality() {
    let targets = start_targets().await;
    let state = warm_state(&targets).await;

    let (status, content_type, body) = get_path(
        &state,
        "/probe",
        &[("target", targets.simple.as_str())],
        &[(
            "accept",
            "text/plain;version=0.0.4;q=1.0,application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;encoding=delimited;q=0.1",
        )],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, prometheus::TEXT_FORMAT);
    assert!(body.contains("probe_success 1"), "{body}");
}

#[tokio::test]
async fn test_inline_config_cases() {
    let targets = start_targets().await;
    let state = app_state(Arc::new(WarmState::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_target = listener.local_addr().unwrap().to_string();

    let cases: Vec<(&str, &str, Vec<(&str, &str)>, &str, StatusCode)> = vec![
        ("http with inline options", "/http", vec![("target", targets.simple.as_str()), ("config", "valid_status_codes: [200]")], "probe_success 1", StatusCode::OK),
        ("http status not accepted", "/http", vec![("target", targets.client_error.as_str()), ("config", "valid_status_codes: [200]")], "probe_success 0", StatusCode::OK),
        ("http body pattern", "/http", vec![("target", targets.body.as_str()), ("config", "fail_if_body_matches_regexp: [fail]")], "probe_success 0", StatusCode::OK),
        ("tcp with empty options", "/tcp", vec![("target", tcp_target.as_str()), ("config", "{}")], "probe_success 1", StatusCode::OK),
        ("missing target", "/http", vec![("config", "{}")], "Target parameter is missing", StatusCode::BAD_REQUEST),
        ("missing config", "/http", vec![("target", targets.simple.as_str())], "Query parameter config is not set", StatusCode::BAD_REQUEST),
        ("malformed config", "/http", vec![("target", targets.simple.as_str()), ("config", "valid_status_codes: nope")], "Invalid inline config", StatusCode::BAD_REQUEST),
        ("unknown prober", "/udp", vec![("target", targets.simple.as_str()), ("config", "{}")], "Unknown prober \"udp\"", StatusCode::BAD_REQUEST),
    ];

    for (name, path, params, body_contains, expected_status) in cases {
        let (status, _, body) = get_path(&state, path, &params, &[]).await;
        assert_eq!(status, expected_status, "{name}: unexpected status, body: {body}");
        assert!(body.contains(body_contains), "{name}: body {body:?} does not contain {body_contains:?}");
    }

    // Inline requests never warm the instance up.
    assert!(!state.warm_state().is_warm());
    assert!(targets.hits.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_healthz() {
    let state = app_state(Arc::new(WarmState::new()));
    let response = router(state)
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
