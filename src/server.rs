use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::dispatch::{validate_limits, PhaseEnd};
use crate::error::ValidationError;
use crate::probe::BannerConfig;
use crate::registry::{SessionRegistry, SessionWriter};
use crate::scanner::{discovery_strategy, port_strategy};
use crate::session::ScanSession;
use crate::targets::{expand_ports, expand_targets, HostRange};
use crate::types::{Protocol, ScanMode};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<SessionRegistry>,
    defaults: Arc<ScanConfig>,
}

impl AppState {
    pub fn new(defaults: ScanConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            defaults: Arc::new(defaults),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// Single address or CIDR block.
    pub target: String,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub scan_type: Option<ScanMode>,
    /// Run host discovery with this method first and only scan live hosts.
    #[serde(default)]
    pub discover: Option<Protocol>,
    /// Interface for ARP discovery.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub banners: bool,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A request that passed validation and is ready to run.
#[derive(Debug)]
struct Plan {
    hosts: HostRange,
    ports: Vec<u16>,
    protocol: Protocol,
    mode: ScanMode,
    discover: Option<Protocol>,
    interface: Option<String>,
    banners: Option<BannerConfig>,
    concurrency: usize,
    timeout: Duration,
    max_duration: Duration,
}

impl Plan {
    fn from_request(req: &ScanRequest, defaults: &ScanConfig) -> Result<Self, ValidationError> {
        let hosts = expand_targets(&req.target)?;
        let ports = expand_ports(req.ports.as_deref().unwrap_or("1-1024"))?;
        let protocol = req.protocol.unwrap_or(Protocol::Tcp);
        let mode = req.scan_type.unwrap_or_default();
        let banners = req.banners.then(|| defaults.banner());
        port_strategy(protocol, mode, banners)?;
        if let Some(method) = req.discover {
            discovery_strategy(method, req.interface.as_deref())?;
        }
        let concurrency = req.concurrency.unwrap_or(defaults.concurrency);
        let timeout = req.timeout_ms.map(Duration::from_millis).unwrap_or_else(|| defaults.probe_timeout());
        validate_limits(concurrency, timeout)?;
        Ok(Self {
            hosts,
            ports,
            protocol,
            mode,
            discover: req.discover,
            interface: req.interface.clone(),
            banners,
            concurrency,
            timeout,
            max_duration: defaults.max_scan_duration(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/scan/{id}", get(get_status).delete(delete_scan))
        .route("/scan/{id}/results", get(get_results))
        .route("/scans", get(list_scans))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn serve(bind: &str, defaults: ScanConfig) -> Result<()> {
    let app = router(AppState::new(defaults));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "session API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn not_found(id: Uuid) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("no scan session {id}") }))).into_response()
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> Response {
    let plan = match Plan::from_request(&req, &app.defaults) {
        Ok(plan) => plan,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string(), "kind": e.kind })),
            )
                .into_response()
        }
    };
    let session = match ScanSession::new(plan.concurrency, plan.timeout) {
        Ok(s) => match &plan.interface {
            Some(name) => s.with_max_duration(plan.max_duration).with_interface(name.clone()),
            None => s.with_max_duration(plan.max_duration),
        },
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    };

    let writer = app.registry.register(format!("{} {}", plan.protocol, req.target), session.cancel_token());
    let id = writer.id();
    info!(%id, target = %req.target, ports = plan.ports.len(), "scan accepted");
    let writer = Arc::new(writer);
    let scan = tokio::spawn(run_session(session, plan, Arc::clone(&writer)));
    tokio::spawn(async move {
        if let Err(e) = scan.await {
            warn!(id = %writer.id(), error = %e, "scan task ended abnormally");
            writer.fail(format!("scan task ended abnormally: {e}"));
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response()
}

async fn run_session(session: ScanSession, plan: Plan, writer: Arc<SessionWriter>) {
    let mut session = session.with_progress(writer.clone()).with_sink(writer.clone());

    let hosts: Vec<IpAddr> = match plan.discover {
        Some(method) => match session.discover_hosts(plan.hosts, method).await {
            Ok(live) => live,
            Err(e) => {
                warn!(id = %writer.id(), error = %e, "host discovery failed");
                writer.fail(e.to_string());
                return;
            }
        },
        None => plan.hosts.collect(),
    };

    let mut end = session.last_end().unwrap_or(PhaseEnd::Completed);
    for host in hosts {
        if end != PhaseEnd::Completed {
            break;
        }
        match session
            .scan_ports(host, &plan.ports, plan.protocol, plan.mode, plan.banners)
            .await
        {
            Ok(phase_end) => end = phase_end,
            Err(e) => {
                warn!(id = %writer.id(), %host, error = %e, "port scan failed");
                writer.fail(e.to_string());
                return;
            }
        }
    }
    info!(id = %writer.id(), end = end.as_str(), recorded = session.results().len(), "scan finished");
    writer.finish(end, None);
}

async fn get_status(State(app): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match app.registry.status(&id) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => not_found(id),
    }
}

async fn get_results(State(app): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match app.registry.results(&id) {
        Some(results) => (StatusCode::OK, Json(results)).into_response(),
        None => not_found(id),
    }
}

async fn delete_scan(State(app): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if app.registry.cancel(&id) {
        (StatusCode::ACCEPTED, Json(json!({ "id": id, "cancelled": true }))).into_response()
    } else {
        not_found(id)
    }
}

async fn list_scans(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.registry.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionState;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    fn app() -> (AppState, Router) {
        let state = AppState::new(ScanConfig::default());
        (state.clone(), router(state))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn bad_input_is_rejected_with_400() {
        let (_, app) = app();
        let (status, body) = call(&app, "POST", "/api/scan", Some(json!({ "target": "10.0.0.0/33" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "cidr");

        let (status, body) = call(
            &app,
            "POST",
            "/api/scan",
            Some(json!({ "target": "127.0.0.1", "ports": "70000" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "port_range");
    }

    #[tokio::test]
    async fn wide_ipv6_prefix_is_rejected_without_registering() {
        let (state, app) = app();
        let (status, body) = call(&app, "POST", "/api/scan", Some(json!({ "target": "2001:db8::/64" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "too_many_hosts");
        assert!(state.registry().list().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let (_, app) = app();
        let id = Uuid::new_v4();
        let (status, _) = call(&app, "GET", &format!("/api/scan/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "DELETE", &format!("/api/scan/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn loopback_scan_runs_to_completion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (state, app) = app();

        let (status, body) = call(
            &app,
            "POST",
            "/api/scan",
            Some(json!({ "target": "127.0.0.1", "ports": port.to_string(), "timeout_ms": 500 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

        let mut finished = false;
        for _ in 0..100 {
            if state.registry().status(&id).unwrap().state != SessionState::Running {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(finished);

        let (status, body) = call(&app, "GET", &format!("/api/scan/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");

        let (_, results) = call(&app, "GET", &format!("/api/scan/{id}/results"), None).await;
        assert_eq!(results[0]["state"], "open");
        assert_eq!(results[0]["unit"]["port"], port);

        let (_, list) = call(&app, "GET", "/api/scans", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cancels_a_session() {
        let (state, app) = app();
        let writer = state.registry().register("manual", tokio_util::sync::CancellationToken::new());
        let (status, body) = call(&app, "DELETE", &format!("/api/scan/{}", writer.id()), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["cancelled"], true);
        assert!(writer.cancel_token().is_cancelled());
    }
}
