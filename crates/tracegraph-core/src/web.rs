//! HTTP and WebSocket surface.
//!
//! - `GET /health`
//! - `POST /ingest/:feed`: newline-delimited telemetry into the log
//! - `GET /ws?runId=…`: live deltas for one run
//! - `GET /api/runs`, `/api/runs/:id/graph`, `/api/runs/:id/snapshot`,
//!   `/api/runs/:id/export?format=json|prompt|jsonld`
//!
//! The server binds to localhost unless public binding is requested
//! explicitly.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::now_ms;
use crate::error::{Error, EventError, StorageError};
use crate::export::{ExportFormat, LlmExecutionTrace};
use crate::hub::{Hub, HubError, Viewer};
use crate::ingest::Ingestor;
use crate::persistence::{DEFAULT_RUN_LIMIT, GraphStore};
use crate::stream_log::StreamLog;
use crate::{Result, VERSION};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

/// Hard ceiling on `/api/runs?limit=`.
const MAX_RUN_LIMIT: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(s) => (StatusCode::NOT_FOUND, s),
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, s),
            Self::Internal(s) => {
                error!(target: "tracegraph.web", error = %s, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, s)
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        match e {
            Error::Event(EventError::BodyInterrupted(_)) => Self::BadRequest(e.to_string()),
            Error::Storage(StorageError::NotFound(what)) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Shared handler state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AppState {
    ingestor: Ingestor,
    store: GraphStore,
    hub: Hub,
    feed: String,
    send_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(log: StreamLog, store: GraphStore, hub: Hub, config: &Config) -> Self {
        Self {
            ingestor: Ingestor::new(log, config.stream.prefix.clone(), &config.ingest),
            store,
            hub,
            feed: config.stream.prefix.clone(),
            send_timeout: config.web.send_timeout(),
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/ingest/:feed", post(ingest))
        .route("/ws", get(ws_upgrade))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:id/graph", get(run_graph))
        .route("/api/runs/:id/snapshot", get(run_snapshot))
        .route("/api/runs/:id/export", get(run_export))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "tracegraph", "version": VERSION }))
}

async fn ingest(
    State(state): State<AppState>,
    Path(feed): Path<String>,
    body: Body,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    if feed != state.feed {
        return Err(AppError::NotFound(format!("unknown feed '{feed}'")));
    }
    let report = state.ingestor.ingest_stream(body.into_data_stream()).await?;
    info!(
        target: "tracegraph.web",
        feed = %feed,
        ingested = report.ingested,
        rejected = report.rejected,
        "ingest complete"
    );
    Ok(Json(json!({
        "status": "ok",
        "ingested": report.ingested,
        "rejected": report.rejected,
    })))
}

#[derive(Debug, Deserialize)]
struct ViewerParams {
    #[serde(rename = "runId")]
    run_id: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ViewerParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let attached = state.hub.attach(params.run_id.as_deref());
    let send_timeout = state.send_timeout;
    ws.on_upgrade(move |socket| async move {
        match attached {
            Ok(viewer) => serve_viewer(socket, viewer, send_timeout).await,
            Err(e) => reject_viewer(socket, e).await,
        }
    })
}

async fn reject_viewer(mut socket: WebSocket, reason: HubError) {
    warn!(target: "tracegraph.web", error = %reason, "viewer rejected");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Cow::Owned(reason.to_string()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn serve_viewer(mut socket: WebSocket, mut viewer: Viewer, send_timeout: Duration) {
    let viewer_id = viewer.id();
    info!(
        target: "tracegraph.web",
        viewer_id,
        run_id = viewer.run_id(),
        "viewer connected"
    );
    loop {
        tokio::select! {
            payload = viewer.recv() => {
                let Some(payload) = payload else {
                    // Cut off by the hub for not draining.
                    let frame = CloseFrame {
                        code: close_code::AGAIN,
                        reason: Cow::Borrowed("viewer too slow"),
                    };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break;
                };
                let send = socket.send(Message::Text(payload.to_string()));
                match tokio::time::timeout(send_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(target: "tracegraph.web", viewer_id, error = %e, "viewer send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(target: "tracegraph.web", viewer_id, "viewer send timed out");
                        break;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "tracegraph.web", viewer_id, error = %e, "viewer socket error");
                    break;
                }
            },
        }
    }
    info!(target: "tracegraph.web", viewer_id, "viewer disconnected");
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsParams>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    let runs = state.store.list_runs(limit).await?;
    Ok(Json(json!({ "runs": runs })))
}

async fn run_graph(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> std::result::Result<Response, AppError> {
    let graph = state
        .store
        .load_graph(&run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;
    Ok(Json(graph).into_response())
}

async fn run_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> std::result::Result<Response, AppError> {
    let snapshot = state
        .store
        .load_latest_snapshot(&run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no snapshot for run '{run_id}'")))?;
    Ok(Json(snapshot).into_response())
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    format: Option<String>,
}

async fn run_export(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(params): Query<ExportParams>,
) -> std::result::Result<Response, AppError> {
    let format = match params.format.as_deref() {
        Some(raw) => raw
            .parse::<ExportFormat>()
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => ExportFormat::default(),
    };
    let graph = state
        .store
        .load_graph(&run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;
    let trace = LlmExecutionTrace::build(&run_id, now_ms(), &graph.nodes, &graph.edges);
    let body = trace.render(format)?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], body).into_response())
}

/// Bind settings for the web server.
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    host: String,
    port: u16,
    /// Must be set to `true` to bind on a non-localhost address.
    allow_public_bind: bool,
}

impl WebServerConfig {
    /// Create a new config with the default localhost host.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            allow_public_bind: false,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let base = Self::new(config.web.port).with_host(config.web.host.clone());
        if config.web.allow_public_bind {
            base.with_dangerous_public_bind()
        } else {
            base
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the bind host.
    ///
    /// Non-localhost addresses require [`Self::with_dangerous_public_bind`].
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Explicitly opt in to binding on a non-localhost address.
    #[must_use]
    pub fn with_dangerous_public_bind(mut self) -> Self {
        self.allow_public_bind = true;
        self
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_localhost(&self) -> bool {
        matches!(
            self.host.as_str(),
            "127.0.0.1" | "::1" | "localhost" | "[::1]"
        )
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// Handle to a running web server.
pub struct WebServerHandle {
    bound_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl WebServerHandle {
    /// The address the server actually bound to.
    #[must_use]
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Trigger graceful shutdown and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        handle_server_exit(self.join.await)
    }
}

/// Start the web server and return a handle for shutdown.
///
/// Refuses to bind on non-localhost addresses unless the config allows it.
pub async fn start_web_server(config: WebServerConfig, state: AppState) -> Result<WebServerHandle> {
    if !config.is_localhost() && !config.allow_public_bind {
        return Err(Error::Runtime(format!(
            "refusing to bind on public address '{}'; set web.allow_public_bind to override",
            config.host
        )));
    }
    if !config.is_localhost() {
        warn!(
            target: "tracegraph.web",
            host = %config.host,
            "binding web server on non-localhost address; endpoints may be remotely reachable"
        );
    }
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let bound_addr = listener.local_addr()?;
    let app = router(state);
    let (shutdown, stop) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop.await;
            })
            .await
    });
    info!(target: "tracegraph.web", bound_addr = %bound_addr, "web server listening");
    Ok(WebServerHandle {
        bound_addr,
        shutdown,
        join,
    })
}

/// Run the web server until Ctrl+C or SIGTERM, then shut down gracefully.
pub async fn run_web_server(config: WebServerConfig, state: AppState) -> Result<()> {
    let handle = start_web_server(config, state).await?;
    wait_for_shutdown_signal().await?;
    info!(target: "tracegraph.web", "shutdown signal received");
    handle.shutdown().await
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Runtime(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}

fn handle_server_exit(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Runtime(format!("web server error: {err}"))),
        Err(err) => Err(Error::Runtime(format!("web server task failed: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::GraphState;
    use crate::event::TelemetryEvent;
    use crate::persistence::PersistenceState;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    struct Harness {
        log: StreamLog,
        store: GraphStore,
        state: AppState,
    }

    fn harness() -> Harness {
        let log = StreamLog::open_in_memory().unwrap();
        let store = GraphStore::open_in_memory().unwrap();
        let state = AppState::new(log.clone(), store.clone(), Hub::default(), &Config::default());
        Harness { log, store, state }
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, String) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn seed_run(store: &GraphStore) {
        let mut state = GraphState::new("r1");
        state.apply(
            &TelemetryEvent::new("r1", 0, 1_000, "call_start")
                .with_span("main")
                .with_node_key("main"),
        );
        state.apply(
            &TelemetryEvent::new("r1", 1, 1_005, "call")
                .with_span("loadData")
                .with_parent("main"),
        );
        let mut tracking = PersistenceState::default();
        store.persist_graph(&state, &mut tracking).await.unwrap();
        store.save_snapshot(&state).await.unwrap();
    }

    #[tokio::test]
    async fn health_reports_service() {
        let h = harness();
        let (status, body) = call(&h.state, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service"], "tracegraph");
    }

    #[tokio::test]
    async fn ingest_counts_lines() {
        let h = harness();
        let body = concat!(
            r#"{"runId":"r1","seq":0,"ts":1000,"kind":"call_start","span":"main","nodeKey":"main"}"#,
            "\n",
            r#"{"runId":"r1","seq":1,"ts":1005,"kind":"call","span":"loadData","parentSpan":"main"}"#,
            "\n",
            "garbage\n",
        );
        let request = Request::builder()
            .method("POST")
            .uri("/ingest/tal")
            .body(Body::from(body))
            .unwrap();
        let (status, body) = call(&h.state, request).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["ingested"], 2);
        assert_eq!(value["rejected"], 1);
        assert_eq!(h.log.stream_len("tal:r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_feed_is_not_found() {
        let h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/ingest/otlp")
            .body(Body::from("{}\n"))
            .unwrap();
        let (status, body) = call(&h.state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("unknown feed"));
    }

    #[tokio::test]
    async fn graph_snapshot_and_runs_endpoints() {
        let h = harness();
        seed_run(&h.store).await;

        let (status, body) = call(&h.state, get_req("/api/runs")).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["runs"][0]["id"], "r1");
        assert_eq!(value["runs"][0]["nodeCount"], 2);

        let (status, body) = call(&h.state, get_req("/api/runs/r1/graph")).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(value["edges"][0]["from"], "main");

        let (status, body) = call(&h.state, get_req("/api/runs/r1/snapshot")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"cursor\""));

        let (status, _) = call(&h.state, get_req("/api/runs/nope/graph")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.state, get_req("/api/runs/nope/snapshot")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_renders_each_format() {
        let h = harness();
        seed_run(&h.store).await;

        let response = router(h.state.clone())
            .oneshot(get_req("/api/runs/r1/export?format=prompt"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/markdown; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("# Execution Trace"));
        assert!(text.contains("- [1] main"));
        assert!(text.contains("\n  - [2] loadData"));

        let (status, body) = call(&h.state, get_req("/api/runs/r1/export")).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["meta"]["runId"], "r1");

        let (status, body) = call(&h.state, get_req("/api/runs/r1/export?format=jsonld")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("urn:tracegraph:run:r1"));

        let (status, _) = call(&h.state, get_req("/api/runs/r1/export?format=xml")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn public_bind_requires_opt_in() {
        let h = harness();
        let config = WebServerConfig::new(0).with_host("0.0.0.0");
        let Err(err) = start_web_server(config, h.state.clone()).await else {
            panic!("public bind must be refused");
        };
        assert!(err.to_string().contains("refusing to bind"));
    }

    async fn handshake(addr: SocketAddr, path: &str) -> (tokio::net::TcpStream, Vec<u8>) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let header_end = loop {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed during handshake");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        (stream, buf[header_end..].to_vec())
    }

    /// Read one unmasked server frame with a short payload.
    async fn read_frame(stream: &mut tokio::net::TcpStream, mut buf: Vec<u8>) -> (u8, Vec<u8>) {
        loop {
            if buf.len() >= 2 && buf.len() >= 2 + usize::from(buf[1] & 0x7f) {
                let len = usize::from(buf[1] & 0x7f);
                return (buf[0], buf[2..2 + len].to_vec());
            }
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed before frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn websocket_without_run_id_closes_with_policy_violation() {
        let h = harness();
        let handle = start_web_server(WebServerConfig::new(0), h.state.clone())
            .await
            .unwrap();
        let (mut stream, rest) = handshake(handle.bound_addr(), "/ws").await;
        let (opcode, payload) = read_frame(&mut stream, rest).await;
        assert_eq!(opcode, 0x88);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1008);
        assert_eq!(&payload[2..], b"runId query parameter is required");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn websocket_viewer_receives_dispatched_deltas() {
        let h = harness();
        let hub = h.state.hub().clone();
        let handle = start_web_server(WebServerConfig::new(0), h.state.clone())
            .await
            .unwrap();
        let (mut stream, rest) = handshake(handle.bound_addr(), "/ws?runId=r1").await;
        assert_eq!(hub.viewers_for("r1"), 1);
        assert_eq!(hub.dispatch("updates:r1", r#"{"runId":"r1"}"#).delivered, 1);
        let (opcode, payload) = read_frame(&mut stream, rest).await;
        assert_eq!(opcode, 0x81);
        assert_eq!(payload, br#"{"runId":"r1"}"#);
        drop(stream);
        handle.shutdown().await.unwrap();
    }
}
