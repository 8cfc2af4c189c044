use std::{path::PathBuf, sync::Arc, time::Duration};

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    address::AddressSpec,
    engine::{Engine, EngineConfig},
    error::ScanError,
    report::{ChannelReporter, DEFAULT_CHANNEL_CAPACITY},
    services::ServiceTable,
    types::{PortRange, ProbeResult, MAX_PORT, MIN_PORT},
};

/// Settings for the WebSocket front-end. Every connection gets its own
/// engine built from `concurrency` and `timeout`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            concurrency: 1024,
            timeout: Duration::from_millis(500),
            static_dir: PathBuf::from("static"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    services: Arc<ServiceTable>,
}

impl AppState {
    pub fn new(config: ServerConfig, services: Arc<ServiceTable>) -> Self {
        Self {
            config: Arc::new(config),
            services,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanQuery {
    pub ip: String,
    #[serde(default = "default_start")]
    pub start: u32,
    #[serde(default = "default_end")]
    pub end: u32,
}

fn default_start() -> u32 {
    MIN_PORT.into()
}

fn default_end() -> u32 {
    MAX_PORT.into()
}

impl ScanQuery {
    pub fn validate(&self) -> Result<(AddressSpec, PortRange), ScanError> {
        Ok((
            AddressSpec::parse(&self.ip)?,
            PortRange::normalize(self.start, self.end)?,
        ))
    }
}

/// One WebSocket text frame.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ProbeRecord {
    pub endpoint: String,
    pub port_name: String,
    pub open: bool,
    pub error: String,
    pub elapsed_ms: u64,
    pub timestamp: String,
}

impl ProbeRecord {
    pub fn new(result: &ProbeResult, services: &ServiceTable) -> Self {
        Self {
            endpoint: result.target.to_string(),
            port_name: services.resolve(result.target.port()).into_owned(),
            open: result.open,
            error: result
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            elapsed_ms: result.elapsed_ms,
            timestamp: now_rfc3339(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let static_svc = ServeDir::new(&state.config.static_dir).append_index_html_on_directories(true);

    Router::new()
        .route("/scan", get(ws_scan))
        .fallback_service(static_svc)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-cache"),
                )),
        )
        .with_state(state)
}

/// Serve the WebSocket API and static UI until Ctrl-C.
pub async fn spawn_server(config: ServerConfig, services: Arc<ServiceTable>) -> Result<()> {
    let bind = config.bind.clone();
    let app = router(AppState::new(config, services));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("serving UI on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn ws_scan(
    State(app): State<AppState>,
    Query(query): Query<ScanQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (spec, ports) = match query.validate() {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    info!(%spec, %ports, "starting websocket scan");
    ws.on_upgrade(move |socket| stream_scan(socket, app, spec, ports))
}

/// Run one scan on a private engine and push each result to the socket.
/// A failed write or a client close stops the engine.
async fn stream_scan(socket: WebSocket, app: AppState, spec: AddressSpec, ports: PortRange) {
    let (mut sink, mut incoming) = socket.split();
    let (reporter, mut results) = ChannelReporter::channel(DEFAULT_CHANNEL_CAPACITY);
    let config = EngineConfig::new(Arc::new(reporter))
        .with_concurrency(app.config.concurrency)
        .with_timeout(app.config.timeout);

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            warn!("cannot start engine: {e}");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let stop = engine.stop_handle();

    let scan = tokio::spawn(async move {
        let summary = engine.scan_spec(&spec, ports).await;
        engine.shutdown().await;
        summary
    });

    loop {
        tokio::select! {
            next = results.recv() => match next {
                Some(result) => {
                    let record = ProbeRecord::new(&result, &app.services);
                    let text = match serde_json::to_string(&record) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("cannot encode result: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        warn!("stopping scan (lost socket)");
                        stop.stop();
                        break;
                    }
                }
                // Engine dropped its reporter: the scan is over.
                None => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("client went away, stopping scan");
                    stop.stop();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // A collector blocked on a full channel gives up once the receiver is gone.
    drop(results);
    match scan.await {
        Ok(summary) => info!(
            delivered = summary.delivered,
            open = summary.open,
            cancelled = summary.cancelled,
            "websocket scan finished"
        ),
        Err(e) => warn!("scan task failed: {e}"),
    }
    let _ = sink.close().await;
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
