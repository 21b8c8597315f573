use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use vepline_engine::{Pipeline, SubmitError};
use vepline_settings::ServerSettings;

use crate::connection::{self, ConnectionConfig};
use crate::submission::parse_submission;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub ping_interval: Duration,
    /// Bound on a REST submission, including time spent waiting for bus room.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            ping_interval: s.ping_interval(),
            request_timeout: s.request_timeout(),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub connection: ConnectionConfig,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/genetics", get(ws_handler))
        .route(
            "/api/genetic/analyze",
            post(analyze_handler).layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                request_timeout,
            )),
        )
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `cancel` fires. The pipeline must already be
/// started by the caller.
pub async fn start(
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        pipeline,
        connection: ConnectionConfig {
            max_send_queue: config.max_send_queue,
            ping_interval: config.ping_interval,
        },
    };
    let router = build_router(state, config.request_timeout);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "vepline server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        server,
    })
}

/// Handle returned by [`start`]. Await `join` after cancelling to wait for
/// in-flight HTTP requests to finish.
pub struct ServerHandle {
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn join(self) {
        let _ = self.server.await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| {
        connection::handle_connection(socket, state.pipeline, state.connection)
    })
}

/// REST submission. There is no session to deliver to, so only the ack is
/// returned.
async fn analyze_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let submission = match parse_submission(&body) {
        Ok(s) => s,
        Err(e) => {
            state.pipeline.metrics().record_rejected();
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };
    match state.pipeline.submit(submission, None).await {
        Ok(ack) => match serde_json::to_value(&ack) {
            Ok(v) => (StatusCode::ACCEPTED, Json(v)),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ),
        },
        Err(SubmitError::Validation(e)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.pipeline.health();
    let service_up = state.pipeline.annotator_ready().await;
    let status = if !service_up || report.reliability.circuit_state == "open" {
        "degraded"
    } else {
        "healthy"
    };
    let mut body = serde_json::to_value(&report).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("status".into(), json!(status));
        obj.insert(
            "annotationService".into(),
            json!(if service_up { "up" } else { "down" }),
        );
    }
    (StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vepline_annotator::{MockAnnotator, MockResponse, ReliableAnnotator, VepClient};
    use vepline_settings::Settings;
    use vepline_telemetry::PipelineMetrics;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline() -> Arc<Pipeline> {
        let annotator = Arc::new(ReliableAnnotator::with_defaults(Arc::new(
            MockAnnotator::always(MockResponse::echo()),
        )));
        Arc::new(Pipeline::new(
            &Settings::default(),
            annotator,
            Arc::new(PipelineMetrics::new()),
        ))
    }

    #[test]
    fn config_follows_settings() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_send_queue, 256);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let state = AppState {
            pipeline: pipeline(),
            connection: ConnectionConfig {
                max_send_queue: 8,
                ping_interval: Duration::from_secs(30),
            },
        };
        let _router = build_router(state, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let cancel = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, pipeline(), cancel.clone()).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["annotationService"], "up");
        assert_eq!(body["reliability"]["circuitState"], "closed");

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn stalled_submission_times_out_with_408() {
        let mut settings = Settings::default();
        settings.pipeline.lane_capacity = 1;
        let annotator = Arc::new(ReliableAnnotator::with_defaults(Arc::new(
            MockAnnotator::always(MockResponse::echo()),
        )));
        // Not started: nothing drains the lane, so the second publish waits.
        let pipeline = Arc::new(Pipeline::new(
            &settings,
            annotator,
            Arc::new(PipelineMetrics::new()),
        ));

        let cancel = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let handle = start(config, pipeline, cancel.clone()).await.unwrap();
        let url = format!("http://{}/api/genetic/analyze", handle.addr);
        let client = reqwest::Client::new();

        let first = client.post(&url).body("ACGT").send().await.unwrap();
        assert_eq!(first.status(), 202);
        let second = client.post(&url).body("ACGT").send().await.unwrap();
        assert_eq!(second.status(), 408);

        cancel.cancel();
        handle.join().await;
    }

    async fn health_against(vep: &MockServer) -> serde_json::Value {
        let mut settings = Settings::default();
        settings.annotator.base_url = vep.uri();
        let client = VepClient::new(&settings.annotator).unwrap();
        let annotator = Arc::new(ReliableAnnotator::with_defaults(Arc::new(client)));
        let pipeline = Arc::new(Pipeline::new(
            &settings,
            annotator,
            Arc::new(PipelineMetrics::new()),
        ));

        let cancel = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, pipeline, cancel.clone()).await.unwrap();
        let body = reqwest::get(format!("http://{}/health", handle.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        cancel.cancel();
        handle.join().await;
        body
    }

    #[tokio::test]
    async fn health_reports_reachable_annotation_service() {
        let vep = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ping": 1})))
            .expect(1)
            .mount(&vep)
            .await;

        let body = health_against(&vep).await;
        assert_eq!(body["annotationService"], "up");
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn health_degrades_when_ping_fails() {
        let vep = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info/ping"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&vep)
            .await;

        let body = health_against(&vep).await;
        assert_eq!(body["annotationService"], "down");
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["reliability"]["circuitState"], "closed");
    }
}
