//! HTTP and WebSocket routes.
//!
//! Thin glue over [`Runner`]: JSON in, JSON out, and a WebSocket that
//! forwards observer snapshots for a nonce.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::observer::Subscription;
use crate::request::ExecutionRequest;
use crate::runner::{RunError, Runner};

/// Largest accepted `run` body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Build the router.
pub fn router(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/runner/{version}/health", get(health))
        .route(
            "/runner/{version}/run",
            post(run).layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route("/runner/{version}/logs/{nonce}", get(logs))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

/// Serve the router on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, runner: Arc<Runner>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %listener.local_addr()?, "Starting HTTP server");

    axum::serve(listener, router(runner))
        .await
        .context("HTTP server error")
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn status() -> Json<serde_json::Value> {
    Json(json!({ "status": "pass" }))
}

async fn health(State(runner): State<Arc<Runner>>, Path(version): Path<String>) -> Response {
    match runner.probe(&version).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(version = %version, error = %format!("{e:#}"), "Health probe failed to run");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "fail", "version": version })),
            )
                .into_response()
        }
    }
}

async fn run(
    State(runner): State<Arc<Runner>>,
    Path(version): Path<String>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return reject_body(&rejection),
    };

    match runner.run(&version, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            if e.is_client_error() {
                debug!(version = %version, error = %e, "Rejected request");
            } else {
                error!(version = %version, error = %e, "Run failed");
            }
            e.into_response()
        }
    }
}

/// Undecodable bodies are bad requests; other rejections keep their status.
fn reject_body(rejection: &JsonRejection) -> Response {
    let status = match rejection {
        JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => rejection.status(),
    };
    debug!(%status, error = %rejection.body_text(), "Rejected request body");
    (status, Json(json!({ "error": rejection.body_text() }))).into_response()
}

async fn logs(
    State(runner): State<Arc<Runner>>,
    Path((_version, nonce)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        let subscription = runner.observe(&nonce);
        forward_snapshots(socket, subscription)
    })
}

/// Send every snapshot as a JSON text frame; close when the job ends.
async fn forward_snapshots(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            snapshot = subscription.next() => {
                let Some(snapshot) = snapshot else { break };
                let payload = match serde_json::to_string(&snapshot) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode snapshot");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Err(_) | Ok(Message::Close(_))) => {
                    debug!("Log client disconnected");
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::ExecutionResult;
    use crate::runner::tests::{MockBackend, TestEnv};
    use crate::sentinel::{STATUS_FILE, STDERR_FILE, STDOUT_FILE, VERSION_FILE};
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    /// What the log socket delivered next.
    #[derive(Debug)]
    enum Frame {
        Snapshot(ExecutionResult),
        Closed,
    }

    async fn spawn_server(runner: Arc<Runner>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(runner)).await.unwrap() });
        addr
    }

    async fn next_frame(client: &mut Client) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("log socket went quiet")
                .expect("log socket ended without a close frame")
                .unwrap();
            match message {
                WsMessage::Text(text) => {
                    return Frame::Snapshot(serde_json::from_str(&text).unwrap());
                }
                WsMessage::Close(_) => return Frame::Closed,
                _ => {}
            }
        }
    }

    fn job_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "Swift version 5.10\n").unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), "line 1\n").unwrap();
        std::fs::write(dir.path().join(STDERR_FILE), "/TEMP/main.swift:7:3: warning: w\n").unwrap();
        dir
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_run(version: &str, body: &str) -> Request<Body> {
        Request::post(format!("/runner/{version}/run"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_reports_pass() {
        let env = TestEnv::new();
        let app = router(Arc::new(Runner::new(env.config(), MockBackend::finishing("", ""))));

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        assert_eq!(body_json(response).await, json!({ "status": "pass" }));
    }

    #[tokio::test]
    async fn run_returns_execution_result() {
        let env = TestEnv::new();
        let app = router(Arc::new(Runner::new(
            env.config(),
            MockBackend::finishing("Hello\n", ""),
        )));

        let response = app
            .oneshot(post_run("5.10", r#"{"code": "print(\"Hello\")", "_nonce": "n1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({
                "output": "Hello\n",
                "errors": "",
                "version": "Swift version 5.10\n",
            })
        );
        assert_eq!(env.workspace_count(), 0);
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let env = TestEnv::new();
        let runner = Arc::new(Runner::new(env.config(), MockBackend::finishing("", "")));

        for body in [
            r#"{"code": "print(1)", "command": "bash"}"#,
            r#"{"code": "print(1)", "options": "-O; id"}"#,
            r#"{"command": "swift"}"#,
        ] {
            let response = router(Arc::clone(&runner))
                .oneshot(post_run("5.10", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            assert!(body_json(response).await["error"].is_string());
        }
        assert_eq!(env.workspace_count(), 0);
    }

    #[tokio::test]
    async fn mistyped_fields_are_bad_requests() {
        let env = TestEnv::new();
        let runner = Arc::new(Runner::new(env.config(), MockBackend::finishing("", "")));

        for body in [
            r#"{"code": "print(1)", "timeout": "x"}"#,
            r#"{"code": "print(1)", "command": 5}"#,
            r#"{"code": "#,
        ] {
            let response = router(Arc::clone(&runner))
                .oneshot(post_run("5.10", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            assert!(body_json(response).await["error"].is_string());
        }
        assert_eq!(env.workspace_count(), 0);
    }

    #[tokio::test]
    async fn health_reports_probe() {
        let env = TestEnv::new();
        let app = router(Arc::new(Runner::new(env.config(), MockBackend::finishing("", ""))));

        let response = app
            .oneshot(Request::get("/runner/5.10/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({
                "status": "pass",
                "version": "5.10",
                "installedVersion": "Swift version 5.10",
            })
        );
    }

    #[tokio::test]
    async fn logs_requires_websocket_upgrade() {
        let env = TestEnv::new();
        let app = router(Arc::new(Runner::new(env.config(), MockBackend::finishing("", ""))));

        let response = app
            .oneshot(Request::get("/runner/5.10/logs/n1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn logs_stream_snapshots_until_job_ends() {
        let env = TestEnv::new();
        let runner = Arc::new(Runner::new(env.config(), MockBackend::finishing("", "")));
        let job = job_dir();
        runner.registry().register("ws1", job.path()).await;

        let addr = spawn_server(Arc::clone(&runner)).await;
        let (mut client, _) = connect_async(format!("ws://{addr}/runner/5.10/logs/ws1"))
            .await
            .unwrap();

        let Frame::Snapshot(first) = next_frame(&mut client).await else {
            panic!("expected a snapshot before close");
        };
        assert_eq!(
            first,
            ExecutionResult {
                output: "line 1\n".to_string(),
                errors: "main.swift:3:3: warning: w\n".to_string(),
                version: "Swift version 5.10\n".to_string(),
            }
        );

        std::fs::write(job.path().join(STDOUT_FILE), "line 1\nline 2\n").unwrap();
        std::fs::write(job.path().join(STATUS_FILE), "0").unwrap();

        let mut last = first;
        loop {
            match next_frame(&mut client).await {
                Frame::Snapshot(snapshot) => last = snapshot,
                Frame::Closed => break,
            }
        }
        assert_eq!(last.output, "line 1\nline 2\n");
    }

    #[tokio::test]
    async fn client_close_stops_observer() {
        let env = TestEnv::new();
        let runner = Arc::new(Runner::new(env.config(), MockBackend::finishing("", "")));
        let job = job_dir();
        runner.registry().register("ws2", job.path()).await;
        let idle_refs = Arc::strong_count(runner.registry());

        let addr = spawn_server(Arc::clone(&runner)).await;
        let (mut client, _) = connect_async(format!("ws://{addr}/runner/5.10/logs/ws2"))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut client).await, Frame::Snapshot(_)));
        // The observer task holds its own registry handle while streaming
        assert!(Arc::strong_count(runner.registry()) > idle_refs);

        client.close(None).await.unwrap();

        for _ in 0..250 {
            if Arc::strong_count(runner.registry()) == idle_refs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(Arc::strong_count(runner.registry()), idle_refs);
        // Job state is untouched
        assert!(job.path().exists());
        assert_eq!(runner.registry().lookup("ws2").await, Some(job.path().to_path_buf()));
    }
}
