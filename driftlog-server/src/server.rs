use crate::config::Config;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use driftlog_core::{
    BlobStore, ContentSum, ConvergeReport, DriftError, LocalSpool, Persister, Result, SUM_LEN,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub persister: Arc<Persister>,
    pub spool: LocalSpool,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(status: StatusCode, data: T) -> Response {
        let body = ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        };
        (status, Json(body)).into_response()
    }
}

fn error_response(error: &DriftError) -> Response {
    let status = match error {
        DriftError::InvalidRequest(_) | DriftError::InvalidContentName(_) => {
            StatusCode::BAD_REQUEST
        }
        DriftError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterFragmentRequest {
    journal: String,
    begin: u64,
    end: u64,
    /// Hex-encoded content sum.
    sum: String,
}

#[derive(Debug, Serialize)]
struct RegisterFragmentResponse {
    journal: String,
    content_name: String,
    pending: usize,
}

pub async fn run_server(config: Config) -> Result<()> {
    let registry = config.registry.builder()?.build().await?;
    let blob_store = BlobStore::from_url(&config.blob_store.url)?;
    let persister_config = config.persister_config()?;

    let persister = Arc::new(Persister::new(persister_config, registry, blob_store)?);
    if config.spool.scan_on_start {
        persister.recover_spool().await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let converge_loop = persister.spawn(shutdown_rx);

    let state = Arc::new(ServerState {
        persister,
        spool: LocalSpool::new(config.spool.root.clone()),
        started_at: chrono::Utc::now(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!(
        "Server listening on {} as {}",
        config.node.bind_addr,
        config.node.route_key
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(error) = converge_loop.await {
        tracing::warn!("Persister loop ended abnormally: {}", error);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/fragments", post(register_fragment))
        .route("/converge", post(converge_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!("Failed to install SIGTERM handler: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "route_key": state.persister.config().route_key,
        "status": "ok",
        "pending": state.persister.pending_len(),
        "started_at": state.started_at.to_rfc3339(),
    });

    (StatusCode::OK, Json(response))
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.persister.status()))
}

async fn register_fragment(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RegisterFragmentRequest>,
) -> Response {
    let sum = match decode_sum(&request.sum) {
        Ok(sum) => sum,
        Err(error) => return error_response(&error),
    };

    let fragment = match state
        .spool
        .open(&request.journal, request.begin, request.end, sum)
        .await
    {
        Ok(fragment) => fragment,
        Err(error) => {
            tracing::warn!(
                "Rejected fragment {}@{}..{}: {}",
                request.journal,
                request.begin,
                request.end,
                error
            );
            return error_response(&error);
        }
    };

    let content_name = fragment.content_name();
    state.persister.persist(fragment);

    ApiResponse::ok(
        StatusCode::ACCEPTED,
        RegisterFragmentResponse {
            journal: request.journal,
            content_name,
            pending: state.persister.pending_len(),
        },
    )
}

async fn converge_handler(State(state): State<Arc<ServerState>>) -> Response {
    let reports: Vec<ConvergeReport> = state.persister.run_pass().await;
    ApiResponse::ok(StatusCode::OK, reports)
}

fn decode_sum(encoded: &str) -> Result<ContentSum> {
    let bytes = hex::decode(encoded.trim()).map_err(|error| {
        DriftError::InvalidRequest(format!("invalid sum {:?}: {}", encoded, error))
    })?;

    ContentSum::try_from(bytes.as_slice()).map_err(|_| {
        DriftError::InvalidRequest(format!(
            "sum must be {} bytes, got {}",
            SUM_LEN,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use bytes::Bytes;
    use driftlog_core::{MemoryLeaseRegistry, PersisterConfig};
    use tower::ServiceExt;

    const SUM_HEX: &str = "0102030405060708090a0b0c0d0e0f1011121314";

    struct TestServer {
        _spool_dir: tempfile::TempDir,
        state: Arc<ServerState>,
        blob_store: BlobStore,
    }

    fn test_server() -> TestServer {
        let spool_dir = tempfile::tempdir().unwrap();
        let blob_store = BlobStore::memory();
        let persister = Persister::new(
            PersisterConfig::new(spool_dir.path(), "route-key"),
            Arc::new(MemoryLeaseRegistry::new()),
            blob_store.clone(),
        )
        .unwrap();

        TestServer {
            state: Arc::new(ServerState {
                persister: Arc::new(persister),
                spool: LocalSpool::new(spool_dir.path()),
                started_at: chrono::Utc::now(),
            }),
            _spool_dir: spool_dir,
            blob_store,
        }
    }

    async fn call(server: &TestServer, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = build_router(server.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_decode_sum() {
        assert_eq!(decode_sum(SUM_HEX).unwrap()[19], 20);
        assert!(matches!(decode_sum("zz"), Err(DriftError::InvalidRequest(_))));
        assert!(matches!(decode_sum("0102"), Err(DriftError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_register_then_converge() {
        let server = test_server();
        let sum = decode_sum(SUM_HEX).unwrap();
        server
            .state
            .spool
            .stage("a/journal", 1000, sum, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let (status, body) = call(
            &server,
            post_json(
                "/fragments",
                serde_json::json!({
                    "journal": "a/journal",
                    "begin": 1000,
                    "end": 1010,
                    "sum": SUM_HEX,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["pending"], 1);

        let (status, body) = call(
            &server,
            Request::get("/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({"a/journal": ["00000000000003e8-00000000000003f2-0102030405060708090a0b0c0d0e0f1011121314"]})
        );

        let (status, body) = call(&server, post_json("/converge", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["outcome"], "persisted");
        assert_eq!(body["data"][0]["bytes"], 10);

        assert!(
            server
                .blob_store
                .exists("a/journal/00000000000003e8-00000000000003f2-0102030405060708090a0b0c0d0e0f1011121314")
                .await
                .unwrap()
        );
        assert_eq!(server.state.persister.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_register_missing_spool_file() {
        let server = test_server();
        let (status, body) = call(
            &server,
            post_json(
                "/fragments",
                serde_json::json!({"journal": "a/journal", "begin": 0, "end": 5, "sum": SUM_HEX}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(server.state.persister.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_register_rejects_dotted_journal() {
        let server = test_server();

        for journal in ["a/../journal", "a//journal"] {
            let (status, body) = call(
                &server,
                post_json(
                    "/fragments",
                    serde_json::json!({
                        "journal": journal,
                        "begin": 0,
                        "end": 5,
                        "sum": SUM_HEX,
                    }),
                ),
            )
            .await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], false);
        }
        assert_eq!(server.state.persister.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let server = test_server();
        let (status, body) = call(
            &server,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route_key"], "route-key");
        assert_eq!(body["pending"], 0);
    }
}
