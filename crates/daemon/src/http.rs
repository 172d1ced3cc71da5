//! Read-only monitoring surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use paintboard_core::scheduler::{Scheduler, SchedulerStatus, TaskSummary};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use ulid::Ulid;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Identifies this daemon process in status output.
    pub instance: Ulid,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance: Ulid,
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (code, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/tasks/{id}", get(task))
        .route("/v1/board", get(board))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        instance: state.instance,
        scheduler: state.scheduler.status(),
    })
}

async fn task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSummary>, ApiError> {
    state
        .scheduler
        .status()
        .tasks
        .into_iter()
        .find(|t| t.id == id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))
}

/// `u32` LE height, `u32` LE width, then the column-major grid.
async fn board(State(state): State<AppState>) -> Result<Response, ApiError> {
    let canvas = state
        .scheduler
        .board()
        .view()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    let cells = canvas.to_bytes();
    let mut body = Vec::with_capacity(8 + cells.len());
    body.extend_from_slice(&(canvas.height() as u32).to_le_bytes());
    body.extend_from_slice(&(canvas.width() as u32).to_le_bytes());
    body.extend_from_slice(&cells);
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use paintboard_core::board::Board;
    use paintboard_core::config::EngineConfig;
    use paintboard_core::model::{BoardState, PaintOutcome, PaintTarget, PaintboardUpdate, Validation};
    use paintboard_core::ports::{CanvasSource, PaintApi, UpdateFeed};
    use paintboard_core::throttle::RequestThrottle;
    use tokio::sync::mpsc;

    use super::*;
    use crate::directory::FileDirectory;

    #[derive(Default)]
    struct StaticCanvas {
        feed: Mutex<Option<mpsc::Sender<PaintboardUpdate>>>,
    }

    #[async_trait]
    impl CanvasSource for StaticCanvas {
        async fn fetch_snapshot(&self) -> anyhow::Result<BoardState> {
            Ok(BoardState {
                width: 2,
                height: 3,
                data: (0..6).collect(),
            })
        }

        async fn open_feed(&self) -> anyhow::Result<UpdateFeed> {
            let (tx, rx) = mpsc::channel(8);
            *self.feed.lock().unwrap() = Some(tx);
            Ok(rx)
        }
    }

    struct Refusing;

    #[async_trait]
    impl PaintApi for Refusing {
        async fn paint(&self, _token: &str, _target: PaintTarget, _route: usize) -> PaintOutcome {
            PaintOutcome::BadRequest
        }

        async fn validate(&self, _token: &str, _route: usize) -> anyhow::Result<Validation> {
            Ok(Validation::Valid)
        }
    }

    #[tokio::test]
    async fn monitor_reports_board_and_status() {
        let config = EngineConfig {
            width: 2,
            height: 3,
            ..EngineConfig::default()
        };
        let board = Board::new(Arc::new(StaticCanvas::default()), &config);
        let throttle = Arc::new(RequestThrottle::new(&config.throttle));
        let directory = FileDirectory::new("unused.json");
        let scheduler = Scheduler::new(
            config,
            board.clone(),
            throttle,
            Arc::new(Refusing),
            directory.clone(),
            directory,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let state = AppState {
                scheduler,
                instance: paintboard_core::new_ulid(),
            };
            axum::serve(listener, router(state)).await.unwrap();
        });
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let closed = client.get(format!("{base}/v1/board")).send().await.unwrap();
        assert_eq!(closed.status().as_u16(), 503);

        board.initialize().await.unwrap();
        let open = client.get(format!("{base}/v1/board")).send().await.unwrap();
        assert_eq!(open.status().as_u16(), 200);
        let bytes = open.bytes().await.unwrap();
        assert_eq!(&bytes[..], &[3, 0, 0, 0, 2, 0, 0, 0, 0, 1, 2, 3, 4, 5]);

        let status: serde_json::Value = client
            .get(format!("{base}/v1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["board"], "open");
        assert_eq!(status["generation"], 1);
        assert_eq!(status["instance"].as_str().map(str::len), Some(26));

        let missing = client.get(format!("{base}/v1/tasks/nope")).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }
}
