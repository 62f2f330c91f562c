//! Worker HTTP surface: accept task events, report tasks and stats, queue
//! stops.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::stats::Stats;
use super::Worker;
use crate::task::{Event, State, Task};

/// Error body shared by the worker and manager APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrResponse {
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u16,
    #[serde(rename = "Message")]
    pub message: String,
}

pub struct TaskServer {
    worker: Arc<Mutex<Worker>>,
    address: String,
    port: u16,
}

impl TaskServer {
    pub fn new(worker: Arc<Mutex<Worker>>, address: &str, port: u16) -> Self {
        TaskServer {
            worker,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(worker: Arc<Mutex<Worker>>) -> Router {
        Router::new()
            .route("/tasks", get(get_tasks).post(start_task))
            .route("/tasks/{task_id}", delete(stop_task))
            .route("/stats", get(get_stats))
            .with_state(worker)
    }

    pub async fn start(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "worker API listening");
        axum::serve(listener, Self::router(self.worker)).await
    }
}

async fn get_tasks(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<Vec<Task>> {
    Json(worker.lock().await.get_tasks())
}

async fn start_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    payload: Result<Json<Event>, JsonRejection>,
) -> Response {
    let event = match payload {
        Ok(Json(event)) => event,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "event decode failed");
            let body = ErrResponse {
                http_status_code: 400,
                message: rejection.body_text(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let task = event.task.clone();
    worker.lock().await.add_task(event.task);
    info!(task_id = %task.id, "task queued");
    (StatusCode::CREATED, Json(task)).into_response()
}

async fn stop_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    Path(task_id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&task_id) else {
        warn!(%task_id, "malformed task id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut guard = worker.lock().await;
    let task = match guard.task(&id) {
        Ok(task) => task,
        Err(_) => {
            warn!(%task_id, "task not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut stopped = task;
    stopped.state = State::Completed;
    info!(task_id = %id, container_id = ?stopped.container_id, "task queued for stop");
    guard.add_task(stopped);

    StatusCode::NO_CONTENT.into_response()
}

async fn get_stats(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<Stats> {
    Json(worker.lock().await.stats().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use reqwest::Client;

    async fn spawn_worker() -> (Arc<Mutex<Worker>>, String) {
        let worker = Arc::new(Mutex::new(Worker::new("test-worker", "memory").unwrap()));
        let app = TaskServer::router(worker.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (worker, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn post_task_queues_and_answers_created() {
        let (worker, base) = spawn_worker().await;
        let event = Event::new(State::Scheduled, Task::default());

        let resp = Client::new()
            .post(format!("{base}/tasks"))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let created: Task = resp.json().await.unwrap();
        assert_eq!(created.id, event.task.id);
        assert_eq!(worker.lock().await.queue_len(), 1);
    }

    #[tokio::test]
    async fn post_garbage_answers_bad_request_with_err_response() {
        let (_worker, base) = spawn_worker().await;

        let resp = Client::new()
            .post(format!("{base}/tasks"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let err: ErrResponse = resp.json().await.unwrap();
        assert_eq!(err.http_status_code, 400);
        assert!(!err.message.is_empty());
    }

    #[tokio::test]
    async fn delete_queues_a_completed_copy() {
        let (worker, base) = spawn_worker().await;

        let mut task = Task::default();
        task.state = State::Running;
        task.container_id = Some("cafebabe".to_string());
        let id = task.id;
        worker
            .lock()
            .await
            .db
            .put(&id.to_string(), task)
            .unwrap();

        let resp = Client::new()
            .delete(format!("{base}/tasks/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let mut guard = worker.lock().await;
        assert_eq!(guard.queue_len(), 1);
        let queued = guard.queue.pop_front().unwrap();
        assert_eq!(queued.id, id);
        assert_eq!(queued.state, State::Completed);
    }

    #[tokio::test]
    async fn delete_unknown_task_answers_not_found() {
        let (_worker, base) = spawn_worker().await;
        let resp = Client::new()
            .delete(format!("{base}/tasks/{}", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn delete_malformed_id_answers_bad_request() {
        let (_worker, base) = spawn_worker().await;
        let resp = Client::new()
            .delete(format!("{base}/tasks/not-a-uuid"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn stats_answers_a_snapshot() {
        let (worker, base) = spawn_worker().await;
        worker.lock().await.collect_stats();

        let resp = Client::new()
            .get(format!("{base}/stats"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let _stats: Stats = resp.json().await.unwrap();
    }
}
