//! Manager HTTP surface: accept task events from users, report tasks and
//! node views, accept stop requests.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::Manager;
use crate::node::Node;
use crate::task::{Event, State, Task};
use crate::worker::api::ErrResponse;

pub struct ManagerServer {
    manager: Arc<Mutex<Manager>>,
    address: String,
    port: u16,
}

impl ManagerServer {
    pub fn new(manager: Arc<Mutex<Manager>>, address: &str, port: u16) -> Self {
        ManagerServer {
            manager,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(manager: Arc<Mutex<Manager>>) -> Router {
        Router::new()
            .route("/tasks", get(get_tasks).post(start_task))
            .route("/tasks/{task_id}", delete(stop_task))
            .route("/nodes", get(get_nodes))
            .with_state(manager)
    }

    pub async fn start(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "manager API listening");
        axum::serve(listener, Self::router(self.manager)).await
    }
}

async fn get_tasks(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<Task>> {
    Json(manager.lock().await.get_tasks())
}

async fn start_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
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
    manager.lock().await.add_task(event);
    info!(task_id = %task.id, "task event accepted");
    (StatusCode::CREATED, Json(task)).into_response()
}

/// Enqueue a `Completed` event for the task; the placement pipeline routes
/// the stop to the right worker.
async fn stop_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
    Path(task_id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&task_id) else {
        warn!(%task_id, "malformed task id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut guard = manager.lock().await;
    let task = match guard.task(&id) {
        Ok(task) => task,
        Err(_) => {
            warn!(%task_id, "task not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let event = Event::new(State::Completed, task);
    info!(event_id = %event.id, task_id = %id, "stop event accepted");
    guard.add_task(event);

    StatusCode::NO_CONTENT.into_response()
}

async fn get_nodes(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<Node>> {
    Json(manager.lock().await.worker_nodes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use reqwest::Client;

    async fn spawn_manager() -> (Arc<Mutex<Manager>>, String) {
        let manager = Arc::new(Mutex::new(
            Manager::new(vec!["127.0.0.1:5556".to_string()], "round_robin", "memory").unwrap(),
        ));
        let app = ManagerServer::router(manager.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (manager, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn post_task_enqueues_the_event() {
        let (manager, base) = spawn_manager().await;
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
        assert_eq!(manager.lock().await.pending_len(), 1);
    }

    #[tokio::test]
    async fn post_garbage_answers_bad_request() {
        let (manager, base) = spawn_manager().await;
        let resp = Client::new()
            .post(format!("{base}/tasks"))
            .header("content-type", "application/json")
            .body("[[[")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let err: ErrResponse = resp.json().await.unwrap();
        assert_eq!(err.http_status_code, 400);
        assert_eq!(manager.lock().await.pending_len(), 0);
    }

    #[tokio::test]
    async fn delete_enqueues_a_completed_event() {
        let (manager, base) = spawn_manager().await;

        let mut task = Task::default();
        task.state = State::Running;
        let id = task.id;
        manager
            .lock()
            .await
            .task_db
            .put(&id.to_string(), task)
            .unwrap();

        let resp = Client::new()
            .delete(format!("{base}/tasks/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let mut guard = manager.lock().await;
        assert_eq!(guard.pending_len(), 1);
        let event = guard.pending.pop_front().unwrap();
        assert_eq!(event.state, State::Completed);
        assert_eq!(event.task.id, id);
    }

    #[tokio::test]
    async fn delete_unknown_task_answers_not_found() {
        let (_manager, base) = spawn_manager().await;
        let resp = Client::new()
            .delete(format!("{base}/tasks/{}", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn delete_malformed_id_answers_bad_request() {
        let (_manager, base) = spawn_manager().await;
        let resp = Client::new()
            .delete(format!("{base}/tasks/not-a-uuid"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn nodes_lists_the_worker_views() {
        let (_manager, base) = spawn_manager().await;
        let resp = Client::new()
            .get(format!("{base}/nodes"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let nodes: Vec<Node> = resp.json().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "127.0.0.1:5556");
        assert_eq!(nodes[0].role, "worker");
    }
}
