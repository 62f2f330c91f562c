//! Manager and worker talking over real HTTP, without a container runtime:
//! placement bookkeeping, event persistence and stop routing.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use stevedore::manager::{api::ManagerServer, Manager};
use stevedore::task::{Event, State, Task};
use stevedore::worker::{api::TaskServer, Worker};

async fn spawn_worker(name: &str) -> (Arc<Mutex<Worker>>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let worker = Arc::new(Mutex::new(Worker::new(name, "memory").unwrap()));
    let app = TaskServer::router(worker.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (worker, format!("127.0.0.1:{}", addr.port()))
}

async fn spawn_manager(workers: Vec<String>, scheduler: &str) -> (Arc<Mutex<Manager>>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = Arc::new(Mutex::new(
        Manager::new(workers, scheduler, "memory").unwrap(),
    ));
    let app = ManagerServer::router(manager.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (manager, format!("127.0.0.1:{}", addr.port()))
}

fn scheduled_event(task: Task) -> Event {
    Event::new(State::Scheduled, task)
}

#[tokio::test]
async fn submitted_tasks_are_placed_on_a_worker() {
    let (worker, worker_addr) = spawn_worker("w1").await;
    let (manager, manager_addr) = spawn_manager(vec![worker_addr.clone()], "round_robin").await;

    let task = Task {
        name: "nginx-test".to_string(),
        image: "nginx:latest".to_string(),
        state: State::Scheduled,
        memory: 64_000_000,
        ..Default::default()
    };
    let task_id = task.id;
    let event = scheduled_event(task);

    // Submit through the manager's HTTP surface.
    let resp = reqwest::Client::new()
        .post(format!("http://{manager_addr}/tasks"))
        .json(&event)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // One placement tick.
    manager.lock().await.send_work().await;

    {
        let m = manager.lock().await;
        assert_eq!(m.task_worker(&task_id), Some(worker_addr.as_str()));
        assert!(m.worker_tasks(&worker_addr).contains(&task_id));
        assert_eq!(m.task(&task_id).unwrap().state, State::Scheduled);
        assert_eq!(m.event_count(), 1);
        assert_eq!(m.pending_len(), 0);
    }

    // The worker holds the task in its queue, ready for its next tick.
    assert_eq!(worker.lock().await.queue_len(), 1);
}

#[tokio::test]
async fn round_robin_spreads_tasks_over_both_workers() {
    let (_w1, addr1) = spawn_worker("w1").await;
    let (_w2, addr2) = spawn_worker("w2").await;
    let (manager, _) = spawn_manager(vec![addr1.clone(), addr2.clone()], "round_robin").await;

    for _ in 0..4 {
        let task = Task {
            state: State::Scheduled,
            ..Default::default()
        };
        manager.lock().await.add_task(scheduled_event(task));
    }
    manager.lock().await.send_work().await;

    let m = manager.lock().await;
    assert_eq!(m.worker_tasks(&addr1).len(), 2);
    assert_eq!(m.worker_tasks(&addr2).len(), 2);
}

#[tokio::test]
async fn stop_request_round_trips_to_the_worker_queue() {
    let (worker, worker_addr) = spawn_worker("w1").await;
    let (manager, manager_addr) = spawn_manager(vec![worker_addr.clone()], "round_robin").await;

    // Place the task first.
    let task = Task {
        state: State::Scheduled,
        ..Default::default()
    };
    let task_id = task.id;
    manager.lock().await.add_task(scheduled_event(task));
    manager.lock().await.send_work().await;

    // DELETE through the manager enqueues a Completed event.
    let resp = reqwest::Client::new()
        .delete(format!("http://{manager_addr}/tasks/{task_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(manager.lock().await.pending_len(), 1);

    // Scheduled -> Completed is illegal, so this particular stop is
    // dropped by the pipeline and the worker queue only holds the original
    // placement.
    manager.lock().await.send_work().await;
    assert_eq!(manager.lock().await.pending_len(), 0);
    assert_eq!(worker.lock().await.queue_len(), 1);
}

#[tokio::test]
async fn unknown_task_stop_is_rejected() {
    let (_worker, worker_addr) = spawn_worker("w1").await;
    let (_manager, manager_addr) = spawn_manager(vec![worker_addr], "round_robin").await;

    let resp = reqwest::Client::new()
        .delete(format!(
            "http://{manager_addr}/tasks/{}",
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn worker_stats_feed_the_manager_nodes_view() {
    let (worker, worker_addr) = spawn_worker("w1").await;
    worker.lock().await.collect_stats();

    let (_manager, manager_addr) = spawn_manager(vec![worker_addr.clone()], "round_robin").await;

    let nodes: Vec<stevedore::node::Node> = reqwest::Client::new()
        .get(format!("http://{manager_addr}/nodes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, worker_addr);

    // The worker's own stats endpoint serves the collected snapshot.
    let stats: stevedore::worker::stats::Stats = reqwest::Client::new()
        .get(format!("http://{worker_addr}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.task_count, 0);
}
