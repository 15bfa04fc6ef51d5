// tests/integration/control_plane_test.rs

//! End-to-end control-plane flows over real HTTP.

use super::fixtures::{MockCoordinator, MockWorker, spawn_coordinator, spawn_worker};
use ms_controller::config::ControllerConfig;
use ms_controller::core::client::{ControlApi, ControlClient};
use ms_controller::core::leader::AlwaysLeader;
use ms_controller::core::planner::RatePlanner;
use ms_controller::core::probe::WorkerProber;
use ms_controller::core::publish::CoordinatorPublisher;
use ms_controller::core::scheduler::ClusterScheduler;
use ms_controller::core::status::NodeStatusStore;
use ms_controller::core::switch::RoleSwitcher;
use ms_controller::core::topology::RankTableLoader;
use ms_controller::core::types::Role;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn quick_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.check_mounted_files = false;
    config.cluster_synchronization_seconds = 1;
    config.server_online_attempt_times = 2;
    config.server_online_wait_seconds = 1;
    config.http_timeout_seconds = 2;
    config.http_retry_times = 2;
    config
}

fn write_rank_table(dir: &TempDir, workers: &[&MockWorker], coordinators: &[&MockCoordinator]) -> std::path::PathBuf {
    let server_list: Vec<_> = workers
        .iter()
        .enumerate()
        .map(|(i, w)| {
            json!({
                "server_id": format!("host-{i}"),
                "server_ip": "127.0.0.1",
                "device_list": [],
                "port": 32000 + i,
                "mgmt_port": w.addr.port(),
                "metric_port": 32100 + i,
                "inter_comm_port": 32200 + i
            })
        })
        .collect();
    let coordinator_list: Vec<_> = coordinators
        .iter()
        .map(|c| json!({ "server_ip": "127.0.0.1", "port": c.addr.port() }))
        .collect();
    let doc = json!({
        "server_count": server_list.len(),
        "server_list": server_list,
        "coordinator_list": coordinator_list
    });
    let path = dir.path().join("global_ranktable.json");
    std::fs::write(&path, doc.to_string()).unwrap();
    path
}

fn build_scheduler(
    config: &ControllerConfig,
    table_path: std::path::PathBuf,
) -> (Arc<NodeStatusStore>, ClusterScheduler) {
    let shared_config = Arc::new(RwLock::new(config.clone()));
    let store = Arc::new(NodeStatusStore::new());
    let loader = Arc::new(RankTableLoader::new(table_path, false));
    let client = Arc::new(ControlClient::new(config).unwrap());
    let prober = WorkerProber::new(store.clone(), client.clone());
    let switcher = RoleSwitcher::new(store.clone(), client.clone());
    let publisher = CoordinatorPublisher::new(store.clone(), client.clone());
    let planner = Arc::new(RatePlanner::from_config(config));
    let scheduler = ClusterScheduler::new(
        shared_config,
        store.clone(),
        loader,
        prober,
        switcher,
        publisher,
        planner,
        Arc::new(AlwaysLeader),
    );
    (store, scheduler)
}

#[tokio::test]
async fn test_cold_start_over_the_wire() {
    let worker_a = spawn_worker().await;
    let worker_b = spawn_worker().await;
    let coordinator = spawn_coordinator().await;

    let dir = tempfile::tempdir().unwrap();
    let table_path = write_rank_table(&dir, &[&worker_a, &worker_b], &[&coordinator]);
    let config = quick_config();
    let (store, scheduler) = build_scheduler(&config, table_path);

    scheduler.bootstrap().await.unwrap();
    let summary = scheduler.iterate().await;
    assert_eq!(summary.switched, 2);
    assert_eq!(summary.coordinators_pushed, 1);

    // One worker took each phase.
    let roles: Vec<String> = vec![
        worker_a.state.current_role.lock().clone(),
        worker_b.state.current_role.lock().clone(),
    ];
    assert!(roles.contains(&"prefill".to_string()));
    assert!(roles.contains(&"decode".to_string()));

    // Both were drained before announcing.
    let drained =
        *worker_a.state.task_polls.lock() + *worker_b.state.task_polls.lock();
    assert!(drained >= 2);

    // The coordinator received the full view with peers resolved to IPs.
    let refreshes = coordinator.state.refreshes.lock();
    assert_eq!(refreshes.len(), 1);
    let servers = refreshes[0]["server"].as_array().unwrap();
    assert_eq!(servers.len(), 2);
    for server in servers {
        assert_eq!(server["peers"], json!(["127.0.0.1"]));
        assert_eq!(server["model_name"], "llama");
    }
    assert!(*coordinator.state.info_polls.lock() >= 1);

    // The registry agrees with the workers.
    let snapshot = store.snapshot();
    assert_eq!(snapshot.live.len(), 2);
    assert!(snapshot.live.values().all(|n| n.is_role_ready()));
    assert_eq!(
        snapshot
            .live
            .values()
            .filter(|n| n.current_role == Role::Prefill)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_decode_announce_carries_the_prefill_peer_list() {
    let worker_a = spawn_worker().await;
    let worker_b = spawn_worker().await;

    let dir = tempfile::tempdir().unwrap();
    let table_path = write_rank_table(&dir, &[&worker_a, &worker_b], &[]);
    let config = quick_config();
    let (_store, scheduler) = build_scheduler(&config, table_path);
    scheduler.bootstrap().await.unwrap();
    scheduler.iterate().await;

    let (decoder, _prefill) = if *worker_a.state.current_role.lock() == "decode" {
        (&worker_a, &worker_b)
    } else {
        (&worker_b, &worker_a)
    };
    let announces = decoder.state.announces.lock();
    let (kind, body) = announces.last().unwrap();
    assert_eq!(kind, "decode");
    let peers = body["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["server_ip"], "127.0.0.1");
}

#[tokio::test]
async fn test_client_retries_transient_config_failures() {
    let worker = spawn_worker().await;
    *worker.state.config_failures.lock() = 2;

    let config = quick_config();
    let client = ControlClient::new(&config).unwrap();
    let fetched = client.fetch_config(&worker.endpoint()).await.unwrap();
    assert_eq!(fetched.model_name, "llama");
    assert_eq!(*worker.state.config_failures.lock(), 0);
}

#[tokio::test]
async fn test_client_maps_client_errors_to_fatal() {
    let worker = spawn_worker().await;
    let config = quick_config();
    let client = ControlClient::new(&config).unwrap();
    // No such route on the worker: a 404 is a fatal answer, not a retry.
    let err = client
        .fetch_coordinator_info(&worker.endpoint())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ms_controller::core::ControllerError::ProbeFatal(_)
    ));
}
