use async_trait::async_trait;
use ms_controller::core::ControllerError;
use ms_controller::core::client::ControlApi;
use ms_controller::core::protocol::{
    ClusterViewPayload, CoordinatorInfoResponse, OfflineRequest, RoleAnnounceRequest,
    TasksResponse, WorkerConfigResponse, WorkerStatusResponse,
};
use ms_controller::core::publish::CoordinatorPublisher;
use ms_controller::core::status::NodeStatusStore;
use ms_controller::core::types::{
    Coordinator, InferenceType, InstanceStaticInfo, NodeInfo, Role, RoleState,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

fn node(id: u64, role: Role, peers: Vec<u64>) -> NodeInfo {
    NodeInfo {
        id,
        host_id: format!("host-{id}"),
        ip: format!("10.7.0.{id}"),
        port: 2025,
        mgmt_port: 4000,
        metric_port: 2027,
        inter_comm_port: 2028,
        model_name: "llama".into(),
        is_healthy: true,
        is_initialized: true,
        inference_type: InferenceType::PdSeparate,
        current_role: role,
        role_state: RoleState::Ready,
        delete_time: 0,
        peers,
        active_peers: vec![],
        static_info: InstanceStaticInfo {
            id,
            group_id: 0,
            role,
            ..Default::default()
        },
        dynamic_info: Default::default(),
        server_info_list: vec![],
        probe_failures: 0,
    }
}

#[derive(Default)]
struct MockApi {
    refresh_log: Mutex<Vec<(String, ClusterViewPayload)>>,
    offline_log: Mutex<Vec<(String, OfflineRequest)>>,
    info_log: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

#[async_trait]
impl ControlApi for MockApi {
    async fn fetch_config(&self, _: &str) -> Result<WorkerConfigResponse, ControllerError> {
        unimplemented!("publisher never fetches worker config")
    }

    async fn fetch_status(&self, _: &str) -> Result<WorkerStatusResponse, ControllerError> {
        unimplemented!("publisher never fetches worker status")
    }

    async fn announce_role(
        &self,
        _: &str,
        _: Role,
        _: &RoleAnnounceRequest,
    ) -> Result<(), ControllerError> {
        unimplemented!("publisher never announces roles")
    }

    async fn fetch_tasks(&self, _: &str, _: u64) -> Result<TasksResponse, ControllerError> {
        unimplemented!("publisher never polls tasks")
    }

    async fn push_refresh(
        &self,
        endpoint: &str,
        view: &ClusterViewPayload,
    ) -> Result<(), ControllerError> {
        if self.failing.lock().contains(endpoint) {
            return Err(ControllerError::CoordinatorPushFailure("boom".into()));
        }
        self.refresh_log
            .lock()
            .push((endpoint.to_string(), view.clone()));
        Ok(())
    }

    async fn push_offline(
        &self,
        endpoint: &str,
        request: &OfflineRequest,
    ) -> Result<(), ControllerError> {
        if self.failing.lock().contains(endpoint) {
            return Err(ControllerError::CoordinatorPushFailure("boom".into()));
        }
        self.offline_log
            .lock()
            .push((endpoint.to_string(), request.clone()));
        Ok(())
    }

    async fn fetch_coordinator_info(
        &self,
        endpoint: &str,
    ) -> Result<CoordinatorInfoResponse, ControllerError> {
        if self.failing.lock().contains(endpoint) {
            return Err(ControllerError::ProbeTransient("down".into()));
        }
        self.info_log.lock().push(endpoint.to_string());
        Ok(CoordinatorInfoResponse::default())
    }
}

fn fixture(nodes: Vec<NodeInfo>) -> (Arc<NodeStatusStore>, Arc<MockApi>, CoordinatorPublisher) {
    let store = Arc::new(NodeStatusStore::new());
    store.seed(nodes);
    let api = Arc::new(MockApi::default());
    let publisher = CoordinatorPublisher::new(store.clone(), api.clone());
    (store, api, publisher)
}

#[test]
fn test_undefined_nodes_never_appear_in_the_view() {
    let (store, _api, _publisher) = fixture(vec![
        node(1, Role::Prefill, vec![2]),
        node(2, Role::Decode, vec![1]),
        node(3, Role::Undefined, vec![]),
    ]);
    let view = CoordinatorPublisher::build_view(&store.snapshot());
    let ids: Vec<u64> = view.server.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_view_resolves_peers_to_ips_even_for_faulty_partners() {
    let (store, _api, _publisher) = fixture(vec![
        node(1, Role::Prefill, vec![2, 3]),
        node(2, Role::Decode, vec![1]),
        node(3, Role::Decode, vec![1]),
    ]);
    store.mark_faulty(3, "unreachable").unwrap();
    let view = CoordinatorPublisher::build_view(&store.snapshot());
    let prefill = view.server.iter().find(|s| s.id == 1).unwrap();
    assert_eq!(
        prefill.peers,
        vec!["10.7.0.2".to_string(), "10.7.0.3".to_string()]
    );
}

#[test]
fn test_unknown_peer_ids_are_dropped_from_the_view() {
    let (store, _api, _publisher) = fixture(vec![node(1, Role::Prefill, vec![42])]);
    let view = CoordinatorPublisher::build_view(&store.snapshot());
    assert!(view.server[0].peers.is_empty());
}

#[tokio::test]
async fn test_publish_reaches_every_healthy_coordinator() {
    let (store, api, publisher) = fixture(vec![node(1, Role::Prefill, vec![])]);
    store.add_coordinator(Coordinator::new("10.7.1.1".into(), 3000));
    store.add_coordinator(Coordinator::new("10.7.1.2".into(), 3000));

    let view = CoordinatorPublisher::build_view(&store.snapshot());
    let summary = publisher.publish(&view).await;
    assert_eq!(summary.pushed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(api.refresh_log.lock().len(), 2);
}

#[tokio::test]
async fn test_three_failed_pushes_mark_a_coordinator_unhealthy() {
    let (store, api, publisher) = fixture(vec![node(1, Role::Prefill, vec![])]);
    store.add_coordinator(Coordinator::new("10.7.1.1".into(), 3000));
    api.failing.lock().insert("10.7.1.1:3000".into());

    let view = CoordinatorPublisher::build_view(&store.snapshot());
    publisher.publish(&view).await;
    publisher.publish(&view).await;
    assert!(store.snapshot().coordinators[0].is_healthy);
    let summary = publisher.publish(&view).await;
    assert_eq!(summary.marked_unhealthy, vec!["10.7.1.1:3000".to_string()]);
    assert!(!store.snapshot().coordinators[0].is_healthy);

    // Unhealthy coordinators are skipped, not dropped.
    let summary = publisher.publish(&view).await;
    assert_eq!(summary.pushed + summary.failed, 0);
    assert_eq!(store.snapshot().coordinators.len(), 1);
}

#[tokio::test]
async fn test_coordinator_rejoins_after_answering_the_probe() {
    let (store, api, publisher) = fixture(vec![node(1, Role::Prefill, vec![])]);
    store.add_coordinator(Coordinator::new("10.7.1.1".into(), 3000));
    api.failing.lock().insert("10.7.1.1:3000".into());

    let view = CoordinatorPublisher::build_view(&store.snapshot());
    for _ in 0..3 {
        publisher.publish(&view).await;
    }
    assert!(!store.snapshot().coordinators[0].is_healthy);

    api.failing.lock().clear();
    publisher.probe_coordinators().await;
    assert!(store.snapshot().coordinators[0].is_healthy);
    let summary = publisher.publish(&view).await;
    assert_eq!(summary.pushed, 1);
}

#[tokio::test]
async fn test_offline_notification_reaches_healthy_coordinators_only() {
    let (store, api, publisher) = fixture(vec![]);
    store.add_coordinator(Coordinator::new("10.7.1.1".into(), 3000));
    store.add_coordinator(Coordinator::new("10.7.1.2".into(), 3000));
    store.update_coordinator("10.7.1.2", 3000, |c| c.is_healthy = false);

    publisher.notify_offline(vec![4, 5]).await;
    let log = api.offline_log.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, "10.7.1.1:3000");
    assert_eq!(log[0].1.ids, vec![4, 5]);
}

#[tokio::test]
async fn test_empty_offline_set_sends_nothing() {
    let (store, api, publisher) = fixture(vec![]);
    store.add_coordinator(Coordinator::new("10.7.1.1".into(), 3000));
    publisher.notify_offline(vec![]).await;
    assert!(api.offline_log.lock().is_empty());
}
