use ms_controller::core::protocol::{
    RoleAnnounceRequest, TasksResponse, WorkerConfigResponse, WorkerStatusResponse,
};
use ms_controller::core::types::{Role, RoleState};
use serde_json::json;

#[test]
fn test_drained_accepts_empty_and_sentinel_zero() {
    assert!(TasksResponse { tasks: vec![] }.is_drained());
    assert!(TasksResponse { tasks: vec![0] }.is_drained());
    assert!(!TasksResponse { tasks: vec![0, 42] }.is_drained());
    assert!(!TasksResponse { tasks: vec![7] }.is_drained());
}

#[test]
fn test_status_response_parses_without_optional_peers() {
    let body = json!({
        "service": { "role_status": "ready", "current_role": "decode" },
        "resource": {
            "avail_slots_num": 10, "avail_block_num": 20,
            "waiting_request_num": 0, "running_request_num": 1,
            "swapped_request_num": 0, "free_npu_block_nums": 5,
            "free_cpu_block_nums": 6, "total_npu_block_nums": 7,
            "total_cpu_block_nums": 8
        }
    });
    let parsed: WorkerStatusResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.service.current_role, Role::Decode);
    assert_eq!(parsed.service.role_status, RoleState::Ready);
    assert!(parsed.peers.is_none());
    assert_eq!(parsed.resource.running_request_num, 1);
}

#[test]
fn test_status_response_carries_decoder_peers() {
    let body = json!({
        "service": { "role_status": "ready", "current_role": "decode" },
        "resource": {
            "avail_slots_num": 0, "avail_block_num": 0,
            "waiting_request_num": 0, "running_request_num": 0,
            "swapped_request_num": 0, "free_npu_block_nums": 0,
            "free_cpu_block_nums": 0, "total_npu_block_nums": 0,
            "total_cpu_block_nums": 0
        },
        "peers": [1, 2],
        "active_peers": [1]
    });
    let parsed: WorkerStatusResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.peers, Some(vec![1, 2]));
    assert_eq!(parsed.active_peers, Some(vec![1]));
}

#[test]
fn test_config_response_flex_ratio_uses_wire_name() {
    let body = json!({
        "model_name": "llama", "max_seq_len": 8192, "max_output_len": 1024,
        "total_slots_num": 200, "total_block_num": 4096, "block_size": 128,
        "group_id": 0, "p_percentage": 30
    });
    let parsed: WorkerConfigResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.flex_p_ratio, 30);
    assert_eq!(parsed.model_name, "llama");
}

#[test]
fn test_role_announce_body_shape() {
    let body = RoleAnnounceRequest::default();
    assert_eq!(serde_json::to_value(&body).unwrap(), json!({ "peers": [] }));
}
