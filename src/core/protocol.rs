// src/core/protocol.rs

//! Wire-format types for the control-plane HTTP endpoints: the worker
//! endpoints the controller consumes (`/v1/config`, `/v1/status`,
//! `/v1/role/*`, `/v1/instances/tasks`) and the coordinator endpoints it
//! drives (`/v1/instances/refresh`, `/v1/instances/offline`,
//! `/v1/coordinator_info`).

use crate::core::types::{
    InstanceDynamicInfo, InstanceStaticInfo, NodeId, Role, RoleState,
};
use serde::{Deserialize, Serialize};

/// `GET /v1/config`: one-time static info reported by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerConfigResponse {
    pub model_name: String,
    pub max_seq_len: u64,
    pub max_output_len: u64,
    pub total_slots_num: u64,
    pub total_block_num: u64,
    pub block_size: u64,
    pub group_id: u64,
    #[serde(default)]
    pub label: Option<crate::core::types::Label>,
    #[serde(default)]
    pub virtual_id: u64,
    /// Fraction of a flex node's capacity devoted to prefill, 0-100.
    #[serde(default, rename = "p_percentage")]
    pub flex_p_ratio: u64,
}

/// Service-level half of a `GET /v1/status` response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub role_status: RoleState,
    pub current_role: Role,
    #[serde(default)]
    pub model_name: String,
}

/// `GET /v1/status`: dynamic worker state. Decoders may additionally
/// report the peer set they currently hold connections to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerStatusResponse {
    pub service: ServiceStatus,
    pub resource: InstanceDynamicInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_peers: Option<Vec<NodeId>>,
}

/// `GET /v1/instances/tasks?id=<id>`: in-flight task IDs on a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TasksResponse {
    #[serde(default)]
    pub tasks: Vec<u64>,
}

impl TasksResponse {
    /// A worker is drained when it reports no tasks, or only the
    /// sentinel task `0`.
    pub fn is_drained(&self) -> bool {
        self.tasks.is_empty() || self.tasks.iter().all(|t| *t == 0)
    }
}

/// One partner endpoint in a `POST /v1/role/*` body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub id: NodeId,
    pub server_ip: String,
    pub inter_comm_port: u16,
}

/// `POST /v1/role/prefill` / `POST /v1/role/decode`: role announcement.
/// Decoders receive the group's prefill endpoints so they can establish
/// RDMA connections; prefill announcements carry an empty list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleAnnounceRequest {
    #[serde(default)]
    pub peers: Vec<PeerEndpoint>,
}

/// One node entry in the view pushed to coordinators. Peers are resolved
/// to IPs at serialization time; IDs never leave the controller here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublishedNode {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub is_healthy: bool,
    pub model_name: String,
    pub static_info: InstanceStaticInfo,
    /// Peer IPs, same order as the node's peer ID list.
    pub peers: Vec<String>,
    pub dynamic_info: InstanceDynamicInfo,
}

/// `POST /v1/instances/refresh`: the full routable cluster view.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ClusterViewPayload {
    pub server: Vec<PublishedNode>,
}

/// `POST /v1/instances/offline`: node IDs a coordinator must evict.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct OfflineRequest {
    pub ids: Vec<NodeId>,
}

/// Per-node usage as reported by a coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CoordinatorNodeUsage {
    pub id: NodeId,
    pub allocated_slots: u64,
    pub allocated_blocks: u64,
}

/// Aggregated request-length statistics from a coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RequestLengthStats {
    pub mean_input_len: f64,
    pub mean_output_len: f64,
    pub p99_input_len: u64,
    pub p99_output_len: u64,
    pub sample_count: u64,
}

/// `GET /v1/coordinator_info`: coordinator observability snapshot, also
/// used as the coordinator liveness probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CoordinatorInfoResponse {
    #[serde(default)]
    pub nodes: Vec<CoordinatorNodeUsage>,
    #[serde(default)]
    pub request_stats: RequestLengthStats,
}
