// src/core/types.rs

//! The cluster data model: worker nodes, coordinators, and the derived
//! group view. Nodes reference each other through `peers` lists of IDs;
//! IDs are resolved to IPs only at serialization time, which keeps the
//! model free of ownership cycles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

/// Stable 64-bit node identifier. The group index lives in the high bits,
/// the persistent ordinal in the low bits.
pub type NodeId = u64;

/// Number of low bits reserved for the per-cluster ordinal.
pub const GROUP_ID_SHIFT: u32 = 48;

/// Hard limit on the number of groups in a cluster.
pub const MAX_GROUPS: usize = 6;

/// Hard limit on the number of nodes in a single group.
pub const MAX_NODES_PER_GROUP: usize = 768;

/// The rank table carries three role types (controller, server,
/// coordinator), so a full replacement can list up to three times the
/// server capacity.
pub const MAX_TOTAL_NODES: usize = MAX_GROUPS * MAX_NODES_PER_GROUP * 3;

/// Composes a `NodeId` from a group index and a persistent ordinal.
pub fn compose_node_id(group_id: u64, ordinal: u64) -> NodeId {
    (group_id << GROUP_ID_SHIFT) | (ordinal & ((1u64 << GROUP_ID_SHIFT) - 1))
}

/// Extracts the group index from a `NodeId`.
pub fn node_group(id: NodeId) -> u64 {
    id >> GROUP_ID_SHIFT
}

/// Extracts the persistent ordinal from a `NodeId`.
pub fn node_ordinal(id: NodeId) -> u64 {
    id & ((1u64 << GROUP_ID_SHIFT) - 1)
}

/// The role a worker currently serves.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    #[default]
    Undefined,
    Prefill,
    Decode,
    Flex,
}

/// Progress of a node through a role assignment.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoleState {
    #[default]
    Unknown,
    Switching,
    Ready,
}

/// Static scheduling preference attached to a node by the operator.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Label {
    #[default]
    PrefillPrefer,
    DecodePrefer,
    PrefillStatic,
    DecodeStatic,
    FlexStatic,
}

impl Label {
    /// Static labels pin a node to its role; the planner may not move it.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            Label::PrefillStatic | Label::DecodeStatic | Label::FlexStatic
        )
    }
}

/// How the worker serves inference: the full pipeline on one node, or one
/// phase of a disaggregated deployment.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InferenceType {
    SingleNode,
    #[default]
    PdSeparate,
    Flex,
}

/// One accelerator device on a physical server. Opaque to the controller;
/// forwarded to workers verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub ip: String,
    pub logical_id: String,
    pub rank_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_device_id: Option<String>,
}

/// Device-level detail for one physical server, as listed in the rank
/// table. Opaque to the controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host_id: String,
    pub ip: String,
    pub is_master: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_pod_id: Option<String>,
    #[serde(default)]
    pub device_infos: Vec<DeviceInfo>,
}

/// Capacity and identity facts fetched once from `GET /v1/config`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct InstanceStaticInfo {
    pub id: NodeId,
    pub group_id: u64,
    pub max_seq_len: u64,
    pub max_output_len: u64,
    pub total_slots_num: u64,
    pub total_block_num: u64,
    pub block_size: u64,
    pub label: Label,
    pub role: Role,
    /// Fraction of a flex node's capacity devoted to prefill, 0-100.
    #[serde(rename = "p_percentage")]
    pub flex_p_ratio: u64,
    pub virtual_id: u64,
}

/// Runtime resource counters polled from `GET /v1/status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct InstanceDynamicInfo {
    pub avail_slots_num: u64,
    pub avail_block_num: u64,
    pub waiting_request_num: u64,
    pub running_request_num: u64,
    pub swapped_request_num: u64,
    pub free_npu_block_nums: u64,
    pub free_cpu_block_nums: u64,
    pub total_npu_block_nums: u64,
    pub total_cpu_block_nums: u64,
}

/// One inference worker node. Created by the Topology Loader (or by a
/// reconcile that sees a new endpoint in the rank table), mutated by the
/// Worker Prober (status fields) and the Role Switcher (role fields).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub host_id: String,
    pub ip: String,
    pub port: u16,
    pub mgmt_port: u16,
    pub metric_port: u16,
    pub inter_comm_port: u16,
    pub model_name: String,
    pub is_healthy: bool,
    pub is_initialized: bool,
    pub inference_type: InferenceType,
    pub current_role: Role,
    pub role_state: RoleState,
    /// Seconds since this node was scheduled for removal; 0 if live.
    pub delete_time: u64,
    /// Partner node IDs for the opposite role within the same group.
    pub peers: Vec<NodeId>,
    /// Subset of `peers` with live connections established. Transient;
    /// not restored across restarts.
    #[serde(default)]
    pub active_peers: Vec<NodeId>,
    pub static_info: InstanceStaticInfo,
    pub dynamic_info: InstanceDynamicInfo,
    #[serde(default)]
    pub server_info_list: Vec<ServerInfo>,
    /// Consecutive failed probe iterations. Transient.
    #[serde(skip)]
    pub probe_failures: u32,
}

impl NodeInfo {
    /// The control endpoint probed by the Worker Prober.
    pub fn mgmt_endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.mgmt_port)
    }

    /// The identity key used by topology reconciliation.
    pub fn endpoint_key(&self) -> (String, u16) {
        (self.ip.clone(), self.mgmt_port)
    }

    pub fn group_id(&self) -> u64 {
        self.static_info.group_id
    }

    /// `ready` only holds while the published role assignment and the
    /// worker's own report agree.
    pub fn is_role_ready(&self) -> bool {
        self.role_state == RoleState::Ready && self.current_role == self.static_info.role
    }
}

/// One front-door routing node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Coordinator {
    pub ip: String,
    pub port: u16,
    pub is_healthy: bool,
    /// Consecutive failed pushes. Transient.
    #[serde(skip)]
    pub failed_pushes: u32,
}

impl Coordinator {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            ip,
            port,
            is_healthy: true,
            failed_pushes: 0,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Derived per-group membership view: the ordered prefill, decode, and
/// flex member sets. The three sets are disjoint by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupView {
    pub prefill: Vec<NodeId>,
    pub decode: Vec<NodeId>,
    pub flex: Vec<NodeId>,
}

impl GroupView {
    pub fn len(&self) -> usize {
        self.prefill.len() + self.decode.len() + self.flex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the group view from an iterator of nodes, keyed by `group_id`.
/// Nodes with an undefined role are not members of any set.
pub fn build_group_view<'a, I>(nodes: I) -> BTreeMap<u64, GroupView>
where
    I: IntoIterator<Item = &'a NodeInfo>,
{
    let mut groups: BTreeMap<u64, GroupView> = BTreeMap::new();
    for node in nodes {
        let entry = groups.entry(node.group_id()).or_default();
        match node.current_role {
            Role::Prefill => entry.prefill.push(node.id),
            Role::Decode => entry.decode.push(node.id),
            Role::Flex => entry.flex.push(node.id),
            Role::Undefined => {}
        }
    }
    groups
}

/// Recomputes every node's `peers` list from the group view: prefill
/// nodes peer with the group's decoders plus flex members, decoders with
/// the prefills plus flex members, and flex nodes with both phase sets.
pub fn refresh_peers_by_group(nodes: &mut [&mut NodeInfo], groups: &BTreeMap<u64, GroupView>) {
    for node in nodes.iter_mut() {
        let Some(group) = groups.get(&node.group_id()) else {
            node.peers.clear();
            continue;
        };
        node.peers = match node.current_role {
            Role::Prefill => group
                .decode
                .iter()
                .chain(group.flex.iter())
                .copied()
                .collect(),
            Role::Decode => group
                .prefill
                .iter()
                .chain(group.flex.iter())
                .copied()
                .collect(),
            Role::Flex => group
                .prefill
                .iter()
                .chain(group.decode.iter())
                .copied()
                .collect(),
            Role::Undefined => Vec::new(),
        };
        let peers = node.peers.clone();
        node.active_peers.retain(|id| peers.contains(id));
    }
}
