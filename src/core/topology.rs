// src/core/topology.rs

//! The rank-table loader: parses the global topology file edited by
//! operators, validates it against the cluster limits, and mints stable
//! node IDs. The ordinal counter is an observable field so recovery can
//! restore it from the Process Status File.

use crate::config::{DeployMode, STRICT_FILE_MODE, check_file_mode};
use crate::core::errors::ControllerError;
use crate::core::types::{
    Coordinator, DeviceInfo, InferenceType, InstanceStaticInfo, Label, MAX_GROUPS,
    MAX_NODES_PER_GROUP, MAX_TOTAL_NODES, NodeId, NodeInfo, Role, RoleState, ServerInfo,
    compose_node_id,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Environment variable naming the global rank table file.
pub const RANK_TABLE_PATH_ENV: &str = "GLOBAL_RANK_TABLE_FILE_PATH";
const DEFAULT_RANK_TABLE_PATH: &str = "conf/global_ranktable.json";

const PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;

/// One accelerator device entry in the rank table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RankTableDevice {
    pub device_id: String,
    pub device_ip: String,
    #[serde(default)]
    pub logical_id: String,
    pub rank_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_device_id: Option<String>,
}

/// One physical server entry in the rank table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RankTableServer {
    pub server_id: String,
    pub server_ip: String,
    #[serde(default)]
    pub device_list: Vec<RankTableDevice>,
    pub port: u16,
    pub mgmt_port: u16,
    pub metric_port: u16,
    pub inter_comm_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_pod_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
}

impl RankTableServer {
    pub fn endpoint_key(&self) -> (String, u16) {
        (self.server_ip.clone(), self.mgmt_port)
    }
}

/// One coordinator entry in the rank table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RankTableCoordinator {
    pub server_ip: String,
    pub port: u16,
}

/// The parsed global rank table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RankTable {
    pub server_count: usize,
    pub server_list: Vec<RankTableServer>,
    #[serde(default)]
    pub coordinator_list: Vec<RankTableCoordinator>,
}

impl RankTable {
    /// Parses and validates a rank-table document.
    pub fn from_json(contents: &str) -> Result<Self, ControllerError> {
        let table: RankTable = serde_json::from_str(contents).map_err(|e| {
            ControllerError::InvalidTopology(format!("failed to parse rank table: {e}"))
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Validates counts, ports, IPs, duplicates, and group limits.
    fn validate(&self) -> Result<(), ControllerError> {
        let err = |msg: String| Err(ControllerError::InvalidTopology(msg));

        if self.server_count != self.server_list.len() {
            return err(format!(
                "server_count {} does not match server_list length {}",
                self.server_count,
                self.server_list.len()
            ));
        }
        if self.server_list.len() + self.coordinator_list.len() > MAX_TOTAL_NODES {
            return err(format!(
                "rank table lists {} nodes, more than the {MAX_TOTAL_NODES} supported",
                self.server_list.len() + self.coordinator_list.len()
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.server_list {
            if server.server_ip.parse::<std::net::IpAddr>().is_err() {
                return err(format!(
                    "server '{}' has invalid IP '{}'",
                    server.server_id, server.server_ip
                ));
            }
            for port in [
                server.port,
                server.mgmt_port,
                server.metric_port,
                server.inter_comm_port,
            ] {
                if !PORT_RANGE.contains(&port) {
                    return err(format!(
                        "server '{}' has out-of-range port {port}",
                        server.server_id
                    ));
                }
            }
            if !seen.insert(server.endpoint_key()) {
                return err(format!(
                    "duplicate endpoint ({}, {}) in rank table",
                    server.server_ip, server.mgmt_port
                ));
            }
        }
        for coordinator in &self.coordinator_list {
            if coordinator.server_ip.parse::<std::net::IpAddr>().is_err() {
                return err(format!(
                    "coordinator has invalid IP '{}'",
                    coordinator.server_ip
                ));
            }
            if !PORT_RANGE.contains(&coordinator.port) {
                return err(format!(
                    "coordinator {} has out-of-range port {}",
                    coordinator.server_ip, coordinator.port
                ));
            }
        }

        self.group_assignments().map(|_| ())
    }

    /// Derives the per-server group index from super-pod membership, in
    /// order of first appearance. Servers without a super pod form one
    /// group of their own.
    pub fn group_assignments(&self) -> Result<Vec<u64>, ControllerError> {
        let mut pods: Vec<Option<&str>> = Vec::new();
        let mut assignments = Vec::with_capacity(self.server_list.len());
        let mut per_group: BTreeMap<u64, usize> = BTreeMap::new();
        for server in &self.server_list {
            let key = server.super_pod_id.as_deref();
            let group = match pods.iter().position(|p| *p == key) {
                Some(index) => index as u64,
                None => {
                    pods.push(key);
                    (pods.len() - 1) as u64
                }
            };
            assignments.push(group);
            *per_group.entry(group).or_default() += 1;
        }
        if pods.len() > MAX_GROUPS {
            return Err(ControllerError::InvalidTopology(format!(
                "rank table defines {} groups, more than the {MAX_GROUPS} supported",
                pods.len()
            )));
        }
        for (group, count) in &per_group {
            if *count > MAX_NODES_PER_GROUP {
                return Err(ControllerError::InvalidTopology(format!(
                    "group {group} has {count} servers, more than the {MAX_NODES_PER_GROUP} supported"
                )));
            }
        }
        Ok(assignments)
    }

    /// Coordinators declared in the table.
    pub fn coordinators(&self) -> Vec<Coordinator> {
        self.coordinator_list
            .iter()
            .map(|c| Coordinator::new(c.server_ip.clone(), c.port))
            .collect()
    }
}

/// Loads the rank table and mints node IDs. Owns the persistent ordinal
/// counter (`instance_start_id_number`).
pub struct RankTableLoader {
    path: PathBuf,
    strict: bool,
    next_ordinal: AtomicU64,
}

impl RankTableLoader {
    pub fn new(path: PathBuf, strict: bool) -> Self {
        Self {
            path,
            strict,
            next_ordinal: AtomicU64::new(1),
        }
    }

    /// Resolves the rank-table path from the environment.
    pub fn from_env(strict: bool) -> Self {
        let path = std::env::var(RANK_TABLE_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RANK_TABLE_PATH));
        Self::new(path, strict)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next ordinal to be minted. Persisted on every status write.
    pub fn instance_start_id_number(&self) -> u64 {
        self.next_ordinal.load(Ordering::SeqCst)
    }

    /// Restores the counter after recovery. The counter never decreases.
    pub fn set_instance_start_id_number(&self, value: u64) {
        self.next_ordinal.fetch_max(value, Ordering::SeqCst);
    }

    /// Mints a fresh node ID in the given group.
    pub fn allocate_id(&self, group_id: u64) -> NodeId {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        compose_node_id(group_id, ordinal)
    }

    /// Reads, parses, and validates the rank table from disk.
    pub fn load(&self) -> Result<RankTable, ControllerError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            ControllerError::InvalidTopology(format!(
                "failed to read rank table '{}': {e}",
                self.path.display()
            ))
        })?;
        if self.strict {
            check_file_mode(&self.path, STRICT_FILE_MODE)
                .map_err(|e| ControllerError::InvalidTopology(e.to_string()))?;
        }
        RankTable::from_json(&contents)
    }

    /// Builds a `NodeInfo` for one rank-table entry, minting a fresh ID.
    pub fn node_from_entry(
        &self,
        entry: &RankTableServer,
        group_id: u64,
        deploy_mode: DeployMode,
    ) -> NodeInfo {
        let id = self.allocate_id(group_id);
        let inference_type = match deploy_mode {
            DeployMode::SingleNode => InferenceType::SingleNode,
            DeployMode::PdSeparate => InferenceType::PdSeparate,
            DeployMode::Flex => InferenceType::Flex,
        };
        let label = entry.label.unwrap_or_default();
        let current_role = if label == Label::FlexStatic {
            Role::Flex
        } else {
            Role::Undefined
        };
        debug!(
            "minted node id {id} for endpoint ({}, {}) in group {group_id}",
            entry.server_ip, entry.mgmt_port
        );
        NodeInfo {
            id,
            host_id: entry.server_id.clone(),
            ip: entry.server_ip.clone(),
            port: entry.port,
            mgmt_port: entry.mgmt_port,
            metric_port: entry.metric_port,
            inter_comm_port: entry.inter_comm_port,
            model_name: String::new(),
            is_healthy: false,
            is_initialized: false,
            inference_type,
            current_role,
            role_state: RoleState::Unknown,
            delete_time: 0,
            peers: Vec::new(),
            active_peers: Vec::new(),
            static_info: InstanceStaticInfo {
                id,
                group_id,
                label,
                role: current_role,
                ..Default::default()
            },
            dynamic_info: Default::default(),
            server_info_list: vec![ServerInfo {
                host_id: entry.server_id.clone(),
                ip: entry.server_ip.clone(),
                is_master: true,
                super_pod_id: entry.super_pod_id.clone(),
                device_infos: entry
                    .device_list
                    .iter()
                    .map(|d| DeviceInfo {
                        id: d.device_id.clone(),
                        ip: d.device_ip.clone(),
                        logical_id: d.logical_id.clone(),
                        rank_id: d.rank_id,
                        super_device_id: d.super_device_id.clone(),
                    })
                    .collect(),
            }],
            probe_failures: 0,
        }
    }

    /// Builds the initial node set from a validated table.
    pub fn build_initial_nodes(
        &self,
        table: &RankTable,
        deploy_mode: DeployMode,
    ) -> Result<Vec<NodeInfo>, ControllerError> {
        let assignments = table.group_assignments()?;
        let nodes = table
            .server_list
            .iter()
            .zip(assignments)
            .map(|(entry, group_id)| self.node_from_entry(entry, group_id, deploy_mode))
            .collect::<Vec<_>>();
        info!(
            "loaded rank table '{}': {} servers, {} coordinators",
            self.path.display(),
            nodes.len(),
            table.coordinator_list.len()
        );
        Ok(nodes)
    }
}
