// src/core/persist/cluster_status.rs

//! The cluster-status observability writer: a background task that
//! periodically serializes every node (live and faulty, peers resolved
//! to IPs) and every coordinator to a file operators and routers can
//! read. Plain temp-file + rename; a failed write is retried next period.

use crate::config::ControllerConfig;
use crate::core::status::{NodeStatusStore, StoreSnapshot};
use crate::core::types::{InstanceDynamicInfo, InstanceStaticInfo, NodeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterStatusNode {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub delete_time: u64,
    pub is_healthy: bool,
    pub is_faulty: bool,
    pub model_name: String,
    pub static_info: InstanceStaticInfo,
    /// Peer IPs; unresolvable peers are omitted.
    pub peers: Vec<String>,
    pub dynamic_info: InstanceDynamicInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterStatusCoordinator {
    pub ip: String,
    pub port: u16,
    pub is_healthy: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterStatusDoc {
    pub server: Vec<ClusterStatusNode>,
    pub coordinator: Vec<ClusterStatusCoordinator>,
}

/// The background writer task.
pub struct ClusterStatusWriter {
    store: Arc<NodeStatusStore>,
    config: Arc<RwLock<ControllerConfig>>,
}

impl ClusterStatusWriter {
    pub fn new(store: Arc<NodeStatusStore>, config: Arc<RwLock<ControllerConfig>>) -> Self {
        Self { store, config }
    }

    /// Serializes a registry snapshot into the on-disk document shape.
    pub fn render(snapshot: &StoreSnapshot) -> ClusterStatusDoc {
        let resolve = |id: NodeId| -> Option<String> {
            snapshot
                .live
                .get(&id)
                .map(|n| n.ip.clone())
                .or_else(|| snapshot.faulty.get(&id).map(|f| f.node.ip.clone()))
        };
        let to_entry = |node: &crate::core::types::NodeInfo, is_faulty: bool| ClusterStatusNode {
            id: node.id,
            ip: node.ip.clone(),
            port: node.port,
            delete_time: node.delete_time,
            is_healthy: node.is_healthy,
            is_faulty,
            model_name: node.model_name.clone(),
            static_info: node.static_info.clone(),
            peers: node.peers.iter().filter_map(|p| resolve(*p)).collect(),
            dynamic_info: node.dynamic_info.clone(),
        };
        let mut server: Vec<ClusterStatusNode> = snapshot
            .live
            .values()
            .map(|n| to_entry(n, false))
            .collect();
        server.extend(snapshot.faulty.values().map(|f| to_entry(&f.node, true)));
        let coordinator = snapshot
            .coordinators
            .iter()
            .map(|c| ClusterStatusCoordinator {
                ip: c.ip.clone(),
                port: c.port,
                is_healthy: c.is_healthy,
            })
            .collect();
        ClusterStatusDoc {
            server,
            coordinator,
        }
    }

    /// One write pass. Failures are logged and left for the next period.
    fn write_once(&self, path: &str) -> std::io::Result<()> {
        let doc = Self::render(&self.store.snapshot());
        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = PathBuf::from(format!("{path}.tmp"));
        fs::write(&tmp_path, rendered)?;
        fs::rename(&tmp_path, path)?;
        debug!("wrote cluster status ({} nodes) to {path}", doc.server.len());
        Ok(())
    }

    /// The writer main loop; period follows the live config snapshot.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (enabled, path) = {
            let config = self.config.read();
            (
                config.cluster_status.to_file,
                config.cluster_status.file_path.clone(),
            )
        };
        if !enabled {
            info!("cluster status file disabled; writer will not run");
            return;
        }
        info!("cluster status writer started, target '{path}'");
        loop {
            if let Err(e) = self.write_once(&path) {
                error!("cluster status write failed: {e}");
            }
            let period = Duration::from_secs(
                self.config.read().cluster_synchronization_seconds,
            );
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown_rx.recv() => {
                    info!("cluster status writer received shutdown signal");
                    return;
                }
            }
        }
    }
}
