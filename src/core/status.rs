// src/core/status.rs

//! The concurrent node registry: live nodes, faulty nodes, and known
//! coordinators. All mutation happens under a single write lock; readers
//! take a short read lock to produce a deep-copy snapshot and then work
//! on the copy.

use crate::core::errors::ControllerError;
use crate::core::types::{Coordinator, NodeId, NodeInfo};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A node parked in the faulty map, with the reason it got there.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultyNode {
    pub node: NodeInfo,
    pub reason: String,
    /// Seconds (monotonic, tracked by the scheduler clock) the node has
    /// spent in the faulty map.
    pub faulty_for: u64,
}

/// Deep copy of the registry, safe to use without holding any lock.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub live: BTreeMap<NodeId, NodeInfo>,
    pub faulty: BTreeMap<NodeId, FaultyNode>,
    pub coordinators: Vec<Coordinator>,
}

#[derive(Default)]
struct StoreInner {
    live: BTreeMap<NodeId, NodeInfo>,
    faulty: BTreeMap<NodeId, FaultyNode>,
    coordinators: BTreeMap<(String, u16), Coordinator>,
}

/// The only mutable shared object in the controller. Every component
/// holds a handle; writes are serialized by the single lock.
#[derive(Default)]
pub struct NodeStatusStore {
    inner: RwLock<StoreInner>,
}

impl NodeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node in the live map. Replaces any faulty entry with
    /// the same ID (a node is never in both maps).
    pub fn add(&self, node: NodeInfo) {
        let mut inner = self.inner.write();
        inner.faulty.remove(&node.id);
        inner.live.insert(node.id, node);
    }

    /// Seeds the registry from a recovered or freshly loaded node set.
    pub fn seed(&self, nodes: Vec<NodeInfo>) {
        let mut inner = self.inner.write();
        for node in nodes {
            inner.faulty.remove(&node.id);
            inner.live.insert(node.id, node);
        }
    }

    /// Applies a mutation to a live node.
    pub fn update<F>(&self, id: NodeId, mutate: F) -> Result<(), ControllerError>
    where
        F: FnOnce(&mut NodeInfo),
    {
        let mut inner = self.inner.write();
        match inner.live.get_mut(&id) {
            Some(node) => {
                mutate(node);
                Ok(())
            }
            None => Err(ControllerError::NotFound(format!(
                "node {id} is not in the live map"
            ))),
        }
    }

    /// Moves a node from the live map to the faulty map.
    pub fn mark_faulty(&self, id: NodeId, reason: &str) -> Result<(), ControllerError> {
        let mut inner = self.inner.write();
        let Some(mut node) = inner.live.remove(&id) else {
            // Already faulty: keep the original reason.
            if inner.faulty.contains_key(&id) {
                return Ok(());
            }
            return Err(ControllerError::NotFound(format!(
                "node {id} is not registered"
            )));
        };
        warn!("marking node {id} ({}) faulty: {reason}", node.ip);
        node.is_healthy = false;
        inner.faulty.insert(
            id,
            FaultyNode {
                node,
                reason: reason.to_string(),
                faulty_for: 0,
            },
        );
        Ok(())
    }

    /// Moves a recovered node from the faulty map back to the live map.
    pub fn promote(&self, id: NodeId) -> Result<(), ControllerError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.faulty.remove(&id) else {
            return Err(ControllerError::NotFound(format!(
                "node {id} is not in the faulty map"
            )));
        };
        info!("promoting node {id} ({}) back to live", entry.node.ip);
        let mut node = entry.node;
        node.is_healthy = true;
        node.probe_failures = 0;
        node.delete_time = 0;
        inner.live.insert(id, node);
        Ok(())
    }

    /// Removes a node entirely, from whichever map holds it.
    pub fn remove(&self, id: NodeId) -> Option<NodeInfo> {
        let mut inner = self.inner.write();
        inner
            .live
            .remove(&id)
            .or_else(|| inner.faulty.remove(&id).map(|f| f.node))
    }

    /// Advances faulty-age bookkeeping by `elapsed_secs` and drops nodes
    /// that have been faulty longer than `retention_secs`.
    pub fn expire_faulty(&self, elapsed_secs: u64, retention_secs: u64) -> Vec<NodeId> {
        let mut inner = self.inner.write();
        let mut dropped = Vec::new();
        inner.faulty.retain(|id, entry| {
            entry.faulty_for = entry.faulty_for.saturating_add(elapsed_secs);
            if entry.faulty_for > retention_secs {
                dropped.push(*id);
                false
            } else {
                true
            }
        });
        for id in &dropped {
            debug!("dropping node {id} from the faulty map after retention expiry");
        }
        dropped
    }

    /// A deep copy of the whole registry.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot {
            live: inner.live.clone(),
            faulty: inner.faulty.clone(),
            coordinators: inner.coordinators.values().cloned().collect(),
        }
    }

    /// Clone of a single node, wherever it lives.
    pub fn get(&self, id: NodeId) -> Option<NodeInfo> {
        let inner = self.inner.read();
        inner
            .live
            .get(&id)
            .cloned()
            .or_else(|| inner.faulty.get(&id).map(|f| f.node.clone()))
    }

    /// Resolves a node ID to its IP, searching live then faulty nodes.
    /// Used when serializing `peers` for publication.
    pub fn lookup_ip(&self, id: NodeId) -> Option<String> {
        let inner = self.inner.read();
        inner
            .live
            .get(&id)
            .map(|n| n.ip.clone())
            .or_else(|| inner.faulty.get(&id).map(|f| f.node.ip.clone()))
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        self.inner.read().live.keys().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live.len()
    }

    pub fn faulty_count(&self) -> usize {
        self.inner.read().faulty.len()
    }

    /// Registers a coordinator if it is not already known.
    pub fn add_coordinator(&self, coordinator: Coordinator) {
        let mut inner = self.inner.write();
        inner
            .coordinators
            .entry((coordinator.ip.clone(), coordinator.port))
            .or_insert(coordinator);
    }

    /// Applies a mutation to a known coordinator.
    pub fn update_coordinator<F>(&self, ip: &str, port: u16, mutate: F)
    where
        F: FnOnce(&mut Coordinator),
    {
        let mut inner = self.inner.write();
        if let Some(coordinator) = inner.coordinators.get_mut(&(ip.to_string(), port)) {
            mutate(coordinator);
        }
    }

    /// Drops coordinators that vanished from the rank table.
    pub fn retain_coordinators(&self, keep: &[(String, u16)]) {
        let mut inner = self.inner.write();
        inner.coordinators.retain(|key, _| keep.contains(key));
    }
}
