// src/core/probe.rs

//! The per-node prober: fetches static config once, polls dynamic status
//! every iteration, and keeps the Node Status Store current. Probes fan
//! out on a bounded worker pool, never one task per node unbounded.

use crate::core::client::ControlApi;
use crate::core::errors::ControllerError;
use crate::core::protocol::{PeerEndpoint, RoleAnnounceRequest, WorkerStatusResponse};
use crate::core::status::NodeStatusStore;
use crate::core::switch::SWITCH_FAILED_REASON_PREFIX;
use crate::core::types::{NodeId, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Faulty-map reason prefix for nodes that answered with a fatal error.
/// Such nodes are not re-probed; they need operator intervention.
pub const FATAL_REASON_PREFIX: &str = "fatal";
/// Reason recorded when a node stops answering probes.
pub const UNREACHABLE_REASON: &str = "unreachable";

/// Outcome of one probe pass, aggregated into the scheduler's summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub failed: usize,
    pub marked_faulty: Vec<NodeId>,
    pub promoted: Vec<NodeId>,
}

enum ProbeOutcome {
    Healthy(NodeId),
    Transient(NodeId),
    MarkedFaulty(NodeId),
    Promoted(NodeId),
}

/// Probes workers and applies the results to the store.
#[derive(Clone)]
pub struct WorkerProber {
    store: Arc<NodeStatusStore>,
    api: Arc<dyn ControlApi>,
}

impl WorkerProber {
    pub fn new(store: Arc<NodeStatusStore>, api: Arc<dyn ControlApi>) -> Self {
        Self { store, api }
    }

    /// Probes every live node and every recoverable faulty node, with at
    /// most `concurrency` requests in flight.
    pub async fn probe_all(&self, concurrency: usize, fault_threshold: u32) -> ProbeSummary {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: JoinSet<Option<ProbeOutcome>> = JoinSet::new();

        for id in self.store.live_ids() {
            let prober = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(prober.probe_live_node(id, fault_threshold).await)
            });
        }

        let snapshot = self.store.snapshot();
        for (id, entry) in &snapshot.faulty {
            // Fatal answers and failed switches wait for the scheduler or
            // an operator; nodes scheduled for removal must not flap back.
            if entry.reason.starts_with(FATAL_REASON_PREFIX)
                || entry.reason.starts_with(SWITCH_FAILED_REASON_PREFIX)
                || entry.node.delete_time > 0
            {
                continue;
            }
            let prober = self.clone();
            let semaphore = semaphore.clone();
            let id = *id;
            let endpoint = entry.node.mgmt_endpoint();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(prober.probe_faulty_node(id, &endpoint).await)
            });
        }

        let mut summary = ProbeSummary::default();
        while let Some(result) = tasks.join_next().await {
            let Ok(Some(outcome)) = result else { continue };
            summary.probed += 1;
            match outcome {
                ProbeOutcome::Healthy(_) => {}
                ProbeOutcome::Transient(_) => summary.failed += 1,
                ProbeOutcome::MarkedFaulty(id) => {
                    summary.failed += 1;
                    summary.marked_faulty.push(id);
                }
                ProbeOutcome::Promoted(id) => summary.promoted.push(id),
            }
        }
        summary
    }

    /// One live-node probe: config fetch while uninitialized, then the
    /// status poll, then decoder peer reconciliation.
    async fn probe_live_node(&self, id: NodeId, fault_threshold: u32) -> ProbeOutcome {
        let Some(node) = self.store.get(id) else {
            return ProbeOutcome::Transient(id);
        };
        let endpoint = node.mgmt_endpoint();

        if !node.is_initialized {
            match self.api.fetch_config(&endpoint).await {
                Ok(config) => {
                    let _ = self.store.update(id, |n| {
                        n.model_name = config.model_name.clone();
                        n.static_info.max_seq_len = config.max_seq_len;
                        n.static_info.max_output_len = config.max_output_len;
                        n.static_info.total_slots_num = config.total_slots_num;
                        n.static_info.total_block_num = config.total_block_num;
                        n.static_info.block_size = config.block_size;
                        n.static_info.virtual_id = config.virtual_id;
                        n.static_info.flex_p_ratio = config.flex_p_ratio;
                        if let Some(label) = config.label {
                            n.static_info.label = label;
                        }
                        n.is_initialized = true;
                    });
                    debug!("node {id} initialized from {endpoint}");
                }
                Err(e) if matches!(e, ControllerError::ProbeFatal(_)) => {
                    let _ = self
                        .store
                        .mark_faulty(id, &format!("{FATAL_REASON_PREFIX}: {e}"));
                    return ProbeOutcome::MarkedFaulty(id);
                }
                Err(e) => {
                    debug!("node {id} config fetch failed, retrying next tick: {e}");
                    return self.record_probe_failure(id, fault_threshold);
                }
            }
        }

        match self.api.fetch_status(&endpoint).await {
            Ok(status) => {
                self.apply_status(id, &status);
                self.reconcile_decoder_peers(id).await;
                ProbeOutcome::Healthy(id)
            }
            Err(e) if matches!(e, ControllerError::ProbeFatal(_)) => {
                let _ = self
                    .store
                    .mark_faulty(id, &format!("{FATAL_REASON_PREFIX}: {e}"));
                ProbeOutcome::MarkedFaulty(id)
            }
            Err(e) => {
                debug!("node {id} status poll failed: {e}");
                self.record_probe_failure(id, fault_threshold)
            }
        }
    }

    /// Counts a consecutive failure and crosses into the faulty map once
    /// the threshold is reached.
    fn record_probe_failure(&self, id: NodeId, fault_threshold: u32) -> ProbeOutcome {
        let mut crossed = false;
        let _ = self.store.update(id, |n| {
            n.probe_failures += 1;
            n.is_healthy = n.probe_failures < fault_threshold;
            crossed = n.probe_failures >= fault_threshold;
        });
        if crossed {
            let _ = self.store.mark_faulty(id, UNREACHABLE_REASON);
            ProbeOutcome::MarkedFaulty(id)
        } else {
            ProbeOutcome::Transient(id)
        }
    }

    /// Applies a successful status poll to the store.
    fn apply_status(&self, id: NodeId, status: &WorkerStatusResponse) {
        let _ = self.store.update(id, |n| {
            n.dynamic_info = status.resource.clone();
            n.role_state = status.service.role_status;
            n.current_role = status.service.current_role;
            if !status.service.model_name.is_empty() {
                n.model_name = status.service.model_name.clone();
            }
            n.is_healthy = true;
            n.probe_failures = 0;
            if n.current_role == Role::Decode {
                if let Some(peers) = &status.peers {
                    for peer in peers {
                        if !n.peers.contains(peer) {
                            n.peers.push(*peer);
                        }
                    }
                }
            }
            if let Some(active) = &status.active_peers {
                n.active_peers = active.clone();
            }
        });
    }

    /// A faulty node that answers its status poll again is promoted back
    /// into the live map.
    async fn probe_faulty_node(&self, id: NodeId, endpoint: &str) -> ProbeOutcome {
        match self.api.fetch_status(endpoint).await {
            Ok(status) => {
                if self.store.promote(id).is_ok() {
                    self.apply_status(id, &status);
                    info!("node {id} recovered and was promoted back to live");
                    ProbeOutcome::Promoted(id)
                } else {
                    ProbeOutcome::Transient(id)
                }
            }
            Err(_) => ProbeOutcome::Transient(id),
        }
    }

    /// Re-announces the decode role when a decoder's active connections
    /// do not cover its peer list. The worker uses the announcement to
    /// re-establish RDMA connections; the call is idempotent.
    async fn reconcile_decoder_peers(&self, id: NodeId) {
        let Some(node) = self.store.get(id) else {
            return;
        };
        if node.current_role != Role::Decode || node.peers.is_empty() {
            return;
        }
        let covered = node.peers.iter().all(|p| node.active_peers.contains(p));
        if covered {
            return;
        }
        let request = RoleAnnounceRequest {
            peers: self.peer_endpoints(&node.peers),
        };
        if let Err(e) = self
            .api
            .announce_role(&node.mgmt_endpoint(), Role::Decode, &request)
            .await
        {
            warn!("failed to refresh peer list on decoder {id}: {e}");
        }
    }

    /// Resolves peer IDs to announce-body endpoints via the store.
    pub fn peer_endpoints(&self, peer_ids: &[NodeId]) -> Vec<PeerEndpoint> {
        peer_ids
            .iter()
            .filter_map(|peer_id| {
                let peer = self.store.get(*peer_id)?;
                Some(PeerEndpoint {
                    id: *peer_id,
                    server_ip: peer.ip,
                    inter_comm_port: peer.inter_comm_port,
                })
            })
            .collect()
    }

    /// Startup online-wait: repeatedly offers every uninitialized node a
    /// config fetch until it answers or the attempt budget is spent.
    /// Stragglers are marked faulty but do not block the fleet.
    pub async fn wait_online(&self, attempts: u32, wait: Duration, concurrency: usize) {
        // Transient failures must not cross the fault threshold while the
        // fleet is still coming up.
        let fault_threshold = attempts.saturating_add(1);
        for attempt in 1..=attempts {
            let pending: Vec<NodeId> = self
                .store
                .snapshot()
                .live
                .values()
                .filter(|n| !n.is_initialized)
                .map(|n| n.id)
                .collect();
            if pending.is_empty() {
                info!("all workers answered their config fetch");
                return;
            }
            debug!(
                "online wait attempt {attempt}/{attempts}: {} workers still pending",
                pending.len()
            );
            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            let mut tasks: JoinSet<()> = JoinSet::new();
            for id in pending {
                let prober = self.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let _ = prober.probe_live_node(id, fault_threshold).await;
                });
            }
            while tasks.join_next().await.is_some() {}
            if attempt < attempts {
                tokio::time::sleep(wait).await;
            }
        }
        for node in self.store.snapshot().live.values() {
            if !node.is_initialized {
                warn!(
                    "node {} ({}) never answered its config fetch",
                    node.id, node.ip
                );
                let _ = self.store.mark_faulty(node.id, UNREACHABLE_REASON);
            }
        }
    }
}
