// src/core/publish.rs

//! Builds the routable cluster view and drives the coordinators with it:
//! full refreshes, offline notifications, and the liveness probe that
//! lets an unhealthy coordinator rejoin.

use crate::core::client::ControlApi;
use crate::core::protocol::{ClusterViewPayload, OfflineRequest, PublishedNode};
use crate::core::status::{NodeStatusStore, StoreSnapshot};
use crate::core::types::{NodeId, Role};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Consecutive push failures after which a coordinator is unhealthy.
const PUSH_FAILURE_LIMIT: u32 = 3;

/// Outcome of one publish pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub pushed: usize,
    pub failed: usize,
    pub marked_unhealthy: Vec<String>,
}

/// Pushes the validated cluster view to every healthy coordinator.
#[derive(Clone)]
pub struct CoordinatorPublisher {
    store: Arc<NodeStatusStore>,
    api: Arc<dyn ControlApi>,
}

impl CoordinatorPublisher {
    pub fn new(store: Arc<NodeStatusStore>, api: Arc<dyn ControlApi>) -> Self {
        Self { store, api }
    }

    /// Serializes the live view. Nodes without an assigned role are not
    /// routable and never appear in the payload; peers resolve to IPs
    /// here, and a peer whose IP cannot be resolved is skipped.
    pub fn build_view(snapshot: &StoreSnapshot) -> ClusterViewPayload {
        let resolve = |id: NodeId| -> Option<String> {
            snapshot
                .live
                .get(&id)
                .map(|n| n.ip.clone())
                .or_else(|| snapshot.faulty.get(&id).map(|f| f.node.ip.clone()))
        };
        let server = snapshot
            .live
            .values()
            .filter(|node| node.current_role != Role::Undefined)
            .map(|node| PublishedNode {
                id: node.id,
                ip: node.ip.clone(),
                port: node.port,
                is_healthy: node.is_healthy,
                model_name: node.model_name.clone(),
                static_info: node.static_info.clone(),
                peers: node
                    .peers
                    .iter()
                    .filter_map(|peer| {
                        let ip = resolve(*peer);
                        if ip.is_none() {
                            warn!("node {} peer {peer} has no resolvable IP", node.id);
                        }
                        ip
                    })
                    .collect(),
                dynamic_info: node.dynamic_info.clone(),
            })
            .collect();
        ClusterViewPayload { server }
    }

    /// POSTs the view to every healthy coordinator concurrently. Three
    /// consecutive failures make a coordinator unhealthy; a single
    /// failure is only worth a warning.
    pub async fn publish(&self, view: &ClusterViewPayload) -> PublishSummary {
        let coordinators = self.store.snapshot().coordinators;
        let mut tasks: JoinSet<(String, u16, bool)> = JoinSet::new();
        for coordinator in coordinators {
            if !coordinator.is_healthy {
                debug!(
                    "skipping unhealthy coordinator {}",
                    coordinator.endpoint()
                );
                continue;
            }
            let api = self.api.clone();
            let view = view.clone();
            tasks.spawn(async move {
                let endpoint = coordinator.endpoint();
                let ok = match api.push_refresh(&endpoint, &view).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("refresh push to coordinator {endpoint} failed: {e}");
                        false
                    }
                };
                (coordinator.ip, coordinator.port, ok)
            });
        }

        let mut summary = PublishSummary::default();
        while let Some(result) = tasks.join_next().await {
            let Ok((ip, port, ok)) = result else { continue };
            if ok {
                summary.pushed += 1;
                self.store.update_coordinator(&ip, port, |c| {
                    c.failed_pushes = 0;
                });
            } else {
                summary.failed += 1;
                let mut went_unhealthy = false;
                self.store.update_coordinator(&ip, port, |c| {
                    c.failed_pushes += 1;
                    if c.failed_pushes >= PUSH_FAILURE_LIMIT {
                        c.is_healthy = false;
                        went_unhealthy = true;
                    }
                });
                if went_unhealthy {
                    warn!("coordinator {ip}:{port} marked unhealthy after {PUSH_FAILURE_LIMIT} failed pushes");
                    summary.marked_unhealthy.push(format!("{ip}:{port}"));
                }
            }
        }
        summary
    }

    /// Tells every healthy coordinator to evict the given nodes at once,
    /// ahead of the next full refresh.
    pub async fn notify_offline(&self, ids: Vec<NodeId>) {
        if ids.is_empty() {
            return;
        }
        let request = OfflineRequest { ids };
        let coordinators = self.store.snapshot().coordinators;
        let mut tasks: JoinSet<()> = JoinSet::new();
        for coordinator in coordinators {
            if !coordinator.is_healthy {
                continue;
            }
            let api = self.api.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let endpoint = coordinator.endpoint();
                if let Err(e) = api.push_offline(&endpoint, &request).await {
                    warn!("offline push to coordinator {endpoint} failed: {e}");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Probes every coordinator with `GET /v1/coordinator_info`. An
    /// unhealthy coordinator that answers again rejoins the push set.
    pub async fn probe_coordinators(&self) {
        let coordinators = self.store.snapshot().coordinators;
        let mut tasks: JoinSet<(String, u16, bool)> = JoinSet::new();
        for coordinator in coordinators {
            let api = self.api.clone();
            tasks.spawn(async move {
                let endpoint = coordinator.endpoint();
                let ok = api.fetch_coordinator_info(&endpoint).await.is_ok();
                (coordinator.ip, coordinator.port, ok)
            });
        }
        while let Some(result) = tasks.join_next().await {
            let Ok((ip, port, ok)) = result else { continue };
            self.store.update_coordinator(&ip, port, |c| {
                if ok {
                    if !c.is_healthy {
                        debug!("coordinator {}:{} answered again, rejoining", c.ip, c.port);
                    }
                    c.is_healthy = true;
                    c.failed_pushes = 0;
                } else if c.is_healthy {
                    c.failed_pushes += 1;
                    if c.failed_pushes >= PUSH_FAILURE_LIMIT {
                        c.is_healthy = false;
                    }
                }
            });
        }
    }
}
