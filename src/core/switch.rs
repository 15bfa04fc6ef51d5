// src/core/switch.rs

//! The role-switch state machine. A switching node is drained of
//! in-flight work, announced into its new role, and watched until the
//! worker reports the role ready. Existing decoders always hear about a
//! reshape before the promoted node does, so prefill traffic never
//! targets a decoder that has not registered its new partner.

use crate::core::client::ControlApi;
use crate::core::errors::ControllerError;
use crate::core::protocol::{PeerEndpoint, RoleAnnounceRequest};
use crate::core::status::NodeStatusStore;
use crate::core::types::{NodeId, NodeInfo, Role, RoleState};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Faulty-map reason prefix for nodes whose switch attempt failed.
/// The scheduler re-admits such nodes for a fresh attempt until the
/// attempt budget is spent; the prober leaves them alone.
pub const SWITCH_FAILED_REASON_PREFIX: &str = "switch_failed";

/// Drain and readiness polls run at 1 Hz.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Announce retry policy: up to 3 retries, 1 s apart, on 5xx.
const ANNOUNCE_RETRIES: u32 = 3;
const ANNOUNCE_BACKOFF: Duration = Duration::from_secs(1);

/// One switch the scheduler wants executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRequest {
    pub id: NodeId,
    pub desired_role: Role,
}

/// Limits applied to a batch of switches.
#[derive(Debug, Clone, Copy)]
pub struct SwitchSettings {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub max_attempts: u32,
}

/// Outcome of one batch, aggregated into the scheduler's summary.
#[derive(Debug, Default)]
pub struct SwitchReport {
    pub done: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    pub skipped: Vec<NodeId>,
}

/// Drives nodes through role transitions.
#[derive(Clone)]
pub struct RoleSwitcher {
    store: Arc<NodeStatusStore>,
    api: Arc<dyn ControlApi>,
    /// Per-node failed-attempt counters, kept across iterations.
    attempts: Arc<DashMap<NodeId, u32>>,
    /// Nodes currently mid-switch. A node present here is never chosen
    /// again until it reaches done or failed.
    in_flight: Arc<DashMap<NodeId, ()>>,
    stop: Arc<AtomicBool>,
}

impl RoleSwitcher {
    pub fn new(store: Arc<NodeStatusStore>, api: Arc<dyn ControlApi>) -> Self {
        Self {
            store,
            api,
            attempts: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared stop flag; setting it aborts in-progress polls promptly.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn attempts_for(&self, id: NodeId) -> u32 {
        self.attempts.get(&id).map(|e| *e.value()).unwrap_or(0)
    }

    /// True once a node has exhausted its attempt budget; it then stays
    /// out of the published view until an operator steps in.
    pub fn is_exhausted(&self, id: NodeId, max_attempts: u32) -> bool {
        self.attempts_for(id) >= max_attempts
    }

    pub fn reset_attempts(&self, id: NodeId) {
        self.attempts.remove(&id);
    }

    /// Executes a batch of switches with bounded concurrency. Ordering
    /// within each node's switch is strict: drain, then decoders, then
    /// the node itself, then readiness.
    pub async fn execute(
        &self,
        requests: Vec<SwitchRequest>,
        settings: SwitchSettings,
    ) -> SwitchReport {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let mut tasks: JoinSet<(SwitchRequest, Result<(), ControllerError>)> = JoinSet::new();

        let mut report = SwitchReport::default();
        for request in requests {
            if self.is_exhausted(request.id, settings.max_attempts) {
                debug!(
                    "node {} has exhausted its switch attempts; skipping",
                    request.id
                );
                report.skipped.push(request.id);
                continue;
            }
            // At most one attempt in flight per node.
            if self.in_flight.insert(request.id, ()).is_some() {
                report.skipped.push(request.id);
                continue;
            }
            let switcher = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    switcher.in_flight.remove(&request.id);
                    return (request, Err(ControllerError::Internal("pool closed".into())));
                };
                let result = switcher.switch_node(request, settings).await;
                switcher.in_flight.remove(&request.id);
                (request, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((request, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => {
                    self.reset_attempts(request.id);
                    report.done.push(request.id);
                }
                Err(ControllerError::Internal(reason)) if self.stop.load(Ordering::SeqCst) => {
                    // Shutdown abort: no fault, no attempt charged.
                    debug!("switch of node {} aborted: {reason}", request.id);
                    report.skipped.push(request.id);
                }
                Err(e) => {
                    let charged = self
                        .attempts
                        .entry(request.id)
                        .and_modify(|a| *a += 1)
                        .or_insert(1);
                    let reason = format!("{SWITCH_FAILED_REASON_PREFIX}: {e}");
                    warn!(
                        "switch of node {} to {} failed (attempt {}): {e}",
                        request.id, request.desired_role, *charged
                    );
                    drop(charged);
                    let _ = self.store.mark_faulty(request.id, &reason);
                    report.failed.push((request.id, reason));
                }
            }
        }
        report
    }

    /// The full state machine for one node:
    /// draining -> announcing (decoders first) -> waiting ready -> done.
    async fn switch_node(
        &self,
        request: SwitchRequest,
        settings: SwitchSettings,
    ) -> Result<(), ControllerError> {
        let node = self.store.get(request.id).ok_or_else(|| {
            ControllerError::NotFound(format!("node {} vanished before switching", request.id))
        })?;
        if node.current_role == request.desired_role && node.role_state == RoleState::Ready {
            return Ok(());
        }
        info!(
            "switching node {} ({}) from {} to {}",
            request.id, node.ip, node.current_role, request.desired_role
        );
        let deadline = Instant::now() + settings.timeout;
        let _ = self
            .store
            .update(request.id, |n| n.role_state = RoleState::Switching);

        self.drain(&node, request.id, deadline, settings.timeout)
            .await?;
        self.announce_reshape(&node, request.desired_role, deadline, settings.timeout)
            .await?;
        self.wait_ready(&node, request.desired_role, deadline, settings.timeout)
            .await?;

        let _ = self.store.update(request.id, |n| {
            n.current_role = request.desired_role;
            n.static_info.role = request.desired_role;
            n.role_state = RoleState::Ready;
        });
        info!(
            "node {} is ready in role {}",
            request.id, request.desired_role
        );
        Ok(())
    }

    /// Polls `/v1/instances/tasks` at 1 Hz until the worker reports no
    /// in-flight work.
    async fn drain(
        &self,
        node: &NodeInfo,
        id: NodeId,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let endpoint = node.mgmt_endpoint();
        loop {
            self.check_stop()?;
            match self.api.fetch_tasks(&endpoint, id).await {
                Ok(tasks) if tasks.is_drained() => return Ok(()),
                Ok(tasks) => {
                    debug!("node {id} still has {} in-flight tasks", tasks.tasks.len())
                }
                Err(ControllerError::ProbeFatal(reason)) => {
                    return Err(ControllerError::SwitchRejected { id, reason });
                }
                Err(e) => debug!("drain poll on node {id} failed, will retry: {e}"),
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(ControllerError::SwitchTimeout {
                    id,
                    elapsed_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Announces the reshape: first the group's other decoders (so they
    /// accept the node as a peer), then the switching node itself.
    async fn announce_reshape(
        &self,
        node: &NodeInfo,
        desired_role: Role,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let snapshot = self.store.snapshot();
        let group_id = node.group_id();

        // Membership as of now: the switching node still holds its old role.
        let mut prefill_ids: Vec<NodeId> = snapshot
            .live
            .values()
            .filter(|n| n.group_id() == group_id && n.current_role == Role::Prefill)
            .map(|n| n.id)
            .collect();
        let decoder_peers: Vec<&NodeInfo> = snapshot
            .live
            .values()
            .filter(|n| {
                n.group_id() == group_id && n.current_role == Role::Decode && n.id != node.id
            })
            .collect();

        // Decoders must learn about an incoming prefill before it starts.
        if desired_role == Role::Prefill && !prefill_ids.contains(&node.id) {
            prefill_ids.push(node.id);
        }
        let decoder_body = RoleAnnounceRequest {
            peers: self.peer_endpoints(&snapshot, &prefill_ids),
        };
        for decoder in decoder_peers {
            self.check_stop()?;
            if Instant::now() > deadline {
                return Err(ControllerError::SwitchTimeout {
                    id: node.id,
                    elapsed_secs: timeout.as_secs(),
                });
            }
            self.announce_with_retry(&decoder.mgmt_endpoint(), decoder.id, Role::Decode, &decoder_body)
                .await?;
        }

        // Then the node itself. A new decoder gets the group's prefill
        // set (minus itself); a new prefill announces with no peers.
        let own_body = match desired_role {
            Role::Decode => {
                let own_peers: Vec<NodeId> = prefill_ids
                    .iter()
                    .copied()
                    .filter(|id| *id != node.id)
                    .collect();
                RoleAnnounceRequest {
                    peers: self.peer_endpoints(&snapshot, &own_peers),
                }
            }
            Role::Prefill => RoleAnnounceRequest::default(),
            other => {
                return Err(ControllerError::SwitchRejected {
                    id: node.id,
                    reason: format!("role '{other}' is not switchable"),
                });
            }
        };
        self.check_stop()?;
        self.announce_with_retry(&node.mgmt_endpoint(), node.id, desired_role, &own_body)
            .await
    }

    /// One announce with the 3x1s retry policy for server errors.
    async fn announce_with_retry(
        &self,
        endpoint: &str,
        id: NodeId,
        role: Role,
        body: &RoleAnnounceRequest,
    ) -> Result<(), ControllerError> {
        let mut last_err = None;
        for attempt in 0..=ANNOUNCE_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(ANNOUNCE_BACKOFF).await;
            }
            match self.api.announce_role(endpoint, role, body).await {
                Ok(()) => return Ok(()),
                Err(ControllerError::ProbeFatal(reason)) => {
                    return Err(ControllerError::SwitchRejected { id, reason });
                }
                Err(e) => {
                    debug!("announce {role} to {endpoint} failed (attempt {attempt}): {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(ControllerError::SwitchRejected {
            id,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "announce failed".into()),
        })
    }

    /// Polls `/v1/status` until the worker reports the desired role ready.
    async fn wait_ready(
        &self,
        node: &NodeInfo,
        desired_role: Role,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let endpoint = node.mgmt_endpoint();
        loop {
            self.check_stop()?;
            match self.api.fetch_status(&endpoint).await {
                Ok(status)
                    if status.service.role_status == RoleState::Ready
                        && status.service.current_role == desired_role =>
                {
                    return Ok(());
                }
                Ok(status) => debug!(
                    "node {} not ready yet: role {} state {}",
                    node.id, status.service.current_role, status.service.role_status
                ),
                Err(e) => debug!("readiness poll on node {} failed: {e}", node.id),
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(ControllerError::SwitchTimeout {
                    id: node.id,
                    elapsed_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn peer_endpoints(
        &self,
        snapshot: &crate::core::status::StoreSnapshot,
        peer_ids: &[NodeId],
    ) -> Vec<PeerEndpoint> {
        peer_ids
            .iter()
            .filter_map(|id| {
                let peer = snapshot.live.get(id)?;
                Some(PeerEndpoint {
                    id: *id,
                    server_ip: peer.ip.clone(),
                    inter_comm_port: peer.inter_comm_port,
                })
            })
            .collect()
    }

    fn check_stop(&self) -> Result<(), ControllerError> {
        if self.stop.load(Ordering::SeqCst) {
            Err(ControllerError::Internal("controller is stopping".into()))
        } else {
            Ok(())
        }
    }
}

/// Faulty nodes the scheduler may re-admit for a fresh switch attempt:
/// the reason records a failed switch and the budget is not spent.
pub fn is_retryable_switch_fault(reason: &str, attempts: u32, max_attempts: u32) -> bool {
    reason.starts_with(SWITCH_FAILED_REASON_PREFIX) && attempts < max_attempts
}
