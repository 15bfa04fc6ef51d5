// src/core/scheduler.rs

//! The top-level orchestration loop. Each iteration reconciles the rank
//! table, probes the fleet, plans the role distribution, drives the Role
//! Switcher, publishes the view to coordinators, and persists state.
//! Followers run the read-only subset so leadership can move without a
//! warmup.

use crate::config::{ControllerConfig, DeployMode};
use crate::core::errors::ControllerError;
use crate::core::leader::LeaderElection;
use crate::core::persist::{ProcessStatusDoc, ProcessStatusFile};
use crate::core::planner::{GroupLoad, GroupPlan, RolePlanner};
use crate::core::probe::WorkerProber;
use crate::core::publish::CoordinatorPublisher;
use crate::core::status::NodeStatusStore;
use crate::core::switch::{
    RoleSwitcher, SwitchRequest, SwitchSettings, is_retryable_switch_fault,
};
use crate::core::topology::RankTableLoader;
use crate::core::types::{
    Label, NodeId, NodeInfo, Role, build_group_view, refresh_peers_by_group,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Reason recorded when a node ages out of the rank table.
pub const REMOVED_REASON: &str = "removed from rank table";

/// One iteration's aggregate, folded into a single summary log line.
#[derive(Debug, Default)]
pub struct IterationSummary {
    pub live_nodes: usize,
    pub faulty_nodes: usize,
    pub probed: usize,
    pub probe_failures: usize,
    pub switched: usize,
    pub switch_failures: usize,
    pub published_nodes: usize,
    pub coordinators_pushed: usize,
    pub is_leader: bool,
    pub errors: Vec<String>,
}

/// The orchestrator. Owns no background tasks of its own; `run` is the
/// task, and everything it drives is awaited inside one iteration.
pub struct ClusterScheduler {
    config: Arc<RwLock<ControllerConfig>>,
    store: Arc<NodeStatusStore>,
    loader: Arc<RankTableLoader>,
    prober: WorkerProber,
    switcher: RoleSwitcher,
    publisher: CoordinatorPublisher,
    planner: Arc<dyn RolePlanner>,
    leader: Arc<dyn LeaderElection>,
    process_file: Option<ProcessStatusFile>,
}

impl ClusterScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<ControllerConfig>>,
        store: Arc<NodeStatusStore>,
        loader: Arc<RankTableLoader>,
        prober: WorkerProber,
        switcher: RoleSwitcher,
        publisher: CoordinatorPublisher,
        planner: Arc<dyn RolePlanner>,
        leader: Arc<dyn LeaderElection>,
    ) -> Self {
        let process_file = {
            let config = config.read();
            config.process_manager.to_file.then(|| {
                ProcessStatusFile::new(
                    config.process_manager.file_path.clone().into(),
                    config.check_mounted_files,
                )
            })
        };
        Self {
            config,
            store,
            loader,
            prober,
            switcher,
            publisher,
            planner,
            leader,
            process_file,
        }
    }

    /// Startup: recover persisted state, ingest the rank table, seed the
    /// store, and wait for the fleet to come online. Errors here are
    /// fatal and map to the process exit codes.
    pub async fn bootstrap(&self) -> Result<(), ControllerError> {
        let recovered = self.recover();

        let table = self.loader.load()?;
        let assignments = table.group_assignments()?;
        let deploy_mode = self.config.read().deploy_mode;

        let mut seeded = 0usize;
        let mut adopted = 0usize;
        let mut nodes = Vec::with_capacity(table.server_list.len());
        for (entry, group_id) in table.server_list.iter().zip(assignments) {
            let node = match recovered.get(&entry.endpoint_key()) {
                Some(persisted) => {
                    adopted += 1;
                    let mut node = persisted.clone();
                    // Ports may have been edited out-of-band; the table wins.
                    node.port = entry.port;
                    node.mgmt_port = entry.mgmt_port;
                    node.metric_port = entry.metric_port;
                    node.inter_comm_port = entry.inter_comm_port;
                    node.host_id = entry.server_id.clone();
                    node.delete_time = 0;
                    node.active_peers.clear();
                    node
                }
                None => self.loader.node_from_entry(entry, group_id, deploy_mode),
            };
            seeded += 1;
            nodes.push(node);
        }
        self.store.seed(nodes);
        for coordinator in table.coordinators() {
            self.store.add_coordinator(coordinator);
        }
        info!("bootstrap complete: {seeded} nodes seeded ({adopted} recovered from disk)");

        let (attempts, wait, concurrency) = {
            let config = self.config.read();
            (
                config.server_online_attempt_times,
                Duration::from_secs(config.server_online_wait_seconds),
                config.probe_concurrency,
            )
        };
        self.prober.wait_online(attempts, wait, concurrency).await;
        Ok(())
    }

    /// Reads the Process Status File. Any failure is logged and the file
    /// ignored; recovery never crashes the controller.
    fn recover(&self) -> HashMap<(String, u16), NodeInfo> {
        let Some(process_file) = &self.process_file else {
            return HashMap::new();
        };
        match process_file.load() {
            Ok(Some(doc)) => {
                self.loader
                    .set_instance_start_id_number(doc.instance_start_id_number);
                doc.server
                    .into_iter()
                    .map(|record| (record.node.endpoint_key(), record.node))
                    .collect()
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                error!("ignoring process status file: {e}");
                HashMap::new()
            }
        }
    }

    /// The scheduler main loop. Publishing of iteration `k` always
    /// completes before iteration `k+1` begins.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let switch_stop = self.switcher.stop_handle();
        let mut stopping = false;
        loop {
            let started = tokio::time::Instant::now();
            let iteration = self.iterate();
            tokio::pin!(iteration);
            let summary = tokio::select! {
                summary = &mut iteration => summary,
                _ = shutdown_rx.recv() => {
                    info!("scheduler received shutdown signal; finishing current iteration");
                    switch_stop.store(true, Ordering::SeqCst);
                    stopping = true;
                    iteration.await
                }
            };
            info!(
                live = summary.live_nodes,
                faulty = summary.faulty_nodes,
                probed = summary.probed,
                probe_failures = summary.probe_failures,
                switched = summary.switched,
                switch_failures = summary.switch_failures,
                published = summary.published_nodes,
                pushed = summary.coordinators_pushed,
                leader = summary.is_leader,
                errors = summary.errors.len(),
                "scheduler iteration complete"
            );
            for message in &summary.errors {
                warn!("iteration error: {message}");
            }
            if stopping {
                return;
            }
            // Sleep whatever is left of the period, waking early on stop.
            let period = self.config.read().sync_period();
            let remaining = period.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = shutdown_rx.recv() => {
                    switch_stop.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// One full iteration: reconcile, probe, plan, switch, publish,
    /// persist. Steps run strictly in this order.
    pub async fn iterate(&self) -> IterationSummary {
        let mut summary = IterationSummary::default();
        let config = self.config.read().clone();
        let is_leader = self.leader.is_leader();
        summary.is_leader = is_leader;

        // (2) Reconcile the rank table against the registry.
        let mut went_offline = match self.reconcile_topology(&config) {
            Ok(removed) => removed,
            Err(e) => {
                summary.errors.push(e.to_string());
                Vec::new()
            }
        };
        let dropped = self
            .store
            .expire_faulty(config.cluster_synchronization_seconds, config.faulty_retention_seconds);
        went_offline.extend(dropped);

        // (3) Probe the fleet.
        let probe = self
            .prober
            .probe_all(config.probe_concurrency, config.probe_fault_threshold)
            .await;
        summary.probed = probe.probed;
        summary.probe_failures = probe.failed;
        went_offline.extend(probe.marked_faulty.iter().copied());

        // (4) Desired role distribution.
        let plans = self.compute_plans(&config);

        // (5) Diff and switch (leader only).
        if is_leader {
            self.readmit_switch_candidates(&config);
            let requests = self.build_switch_requests(&config, &plans);
            if !requests.is_empty() {
                let group_count = build_group_view(self.store.snapshot().live.values()).len();
                let settings = SwitchSettings {
                    timeout: Duration::from_secs(config.role_switch_timeout_seconds),
                    max_concurrent: if config.max_concurrent_switches == 0 {
                        group_count.max(1)
                    } else {
                        config.max_concurrent_switches
                    },
                    max_attempts: config.max_switch_attempts,
                };
                let report = self.switcher.execute(requests, settings).await;
                summary.switched = report.done.len();
                summary.switch_failures = report.failed.len();
                went_offline.extend(report.failed.iter().map(|(id, _)| *id));
                for (id, reason) in &report.failed {
                    summary.errors.push(format!("node {id}: {reason}"));
                }
            }
        }
        self.apply_flex_ratios(&plans);
        self.refresh_all_peers();

        // (6) Publish. Followers still build the view so they can lead
        // on the next iteration without a warmup.
        let snapshot = self.store.snapshot();
        summary.live_nodes = snapshot.live.len();
        summary.faulty_nodes = snapshot.faulty.len();
        let view = CoordinatorPublisher::build_view(&snapshot);
        summary.published_nodes = view.server.len();
        if is_leader {
            went_offline.sort_unstable();
            went_offline.dedup();
            self.publisher.notify_offline(went_offline).await;
            let push = self.publisher.publish(&view).await;
            summary.coordinators_pushed = push.pushed;
            if push.failed > 0 {
                summary
                    .errors
                    .push(format!("{} coordinator pushes failed", push.failed));
            }
            self.publisher.probe_coordinators().await;
        }

        // (7) Persist (leader only). A failed write is skipped, never fatal.
        if is_leader {
            if let Some(process_file) = &self.process_file {
                let doc = ProcessStatusDoc::from_snapshot(
                    &snapshot,
                    self.loader.instance_start_id_number(),
                );
                if let Err(e) = process_file.save(doc) {
                    error!("skipping status persist this iteration: {e}");
                    summary.errors.push(e.to_string());
                }
            }
        }
        summary
    }

    /// Step 2: three-way diff between the rank table and the registry.
    /// Returns the IDs that crossed into the faulty map by going absent.
    fn reconcile_topology(
        &self,
        config: &ControllerConfig,
    ) -> Result<Vec<NodeId>, ControllerError> {
        let table = match self.loader.load() {
            Ok(table) => table,
            Err(e) => {
                // Keep the last valid snapshot; the table is operator-edited
                // and transient breakage must not take the fleet down.
                warn!("rank table reload failed, keeping last valid snapshot: {e}");
                return Err(e);
            }
        };
        let assignments = table.group_assignments()?;
        let deploy_mode = config.deploy_mode;

        let snapshot = self.store.snapshot();
        let mut known: HashMap<(String, u16), NodeId> = snapshot
            .live
            .values()
            .map(|n| (n.endpoint_key(), n.id))
            .chain(
                snapshot
                    .faulty
                    .values()
                    .map(|f| (f.node.endpoint_key(), f.node.id)),
            )
            .collect();

        for (entry, group_id) in table.server_list.iter().zip(assignments) {
            match known.remove(&entry.endpoint_key()) {
                Some(id) => {
                    // A node that aged out of the table and reappears must
                    // keep its ID: promote it out of the faulty map first,
                    // since `update` only reaches live nodes. Nodes parked
                    // for health or switch reasons stay where they are.
                    if let Some(parked) = snapshot.faulty.get(&id) {
                        if parked.reason == REMOVED_REASON || parked.node.delete_time > 0 {
                            info!("node {id} reappeared in the rank table");
                            let _ = self.store.promote(id);
                        }
                    }
                    let _ = self.store.update(id, |node| {
                        node.port = entry.port;
                        node.mgmt_port = entry.mgmt_port;
                        node.metric_port = entry.metric_port;
                        node.inter_comm_port = entry.inter_comm_port;
                        node.host_id = entry.server_id.clone();
                        node.delete_time = 0;
                    });
                }
                None => {
                    let node = self.loader.node_from_entry(entry, group_id, deploy_mode);
                    info!(
                        "rank table added node {} at ({}, {})",
                        node.id, entry.server_ip, entry.mgmt_port
                    );
                    self.store.add(node);
                }
            }
        }

        // Whatever is left in `known` vanished from the table.
        let mut removed = Vec::new();
        for (key, id) in known {
            let mut grace_exceeded = false;
            let updated = self.store.update(id, |node| {
                node.delete_time = node
                    .delete_time
                    .saturating_add(config.cluster_synchronization_seconds);
                grace_exceeded = node.delete_time > config.delete_grace_seconds;
            });
            if updated.is_ok() && grace_exceeded {
                debug!(
                    "node {id} at ({}, {}) stayed absent past the grace period",
                    key.0, key.1
                );
                let _ = self.store.mark_faulty(id, REMOVED_REASON);
                removed.push(id);
            }
        }

        let coordinator_keys: Vec<(String, u16)> = table
            .coordinator_list
            .iter()
            .map(|c| (c.server_ip.clone(), c.port))
            .collect();
        for coordinator in table.coordinators() {
            self.store.add_coordinator(coordinator);
        }
        self.store.retain_coordinators(&coordinator_keys);

        Ok(removed)
    }

    /// Step 4: per-group loads into the planner. Single-node deployments
    /// bypass planning entirely; every node serves the full pipeline.
    fn compute_plans(&self, config: &ControllerConfig) -> Vec<GroupPlan> {
        if config.deploy_mode == DeployMode::SingleNode {
            return Vec::new();
        }
        let snapshot = self.store.snapshot();
        let mut loads: BTreeMap<u64, GroupLoad> = BTreeMap::new();
        for node in snapshot.live.values() {
            if !node.is_initialized {
                continue;
            }
            let load = loads.entry(node.group_id()).or_insert_with(|| GroupLoad {
                group_id: node.group_id(),
                ..Default::default()
            });
            if node.current_role == Role::Flex || node.static_info.label == Label::FlexStatic {
                load.flex_count += 1;
            } else {
                load.node_count += 1;
            }
            load.total_slots += node.static_info.total_slots_num;
            load.avail_slots += node.dynamic_info.avail_slots_num;
            load.total_blocks += node.static_info.total_block_num;
            load.avail_blocks += node.dynamic_info.avail_block_num;
            load.waiting_requests += node.dynamic_info.waiting_request_num;
        }
        let loads: Vec<GroupLoad> = loads.into_values().collect();
        if loads.is_empty() {
            return Vec::new();
        }
        self.planner.plan(&loads)
    }

    /// Failed switchers whose attempt budget is not spent come back from
    /// the faulty map for a fresh try this iteration.
    fn readmit_switch_candidates(&self, config: &ControllerConfig) {
        let snapshot = self.store.snapshot();
        for (id, entry) in &snapshot.faulty {
            if is_retryable_switch_fault(
                &entry.reason,
                self.switcher.attempts_for(*id),
                config.max_switch_attempts,
            ) {
                debug!("re-admitting node {id} for a fresh switch attempt");
                let _ = self.store.promote(*id);
            }
        }
    }

    /// Step 5 input: the set of nodes whose current role differs from
    /// the planned one, honoring static labels and preferring nodes that
    /// already hold the role (minimal movement).
    fn build_switch_requests(
        &self,
        config: &ControllerConfig,
        plans: &[GroupPlan],
    ) -> Vec<SwitchRequest> {
        if config.deploy_mode == DeployMode::SingleNode {
            return Vec::new();
        }
        let snapshot = self.store.snapshot();
        let mut requests = Vec::new();
        for plan in plans {
            let mut members: Vec<&NodeInfo> = snapshot
                .live
                .values()
                .filter(|n| {
                    n.group_id() == plan.group_id
                        && n.is_initialized
                        && n.is_healthy
                        && n.current_role != Role::Flex
                        && n.static_info.label != Label::FlexStatic
                })
                .collect();
            members.sort_by_key(|n| n.id);
            for (id, desired_role) in desired_roles_for_group(&members, plan) {
                let current = snapshot.live[&id].current_role;
                if current != desired_role {
                    requests.push(SwitchRequest { id, desired_role });
                }
            }
        }
        // Decoder announcements must precede the promoted node within a
        // switch; across switches, promote decoders before prefills so a
        // reshaped group always has its decode side settled first.
        requests.sort_by_key(|r| match r.desired_role {
            Role::Decode => 0,
            _ => 1,
        });
        requests
    }

    /// Applies the planner's flex split to the flex members of each group.
    fn apply_flex_ratios(&self, plans: &[GroupPlan]) {
        let snapshot = self.store.snapshot();
        for plan in plans {
            for node in snapshot.live.values() {
                if node.group_id() == plan.group_id
                    && node.current_role == Role::Flex
                    && node.static_info.flex_p_ratio != plan.flex_p_ratio
                {
                    let _ = self.store.update(node.id, |n| {
                        n.static_info.flex_p_ratio = plan.flex_p_ratio;
                    });
                }
            }
        }
    }

    /// Recomputes every live node's peer list from current group
    /// membership.
    fn refresh_all_peers(&self) {
        let snapshot = self.store.snapshot();
        let groups = build_group_view(snapshot.live.values());
        let mut nodes: Vec<NodeInfo> = snapshot.live.into_values().collect();
        {
            let mut refs: Vec<&mut NodeInfo> = nodes.iter_mut().collect();
            refresh_peers_by_group(&mut refs, &groups);
        }
        for node in nodes {
            let _ = self.store.update(node.id, |n| {
                n.peers = node.peers.clone();
                n.active_peers = node.active_peers.clone();
            });
        }
    }
}

/// Pure assignment for one group: static labels bind, then nodes already
/// in the target role stay put, then operator preference breaks ties.
pub fn desired_roles_for_group(
    members: &[&NodeInfo],
    plan: &GroupPlan,
) -> Vec<(NodeId, Role)> {
    let mut assignments = Vec::with_capacity(members.len());
    let mut flexible: Vec<&NodeInfo> = Vec::new();
    let mut static_prefill = 0usize;
    for node in members.iter().copied() {
        match node.static_info.label {
            Label::PrefillStatic => {
                static_prefill += 1;
                assignments.push((node.id, Role::Prefill));
            }
            Label::DecodeStatic => assignments.push((node.id, Role::Decode)),
            _ => flexible.push(node),
        }
    }
    if static_prefill > plan.prefill_count {
        warn!(
            "group {}: {static_prefill} statically pinned prefill nodes exceed the planned {}",
            plan.group_id, plan.prefill_count
        );
    }
    let need_prefill = plan.prefill_count.saturating_sub(static_prefill);

    // Prefer keeping nodes in the role they already hold.
    flexible.sort_by_key(|n| {
        let keeps_role = n.current_role == Role::Prefill;
        let prefers = n.static_info.label == Label::PrefillPrefer;
        (!keeps_role, !prefers, n.id)
    });
    for (index, node) in flexible.iter().enumerate() {
        let role = if index < need_prefill {
            Role::Prefill
        } else {
            Role::Decode
        };
        assignments.push((node.id, role));
    }
    assignments
}
