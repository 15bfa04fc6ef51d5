// src/core/leader.rs

//! Leadership seam. Election itself lives in an external service; the
//! controller only ever asks whether it currently leads. Followers keep
//! probing and building the view so they can take over without a warmup.

/// Answered fresh on every scheduler iteration.
pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-controller deployments lead unconditionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

impl LeaderElection for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// A toggleable leadership flag, used by tests and by the HA agent glue.
#[derive(Debug, Default)]
pub struct SharedLeaderFlag(std::sync::atomic::AtomicBool);

impl SharedLeaderFlag {
    pub fn new(is_leader: bool) -> Self {
        Self(std::sync::atomic::AtomicBool::new(is_leader))
    }

    pub fn set(&self, is_leader: bool) {
        self.0.store(is_leader, std::sync::atomic::Ordering::SeqCst);
    }
}

impl LeaderElection for SharedLeaderFlag {
    fn is_leader(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
