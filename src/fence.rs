// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The fence-cycle primitive signaling GPU completion.
//!
//! `FenceCycle` is an external collaborator (§1): the coherency core only
//! waits on, polls, and chains cycles, it never creates the underlying GPU
//! submission. Implementations live on the caller's side of the boundary;
//! [`crate::testing::NopFenceCycle`] provides an always-signaled stand-in.
use std::sync::Arc;

/// An opaque handle to a submitted GPU operation's completion signal.
pub trait FenceCycle: std::fmt::Debug + Send + Sync {
    /// Blocks the calling thread until this cycle has completed.
    fn wait(&self);

    /// Returns whether this cycle has completed, without blocking.
    fn poll(&self) -> bool;
}

/// Links an older cycle behind a newer one so waiting on the newer cycle
/// transitively waits for the older one too.
///
/// Mirrors `ChainCycle` (§6): a buffer attaching a new cycle while an older
/// one is still outstanding chains rather than drops it, so a caller that
/// only holds the latest `cycle` still observes every prior completion.
#[derive(Debug)]
pub struct ChainedCycle {
    newer: Arc<dyn FenceCycle>,
    older: Option<Arc<dyn FenceCycle>>,
}

impl ChainedCycle {
    pub fn new(newer: Arc<dyn FenceCycle>, older: Option<Arc<dyn FenceCycle>>) -> Self {
        ChainedCycle { newer, older }
    }
}

impl FenceCycle for ChainedCycle {
    fn wait(&self) {
        if let Some(older) = &self.older {
            older.wait();
        }
        self.newer.wait();
    }

    fn poll(&self) -> bool {
        self.older.as_ref().is_none_or(|o| o.poll()) && self.newer.poll()
    }
}

/// Chains `newer` behind `old` (§6 `ChainCycle`). `old` may be absent, in
/// which case `newer` is returned unchanged.
pub fn chain_cycle(
    old: Option<Arc<dyn FenceCycle>>,
    newer: Arc<dyn FenceCycle>,
) -> Arc<dyn FenceCycle> {
    match old {
        None => newer,
        Some(old) => Arc::new(ChainedCycle::new(newer, Some(old))),
    }
}
