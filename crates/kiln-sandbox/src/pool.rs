//! Slot pool: a fixed set of lock-guarded sandbox slots.
//!
//! Each slot maps to one numbered sandbox (an `isolate` box id, or a staging
//! directory for the unconfined backend). A run picks a slot uniformly at
//! random and takes its async mutex, so two invocations never share a box;
//! a busy slot simply queues the run behind the lock. With N slots the
//! service runs at most N tools concurrently and the wait is unbounded but
//! fair enough in practice.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::IsolationBackend;

/// Extra wall-clock allowance past the sandbox's own limit, so the sandbox
/// can report its timeout cleanly before the host gives up on it.
const HOST_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the slot pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of sandbox slots, and so the concurrency ceiling.
    pub slots: usize,
    /// Wall-clock budget per run; the host kills the sandbox shortly after.
    pub wall_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            wall_time: Duration::from_secs(30),
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Runs that reached a slot.
    pub started: AtomicU64,
    /// Runs whose sandbox exited on its own.
    pub completed: AtomicU64,
    /// Runs killed by the host wall-clock guard.
    pub timed_out: AtomicU64,
    /// Sandbox init, run, or cleanup failures.
    pub faults: AtomicU64,
}

/// What happened to one sandboxed run, as far as the pool can tell.
///
/// A nonzero or absent exit status is not an error at this level; whether
/// the invocation produced a usable result is decided by whoever reads the
/// workspace afterwards.
#[derive(Debug)]
pub struct RunRecord {
    /// The slot the run occupied.
    pub slot: usize,
    /// Exit status of the sandbox process, when it exited on its own.
    pub status: Option<ExitStatus>,
    /// True when the host killed the sandbox at the wall-clock guard.
    pub timed_out: bool,
}

struct Slot {
    lock: Mutex<()>,
}

/// A fixed pool of sandbox slots sharing one backend.
pub struct SlotPool {
    config: PoolConfig,
    slots: Vec<Slot>,
    backend: Arc<dyn IsolationBackend>,
    metrics: Arc<PoolMetrics>,
}

impl SlotPool {
    /// Create a pool of `config.slots` slots over the given backend.
    pub fn new(config: PoolConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        let slots = (0..config.slots.max(1))
            .map(|_| Slot {
                lock: Mutex::new(()),
            })
            .collect();
        Self {
            config,
            slots,
            backend,
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Get a reference to the pool metrics.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Run one staged program in a randomly chosen slot.
    ///
    /// Blocks (asynchronously) while the chosen slot is busy. The slot is
    /// initialized, run under the wall-clock guard, and cleaned up again
    /// before the lock is dropped; cleanup happens even when the run fails.
    #[tracing::instrument(skip(self, program, workspace))]
    pub async fn run(&self, program: &Path, workspace: &Path) -> anyhow::Result<RunRecord> {
        let slot_index = rand::rng().random_range(0..self.slots.len());
        let slot = &self.slots[slot_index];

        let _guard = slot.lock.lock().await;
        self.metrics.started.fetch_add(1, Ordering::Relaxed);
        debug!(slot = slot_index, "slot acquired");

        let result = self.run_in_slot(slot_index, program, workspace).await;

        if let Err(e) = self.backend.cleanup(slot_index).await {
            self.metrics.faults.fetch_add(1, Ordering::Relaxed);
            warn!(slot = slot_index, error = format!("{e:#}"), "slot cleanup failed");
        }

        if result.is_err() {
            self.metrics.faults.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn run_in_slot(
        &self,
        slot: usize,
        program: &Path,
        workspace: &Path,
    ) -> anyhow::Result<RunRecord> {
        let staged = self
            .backend
            .init(slot, program)
            .await
            .context("sandbox initialization failed")?;

        // Give the sandbox a bit more time than its own wall-clock limit,
        // so it can report the timeout itself; past that, dropping the run
        // future kills the child.
        let deadline = self.config.wall_time + HOST_GRACE;
        match tokio::time::timeout(deadline, self.backend.run(slot, &staged, workspace)).await {
            Ok(Ok(status)) => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                debug!(slot, code = status.code(), "sandbox exited");
                Ok(RunRecord {
                    slot,
                    status: Some(status),
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(e.context("sandbox run failed")),
            Err(_elapsed) => {
                self.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(slot, "sandbox exceeded the wall-clock guard and was killed");
                Ok(RunRecord {
                    slot,
                    status: None,
                    timed_out: true,
                })
            }
        }
    }
}
