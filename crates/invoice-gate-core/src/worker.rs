// crates/invoice-gate-core/src/worker.rs
// ============================================================================
// Module: Invoice Gate Worker
// Description: Polling worker that drains QUEUED runs through the
//              orchestrator, equivalent to a background-task dispatch.
// Purpose: Give deployments without an inline dispatcher a way to make
//          progress on queued runs.
// Dependencies: tracing, crate::identifiers, crate::interfaces,
//               crate::orchestrator
// ============================================================================

//! ## Overview
//! [`Worker::drain_once`] and [`Worker::run_forever`] both call
//! [`crate::orchestrator::Orchestrator::process_run`] for each queued run —
//! the same routine a background-task dispatcher calls on admission. There
//! is no behavioural divergence between the two drivers; the worker exists
//! only for deployments that rely on polling rather than inline dispatch.

use std::thread;
use std::time::Duration;

use tracing::info;
use tracing::warn;

use crate::interfaces::Repository;
use crate::orchestrator::Orchestrator;

/// Configuration the polling worker needs but does not own.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// How long to sleep between poll cycles when no runs were found.
    pub poll_interval: Duration,
    /// Maximum number of queued runs to drain per poll cycle.
    pub batch_size: u32,
}

/// Polls the repository for `QUEUED` runs and drives each one to
/// completion via the orchestrator.
pub struct Worker<'a> {
    repository: &'a dyn Repository,
    orchestrator: &'a Orchestrator<'a>,
    config: WorkerConfig,
    worker_id: String,
}

impl<'a> Worker<'a> {
    /// Builds a worker over the given repository and orchestrator.
    #[must_use]
    pub fn new(
        repository: &'a dyn Repository,
        orchestrator: &'a Orchestrator<'a>,
        config: WorkerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Drains up to `batch_size` queued runs once, returning how many were
    /// processed. Used for both a single poll cycle of [`Self::run_forever`]
    /// and a `--once` CLI invocation.
    #[must_use]
    pub fn drain_once(&self) -> u64 {
        let runs = match self.repository.list_queued_runs(self.config.batch_size) {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "failed to list queued runs");
                return 0;
            }
        };
        let processed = runs.len() as u64;
        for run in runs {
            info!(run_id = %run.id, worker_id = %self.worker_id, "worker picked up run");
            self.orchestrator.process_run(&run.id, &self.worker_id);
        }
        processed
    }

    /// Polls forever, draining a batch then sleeping `poll_interval` when
    /// idle. Intended to run on a dedicated thread or process; never
    /// returns.
    pub fn run_forever(&self) -> ! {
        loop {
            let processed = self.drain_once();
            if processed == 0 {
                thread::sleep(self.config.poll_interval);
            }
        }
    }
}
