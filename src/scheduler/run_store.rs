use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::scheduler::run::{Run, RunStatus};

const DEFAULT_MAX_RUNS: usize = 10_000;

/// Shared map of every run known to the control plane.
///
/// Each mutation runs under the owning shard's lock, so callers never need
/// their own locking and two transitions on the same run cannot interleave.
/// Inserts are serialized so the capacity check and the insert are one step.
#[derive(Debug)]
pub struct RunStore {
    runs: DashMap<Uuid, Run>,
    max_runs: usize,
    insert_lock: Mutex<()>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RUNS)
    }

    pub fn with_capacity(max_runs: usize) -> Self {
        Self {
            runs: DashMap::new(),
            max_runs,
            insert_lock: Mutex::new(()),
        }
    }

    /// Add a new run. At capacity, finished runs are dropped to make room;
    /// returns false if the store is still full of unfinished runs.
    pub fn insert(&self, run: Run) -> bool {
        let _guard = match self.insert_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.runs.len() >= self.max_runs {
            let evicted = self.evict_finished_before(Utc::now());
            tracing::warn!(evicted, max_runs = self.max_runs, "Run store at capacity, evicted finished runs");
            if self.runs.len() >= self.max_runs {
                return false;
            }
        }
        self.runs.entry(run.run_id).or_insert(run);
        true
    }

    pub fn get(&self, run_id: &Uuid) -> Option<Run> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// Apply `f` to the run while holding its entry, returning the updated copy.
    pub fn update<F>(&self, run_id: &Uuid, f: F) -> Result<Run>
    where
        F: FnOnce(&mut Run) -> Result<()>,
    {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or(FleetError::RunNotFound(*run_id))?;
        f(entry.value_mut())?;
        Ok(entry.clone())
    }

    /// Pending runs, oldest first.
    pub fn pending_runs(&self) -> Vec<Run> {
        self.filtered(|r| r.status == RunStatus::Pending)
    }

    /// All runs sorted chronologically by creation time.
    pub fn all_runs(&self) -> Vec<Run> {
        self.filtered(|_| true)
    }

    /// Non-terminal runs currently bound to `node_id`.
    pub fn active_runs_for_node(&self, node_id: &str) -> Vec<Run> {
        self.filtered(|r| !r.status.is_terminal() && r.node_id.as_deref() == Some(node_id))
    }

    fn filtered(&self, keep: impl Fn(&Run) -> bool) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Remove terminal runs that finished before `cutoff`. Returns the number
    /// of runs removed.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, run| {
            !(run.status.is_terminal()
                && run.timings.finished_at.map_or(true, |at| at <= cutoff))
        });
        before.saturating_sub(self.runs.len())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
