//! In-memory Run registry
//!
//! Every mutation goes through `update`, which applies a closure under the
//! write lock and wakes waiters.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use snapshot2catalog_core::{Environment, PipelineError, Result, Run, RunContext, RunId, RunStage};
use std::collections::HashMap;
use tokio::sync::Notify;

struct Entry {
    run: Run,
    ctx: RunContext,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Entry>>,
    changed: Notify,
}

fn not_found(id: &RunId) -> PipelineError {
    PipelineError::RunNotFound {
        run_id: id.to_string(),
    }
}

fn newest_active(runs: &HashMap<RunId, Entry>, environment: Environment) -> Option<&Run> {
    runs.values()
        .map(|entry| &entry.run)
        .filter(|run| run.environment == environment && !run.stage.is_terminal())
        .max_by_key(|run| run.started_at)
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: Run, ctx: RunContext) {
        self.runs.write().insert(run.id, Entry { run, ctx });
        self.changed.notify_waiters();
    }

    pub fn get(&self, id: &RunId) -> Option<Run> {
        self.runs.read().get(id).map(|e| e.run.clone())
    }

    pub fn context(&self, id: &RunId) -> Option<RunContext> {
        self.runs.read().get(id).map(|e| e.ctx.clone())
    }

    /// All Runs, newest first.
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().values().map(|e| e.run.clone()).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Apply `f` to the Run and its context atomically.
    pub fn update<T>(
        &self,
        id: &RunId,
        f: impl FnOnce(&mut Run, &RunContext) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let mut runs = self.runs.write();
            let entry = runs.get_mut(id).ok_or_else(|| not_found(id))?;
            f(&mut entry.run, &entry.ctx)
        };
        self.changed.notify_waiters();
        result
    }

    /// Newest non-terminal Run of `environment`.
    pub fn active_for(&self, environment: Environment) -> Option<Run> {
        newest_active(&self.runs.read(), environment).cloned()
    }

    /// Insert `run` unless its environment already has an active Run, which
    /// is returned instead. Lookup and insert happen under one write lock.
    pub fn insert_unless_active(
        &self,
        run: Run,
        ctx: RunContext,
    ) -> std::result::Result<RunId, Run> {
        {
            let mut runs = self.runs.write();
            if let Some(active) = newest_active(&runs, run.environment) {
                return Err(active.clone());
            }
            runs.insert(run.id, Entry { run: run.clone(), ctx });
        }
        self.changed.notify_waiters();
        Ok(run.id)
    }

    /// Newest Run of `environment` that has not failed.
    pub fn latest_non_failed(&self, environment: Environment) -> Option<Run> {
        self.list()
            .into_iter()
            .find(|run| run.environment == environment && run.stage != RunStage::Failed)
    }

    /// Drop terminal Runs that finished before `cutoff`. Returns how many were removed.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, entry| match entry.run.finished_at {
            Some(finished) if entry.run.stage.is_terminal() => finished >= cutoff,
            _ => true,
        });
        before - runs.len()
    }

    /// Resolve once the Run reaches `Done` or `Failed`.
    pub async fn wait_until_terminal(&self, id: &RunId) -> Result<Run> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self.get(id).ok_or_else(|| not_found(id))?;
            if run.stage.is_terminal() {
                return Ok(run);
            }
            notified.await;
        }
    }
}
