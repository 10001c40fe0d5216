//! Scheduler/Trigger
//!
//! Owns Run lifecycles. Each Run executes as its own task; stage transitions
//! go through `Run::advance`, so cataloging can only start after an observed
//! export success and only the scheduler decides a Run's terminal state.

use crate::cadence::Cadence;
use crate::registry::RunRegistry;
use chrono::{DateTime, Utc};
use snapshot2catalog_catalog::CatalogUpdater;
use snapshot2catalog_core::{
    Deployment, Environment, ExportLocation, ExportStatus, PipelineError, Purpose, Result, Run,
    RunContext, RunId, RunStage,
};
use snapshot2catalog_exporter::{resolve_endpoints, SnapshotExporter};
use snapshot2catalog_trust::TrustBroker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Stage collaborators shared by every Run
pub struct Pipeline {
    pub broker: Arc<TrustBroker>,
    pub exporter: Arc<SnapshotExporter>,
    pub catalog: Arc<CatalogUpdater>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub cadence: Cadence,
    /// Terminal Runs older than this are purged
    pub retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cadence: Cadence::default(),
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

struct Inner {
    deployments: BTreeMap<Environment, Arc<Deployment>>,
    pipeline: Pipeline,
    registry: RunRegistry,
    settings: SchedulerSettings,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        deployments: BTreeMap<Environment, Deployment>,
        pipeline: Pipeline,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deployments: deployments
                    .into_iter()
                    .map(|(env, d)| (env, Arc::new(d)))
                    .collect(),
                pipeline,
                registry: RunRegistry::new(),
                settings,
            }),
        }
    }

    pub fn environments(&self) -> Vec<Environment> {
        self.inner.deployments.keys().copied().collect()
    }

    fn deployment(&self, environment: Environment) -> Result<Arc<Deployment>> {
        self.inner
            .deployments
            .get(&environment)
            .cloned()
            .ok_or_else(|| {
                PipelineError::invalid_config(format!("environment '{}' is not configured", environment))
            })
    }

    /// Start or resume the Run for `environment`. Returns immediately; the
    /// pipeline proceeds in the background.
    #[instrument(name = "scheduler.trigger", skip(self))]
    pub fn trigger(&self, environment: Environment, purpose: Purpose) -> Result<RunId> {
        let deployment = self.deployment(environment)?;
        match purpose {
            Purpose::Export => Ok(self.start_or_resume(deployment)),
            Purpose::Catalog => {
                let run = self
                    .inner
                    .registry
                    .latest_non_failed(environment)
                    .ok_or(PipelineError::NoEligibleRun { environment })?;
                if run.stage == RunStage::Exporting {
                    warn!(run_id = %run.id, "Export still running; cataloging follows its success");
                } else {
                    info!(run_id = %run.id, stage = %run.stage, "Catalog trigger resolved to run");
                }
                Ok(run.id)
            }
        }
    }

    /// Register and spawn a new Run, or return the environment's active one.
    fn start_or_resume(&self, deployment: Arc<Deployment>) -> RunId {
        let id = RunId::new();
        let now = Utc::now();
        let environment = deployment.environment;
        let ctx = RunContext::new(id, deployment, now);
        if let Err(active) = self
            .inner
            .registry
            .insert_unless_active(Run::new(id, environment, now), ctx)
        {
            info!(run_id = %active.id, stage = %active.stage, "Resuming active run");
            return active.id;
        }
        metrics::counter!("snapshot2catalog.runs.started", "environment" => environment.as_str())
            .increment(1);
        info!(run_id = %id, environment = %environment, "Run created");

        let this = self.clone();
        tokio::spawn(async move { this.execute(id).await });
        id
    }

    /// Trigger an export Run and wait for its terminal state.
    pub async fn run_now(&self, environment: Environment) -> Result<Run> {
        let id = self.trigger(environment, Purpose::Export)?;
        self.wait_until_terminal(&id).await
    }

    async fn execute(&self, id: RunId) {
        let Some(ctx) = self.inner.registry.context(&id) else {
            error!(run_id = %id, "Run vanished before execution");
            return;
        };
        let started = Instant::now();
        let environment = ctx.environment.as_str();

        let outcome = self.drive(&ctx).await;

        // Credentials and export state are released before the terminal
        // stage becomes visible to waiters.
        self.inner.pipeline.broker.revoke_run(&id);
        self.inner.pipeline.exporter.forget(&id);

        let recorded = self.inner.registry.update(&id, |run, _| {
            let now = Utc::now();
            match outcome {
                Ok(synced) => {
                    run.synced_tables = synced;
                    run.advance(RunStage::Done, now).map(|_| None)
                }
                Err(err) => run.fail(&err, now).map(|_| Some(err)),
            }
        });

        match recorded {
            Ok(None) => {
                metrics::counter!("snapshot2catalog.runs.done", "environment" => environment)
                    .increment(1);
                info!(run_id = %id, "Run done");
            }
            Ok(Some(err)) => {
                metrics::counter!("snapshot2catalog.runs.failed", "environment" => environment)
                    .increment(1);
                error!(run_id = %id, code = %err.code(), error = %err, "Run failed");
            }
            Err(gate) => error!(run_id = %id, error = %gate, "Could not record run outcome"),
        }
        metrics::histogram!("snapshot2catalog.run.duration_ms")
            .record(started.elapsed().as_millis() as f64);
    }

    /// Drive one Run through export and cataloging. Returns the synced table
    /// names; the caller records the terminal stage.
    #[instrument(name = "scheduler.run", skip_all, fields(run_id = %ctx.run_id, environment = %ctx.environment))]
    async fn drive(&self, ctx: &RunContext) -> Result<Vec<String>> {
        let id = ctx.run_id;
        let registry = &self.inner.registry;
        let pipeline = &self.inner.pipeline;
        let deployment = Arc::clone(&ctx.deployment);

        registry.update(&id, |run, _| run.advance(RunStage::Exporting, Utc::now()))?;

        let grant = pipeline.broker.issue_grant(ctx, Purpose::Export).await?;
        let (source, target) = resolve_endpoints(ctx)?;
        let task = pipeline
            .exporter
            .start_export(ctx, &grant, source, target, &deployment.table_names())
            .await?;
        registry.update(&id, |run, _| {
            run.export_task = Some(task.task_identifier.clone());
            run.updated_at = Utc::now();
            Ok(())
        })?;

        let task = pipeline.exporter.await_completion(ctx, &grant, task).await?;

        // Gate: only an observed success opens the catalog stage
        registry.update(&id, |run, ctx| {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            run.export_succeeded = task.status == ExportStatus::Succeeded;
            run.advance(RunStage::Cataloging, Utc::now())
        })?;

        let grant = pipeline.broker.issue_grant(ctx, Purpose::Catalog).await?;
        let location = ExportLocation {
            bucket: task.target.bucket.clone(),
            run_prefix: task.target.prefix.clone(),
            task_id: task.task_identifier.clone(),
            database: task.source.database_name.clone(),
        };
        let synced = pipeline
            .catalog
            .sync_tables(ctx, &grant, &location, &deployment.tables)
            .await?;
        Ok(synced.into_iter().map(|table| table.name).collect())
    }

    /// Cancel a Run. Only Runs in `Exporting` can be cancelled; the Run moves
    /// to `Failed` once the vendor abort has been requested.
    pub fn cancel(&self, id: &RunId) -> Result<Run> {
        self.inner.registry.update(id, |run, ctx| {
            if run.stage != RunStage::Exporting {
                return Err(PipelineError::NotCancellable {
                    run_id: run.id.to_string(),
                    stage: run.stage.to_string(),
                });
            }
            info!(run_id = %run.id, "Cancellation requested");
            ctx.cancellation().cancel();
            Ok(run.clone())
        })
    }

    pub fn get(&self, id: &RunId) -> Result<Run> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| PipelineError::RunNotFound {
                run_id: id.to_string(),
            })
    }

    pub fn list(&self) -> Vec<Run> {
        self.inner.registry.list()
    }

    pub async fn wait_until_terminal(&self, id: &RunId) -> Result<Run> {
        self.inner.registry.wait_until_terminal(id).await
    }

    /// Drop terminal Runs past the retention window.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.inner.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3));
        let purged = self.inner.registry.purge_finished_before(now - retention);
        if purged > 0 {
            info!(purged, "Purged expired runs");
        }
        purged
    }

    /// Fire triggers on the daily cadence until `shutdown` is cancelled.
    pub async fn run_cadence(&self, shutdown: CancellationToken) {
        let cadence = self.inner.settings.cadence;
        info!(
            export_at = %cadence.export_at,
            catalog_at = %cadence.catalog_at,
            "Daily cadence started"
        );
        loop {
            let now = Utc::now();
            let (at, purpose) = cadence.next_fire(now);
            let wait = (at - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Daily cadence stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            for environment in self.environments() {
                match self.trigger(environment, purpose) {
                    Ok(id) => info!(run_id = %id, environment = %environment, purpose = %purpose, "Scheduled trigger"),
                    Err(err) => warn!(environment = %environment, purpose = %purpose, error = %err, "Scheduled trigger rejected"),
                }
            }
            self.purge_expired(Utc::now());
        }
    }
}
