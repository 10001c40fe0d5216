//! Snapshot Exporter
//!
//! One export per Run. `start_export` is idempotent: concurrent or repeated
//! calls for the same Run resolve to the task created by the first call.
//! `await_completion` is the only place the pipeline waits on the vendor.

use crate::vendor::{ExportVendor, StartExportRequest, VendorError};
use chrono::Utc;
use parking_lot::Mutex;
use snapshot2catalog_core::{
    export_task_identifier, Arn, BackoffPolicy, Deployment, ExportSource, ExportStatus,
    ExportTarget, ExportTask, PipelineError, Purpose, Result, RunContext, RunId, ScopeDescriptor,
    ScopeStatement, TrustGrant,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Retry and polling limits
#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Backoff between status polls. Only the interval fields apply; the
    /// poll loop is bounded by `max_wait`, throttled polls by `vendor_retry`.
    pub poll: BackoffPolicy,
    /// Total time `await_completion` may spend before giving up
    pub max_wait: Duration,
    /// Backoff and attempt ceiling for throttled vendor calls. During polling
    /// the ceiling counts consecutive throttled describes.
    pub vendor_retry: BackoffPolicy,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            poll: BackoffPolicy {
                initial: Duration::from_secs(10),
                max_interval: Duration::from_secs(300),
                multiplier: 2.0,
                max_attempts: u32::MAX,
            },
            max_wait: Duration::from_secs(6 * 3600),
            vendor_retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Slot {
    task: OnceCell<ExportTask>,
    status: Mutex<Option<ExportStatus>>,
}

pub struct SnapshotExporter {
    vendor: Arc<dyn ExportVendor>,
    settings: ExportSettings,
    slots: Mutex<HashMap<RunId, Arc<Slot>>>,
}

/// Source and target of the export for the Run in `ctx`.
pub fn resolve_endpoints(ctx: &RunContext) -> Result<(ExportSource, ExportTarget)> {
    let deployment = ctx.deployment.as_ref();
    let source = ExportSource {
        cluster_identifier: deployment.cluster()?.to_string(),
        database_name: deployment.database()?.to_string(),
    };
    let target = ExportTarget {
        bucket: deployment.staging_bucket.clone(),
        prefix: ctx.staging_prefix(),
        role_arn: deployment.export_role_arn()?,
        kms_key_arn: deployment.kms_key()?,
    };
    Ok((source, target))
}

impl SnapshotExporter {
    pub fn new(vendor: Arc<dyn ExportVendor>, settings: ExportSettings) -> Self {
        Self {
            vendor,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, run_id: RunId) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(run_id).or_default())
    }

    /// Start the export of the newest automated snapshot, restricted to `table_allowlist`.
    ///
    /// Returns the existing task when the Run already started one.
    #[instrument(
        name = "exporter.start_export",
        skip_all,
        fields(run_id = %ctx.run_id, environment = %ctx.environment, cluster = %source.cluster_identifier)
    )]
    pub async fn start_export(
        &self,
        ctx: &RunContext,
        grant: &TrustGrant,
        source: ExportSource,
        target: ExportTarget,
        table_allowlist: &[String],
    ) -> Result<ExportTask> {
        if table_allowlist.is_empty() {
            return Err(PipelineError::invalid_config(
                "table allow-list is empty; refusing to export every table",
            ));
        }

        let slot = self.slot(ctx.run_id);
        let task = slot
            .task
            .get_or_try_init(|| self.begin(ctx, grant, source, target, table_allowlist))
            .await?;
        Ok(self.with_status(&slot, task.clone()))
    }

    async fn begin(
        &self,
        ctx: &RunContext,
        grant: &TrustGrant,
        source: ExportSource,
        target: ExportTarget,
        table_allowlist: &[String],
    ) -> Result<ExportTask> {
        let deployment = ctx.deployment.as_ref();
        grant.verify(
            &ctx.run_id,
            Purpose::Export,
            &discovery_needs(deployment)?,
            Utc::now(),
        )?;

        let snapshot = {
            let vendor = Arc::clone(&self.vendor);
            let cluster = source.cluster_identifier.clone();
            let credentials = grant.credentials.clone();
            self.with_retry(ctx, "DescribeDBClusterSnapshots", move || {
                let vendor = Arc::clone(&vendor);
                let cluster = cluster.clone();
                let credentials = credentials.clone();
                async move { vendor.automated_snapshots(&cluster, &credentials).await }
            })
            .await?
        }
        .into_iter()
        .max_by_key(|snapshot| snapshot.created_at)
        .ok_or_else(|| PipelineError::VendorExportFailed {
            task: source.cluster_identifier.clone(),
            reason: "no automated snapshot".to_string(),
        })?;

        grant.verify(
            &ctx.run_id,
            Purpose::Export,
            &start_needs(deployment, &snapshot.arn, &target)?,
            Utc::now(),
        )?;

        let started_at = Utc::now();
        let task_identifier = export_task_identifier(&snapshot.identifier, &ctx.run_id, started_at);
        let export_only: Vec<String> = table_allowlist
            .iter()
            .map(|table| format!("{}.{}", source.database_name, table))
            .collect();

        let request = StartExportRequest {
            task_identifier: task_identifier.clone(),
            source: source.clone(),
            snapshot: snapshot.clone(),
            target: target.clone(),
            export_only: export_only.clone(),
            credentials: grant.credentials.clone(),
        };
        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let handle = {
            let vendor = Arc::clone(&self.vendor);
            self.with_retry(ctx, "StartExportTask", move || {
                let vendor = Arc::clone(&vendor);
                let request = request.clone();
                async move { vendor.start(request).await }
            })
            .await?
        };

        info!(
            task = %handle,
            snapshot = %snapshot.identifier,
            tables = export_only.len(),
            "Started export"
        );

        Ok(ExportTask {
            run_id: ctx.run_id,
            task_identifier: handle,
            source,
            snapshot,
            target,
            table_allowlist: table_allowlist.to_vec(),
            export_only,
            status: ExportStatus::Pending,
            started_at,
        })
    }

    /// Describe the task once. Throttling surfaces as `PipelineError::Throttled`.
    pub async fn poll(&self, grant: &TrustGrant, task: &ExportTask) -> Result<ExportStatus> {
        let status = self
            .vendor
            .describe(&task.task_identifier, &grant.credentials)
            .await
            .map_err(|err| vendor_failure(&task.task_identifier, "DescribeExportTasks", err))?;
        *self.slot(task.run_id).status.lock() = Some(status.clone());
        Ok(status)
    }

    /// Poll with backoff until the task is terminal, the wait bound is hit,
    /// or the Run is cancelled (which aborts the vendor task).
    #[instrument(
        name = "exporter.await_completion",
        skip_all,
        fields(run_id = %ctx.run_id, task = %task.task_identifier)
    )]
    pub async fn await_completion(
        &self,
        ctx: &RunContext,
        grant: &TrustGrant,
        mut task: ExportTask,
    ) -> Result<ExportTask> {
        let started = Instant::now();
        let mut attempt: u32 = 1;
        let mut throttled: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(self.abort(grant, &task).await);
            }

            let delay = match self.poll(grant, &task).await {
                Ok(ExportStatus::Succeeded) => {
                    task.status = ExportStatus::Succeeded;
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Export succeeded");
                    return Ok(task);
                }
                Ok(ExportStatus::Failed { reason }) => {
                    return Err(PipelineError::VendorExportFailed {
                        task: task.task_identifier.clone(),
                        reason,
                    });
                }
                Ok(ExportStatus::Cancelled) => return Err(PipelineError::Cancelled),
                Ok(status) => {
                    debug!(status = status.as_str(), attempt, "Export still in progress");
                    task.status = status;
                    throttled = 0;
                    self.settings.poll.delay(attempt)
                }
                Err(PipelineError::Throttled { operation, retry_after }) => {
                    metrics::counter!("snapshot2catalog.export.throttled").increment(1);
                    throttled += 1;
                    let policy = &self.settings.vendor_retry;
                    if !policy.allows_another(throttled) {
                        warn!(throttled, "Describe throttled past the retry ceiling");
                        return Err(PipelineError::Throttled {
                            operation,
                            retry_after,
                        });
                    }
                    warn!(attempt, throttled, "Describe throttled");
                    policy.delay_with_hint(throttled, retry_after)
                }
                Err(err) => return Err(err),
            };

            if started.elapsed() + delay > self.settings.max_wait {
                return Err(PipelineError::ExportTimedOut {
                    task: task.task_identifier.clone(),
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    return Err(self.abort(grant, &task).await);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Ask the vendor to abort `task`. Always yields `Cancelled`.
    async fn abort(&self, grant: &TrustGrant, task: &ExportTask) -> PipelineError {
        info!(task = %task.task_identifier, "Cancelling export");
        if let Err(err) = self
            .vendor
            .cancel(&task.task_identifier, &grant.credentials)
            .await
        {
            warn!(task = %task.task_identifier, error = %err, "Vendor abort failed");
        }
        *self.slot(task.run_id).status.lock() = Some(ExportStatus::Cancelled);
        PipelineError::Cancelled
    }

    /// Task started for `run_id`, with the last observed status.
    pub fn current(&self, run_id: &RunId) -> Option<ExportTask> {
        let slot = self.slots.lock().get(run_id).cloned()?;
        let task = slot.task.get()?.clone();
        Some(self.with_status(&slot, task))
    }

    /// Release the Run's export state once the Run is terminal.
    pub fn forget(&self, run_id: &RunId) {
        self.slots.lock().remove(run_id);
    }

    fn with_status(&self, slot: &Slot, mut task: ExportTask) -> ExportTask {
        if let Some(status) = slot.status.lock().clone() {
            task.status = status;
        }
        task
    }

    async fn with_retry<T, F, Fut>(&self, ctx: &RunContext, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, VendorError>>,
    {
        let policy = &self.settings.vendor_retry;
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(VendorError::Throttled { retry_after }) => {
                    metrics::counter!("snapshot2catalog.export.throttled").increment(1);
                    if !policy.allows_another(attempt) {
                        return Err(PipelineError::Throttled {
                            operation: operation.to_string(),
                            retry_after,
                        });
                    }
                    let delay = policy.delay_with_hint(attempt, retry_after);
                    warn!(operation, attempt, delay_ms = delay.as_millis() as u64, "Vendor throttled, retrying");
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(vendor_failure(operation, operation, err)),
            }
        }
    }
}

fn vendor_failure(task: &str, operation: &str, err: VendorError) -> PipelineError {
    match err {
        VendorError::Throttled { retry_after } => PipelineError::Throttled {
            operation: operation.to_string(),
            retry_after,
        },
        other => PipelineError::VendorExportFailed {
            task: task.to_string(),
            reason: format!("{}: {}", operation, other),
        },
    }
}

fn needs(statements: Vec<std::result::Result<ScopeStatement, String>>) -> Result<ScopeDescriptor> {
    let statements = statements
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(PipelineError::invalid_grant)?;
    Ok(ScopeDescriptor::new(statements))
}

fn discovery_needs(deployment: &Deployment) -> Result<ScopeDescriptor> {
    needs(vec![ScopeStatement::new(
        "DescribeSnapshots",
        ["rds:DescribeDBClusterSnapshots"],
        [deployment.cluster_arn()?],
    )])
}

fn start_needs(deployment: &Deployment, snapshot: &Arn, target: &ExportTarget) -> Result<ScopeDescriptor> {
    needs(vec![
        ScopeStatement::new("StartExport", ["rds:StartExportTask"], [snapshot.clone()]),
        ScopeStatement::new("PassRole", ["iam:PassRole"], [target.role_arn.clone()]),
        ScopeStatement::new("Key", ["kms:GenerateDataKey"], [target.kms_key_arn.clone()]),
        ScopeStatement::new(
            "Write",
            ["s3:PutObject"],
            [deployment.staging_objects_arn(&target.prefix)?],
        ),
    ])
}
