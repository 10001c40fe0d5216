use async_trait::async_trait;
use aws_credential_types::Credentials;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use opendal::Operator;
use parking_lot::Mutex;
use snapshot2catalog_catalog::{CatalogClient, CatalogUpdater, OperatorCatalog, StagingStore};
use snapshot2catalog_core::{
    Arn, BackoffPolicy, CatalogTable, Column, Deployment, Encryption, Environment, ErrorCode,
    ExportStatus, PipelineError, PrincipalAllowList, Purpose, RunId, RunStage, SnapshotRef,
    TableDefinition, WorkspaceSettings,
};
use snapshot2catalog_exporter::{
    ExportSettings, ExportVendor, SnapshotExporter, StartExportRequest, VendorError,
};
use snapshot2catalog_scheduler::{Pipeline, Scheduler, SchedulerSettings};
use snapshot2catalog_trust::{GrantDurations, StaticIdentity, TrustBroker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "test-rds-snapshot-dev";
const PRINCIPAL: &str = "arn:aws:iam::111111111111:role/snapshot2catalog-pipeline-dev";

fn table(name: &str, id_type: &str) -> TableDefinition {
    TableDefinition {
        name: name.into(),
        columns: vec![Column::new("id", id_type), Column::new("body", "string")],
    }
}

fn deployment() -> Deployment {
    Deployment {
        environment: Environment::Dev,
        region: "ap-northeast-1".into(),
        platform_account_id: Some("111111111111".into()),
        source_account_id: Some("222222222222".into()),
        cluster_identifier: Some("db-1".into()),
        database_name: Some("app".into()),
        export_role_name: "rds-snapshot-export-assumable-role".into(),
        kms_key_arn: Some("arn:aws:kms:ap-northeast-1:222222222222:key/k-1".into()),
        staging_bucket: BUCKET.into(),
        catalog_database: "test-dwh".into(),
        workspace: WorkspaceSettings {
            name: "test-dev".into(),
            result_bucket: "analysis-platform-athena-query-result-dev".into(),
            output_prefix: "output/".into(),
            encryption: Encryption::SseS3,
            kms_key_arn: None,
            enforce_configuration: true,
        },
        principals: PrincipalAllowList {
            export: vec![PRINCIPAL.into()],
            catalog: vec![PRINCIPAL.into()],
        },
        tables: vec![table("posts", "bigint"), table("users", "bigint")],
    }
}

fn memory() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish()
}

fn credentials() -> Credentials {
    Credentials::new("AKIDTEST", "secret", None, None, "scenarios")
}

/// Vendor that lands one Parquet object per requested table on start
struct FakeVendor {
    staging: Operator,
    start_throttles: Mutex<u32>,
    start_attempts: Mutex<u32>,
    outcome: Option<ExportStatus>,
    cancels: Mutex<Vec<String>>,
}

impl FakeVendor {
    fn new(staging: Operator) -> Self {
        Self {
            staging,
            start_throttles: Mutex::new(0),
            start_attempts: Mutex::new(0),
            outcome: Some(ExportStatus::Succeeded),
            cancels: Mutex::new(Vec::new()),
        }
    }

    /// Never finish on its own.
    fn hold(mut self) -> Self {
        self.outcome = None;
        self
    }

    fn finish_with(mut self, status: ExportStatus) -> Self {
        self.outcome = Some(status);
        self
    }

    fn throttle_starts(self, times: u32) -> Self {
        *self.start_throttles.lock() = times;
        self
    }
}

#[async_trait]
impl ExportVendor for FakeVendor {
    async fn automated_snapshots(
        &self,
        cluster: &str,
        _credentials: &Credentials,
    ) -> Result<Vec<SnapshotRef>, VendorError> {
        let identifier = format!("rds:{}-2024-01-15-16-00", cluster);
        Ok(vec![SnapshotRef {
            arn: Arn::parse(format!(
                "arn:aws:rds:ap-northeast-1:222222222222:cluster-snapshot:{}",
                identifier
            ))
            .map_err(VendorError::Rejected)?,
            identifier,
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 16, 0, 0).unwrap(),
        }])
    }

    async fn start(&self, request: StartExportRequest) -> Result<String, VendorError> {
        *self.start_attempts.lock() += 1;
        {
            let mut throttles = self.start_throttles.lock();
            if *throttles > 0 {
                *throttles -= 1;
                return Err(VendorError::Throttled { retry_after: None });
            }
        }
        for qualified in &request.export_only {
            let path = format!(
                "{}/{}/{}/{}/1/part-00000.parquet",
                request.target.prefix,
                request.task_identifier,
                request.source.database_name,
                qualified
            );
            self.staging
                .write(&path, b"PAR1".to_vec())
                .await
                .map_err(|e| VendorError::Unavailable(e.to_string()))?;
        }
        Ok(request.task_identifier)
    }

    async fn describe(
        &self,
        _handle: &str,
        _credentials: &Credentials,
    ) -> Result<ExportStatus, VendorError> {
        Ok(self
            .outcome
            .clone()
            .unwrap_or(ExportStatus::Running { percent_progress: 10 }))
    }

    async fn cancel(&self, handle: &str, _credentials: &Credentials) -> Result<(), VendorError> {
        self.cancels.lock().push(handle.to_string());
        Ok(())
    }
}

struct Harness {
    staging: Operator,
    catalog: OperatorCatalog,
}

impl Harness {
    fn new() -> Self {
        Self {
            staging: memory(),
            catalog: OperatorCatalog::new(memory()),
        }
    }

    fn vendor(&self) -> FakeVendor {
        FakeVendor::new(self.staging.clone())
    }

    fn scheduler(&self, vendor: Arc<FakeVendor>) -> (Scheduler, Arc<TrustBroker>) {
        let broker = Arc::new(TrustBroker::new(
            Arc::new(StaticIdentity::new(Arn::parse(PRINCIPAL).unwrap())),
            GrantDurations::default(),
        ));
        let exporter = Arc::new(SnapshotExporter::new(
            vendor,
            ExportSettings {
                poll: BackoffPolicy {
                    initial: Duration::from_secs(10),
                    max_interval: Duration::from_secs(60),
                    multiplier: 2.0,
                    max_attempts: 8,
                },
                max_wait: Duration::from_secs(3600),
                vendor_retry: BackoffPolicy {
                    initial: Duration::from_secs(1),
                    max_interval: Duration::from_secs(8),
                    multiplier: 2.0,
                    max_attempts: 5,
                },
            },
        ));
        let catalog = Arc::new(CatalogUpdater::new(
            Arc::new(self.catalog.clone()),
            StagingStore::new().with_bucket(BUCKET, self.staging.clone()),
            BackoffPolicy {
                initial: Duration::from_millis(100),
                max_interval: Duration::from_secs(1),
                multiplier: 2.0,
                max_attempts: 3,
            },
        ));

        let mut deployments = BTreeMap::new();
        deployments.insert(Environment::Dev, deployment());
        let scheduler = Scheduler::new(
            deployments,
            Pipeline {
                broker: Arc::clone(&broker),
                exporter,
                catalog,
            },
            SchedulerSettings::default(),
        );
        (scheduler, broker)
    }
}

/// Wait until the Run has a started export task.
async fn export_started(scheduler: &Scheduler, id: &RunId) {
    for _ in 0..100 {
        let run = scheduler.get(id).unwrap();
        if run.export_task.is_some() {
            assert_eq!(run.stage, RunStage::Exporting);
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("export never started");
}

#[tokio::test(start_paused = true)]
async fn run_exports_and_catalogs_every_table() {
    let harness = Harness::new();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();

    assert_eq!(run.stage, RunStage::Done);
    assert!(run.export_succeeded);
    assert!(run.error.is_none());
    assert_eq!(run.synced_tables, vec!["posts", "users"]);
    assert!(run.finished_at.is_some());

    let task = run.export_task.unwrap();
    let tables = harness.catalog.tables("test-dwh").await.unwrap();
    assert_eq!(tables.len(), 2);
    for table in &tables {
        assert_eq!(
            table.location,
            format!(
                "s3://{}/{}/{}/app/app.{}/1/",
                BUCKET, run.id, task, table.name
            )
        );
    }
}

#[tokio::test(start_paused = true)]
async fn throttled_start_recovers_within_ceiling() {
    let harness = Harness::new();
    let vendor = Arc::new(harness.vendor().throttle_starts(3));
    let (scheduler, _) = harness.scheduler(vendor.clone());

    let run = scheduler.run_now(Environment::Dev).await.unwrap();

    assert_eq!(run.stage, RunStage::Done);
    let attempts = *vendor.start_attempts.lock();
    assert_eq!(attempts, 4);
    assert!(attempts <= 5);
}

#[tokio::test(start_paused = true)]
async fn schema_conflict_fails_run_after_earlier_tables() {
    let harness = Harness::new();
    let existing = CatalogTable::external_parquet(
        "test-dwh",
        &table("users", "string"),
        "s3://test-rds-snapshot-dev/previous/",
    );
    harness
        .catalog
        .create_or_update_table(&existing, &credentials())
        .await
        .unwrap();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();

    assert_eq!(run.stage, RunStage::Failed);
    let failure = run.error.unwrap();
    assert_eq!(failure.code, ErrorCode::E005SchemaConflict);
    assert_eq!(failure.stage, RunStage::Cataloging);

    let tables = harness.catalog.tables("test-dwh").await.unwrap();
    let posts = tables.iter().find(|t| t.name == "posts").unwrap();
    assert!(posts.location.contains(&run.id.to_string()));
    let users = tables.iter().find(|t| t.name == "users").unwrap();
    assert_eq!(users.location, "s3://test-rds-snapshot-dev/previous/");
}

#[tokio::test(start_paused = true)]
async fn cancel_during_export_aborts_vendor_task() {
    let harness = Harness::new();
    let vendor = Arc::new(harness.vendor().hold());
    let (scheduler, _) = harness.scheduler(vendor.clone());

    let id = scheduler.trigger(Environment::Dev, Purpose::Export).unwrap();
    export_started(&scheduler, &id).await;

    scheduler.cancel(&id).unwrap();
    let run = scheduler.wait_until_terminal(&id).await.unwrap();

    assert_eq!(run.stage, RunStage::Failed);
    let failure = run.error.unwrap();
    assert!(failure.cancelled);
    assert_eq!(failure.code, ErrorCode::E007Cancelled);
    assert_eq!(vendor.cancels.lock().as_slice(), &[run.export_task.unwrap()]);
    assert!(harness.catalog.tables("test-dwh").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_outside_export_is_rejected() {
    let harness = Harness::new();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();
    let err = scheduler.cancel(&run.id).unwrap_err();
    assert!(matches!(err, PipelineError::NotCancellable { .. }));

    let err = scheduler.cancel(&RunId::new()).unwrap_err();
    assert!(matches!(err, PipelineError::RunNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_export_never_reaches_cataloging() {
    let harness = Harness::new();
    let vendor = harness.vendor().finish_with(ExportStatus::Failed {
        reason: "snapshot unavailable".into(),
    });
    let (scheduler, _) = harness.scheduler(Arc::new(vendor));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();

    assert_eq!(run.stage, RunStage::Failed);
    assert!(!run.export_succeeded);
    let failure = run.error.unwrap();
    assert_eq!(failure.code, ErrorCode::E004VendorExportFailed);
    assert_eq!(failure.stage, RunStage::Exporting);
    assert!(harness.catalog.tables("test-dwh").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn catalog_trigger_requires_an_eligible_run() {
    let harness = Harness::new();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let err = scheduler
        .trigger(Environment::Dev, Purpose::Catalog)
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NoEligibleRun {
            environment: Environment::Dev
        }
    ));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();
    let resolved = scheduler
        .trigger(Environment::Dev, Purpose::Catalog)
        .unwrap();
    assert_eq!(resolved, run.id);
}

#[tokio::test(start_paused = true)]
async fn export_trigger_resumes_active_run() {
    let harness = Harness::new();
    let vendor = Arc::new(harness.vendor().hold());
    let (scheduler, _) = harness.scheduler(vendor.clone());

    let first = scheduler.trigger(Environment::Dev, Purpose::Export).unwrap();
    let second = scheduler.trigger(Environment::Dev, Purpose::Export).unwrap();
    assert_eq!(first, second);
    assert_eq!(scheduler.list().len(), 1);

    export_started(&scheduler, &first).await;
    scheduler.cancel(&first).unwrap();
    scheduler.wait_until_terminal(&first).await.unwrap();

    let third = scheduler.trigger(Environment::Dev, Purpose::Export).unwrap();
    assert_ne!(third, first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_export_triggers_share_one_run() {
    let harness = Harness::new();
    let vendor = Arc::new(harness.vendor().hold());
    let (scheduler, _) = harness.scheduler(vendor);

    let barrier = Arc::new(std::sync::Barrier::new(8));
    let triggers: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = scheduler.clone();
            let barrier = Arc::clone(&barrier);
            tokio::task::spawn_blocking(move || {
                barrier.wait();
                scheduler.trigger(Environment::Dev, Purpose::Export)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for trigger in triggers {
        ids.push(trigger.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(scheduler.list().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_environment_is_a_config_error() {
    let harness = Harness::new();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let err = scheduler
        .trigger(Environment::Prod, Purpose::Export)
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig { .. }));
}

#[tokio::test(start_paused = true)]
async fn grants_are_revoked_once_run_is_terminal() {
    let harness = Harness::new();
    let (scheduler, broker) = harness.scheduler(Arc::new(harness.vendor()));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();
    assert_eq!(run.stage, RunStage::Done);
    assert!(broker.active_grants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn purge_drops_only_expired_terminal_runs() {
    let harness = Harness::new();
    let (scheduler, _) = harness.scheduler(Arc::new(harness.vendor()));

    let run = scheduler.run_now(Environment::Dev).await.unwrap();
    assert_eq!(scheduler.purge_expired(Utc::now()), 0);
    assert_eq!(scheduler.purge_expired(Utc::now() + ChronoDuration::days(4)), 1);
    assert!(matches!(
        scheduler.get(&run.id),
        Err(PipelineError::RunNotFound { .. })
    ));
}
