// Initialization utilities for server mode
//
// Storage operators, local collaborators and logging/tracing setup

use crate::local::LocalExportVendor;
use anyhow::{Context, Result};
use opendal::Operator;
use snapshot2catalog_catalog::{CatalogUpdater, OperatorCatalog, StagingStore};
use snapshot2catalog_config::{LogFormat, RuntimeConfig, StagingBackend};
use snapshot2catalog_core::Arn;
use snapshot2catalog_exporter::{ExportSettings, SnapshotExporter};
use snapshot2catalog_scheduler::{Cadence, Pipeline, Scheduler, SchedulerSettings};
use snapshot2catalog_trust::{GrantDurations, StaticIdentity, TrustBroker};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything a trigger surface needs, built once from configuration
pub struct Components {
    pub scheduler: Scheduler,
    pub staging: StagingStore,
    pub catalog: OperatorCatalog,
    /// Staging bucket of every configured environment
    pub buckets: Vec<String>,
}

/// Operator for one staging bucket
pub fn staging_operator(config: &RuntimeConfig, bucket: &str) -> Result<Operator> {
    let operator = match config.staging.backend {
        StagingBackend::Fs => {
            let fs = config
                .staging
                .fs
                .as_ref()
                .context("fs config required for filesystem backend")?;
            let root = Path::new(&fs.path).join(bucket);
            info!("Using filesystem staging for {} at: {}", bucket, root.display());

            let fs_builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(fs_builder)?.finish()
        }
        StagingBackend::S3 => {
            let s3 = config
                .staging
                .s3
                .as_ref()
                .context("s3 config required for S3 backend")?;
            info!("Using S3 staging: bucket={}, region={}", bucket, s3.region);

            let mut s3_builder = opendal::services::S3::default()
                .bucket(bucket)
                .region(&s3.region);
            if let Some(endpoint) = &s3.endpoint {
                s3_builder = s3_builder.endpoint(endpoint);
            }

            Operator::new(s3_builder)?.finish()
        }
        StagingBackend::Memory => {
            info!("Using in-memory staging for {}", bucket);
            Operator::new(opendal::services::Memory::default())?.finish()
        }
    };
    Ok(operator)
}

/// Operator for the local catalog store
pub fn catalog_operator(config: &RuntimeConfig) -> Result<Operator> {
    let operator = match config.staging.backend {
        StagingBackend::Memory => Operator::new(opendal::services::Memory::default())?.finish(),
        StagingBackend::Fs | StagingBackend::S3 => {
            info!("Using local catalog store at: {}", config.staging.catalog_path);
            let fs_builder = opendal::services::Fs::default().root(&config.staging.catalog_path);
            Operator::new(fs_builder)?.finish()
        }
    };
    Ok(operator)
}

/// Wire the scheduler with local collaborators
pub fn init_components(config: &RuntimeConfig) -> Result<Components> {
    let deployments = config.deployments();

    let mut staging = StagingStore::new();
    let mut buckets = Vec::new();
    for deployment in deployments.values() {
        let bucket = deployment.staging_bucket.clone();
        if buckets.contains(&bucket) {
            continue;
        }
        staging = staging.with_bucket(bucket.clone(), staging_operator(config, &bucket)?);
        buckets.push(bucket);
    }

    let caller = Arn::parse(config.identity.caller_arn.as_str())
        .map_err(|reason| anyhow::anyhow!("identity.caller_arn is invalid: {}", reason))?;
    info!(caller = %caller, "Using static identity provider");

    let pipeline_config = &config.pipeline;
    let broker = Arc::new(TrustBroker::new(
        Arc::new(StaticIdentity::new(caller)),
        GrantDurations {
            export: pipeline_config.export_grant(),
            catalog: pipeline_config.catalog_grant(),
            safety_margin: pipeline_config.grant_safety_margin(),
        },
    ));

    let vendor = Arc::new(LocalExportVendor::new(staging.clone(), deployments.values()));
    let exporter = Arc::new(SnapshotExporter::new(
        vendor,
        ExportSettings {
            poll: pipeline_config.poll_backoff(),
            max_wait: pipeline_config.poll_max_wait(),
            vendor_retry: pipeline_config.vendor_retry(),
        },
    ));

    let catalog = OperatorCatalog::new(catalog_operator(config)?);
    let updater = Arc::new(CatalogUpdater::new(
        Arc::new(catalog.clone()),
        staging.clone(),
        pipeline_config.catalog_retry(),
    ));

    let settings = SchedulerSettings {
        cadence: Cadence {
            export_at: config.schedule.export_time()?,
            catalog_at: config.schedule.catalog_time()?,
        },
        retention: pipeline_config.run_retention(),
    };
    let scheduler = Scheduler::new(
        deployments,
        Pipeline {
            broker,
            exporter,
            catalog: updater,
        },
        settings,
    );

    Ok(Components {
        scheduler,
        staging,
        catalog,
        buckets,
    })
}

/// Initialize tracing/logging from RuntimeConfig
///
/// A second call is ignored.
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = match config.server.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
}
