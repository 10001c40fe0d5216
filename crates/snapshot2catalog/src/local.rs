//! Local export vendor
//!
//! Materializes an export inside the staging store instead of calling a
//! cloud vendor: a manifest at the task root and one placeholder Parquet
//! object per requested table, laid out the way real exports land.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::json;
use snapshot2catalog_catalog::StagingStore;
use snapshot2catalog_core::{Arn, Deployment, ExportStatus, SnapshotRef};
use snapshot2catalog_exporter::{ExportVendor, StartExportRequest, VendorError};
use std::collections::HashMap;
use tracing::{debug, info};

/// Parquet magic; the local vendor writes no real row data
const PARQUET_MAGIC: &[u8] = b"PAR1";

struct Cluster {
    region: String,
    account: String,
}

pub struct LocalExportVendor {
    staging: StagingStore,
    clusters: HashMap<String, Cluster>,
    tasks: Mutex<HashMap<String, ExportStatus>>,
}

impl LocalExportVendor {
    pub fn new<'a>(
        staging: StagingStore,
        deployments: impl IntoIterator<Item = &'a Deployment>,
    ) -> Self {
        let clusters = deployments
            .into_iter()
            .filter_map(|d| {
                let cluster = d.cluster().ok()?;
                let account = d.source_account().ok()?;
                Some((
                    cluster.to_string(),
                    Cluster {
                        region: d.region.clone(),
                        account: account.to_string(),
                    },
                ))
            })
            .collect();
        Self {
            staging,
            clusters,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Automated snapshot the vendor would have taken at the top of the hour
    fn latest_snapshot(&self, cluster: &str, now: DateTime<Utc>) -> Result<SnapshotRef, VendorError> {
        let located = self
            .clusters
            .get(cluster)
            .ok_or_else(|| VendorError::Rejected(format!("unknown cluster '{}'", cluster)))?;
        let created_at = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let identifier = format!("rds:{}-{}", cluster, created_at.format("%Y-%m-%d-%H-%M"));
        let arn = Arn::parse(format!(
            "arn:aws:rds:{}:{}:cluster-snapshot:{}",
            located.region, located.account, identifier
        ))
        .map_err(VendorError::Rejected)?;
        Ok(SnapshotRef {
            identifier,
            arn,
            created_at,
        })
    }
}

#[async_trait]
impl ExportVendor for LocalExportVendor {
    async fn automated_snapshots(
        &self,
        cluster: &str,
        _credentials: &Credentials,
    ) -> Result<Vec<SnapshotRef>, VendorError> {
        Ok(vec![self.latest_snapshot(cluster, Utc::now())?])
    }

    async fn start(&self, request: StartExportRequest) -> Result<String, VendorError> {
        let handle = request.task_identifier.clone();
        if self.tasks.lock().contains_key(&handle) {
            debug!(task = %handle, "Export already started");
            return Ok(handle);
        }

        let operator = self
            .staging
            .operator(&request.target.bucket)
            .map_err(|e| VendorError::Rejected(e.to_string()))?;
        let root = format!("{}/{}", request.target.prefix, handle);
        let unavailable = |e: opendal::Error| VendorError::Unavailable(e.to_string());

        for qualified in &request.export_only {
            let path = format!(
                "{}/{}/{}/1/part-00000-{}.gz.parquet",
                root, request.source.database_name, qualified, handle
            );
            operator
                .write(&path, PARQUET_MAGIC.to_vec())
                .await
                .map_err(unavailable)?;
        }

        let manifest = json!({
            "exportTaskIdentifier": handle,
            "sourceArn": request.snapshot.arn.as_str(),
            "snapshotTime": request.snapshot.created_at.to_rfc3339(),
            "s3Bucket": request.target.bucket,
            "s3Prefix": request.target.prefix,
            "iamRoleArn": request.target.role_arn.as_str(),
            "kmsKeyId": request.target.kms_key_arn.as_str(),
            "exportOnly": request.export_only,
        });
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| VendorError::Rejected(e.to_string()))?;
        operator
            .write(&format!("{}/export_info_{}.json", root, handle), manifest)
            .await
            .map_err(unavailable)?;

        info!(task = %handle, tables = request.export_only.len(), "Local export written");
        self.tasks
            .lock()
            .insert(handle.clone(), ExportStatus::Running { percent_progress: 50 });
        Ok(handle)
    }

    async fn describe(
        &self,
        handle: &str,
        _credentials: &Credentials,
    ) -> Result<ExportStatus, VendorError> {
        let mut tasks = self.tasks.lock();
        let status = tasks
            .get_mut(handle)
            .ok_or_else(|| VendorError::Rejected(format!("unknown export task '{}'", handle)))?;
        let observed = status.clone();
        // A running task finishes after it has been observed once
        if matches!(observed, ExportStatus::Running { .. }) {
            *status = ExportStatus::Succeeded;
        }
        Ok(observed)
    }

    async fn cancel(&self, handle: &str, _credentials: &Credentials) -> Result<(), VendorError> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(handle) {
            Some(status) if !status.is_terminal() => {
                *status = ExportStatus::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(VendorError::Rejected(format!("unknown export task '{}'", handle))),
        }
    }
}
