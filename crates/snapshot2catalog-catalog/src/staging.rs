//! Staging store access
//!
//! One opendal operator per staging bucket, rooted at the bucket.

use opendal::{ErrorKind, Operator};
use snapshot2catalog_core::{ExportLocation, PipelineError, Result};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Default)]
pub struct StagingStore {
    buckets: HashMap<String, Operator>,
}

impl StagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>, operator: Operator) -> Self {
        self.buckets.insert(bucket.into(), operator);
        self
    }

    pub fn operator(&self, bucket: &str) -> Result<&Operator> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| PipelineError::storage(format!("no staging store for bucket '{}'", bucket)))
    }

    /// Number of files under `prefix`; a missing prefix counts as empty.
    pub async fn count_files(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let operator = self.operator(bucket)?;
        match operator.list_with(prefix).recursive(true).await {
            Ok(entries) => Ok(entries
                .iter()
                .filter(|entry| entry.metadata().mode().is_file())
                .count()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(PipelineError::storage(format!(
                "listing s3://{}/{} failed: {}",
                bucket, prefix, err
            ))),
        }
    }

    /// Fail with `ExportNotLanded` unless every table has data under its prefix.
    pub async fn verify_landed(&self, location: &ExportLocation, tables: &[String]) -> Result<()> {
        for table in tables {
            let prefix = location.table_prefix(table);
            let files = self.count_files(&location.bucket, &prefix).await?;
            debug!(table = %table, files, "Staged export files");
            if files == 0 {
                return Err(PipelineError::ExportNotLanded {
                    path: location.table_location(table),
                });
            }
        }
        Ok(())
    }
}
