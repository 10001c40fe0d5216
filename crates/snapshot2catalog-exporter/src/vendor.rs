//! Vendor export collaborator

use async_trait::async_trait;
use aws_credential_types::Credentials;
use snapshot2catalog_core::{ExportSource, ExportStatus, ExportTarget, SnapshotRef};
use std::time::Duration;
use thiserror::Error;

/// Failure kinds a vendor call can report
#[derive(Debug, Clone, Error)]
pub enum VendorError {
    /// Rate limited; the call may be retried after backoff
    #[error("throttled")]
    Throttled { retry_after: Option<Duration> },

    /// The vendor refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Everything the vendor needs to start one export
#[derive(Debug, Clone)]
pub struct StartExportRequest {
    pub task_identifier: String,
    pub source: ExportSource,
    pub snapshot: SnapshotRef,
    pub target: ExportTarget,
    /// `ExportOnly` option, `<database>.<table>` entries
    pub export_only: Vec<String>,
    pub credentials: Credentials,
}

#[async_trait]
pub trait ExportVendor: Send + Sync {
    /// Automated (system-taken) snapshots of `cluster`, in any order.
    async fn automated_snapshots(
        &self,
        cluster: &str,
        credentials: &Credentials,
    ) -> Result<Vec<SnapshotRef>, VendorError>;

    /// Start an export; returns the vendor task handle.
    async fn start(&self, request: StartExportRequest) -> Result<String, VendorError>;

    async fn describe(
        &self,
        handle: &str,
        credentials: &Credentials,
    ) -> Result<ExportStatus, VendorError>;

    async fn cancel(&self, handle: &str, credentials: &Credentials) -> Result<(), VendorError>;
}
