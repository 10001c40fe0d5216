//! Export task model

use crate::run::RunId;
use crate::scope::Arn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a vendor export task identifier
pub const MAX_TASK_IDENTIFIER_LEN: usize = 60;

/// An automated snapshot of the source cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Vendor identifier, e.g. `rds:db-1-2024-01-15-17-05`
    pub identifier: String,
    pub arn: Arn,
    pub created_at: DateTime<Utc>,
}

/// Source of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSource {
    pub cluster_identifier: String,
    pub database_name: String,
}

/// Destination of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTarget {
    pub bucket: String,
    /// Run-scoped key prefix inside the bucket, without trailing slash
    pub prefix: String,
    /// Role the vendor assumes to write into the bucket
    pub role_arn: Arn,
    pub kms_key_arn: Arn,
}

/// Lifecycle of a vendor export operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Running {
        #[serde(default)]
        percent_progress: u8,
    },
    Succeeded,
    Failed {
        reason: String,
    },
    Cancelled,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Succeeded | ExportStatus::Failed { .. } | ExportStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Running { .. } => "running",
            ExportStatus::Succeeded => "succeeded",
            ExportStatus::Failed { .. } => "failed",
            ExportStatus::Cancelled => "cancelled",
        }
    }
}

/// One in-flight vendor export, owned by the exporter for the duration of a Run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTask {
    pub run_id: RunId,
    /// Vendor task handle
    pub task_identifier: String,
    pub source: ExportSource,
    pub snapshot: SnapshotRef,
    pub target: ExportTarget,
    /// Tables requested for this Run, unqualified
    pub table_allowlist: Vec<String>,
    /// Vendor `ExportOnly` list, qualified as `<database>.<table>`
    pub export_only: Vec<String>,
    pub status: ExportStatus,
    pub started_at: DateTime<Utc>,
}

/// Build a vendor task identifier from the snapshot and the Run
///
/// The `rds:` prefix of automated snapshots is dropped; the result contains only
/// ASCII letters, digits and hyphens, starts with a letter and fits the vendor limit.
pub fn export_task_identifier(snapshot_identifier: &str, run_id: &RunId, now: DateTime<Utc>) -> String {
    let base = snapshot_identifier
        .strip_prefix("rds:")
        .unwrap_or(snapshot_identifier);
    let suffix = format!("-export-{}-{}", now.format("%Y%m%d%H%M"), run_id.short());

    let mut sanitized: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if !sanitized.starts_with(|c: char| c.is_ascii_alphabetic()) {
        sanitized.insert(0, 's');
    }
    let room = MAX_TASK_IDENTIFIER_LEN.saturating_sub(suffix.len());
    sanitized.truncate(room);
    let sanitized = sanitized.trim_end_matches('-');
    format!("{}{}", sanitized, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_identifier_strips_vendor_prefix() {
        let run_id = RunId::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 17, 5, 0).unwrap();
        let id = export_task_identifier("rds:db-1-2024-01-15-16-00", &run_id, now);
        assert!(id.starts_with("db-1-2024-01-15-16-00-export-202401151705-"));
        assert!(id.ends_with(&run_id.short()));
    }

    #[test]
    fn test_identifier_is_bounded_and_sanitized() {
        let run_id = RunId::new();
        let now = Utc::now();
        let long = format!("rds:9{}", "x_y.".repeat(40));
        let id = export_task_identifier(&long, &run_id, now);
        assert!(id.len() <= MAX_TASK_IDENTIFIER_LEN);
        assert!(id.starts_with('s'));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(!id.contains("--export"));
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ExportStatus::Pending.is_terminal());
        assert!(!ExportStatus::Running { percent_progress: 40 }.is_terminal());
        assert!(ExportStatus::Succeeded.is_terminal());
        assert!(ExportStatus::Failed { reason: "x".into() }.is_terminal());
    }
}
