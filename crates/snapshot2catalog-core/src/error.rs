//! Error taxonomy shared by every pipeline stage

use crate::environment::{Environment, Purpose};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// E001: Caller is not an allow-listed principal for the purpose
    E001UnauthorizedPrincipal,
    /// E002: Resource identifiers missing from configuration
    E002ScopeResolution,
    /// E003: Vendor throttled the request
    E003Throttled,
    /// E004: Vendor export reached a failed terminal state
    E004VendorExportFailed,
    /// E005: Declared schema incompatible with the existing table
    E005SchemaConflict,
    /// E006: Catalog control plane unreachable
    E006CatalogUnavailable,
    /// E007: Run cancelled while exporting
    E007Cancelled,
    /// E008: Grant missing, expired or scoped for something else
    E008InvalidGrant,
    /// E009: Stage transition not allowed from the current state
    E009StageGate,
    /// E010: Export output not found in the staging store
    E010ExportNotLanded,
    /// E011: Invalid configuration or request
    E011InvalidConfig,
    /// E012: Staging storage operation failed
    E012Storage,
    /// E013: Run lookup or resume failed
    E013RunLookup,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001UnauthorizedPrincipal => "E001",
            Self::E002ScopeResolution => "E002",
            Self::E003Throttled => "E003",
            Self::E004VendorExportFailed => "E004",
            Self::E005SchemaConflict => "E005",
            Self::E006CatalogUnavailable => "E006",
            Self::E007Cancelled => "E007",
            Self::E008InvalidGrant => "E008",
            Self::E009StageGate => "E009",
            Self::E010ExportNotLanded => "E010",
            Self::E011InvalidConfig => "E011",
            Self::E012Storage => "E012",
            Self::E013RunLookup => "E013",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the trust broker, exporter, catalog updater and scheduler
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("[E001] Principal '{principal}' is not allowed to act for purpose '{purpose}'")]
    UnauthorizedPrincipal { principal: String, purpose: Purpose },

    #[error("[E002] Cannot resolve resource scope for {environment}: missing {missing}")]
    ScopeResolution {
        environment: Environment,
        missing: String,
    },

    #[error("[E003] Vendor throttled '{operation}'")]
    Throttled {
        operation: String,
        retry_after: Option<Duration>,
    },

    #[error("[E004] Export task '{task}' failed: {reason}")]
    VendorExportFailed { task: String, reason: String },

    #[error("[E004] Export task '{task}' did not finish within {waited:?}")]
    ExportTimedOut { task: String, waited: Duration },

    #[error("[E007] Cancelled")]
    Cancelled,

    #[error("[E005] Schema conflict on table '{table}': column '{column}' is {existing} in the catalog but declared as {declared}")]
    SchemaConflict {
        table: String,
        column: String,
        existing: String,
        declared: String,
    },

    #[error("[E006] Catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    #[error("[E006] Catalog rejected '{operation}': {reason}")]
    CatalogRejected { operation: String, reason: String },

    #[error("[E008] Invalid grant: {reason}")]
    InvalidGrant { reason: String },

    #[error("[E009] Stage transition {from} -> {to} not allowed: {reason}")]
    StageGate {
        from: String,
        to: String,
        reason: String,
    },

    #[error("[E010] Export output not found at '{path}'")]
    ExportNotLanded { path: String },

    #[error("[E009] Run '{run_id}' cannot be cancelled in stage {stage}")]
    NotCancellable { run_id: String, stage: String },

    #[error("[E013] No run of {environment} is eligible for cataloging")]
    NoEligibleRun { environment: Environment },

    #[error("[E013] Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("[E012] Storage operation failed: {message}")]
    Storage { message: String },

    #[error("[E011] Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnauthorizedPrincipal { .. } => ErrorCode::E001UnauthorizedPrincipal,
            Self::ScopeResolution { .. } => ErrorCode::E002ScopeResolution,
            Self::Throttled { .. } => ErrorCode::E003Throttled,
            Self::VendorExportFailed { .. } | Self::ExportTimedOut { .. } => {
                ErrorCode::E004VendorExportFailed
            }
            Self::Cancelled => ErrorCode::E007Cancelled,
            Self::SchemaConflict { .. } => ErrorCode::E005SchemaConflict,
            Self::CatalogUnavailable { .. } | Self::CatalogRejected { .. } => {
                ErrorCode::E006CatalogUnavailable
            }
            Self::InvalidGrant { .. } => ErrorCode::E008InvalidGrant,
            Self::StageGate { .. } | Self::NotCancellable { .. } => ErrorCode::E009StageGate,
            Self::ExportNotLanded { .. } => ErrorCode::E010ExportNotLanded,
            Self::NoEligibleRun { .. } | Self::RunNotFound { .. } => ErrorCode::E013RunLookup,
            Self::Storage { .. } => ErrorCode::E012Storage,
            Self::InvalidConfig { .. } => ErrorCode::E011InvalidConfig,
        }
    }

    /// Throttling and catalog outages are transient; everything else is terminal for the stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::CatalogUnavailable { .. }
        )
    }

    /// Server-suggested delay, when the collaborator supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_grant(reason: impl Into<String>) -> Self {
        Self::InvalidGrant {
            reason: reason.into(),
        }
    }
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
