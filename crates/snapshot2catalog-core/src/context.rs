use crate::deployment::Deployment;
use crate::environment::Environment;
use crate::run::RunId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Explicit per-Run context handed to every stage
///
/// Replaces process-wide configuration: a stage learns which environment,
/// which resources and which cancellation signal apply only from here.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub environment: Environment,
    pub deployment: Arc<Deployment>,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: RunId, deployment: Arc<Deployment>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            environment: deployment.environment,
            deployment,
            started_at,
            cancel: CancellationToken::new(),
        }
    }

    /// Run-scoped key prefix in the staging store.
    pub fn staging_prefix(&self) -> String {
        self.run_id.to_string()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
