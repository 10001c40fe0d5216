//! Run identity, stages and the stage transition guard

use crate::environment::Environment;
use crate::error::{ErrorCode, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one Run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// First eight hex digits, used in vendor task identifiers.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stage of a Run
///
/// `NotStarted -> Exporting -> Cataloging -> Done`, with `Failed` reachable
/// from `Exporting` and `Cataloging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    NotStarted,
    Exporting,
    Cataloging,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::NotStarted => "not_started",
            RunStage::Exporting => "exporting",
            RunStage::Cataloging => "cataloging",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }

    pub fn can_transition_to(&self, next: RunStage) -> bool {
        matches!(
            (self, next),
            (RunStage::NotStarted, RunStage::Exporting)
                | (RunStage::Exporting, RunStage::Cataloging)
                | (RunStage::Cataloging, RunStage::Done)
                | (RunStage::Exporting, RunStage::Failed)
                | (RunStage::Cataloging, RunStage::Failed)
        )
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail recorded on a failed Run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: ErrorCode,
    /// Stage the Run was in when it failed
    pub stage: RunStage,
    pub message: String,
    pub cancelled: bool,
}

impl RunFailure {
    pub fn from_error(stage: RunStage, error: &PipelineError) -> Self {
        Self {
            code: error.code(),
            stage,
            message: error.to_string(),
            cancelled: matches!(error, PipelineError::Cancelled),
        }
    }
}

/// One execution of the pipeline for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: RunStage,
    /// Vendor task identifier once the export has been started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_task: Option<String>,
    /// Set only when a `succeeded` export status has been observed
    pub export_succeeded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
}

impl Run {
    pub fn new(id: RunId, environment: Environment, now: DateTime<Utc>) -> Self {
        Self {
            id,
            environment,
            started_at: now,
            updated_at: now,
            finished_at: None,
            stage: RunStage::NotStarted,
            export_task: None,
            export_succeeded: false,
            synced_tables: Vec::new(),
            error: None,
        }
    }

    /// Move to `next`, enforcing the state machine and the export gate.
    pub fn advance(&mut self, next: RunStage, now: DateTime<Utc>) -> Result<(), PipelineError> {
        if !self.stage.can_transition_to(next) {
            return Err(self.gate_error(next, "transition not in the state machine"));
        }
        if next == RunStage::Cataloging && !self.export_succeeded {
            return Err(self.gate_error(next, "export success has not been observed"));
        }
        self.stage = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Record a stage error and move to `Failed`.
    pub fn fail(&mut self, error: &PipelineError, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let failure = RunFailure::from_error(self.stage, error);
        self.advance(RunStage::Failed, now)?;
        self.error = Some(failure);
        Ok(())
    }

    fn gate_error(&self, next: RunStage, reason: &str) -> PipelineError {
        PipelineError::StageGate {
            from: self.stage.to_string(),
            to: next.to_string(),
            reason: reason.to_string(),
        }
    }
}
