// snapshot2catalog-core - domain model of the snapshot export pipeline
//
// Pure types and rules, no I/O: environments, runs and their state machine,
// typed resource scopes, trust grants, export tasks, catalog tables and the
// error taxonomy every stage reports through.

pub mod backoff;
pub mod context;
pub mod deployment;
pub mod environment;
pub mod error;
pub mod export;
pub mod grant;
pub mod run;
pub mod scope;
pub mod table;

pub use backoff::BackoffPolicy;
pub use context::RunContext;
pub use deployment::{Deployment, Encryption, PrincipalAllowList, WorkspaceSettings};
pub use environment::{Environment, Purpose};
pub use error::{ErrorCode, PipelineError, Result};
pub use export::{
    export_task_identifier, ExportSource, ExportStatus, ExportTarget, ExportTask, SnapshotRef,
};
pub use grant::{grant_id, GrantSummary, TrustGrant};
pub use run::{Run, RunFailure, RunId, RunStage};
pub use scope::{Action, Arn, ScopeDescriptor, ScopeStatement};
pub use table::{CatalogTable, Column, ExportLocation, StorageFormat, TableDefinition};
