//! Catalog collaborator

use async_trait::async_trait;
use aws_credential_types::Credentials;
use snapshot2catalog_core::{CatalogTable, Result, WorkspaceSettings};

/// External query catalog.
///
/// Unreachable control planes report `PipelineError::CatalogUnavailable`,
/// refused requests `PipelineError::CatalogRejected`.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_table(
        &self,
        database: &str,
        name: &str,
        credentials: &Credentials,
    ) -> Result<Option<CatalogTable>>;

    async fn create_or_update_table(
        &self,
        table: &CatalogTable,
        credentials: &Credentials,
    ) -> Result<()>;

    /// Create the query workspace if absent; returns its output location.
    async fn ensure_workspace(
        &self,
        settings: &WorkspaceSettings,
        credentials: &Credentials,
    ) -> Result<String>;
}
