//! Catalog persisted as JSON documents in an opendal store
//!
//! Layout:
//!   databases/<database>/tables/<table>.json
//!   workspaces/<name>.json

use crate::client::CatalogClient;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use opendal::{ErrorKind, Operator};
use snapshot2catalog_core::{CatalogTable, PipelineError, Result, WorkspaceSettings};
use tracing::{debug, info};

#[derive(Clone)]
pub struct OperatorCatalog {
    operator: Operator,
}

impl OperatorCatalog {
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    fn table_path(database: &str, name: &str) -> String {
        format!("databases/{}/tables/{}.json", database, name)
    }

    fn workspace_path(name: &str) -> String {
        format!("workspaces/{}.json", name)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.operator.read(path).await {
            Ok(buffer) => serde_json::from_slice(&buffer.to_vec())
                .map(Some)
                .map_err(|err| PipelineError::CatalogRejected {
                    operation: "read".to_string(),
                    reason: format!("corrupt document {}: {}", path, err),
                }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(unavailable(path, err)),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value).map_err(|err| PipelineError::CatalogRejected {
            operation: "write".to_string(),
            reason: err.to_string(),
        })?;
        self.operator
            .write(path, body)
            .await
            .map(|_| ())
            .map_err(|err| unavailable(path, err))
    }

    /// Every table registered in `database`, sorted by name.
    pub async fn tables(&self, database: &str) -> Result<Vec<CatalogTable>> {
        let prefix = format!("databases/{}/tables/", database);
        let entries = match self.operator.list(&prefix).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(&prefix, err)),
        };
        let mut tables = Vec::new();
        for entry in entries {
            if !entry.path().ends_with(".json") {
                continue;
            }
            if let Some(table) = self.read_json::<CatalogTable>(entry.path()).await? {
                tables.push(table);
            }
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }
}

fn unavailable(path: &str, err: opendal::Error) -> PipelineError {
    PipelineError::CatalogUnavailable {
        reason: format!("{}: {}", path, err),
    }
}

#[async_trait]
impl CatalogClient for OperatorCatalog {
    async fn get_table(
        &self,
        database: &str,
        name: &str,
        _credentials: &Credentials,
    ) -> Result<Option<CatalogTable>> {
        self.read_json(&Self::table_path(database, name)).await
    }

    async fn create_or_update_table(
        &self,
        table: &CatalogTable,
        _credentials: &Credentials,
    ) -> Result<()> {
        debug!(database = %table.database, table = %table.name, "Writing table document");
        self.write_json(&Self::table_path(&table.database, &table.name), table)
            .await
    }

    async fn ensure_workspace(
        &self,
        settings: &WorkspaceSettings,
        _credentials: &Credentials,
    ) -> Result<String> {
        let path = Self::workspace_path(&settings.name);
        let existing: Option<WorkspaceSettings> = self.read_json(&path).await?;
        match existing {
            Some(current) if &current == settings || !settings.enforce_configuration => {}
            _ => {
                info!(workspace = %settings.name, "Provisioning query workspace");
                self.write_json(&path, settings).await?;
            }
        }
        Ok(settings.output_location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshot2catalog_core::{Column, Encryption, TableDefinition};

    fn catalog() -> OperatorCatalog {
        let operator = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OperatorCatalog::new(operator)
    }

    fn credentials() -> Credentials {
        Credentials::new("AKID", "SECRET", None, None, "test")
    }

    #[tokio::test]
    async fn test_table_documents() {
        let catalog = catalog();
        assert!(catalog
            .get_table("test-dwh", "users", &credentials())
            .await
            .unwrap()
            .is_none());

        let definition = TableDefinition {
            name: "users".into(),
            columns: vec![Column::new("id", "bigint")],
        };
        let table = CatalogTable::external_parquet("test-dwh", &definition, "s3://b/r/t/");
        catalog
            .create_or_update_table(&table, &credentials())
            .await
            .unwrap();

        let stored = catalog
            .get_table("test-dwh", "users", &credentials())
            .await
            .unwrap();
        assert_eq!(stored, Some(table.clone()));
        assert_eq!(catalog.tables("test-dwh").await.unwrap(), vec![table]);
    }

    #[tokio::test]
    async fn test_workspace_is_ensured_once() {
        let catalog = catalog();
        let settings = WorkspaceSettings {
            name: "test-dev".into(),
            result_bucket: "results".into(),
            output_prefix: "output/".into(),
            encryption: Encryption::SseS3,
            kms_key_arn: None,
            enforce_configuration: true,
        };
        let location = catalog
            .ensure_workspace(&settings, &credentials())
            .await
            .unwrap();
        assert_eq!(location, "s3://results/output/");

        let again = catalog
            .ensure_workspace(&settings, &credentials())
            .await
            .unwrap();
        assert_eq!(again, location);
    }
}
