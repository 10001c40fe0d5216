//! Catalog Updater
//!
//! Tables are synced one at a time in declared order. A failure stops the
//! sync; tables already synced stay synced, later ones are left untouched.
//! Writes to one table name are serialized across concurrent Runs.

use crate::client::CatalogClient;
use crate::staging::StagingStore;
use chrono::Utc;
use parking_lot::Mutex;
use snapshot2catalog_core::{
    BackoffPolicy, CatalogTable, Deployment, Environment, ExportLocation, PipelineError, Purpose,
    Result, RunContext, ScopeDescriptor, ScopeStatement, TableDefinition, TrustGrant,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct CatalogUpdater {
    client: Arc<dyn CatalogClient>,
    staging: StagingStore,
    retry: BackoffPolicy,
    table_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    workspaces: Mutex<HashMap<Environment, String>>,
}

/// Outcome of syncing one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableChange {
    Created,
    Refreshed,
    Unchanged,
}

impl CatalogUpdater {
    pub fn new(client: Arc<dyn CatalogClient>, staging: StagingStore, retry: BackoffPolicy) -> Self {
        Self {
            client,
            staging,
            retry,
            table_locks: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Register or refresh every table in `definitions` against the export at `location`.
    #[instrument(
        name = "catalog.sync_tables",
        skip_all,
        fields(run_id = %ctx.run_id, environment = %ctx.environment, export = %location.uri())
    )]
    pub async fn sync_tables(
        &self,
        ctx: &RunContext,
        grant: &TrustGrant,
        location: &ExportLocation,
        definitions: &[TableDefinition],
    ) -> Result<Vec<CatalogTable>> {
        if definitions.is_empty() {
            return Ok(Vec::new());
        }
        let deployment = ctx.deployment.as_ref();
        grant.verify(
            &ctx.run_id,
            Purpose::Catalog,
            &sync_needs(deployment, location, definitions)?,
            Utc::now(),
        )?;

        let names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        self.staging.verify_landed(location, &names).await?;
        self.ensure_workspace(ctx, grant).await?;

        let mut synced = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let (table, change) = self.sync_table(ctx, grant, location, definition).await?;
            metrics::counter!("snapshot2catalog.catalog.tables_synced").increment(1);
            info!(table = %table.name, change = ?change, location = %table.location, "Table synced");
            synced.push(table);
        }
        Ok(synced)
    }

    async fn sync_table(
        &self,
        ctx: &RunContext,
        grant: &TrustGrant,
        location: &ExportLocation,
        definition: &TableDefinition,
    ) -> Result<(CatalogTable, TableChange)> {
        let database = ctx.deployment.catalog_database.clone();
        let lock = self.table_lock(ctx.environment, &database, &definition.name);
        let _guard = lock.lock().await;

        let desired = CatalogTable::external_parquet(
            &database,
            definition,
            location.table_location(&definition.name),
        );

        let existing = {
            let client = Arc::clone(&self.client);
            let credentials = grant.credentials.clone();
            let database = database.clone();
            let name = definition.name.clone();
            self.retrying("GetTable", move || {
                let client = Arc::clone(&client);
                let credentials = credentials.clone();
                let database = database.clone();
                let name = name.clone();
                async move { client.get_table(&database, &name, &credentials).await }
            })
            .await?
        };

        let (table, change) = match existing {
            None => (desired, TableChange::Created),
            Some(current) => {
                if let Some((column, existing, declared)) =
                    current.schema_conflict(&definition.columns)
                {
                    warn!(table = %definition.name, column = %column, "Schema conflict");
                    return Err(PipelineError::SchemaConflict {
                        table: definition.name.clone(),
                        column,
                        existing,
                        declared,
                    });
                }
                if current.location == desired.location {
                    return Ok((current, TableChange::Unchanged));
                }
                let refreshed = CatalogTable {
                    location: desired.location,
                    ..current
                };
                (refreshed, TableChange::Refreshed)
            }
        };

        {
            let client = Arc::clone(&self.client);
            let credentials = grant.credentials.clone();
            let table = table.clone();
            let operation = match change {
                TableChange::Created => "CreateTable",
                _ => "UpdateTable",
            };
            self.retrying(operation, move || {
                let client = Arc::clone(&client);
                let credentials = credentials.clone();
                let table = table.clone();
                async move { client.create_or_update_table(&table, &credentials).await }
            })
            .await?;
        }
        Ok((table, change))
    }

    /// Provision the environment's query workspace once per process.
    pub async fn ensure_workspace(&self, ctx: &RunContext, grant: &TrustGrant) -> Result<String> {
        let cached = self.workspaces.lock().get(&ctx.environment).cloned();
        if let Some(location) = cached {
            return Ok(location);
        }

        let settings = ctx.deployment.workspace.clone();
        let client = Arc::clone(&self.client);
        let credentials = grant.credentials.clone();
        let location = self
            .retrying("EnsureWorkspace", move || {
                let client = Arc::clone(&client);
                let credentials = credentials.clone();
                let settings = settings.clone();
                async move { client.ensure_workspace(&settings, &credentials).await }
            })
            .await?;

        debug!(workspace = %ctx.deployment.workspace.name, location = %location, "Workspace ready");
        self.workspaces
            .lock()
            .insert(ctx.environment, location.clone());
        Ok(location)
    }

    fn table_lock(
        &self,
        environment: Environment,
        database: &str,
        table: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}/{}/{}", environment, database, table);
        Arc::clone(self.table_locks.lock().entry(key).or_default())
    }

    /// Retry `call` while the catalog is unavailable, up to the attempt ceiling.
    async fn retrying<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.retry.allows_another(attempt) => {
                    let delay = self.retry.delay_with_hint(attempt, err.retry_after());
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Catalog call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn sync_needs(
    deployment: &Deployment,
    location: &ExportLocation,
    definitions: &[TableDefinition],
) -> Result<ScopeDescriptor> {
    let mut tables = Vec::with_capacity(definitions.len());
    for definition in definitions {
        tables.push(deployment.catalog_table_arn(&definition.name)?);
    }
    let statements = vec![
        ScopeStatement::new(
            "ReadExport",
            ["s3:GetObject"],
            [deployment.staging_objects_arn(&location.run_prefix)?],
        ),
        ScopeStatement::new(
            "Workspace",
            ["athena:GetWorkGroup"],
            [deployment.workgroup_arn()?],
        ),
        ScopeStatement::new("Tables", ["glue:GetTable", "glue:CreateTable", "glue:UpdateTable"], tables),
    ];
    let statements = statements
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(PipelineError::invalid_grant)?;
    Ok(ScopeDescriptor::new(statements))
}
