//! Least-privilege scope per purpose
//!
//! Every resource is derived from the Run's deployment; nothing is broader
//! than one bucket prefix, one key, one cluster or one declared table.

use snapshot2catalog_core::{
    Arn, Deployment, PipelineError, Purpose, Result, ScopeDescriptor, ScopeStatement,
};

const DESCRIBE_SOURCE: &[&str] = &["rds:DescribeDBClusters", "rds:DescribeDBClusterSnapshots"];
const START_EXPORT: &[&str] = &[
    "rds:StartExportTask",
    "rds:DescribeExportTasks",
    "rds:CancelExportTask",
];
const PASS_EXPORT_ROLE: &[&str] = &["iam:GetRole", "iam:PassRole"];
const EXPORT_KEY: &[&str] = &[
    "kms:CreateGrant",
    "kms:Decrypt",
    "kms:DescribeKey",
    "kms:Encrypt",
    "kms:GenerateDataKey*",
    "kms:ReEncrypt*",
    "kms:RetireGrant",
];
const WRITE_OBJECTS: &[&str] = &[
    "s3:PutObject*",
    "s3:GetObject*",
    "s3:DeleteObject*",
    "s3:AbortMultipartUpload",
];
const READ_OBJECTS: &[&str] = &["s3:GetObject", "s3:GetObjectVersion"];
const LIST_BUCKET: &[&str] = &["s3:ListBucket", "s3:GetBucketLocation"];
const QUERY_WORKGROUP: &[&str] = &[
    "athena:CreateWorkGroup",
    "athena:GetWorkGroup",
    "athena:UpdateWorkGroup",
    "athena:StartQueryExecution",
    "athena:GetQueryExecution",
    "athena:GetQueryResults",
];
const CATALOG_TABLES: &[&str] = &[
    "glue:GetDatabase",
    "glue:GetTable",
    "glue:CreateTable",
    "glue:UpdateTable",
];

fn statement(
    deployment: &Deployment,
    sid: &str,
    actions: &[&str],
    resources: Vec<Arn>,
) -> Result<ScopeStatement> {
    ScopeStatement::new(sid, actions.iter().copied(), resources).map_err(|reason| {
        PipelineError::ScopeResolution {
            environment: deployment.environment,
            missing: reason,
        }
    })
}

/// Scope the `purpose` stage of the Run staged under `run_prefix` needs.
pub fn required_scope(
    deployment: &Deployment,
    run_prefix: &str,
    purpose: Purpose,
) -> Result<ScopeDescriptor> {
    let statements = match purpose {
        Purpose::Export => export_statements(deployment, run_prefix)?,
        Purpose::Catalog => catalog_statements(deployment, run_prefix)?,
    };
    Ok(ScopeDescriptor::new(statements))
}

fn export_statements(deployment: &Deployment, run_prefix: &str) -> Result<Vec<ScopeStatement>> {
    let snapshots = deployment.automated_snapshot_pattern()?;
    Ok(vec![
        statement(
            deployment,
            "DescribeSource",
            DESCRIBE_SOURCE,
            vec![deployment.cluster_arn()?, snapshots.clone()],
        )?,
        statement(deployment, "StartExport", START_EXPORT, vec![snapshots])?,
        statement(
            deployment,
            "PassExportRole",
            PASS_EXPORT_ROLE,
            vec![deployment.export_role_arn()?],
        )?,
        statement(deployment, "ExportKey", EXPORT_KEY, vec![deployment.kms_key()?])?,
        statement(
            deployment,
            "StagingObjects",
            WRITE_OBJECTS,
            vec![deployment.staging_objects_arn(run_prefix)?],
        )?,
        statement(
            deployment,
            "StagingBucket",
            LIST_BUCKET,
            vec![deployment.staging_bucket_arn()?],
        )?,
    ])
}

fn catalog_statements(deployment: &Deployment, run_prefix: &str) -> Result<Vec<ScopeStatement>> {
    let mut tables = vec![deployment.catalog_arn()?, deployment.catalog_database_arn()?];
    for name in deployment.table_names() {
        tables.push(deployment.catalog_table_arn(&name)?);
    }

    Ok(vec![
        statement(
            deployment,
            "ReadExport",
            READ_OBJECTS,
            vec![deployment.staging_objects_arn(run_prefix)?],
        )?,
        statement(
            deployment,
            "ListBuckets",
            LIST_BUCKET,
            vec![
                deployment.staging_bucket_arn()?,
                deployment.result_bucket_arn()?,
            ],
        )?,
        statement(
            deployment,
            "QueryResults",
            WRITE_OBJECTS,
            vec![deployment.result_objects_arn()?],
        )?,
        statement(
            deployment,
            "QueryWorkgroup",
            QUERY_WORKGROUP,
            vec![deployment.workgroup_arn()?],
        )?,
        statement(deployment, "CatalogTables", CATALOG_TABLES, tables)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshot2catalog_core::{
        Column, Encryption, Environment, PrincipalAllowList, TableDefinition, WorkspaceSettings,
    };

    pub(crate) fn deployment() -> Deployment {
        Deployment {
            environment: Environment::Dev,
            region: "ap-northeast-1".into(),
            platform_account_id: Some("111111111111".into()),
            source_account_id: Some("222222222222".into()),
            cluster_identifier: Some("db-1".into()),
            database_name: Some("app".into()),
            export_role_name: "rds-snapshot-export-assumable-role".into(),
            kms_key_arn: Some("arn:aws:kms:ap-northeast-1:222222222222:key/k-1".into()),
            staging_bucket: "test-rds-snapshot-dev".into(),
            catalog_database: "test-dwh".into(),
            workspace: WorkspaceSettings {
                name: "test-dev".into(),
                result_bucket: "analysis-platform-athena-query-result-dev".into(),
                output_prefix: "output/".into(),
                encryption: Encryption::SseS3,
                kms_key_arn: None,
                enforce_configuration: true,
            },
            principals: PrincipalAllowList::default(),
            tables: vec![
                TableDefinition {
                    name: "users".into(),
                    columns: vec![Column::new("id", "bigint")],
                },
                TableDefinition {
                    name: "posts".into(),
                    columns: vec![Column::new("id", "bigint")],
                },
            ],
        }
    }

    #[test]
    fn test_export_scope_is_run_scoped() {
        let scope = required_scope(&deployment(), "run-1", Purpose::Export).unwrap();
        let resources: Vec<&str> = scope.resources().into_iter().map(|a| a.as_str()).collect();

        assert!(resources.contains(&"arn:aws:s3:::test-rds-snapshot-dev/run-1/*"));
        assert!(resources.contains(&"arn:aws:kms:ap-northeast-1:222222222222:key/k-1"));
        assert!(!resources.iter().any(|r| r.contains("glue")));
        assert!(!resources.iter().any(|r| *r == "*" || r.ends_with(":key/*")));
    }

    #[test]
    fn test_catalog_scope_names_each_table() {
        let scope = required_scope(&deployment(), "run-1", Purpose::Catalog).unwrap();
        let resources: Vec<&str> = scope.resources().into_iter().map(|a| a.as_str()).collect();

        assert!(resources.contains(&"arn:aws:glue:ap-northeast-1:111111111111:table/test-dwh/users"));
        assert!(resources.contains(&"arn:aws:glue:ap-northeast-1:111111111111:table/test-dwh/posts"));
        assert!(!resources.iter().any(|r| r.ends_with("table/*")));
        assert!(!resources.iter().any(|r| r.starts_with("arn:aws:rds")));
    }

    #[test]
    fn test_scopes_differ_between_runs() {
        let d = deployment();
        let first = required_scope(&d, "run-1", Purpose::Export).unwrap();
        let second = required_scope(&d, "run-2", Purpose::Export).unwrap();
        assert!(!first.covers(&second));
    }

    #[test]
    fn test_missing_key_is_scope_resolution() {
        let mut d = deployment();
        d.kms_key_arn = None;
        let err = required_scope(&d, "run-1", Purpose::Export).unwrap_err();
        assert!(matches!(err, PipelineError::ScopeResolution { .. }));

        // Catalog purpose does not need the key
        assert!(required_scope(&d, "run-1", Purpose::Catalog).is_ok());
    }
}
