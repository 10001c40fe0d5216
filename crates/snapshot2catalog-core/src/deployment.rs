//! Resolved per-environment resource identifiers
//!
//! A `Deployment` is built from configuration once at startup and shared
//! read-only by every Run of that environment. Identifiers that configuration
//! may omit are `Option`s; the accessors turn an absent value into
//! `PipelineError::ScopeResolution` at the moment a stage needs it.

use crate::environment::Environment;
use crate::error::{PipelineError, Result};
use crate::scope::Arn;
use crate::table::TableDefinition;
use serde::{Deserialize, Serialize};

/// Server-side encryption of query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Encryption {
    SseS3,
    SseKms,
}

impl Encryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encryption::SseS3 => "SSE_S3",
            Encryption::SseKms => "SSE_KMS",
        }
    }
}

/// Query workspace settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    pub name: String,
    pub result_bucket: String,
    /// Key prefix for results, with trailing slash
    pub output_prefix: String,
    pub encryption: Encryption,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_arn: Option<String>,
    pub enforce_configuration: bool,
}

impl WorkspaceSettings {
    pub fn output_location(&self) -> String {
        format!("s3://{}/{}", self.result_bucket, self.output_prefix)
    }
}

/// Principals allowed to request grants, per purpose
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalAllowList {
    pub export: Vec<String>,
    pub catalog: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub environment: Environment,
    pub region: String,
    /// Account running the pipeline (owns staging, catalog, workspace)
    pub platform_account_id: Option<String>,
    /// Account owning the source cluster and the assumable export role
    pub source_account_id: Option<String>,
    pub cluster_identifier: Option<String>,
    pub database_name: Option<String>,
    pub export_role_name: String,
    pub kms_key_arn: Option<String>,
    pub staging_bucket: String,
    pub catalog_database: String,
    pub workspace: WorkspaceSettings,
    pub principals: PrincipalAllowList,
    pub tables: Vec<TableDefinition>,
}

impl Deployment {
    fn missing(&self, what: &str) -> PipelineError {
        PipelineError::ScopeResolution {
            environment: self.environment,
            missing: what.to_string(),
        }
    }

    fn required<'a>(&self, value: &'a Option<String>, what: &str) -> Result<&'a str> {
        match value.as_deref() {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(self.missing(what)),
        }
    }

    fn arn(&self, value: String) -> Result<Arn> {
        Arn::parse(value).map_err(|reason| self.missing(&reason))
    }

    pub fn platform_account(&self) -> Result<&str> {
        self.required(&self.platform_account_id, "platform_account_id")
    }

    pub fn source_account(&self) -> Result<&str> {
        self.required(&self.source_account_id, "source_account_id")
    }

    pub fn cluster(&self) -> Result<&str> {
        self.required(&self.cluster_identifier, "cluster_identifier")
    }

    pub fn database(&self) -> Result<&str> {
        self.required(&self.database_name, "database_name")
    }

    pub fn kms_key(&self) -> Result<Arn> {
        let key = self.required(&self.kms_key_arn, "kms_key_arn")?;
        self.arn(key.to_string())
    }

    pub fn export_role_arn(&self) -> Result<Arn> {
        let account = self.source_account()?;
        self.arn(format!("arn:aws:iam::{}:role/{}", account, self.export_role_name))
    }

    pub fn cluster_arn(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:rds:{}:{}:cluster:{}",
            self.region,
            self.source_account()?,
            self.cluster()?
        ))
    }

    /// Pattern covering the cluster's automated snapshots only.
    ///
    /// Automated identifiers are `rds:<cluster>-YYYY-MM-DD-HH-MM`, so the
    /// year digit keeps sibling clusters named `<cluster>-<suffix>` out.
    pub fn automated_snapshot_pattern(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:rds:{}:{}:cluster-snapshot:rds:{}-2*",
            self.region,
            self.source_account()?,
            self.cluster()?
        ))
    }

    pub fn staging_bucket_arn(&self) -> Result<Arn> {
        self.arn(format!("arn:aws:s3:::{}", self.staging_bucket))
    }

    pub fn staging_objects_arn(&self, prefix: &str) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:s3:::{}/{}/*",
            self.staging_bucket,
            prefix.trim_matches('/')
        ))
    }

    pub fn result_bucket_arn(&self) -> Result<Arn> {
        self.arn(format!("arn:aws:s3:::{}", self.workspace.result_bucket))
    }

    pub fn result_objects_arn(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:s3:::{}/{}/*",
            self.workspace.result_bucket,
            self.workspace.output_prefix.trim_matches('/')
        ))
    }

    pub fn workgroup_arn(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:athena:{}:{}:workgroup/{}",
            self.region,
            self.platform_account()?,
            self.workspace.name
        ))
    }

    pub fn catalog_arn(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:glue:{}:{}:catalog",
            self.region,
            self.platform_account()?
        ))
    }

    pub fn catalog_database_arn(&self) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:glue:{}:{}:database/{}",
            self.region,
            self.platform_account()?,
            self.catalog_database
        ))
    }

    pub fn catalog_table_arn(&self, table: &str) -> Result<Arn> {
        self.arn(format!(
            "arn:aws:glue:{}:{}:table/{}/{}",
            self.region,
            self.platform_account()?,
            self.catalog_database,
            table
        ))
    }

    pub fn allowed_principals(&self, purpose: crate::Purpose) -> &[String] {
        match purpose {
            crate::Purpose::Export => &self.principals.export,
            crate::Purpose::Catalog => &self.principals.catalog,
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::table::Column;

    pub(crate) fn sample() -> Deployment {
        Deployment {
            environment: Environment::Dev,
            region: "ap-northeast-1".into(),
            platform_account_id: Some("111111111111".into()),
            source_account_id: Some("222222222222".into()),
            cluster_identifier: Some("db-1".into()),
            database_name: Some("app".into()),
            export_role_name: "rds-snapshot-export-role".into(),
            kms_key_arn: Some("arn:aws:kms:ap-northeast-1:111111111111:key/abcd".into()),
            staging_bucket: "test-rds-snapshot-dev".into(),
            catalog_database: "test-dwh".into(),
            workspace: WorkspaceSettings {
                name: "test-dev".into(),
                result_bucket: "analysis-athena-query-result-dev".into(),
                output_prefix: "output/".into(),
                encryption: Encryption::SseS3,
                kms_key_arn: None,
                enforce_configuration: true,
            },
            principals: PrincipalAllowList::default(),
            tables: vec![TableDefinition {
                name: "users".into(),
                columns: vec![Column::new("id", "bigint")],
            }],
        }
    }

    #[test]
    fn test_snapshot_pattern_excludes_sibling_clusters() {
        let pattern = sample().automated_snapshot_pattern().unwrap();
        let own = Arn::parse(
            "arn:aws:rds:ap-northeast-1:222222222222:cluster-snapshot:rds:db-1-2024-01-15-16-00",
        )
        .unwrap();
        let sibling = Arn::parse(
            "arn:aws:rds:ap-northeast-1:222222222222:cluster-snapshot:rds:db-1-archive-2024-01-15-16-00",
        )
        .unwrap();
        assert!(pattern.matches(&own));
        assert!(!pattern.matches(&sibling));
    }

    #[test]
    fn test_resource_arns() {
        let d = sample();
        assert_eq!(
            d.export_role_arn().unwrap().as_str(),
            "arn:aws:iam::222222222222:role/rds-snapshot-export-role"
        );
        assert_eq!(
            d.automated_snapshot_pattern().unwrap().as_str(),
            "arn:aws:rds:ap-northeast-1:222222222222:cluster-snapshot:rds:db-1-2*"
        );
        assert_eq!(
            d.staging_objects_arn("run-1").unwrap().as_str(),
            "arn:aws:s3:::test-rds-snapshot-dev/run-1/*"
        );
        assert_eq!(
            d.catalog_table_arn("users").unwrap().as_str(),
            "arn:aws:glue:ap-northeast-1:111111111111:table/test-dwh/users"
        );
        assert_eq!(
            d.workspace.output_location(),
            "s3://analysis-athena-query-result-dev/output/"
        );
    }

    #[test]
    fn test_missing_identifiers_are_scope_errors() {
        let mut d = sample();
        d.source_account_id = None;
        let err = d.export_role_arn().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ScopeResolution { ref missing, .. } if missing == "source_account_id"
        ));

        d.kms_key_arn = Some("  ".into());
        assert!(d.kms_key().is_err());
    }
}
