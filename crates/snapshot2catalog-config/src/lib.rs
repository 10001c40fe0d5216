// snapshot2catalog-config - configuration for the export pipeline
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from SNAPSHOT2CATALOG_CONFIG env var
// 3. Config file contents from SNAPSHOT2CATALOG_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.snapshot2catalog.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use snapshot2catalog_core::{
    BackoffPolicy, Deployment, Encryption, Environment, PrincipalAllowList, TableDefinition,
    WorkspaceSettings,
};
use std::collections::BTreeMap;
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{apply_env_overrides, EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub environments: BTreeMap<Environment, EnvironmentConfig>,
}

fn default_project_name() -> String {
    "analysis-platform".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            schedule: ScheduleConfig::default(),
            staging: StagingConfig::default(),
            identity: IdentityConfig::default(),
            environments: BTreeMap::new(),
        }
    }
}

/// HTTP trigger interface and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unsupported log format: {}. Supported: text, json", s),
        }
    }
}

/// Polling, retry and grant timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_initial_secs: u64,
    pub poll_max_interval_secs: u64,
    pub poll_multiplier: f64,
    /// Upper bound on the total time spent waiting for one export
    pub poll_max_wait_secs: u64,
    /// Attempt ceiling for throttled vendor calls
    pub vendor_max_attempts: u32,
    /// Attempt ceiling for catalog calls while the catalog is unavailable
    pub catalog_max_attempts: u32,
    pub catalog_retry_initial_ms: u64,
    pub catalog_retry_max_ms: u64,
    /// Expected duration of the export stage
    pub export_grant_secs: u64,
    /// Expected duration of the catalog stage
    pub catalog_grant_secs: u64,
    pub grant_safety_margin_secs: u64,
    /// How long terminal runs stay visible before being purged
    pub run_retention_hours: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_initial_secs: 10,
            poll_max_interval_secs: 300,
            poll_multiplier: 2.0,
            poll_max_wait_secs: 6 * 3600,
            vendor_max_attempts: 8,
            catalog_max_attempts: 5,
            catalog_retry_initial_ms: 500,
            catalog_retry_max_ms: 10_000,
            export_grant_secs: 6 * 3600,
            catalog_grant_secs: 15 * 60,
            grant_safety_margin_secs: 15 * 60,
            run_retention_hours: 72,
        }
    }
}

impl PipelineConfig {
    /// Interval schedule of status polls; polling is bounded by `poll_max_wait`.
    pub fn poll_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.poll_initial_secs),
            max_interval: Duration::from_secs(self.poll_max_interval_secs),
            multiplier: self.poll_multiplier,
            max_attempts: u32::MAX,
        }
    }

    /// Backoff for throttled vendor calls, at start and while polling
    pub fn vendor_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.vendor_max_attempts,
            ..BackoffPolicy::default()
        }
    }

    pub fn poll_max_wait(&self) -> Duration {
        Duration::from_secs(self.poll_max_wait_secs)
    }

    pub fn catalog_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.catalog_retry_initial_ms),
            max_interval: Duration::from_millis(self.catalog_retry_max_ms),
            multiplier: 2.0,
            max_attempts: self.catalog_max_attempts,
        }
    }

    pub fn export_grant(&self) -> Duration {
        Duration::from_secs(self.export_grant_secs)
    }

    pub fn catalog_grant(&self) -> Duration {
        Duration::from_secs(self.catalog_grant_secs)
    }

    pub fn grant_safety_margin(&self) -> Duration {
        Duration::from_secs(self.grant_safety_margin_secs)
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_hours * 3600)
    }
}

/// Daily cadence, times of day in UTC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub export_at: String,
    pub catalog_at: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_at: "17:00".to_string(),
            catalog_at: "20:00".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn export_time(&self) -> Result<NaiveTime> {
        parse_time_of_day(&self.export_at).context("schedule.export_at")
    }

    pub fn catalog_time(&self) -> Result<NaiveTime> {
        parse_time_of_day(&self.catalog_at).context("schedule.catalog_at")
    }
}

fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .with_context(|| format!("'{}' is not a HH:MM time of day", value))
}

/// Staging store holding exported snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub backend: StagingBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,

    /// Objects expire after this many days (declared lifecycle, not enforced here)
    #[serde(default = "default_expiration_days")]
    pub expiration_days: u32,

    #[serde(default = "default_block_public_access")]
    pub block_public_access: bool,

    /// Directory of the local catalog store (table and workspace documents)
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
}

fn default_expiration_days() -> u32 {
    3
}

fn default_block_public_access() -> bool {
    true
}

fn default_catalog_path() -> String {
    "./catalog".to_string()
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            backend: StagingBackend::Fs,
            fs: Some(FsConfig::default()),
            s3: None,
            expiration_days: default_expiration_days(),
            block_public_access: default_block_public_access(),
            catalog_path: default_catalog_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingBackend {
    Fs,
    S3,
    Memory,
}

impl std::fmt::Display for StagingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingBackend::Fs => write!(f, "fs"),
            StagingBackend::S3 => write!(f, "s3"),
            StagingBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StagingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StagingBackend::Fs),
            "s3" | "aws" => Ok(StagingBackend::S3),
            "memory" | "mem" => Ok(StagingBackend::Memory),
            _ => anyhow::bail!(
                "Unsupported staging backend: {}. Supported: fs, s3, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./staging".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Principal reported by the local identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub caller_arn: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            caller_arn: "arn:aws:iam::000000000000:role/snapshot2catalog-local".to_string(),
        }
    }
}

/// Per-environment settings, supplied externally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub platform_account_id: Option<String>,
    #[serde(default)]
    pub source_account_id: Option<String>,
    #[serde(default)]
    pub cluster_identifier: Option<String>,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default = "default_export_role_name")]
    pub export_role_name: String,
    #[serde(default)]
    pub kms_key_arn: Option<String>,
    /// Defaults to `test-rds-snapshot-<env>`
    #[serde(default)]
    pub staging_bucket: Option<String>,
    #[serde(default = "default_catalog_database")]
    pub catalog_database: String,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Defaults to the export function's execution role in the platform account
    #[serde(default)]
    pub export_principals: Vec<String>,
    /// Defaults to the catalog function's execution role in the platform account
    #[serde(default)]
    pub catalog_principals: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
}

fn default_region() -> String {
    "ap-northeast-1".to_string()
}

fn default_export_role_name() -> String {
    "rds-snapshot-export-assumable-role".to_string()
}

fn default_catalog_database() -> String {
    "test-dwh".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            platform_account_id: None,
            source_account_id: None,
            cluster_identifier: None,
            database_name: None,
            export_role_name: default_export_role_name(),
            kms_key_arn: None,
            staging_bucket: None,
            catalog_database: default_catalog_database(),
            workspace: WorkspaceConfig::default(),
            export_principals: Vec::new(),
            catalog_principals: Vec::new(),
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Defaults to `test-<env>`
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to `<project>-athena-query-result-<env>`
    #[serde(default)]
    pub result_bucket: Option<String>,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default = "default_encryption")]
    pub encryption: Encryption,
    #[serde(default)]
    pub kms_key_arn: Option<String>,
    #[serde(default = "default_enforce")]
    pub enforce_configuration: bool,
}

fn default_output_prefix() -> String {
    "output/".to_string()
}

fn default_encryption() -> Encryption {
    Encryption::SseS3
}

fn default_enforce() -> bool {
    true
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: None,
            result_bucket: None,
            output_prefix: default_output_prefix(),
            encryption: default_encryption(),
            kms_key_arn: None,
            enforce_configuration: default_enforce(),
        }
    }
}

impl EnvironmentConfig {
    pub fn staging_bucket(&self, env: Environment) -> String {
        self.staging_bucket
            .clone()
            .unwrap_or_else(|| format!("test-rds-snapshot-{}", env))
    }

    /// Resolve defaults into the deployment shared by all Runs of `env`.
    pub fn to_deployment(&self, env: Environment, project_name: &str) -> Deployment {
        let platform = self
            .platform_account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        let default_principal = |function: &str| -> Vec<String> {
            platform
                .map(|account| {
                    vec![format!(
                        "arn:aws:iam::{}:role/{}-lambda-exec-role-{}",
                        account, function, env
                    )]
                })
                .unwrap_or_default()
        };
        let export = if self.export_principals.is_empty() {
            default_principal("export-another-account-rds-snapshot-to-s3")
        } else {
            self.export_principals.clone()
        };
        let catalog = if self.catalog_principals.is_empty() {
            default_principal("update-glue-catalog-tables")
        } else {
            self.catalog_principals.clone()
        };

        let mut output_prefix = self.workspace.output_prefix.trim_start_matches('/').to_string();
        if !output_prefix.ends_with('/') {
            output_prefix.push('/');
        }

        Deployment {
            environment: env,
            region: self.region.clone(),
            platform_account_id: self.platform_account_id.clone(),
            source_account_id: self.source_account_id.clone(),
            cluster_identifier: self.cluster_identifier.clone(),
            database_name: self.database_name.clone(),
            export_role_name: self.export_role_name.clone(),
            kms_key_arn: self.kms_key_arn.clone(),
            staging_bucket: self.staging_bucket(env),
            catalog_database: self.catalog_database.clone(),
            workspace: WorkspaceSettings {
                name: self
                    .workspace
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("test-{}", env)),
                result_bucket: self
                    .workspace
                    .result_bucket
                    .clone()
                    .unwrap_or_else(|| format!("{}-athena-query-result-{}", project_name, env)),
                output_prefix,
                encryption: self.workspace.encryption,
                kms_key_arn: self.workspace.kms_key_arn.clone(),
                enforce_configuration: self.workspace.enforce_configuration,
            },
            principals: PrincipalAllowList { export, catalog },
            tables: self.tables.clone(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from a specific file (CLI --config flag)
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Parse a TOML document, apply no overrides, validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Deployments for every configured environment
    pub fn deployments(&self) -> BTreeMap<Environment, Deployment> {
        self.environments
            .iter()
            .map(|(env, cfg)| (*env, cfg.to_deployment(*env, &self.project_name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        listen_addr = "127.0.0.1:9000"
        log_level = "debug"
        log_format = "json"

        [staging]
        backend = "memory"

        [environments.dev]
        platform_account_id = "111111111111"
        source_account_id = "222222222222"
        cluster_identifier = "db-1"
        database_name = "app"
        kms_key_arn = "arn:aws:kms:ap-northeast-1:111111111111:key/abcd"

        [[environments.dev.tables]]
        name = "users"
        columns = [{ name = "id", type = "bigint" }]

        [[environments.dev.tables]]
        name = "posts"
        columns = [{ name = "id", type = "bigint" }, { name = "title", type = "string" }]
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = RuntimeConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.staging.backend, StagingBackend::Memory);
        assert_eq!(config.staging.expiration_days, 3);

        let dev = &config.environments[&Environment::Dev];
        assert_eq!(dev.tables.len(), 2);
        assert_eq!(dev.tables[1].columns[1].data_type, "string");
    }

    #[test]
    fn test_deployment_defaults() {
        let config = RuntimeConfig::from_toml(SAMPLE).unwrap();
        let deployments = config.deployments();
        let dev = &deployments[&Environment::Dev];
        assert_eq!(dev.staging_bucket, "test-rds-snapshot-dev");
        assert_eq!(dev.catalog_database, "test-dwh");
        assert_eq!(dev.workspace.name, "test-dev");
        assert_eq!(
            dev.workspace.result_bucket,
            "analysis-platform-athena-query-result-dev"
        );
        assert_eq!(
            dev.principals.export,
            vec![
                "arn:aws:iam::111111111111:role/export-another-account-rds-snapshot-to-s3-lambda-exec-role-dev"
                    .to_string()
            ]
        );
        assert_eq!(dev.table_names(), vec!["users", "posts"]);
    }

    #[test]
    fn test_schedule_times() {
        let schedule = ScheduleConfig::default();
        assert_eq!(
            schedule.export_time().unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap()
        );
        let bad = ScheduleConfig {
            export_at: "5pm".into(),
            ..ScheduleConfig::default()
        };
        assert!(bad.export_time().is_err());
    }

    #[test]
    fn test_staging_backend_from_str() {
        assert_eq!("fs".parse::<StagingBackend>().unwrap(), StagingBackend::Fs);
        assert_eq!("aws".parse::<StagingBackend>().unwrap(), StagingBackend::S3);
        assert_eq!(
            "memory".parse::<StagingBackend>().unwrap(),
            StagingBackend::Memory
        );
        assert!("gcs".parse::<StagingBackend>().is_err());
    }
}
