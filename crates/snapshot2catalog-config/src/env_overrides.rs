use crate::{EnvironmentConfig, LogFormat, RuntimeConfig, S3Config, StagingBackend};
use anyhow::{anyhow, Context, Result};
use snapshot2catalog_core::Environment;

pub const ENV_PREFIX: &str = "SNAPSHOT2CATALOG_";

/// Abstraction over environment-variable lookups so tests can supply their own
/// source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the SNAPSHOT2CATALOG_ prefix
    /// Used for AWS standard variables (AWS_REGION, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    if let Some(name) = get_env_string(env, "PROJECT_NAME") {
        config.project_name = name;
    }

    // Server configuration (listen addr, log level/format)
    if let Some(addr) = get_env_string(env, "LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Some(level) = get_env_string(env, "LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT") {
        config.server.log_format = format
            .parse::<LogFormat>()
            .context("Invalid SNAPSHOT2CATALOG_LOG_FORMAT value")?;
    }

    // Schedule
    if let Some(enabled) = get_env_bool(env, "SCHEDULE_ENABLED")? {
        config.schedule.enabled = enabled;
    }
    if let Some(at) = get_env_string(env, "EXPORT_AT") {
        config.schedule.export_at = at;
    }
    if let Some(at) = get_env_string(env, "CATALOG_AT") {
        config.schedule.catalog_at = at;
    }

    // Pipeline timing
    if let Some(secs) = get_env_u64(env, "POLL_MAX_WAIT_SECS")? {
        config.pipeline.poll_max_wait_secs = secs;
    }
    if let Some(attempts) = get_env_u32(env, "VENDOR_MAX_ATTEMPTS")? {
        config.pipeline.vendor_max_attempts = attempts;
    }
    if let Some(attempts) = get_env_u32(env, "CATALOG_MAX_ATTEMPTS")? {
        config.pipeline.catalog_max_attempts = attempts;
    }
    if let Some(hours) = get_env_u64(env, "RUN_RETENTION_HOURS")? {
        config.pipeline.run_retention_hours = hours;
    }

    // Staging store
    if let Some(backend) = get_env_string(env, "STAGING_BACKEND") {
        config.staging.backend = backend
            .parse::<StagingBackend>()
            .context("Invalid SNAPSHOT2CATALOG_STAGING_BACKEND value")?;
    }
    if let Some(path) = get_env_string(env, "STAGING_PATH") {
        config.staging.fs.get_or_insert_with(Default::default).path = path;
    }
    if let Some(arn) = get_env_string(env, "CALLER_ARN") {
        config.identity.caller_arn = arn;
    }
    if let Some(path) = get_env_string(env, "CATALOG_PATH") {
        config.staging.catalog_path = path;
    }
    // AWS standard region (without prefix) first, prefixed value wins
    if let Some(region) = env.get_raw("AWS_REGION") {
        ensure_s3(config).region = region;
    }
    if let Some(region) = get_env_string(env, "S3_REGION") {
        ensure_s3(config).region = region;
    }
    if let Some(endpoint) = get_env_string(env, "S3_ENDPOINT") {
        ensure_s3(config).endpoint = Some(endpoint);
    }

    // Per-environment resource identifiers, e.g. SNAPSHOT2CATALOG_DEV_CLUSTER_IDENTIFIER
    for environment in Environment::all() {
        apply_environment_overrides(config, environment, env);
    }

    Ok(())
}

fn apply_environment_overrides<E: EnvSource>(
    config: &mut RuntimeConfig,
    environment: Environment,
    env: &E,
) {
    let prefix = environment.as_str().to_uppercase();
    let lookup = |field: &str| get_env_string(env, &format!("{}_{}", prefix, field));

    let fields = [
        "PLATFORM_ACCOUNT_ID",
        "SOURCE_ACCOUNT_ID",
        "CLUSTER_IDENTIFIER",
        "DATABASE_NAME",
        "KMS_KEY_ARN",
        "STAGING_BUCKET",
        "REGION",
    ];
    let values: Vec<(&str, String)> = fields
        .iter()
        .filter_map(|field| lookup(field).map(|value| (*field, value)))
        .collect();
    if values.is_empty() {
        return;
    }

    let section = ensure_environment(config, environment);
    for (field, value) in values {
        match field {
            "PLATFORM_ACCOUNT_ID" => section.platform_account_id = Some(value),
            "SOURCE_ACCOUNT_ID" => section.source_account_id = Some(value),
            "CLUSTER_IDENTIFIER" => section.cluster_identifier = Some(value),
            "DATABASE_NAME" => section.database_name = Some(value),
            "KMS_KEY_ARN" => section.kms_key_arn = Some(value),
            "STAGING_BUCKET" => section.staging_bucket = Some(value),
            "REGION" => section.region = value,
            _ => {}
        }
    }
}

fn ensure_environment(config: &mut RuntimeConfig, environment: Environment) -> &mut EnvironmentConfig {
    config.environments.entry(environment).or_default()
}

fn ensure_s3(config: &mut RuntimeConfig) -> &mut S3Config {
    config.staging.s3.get_or_insert_with(|| S3Config {
        region: String::new(),
        endpoint: None,
    })
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.trim().is_empty())
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_u32<E: EnvSource>(env: &E, key: &str) -> Result<Option<u32>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val
                .parse::<u32>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val.parse::<bool>().map_err(|e| {
                anyhow!(
                    "Failed to parse {}{} (expected bool): {}",
                    ENV_PREFIX,
                    key,
                    e
                )
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<String, String>);

    impl MapEnv {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl EnvSource for MapEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(&format!("{}{}", ENV_PREFIX, key)).cloned()
        }

        fn get_raw(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn test_server_and_staging_overrides() {
        let env = MapEnv::new(&[
            ("SNAPSHOT2CATALOG_LISTEN_ADDR", "127.0.0.1:1234"),
            ("SNAPSHOT2CATALOG_LOG_FORMAT", "json"),
            ("SNAPSHOT2CATALOG_STAGING_BACKEND", "s3"),
            ("AWS_REGION", "us-east-1"),
            ("SNAPSHOT2CATALOG_SCHEDULE_ENABLED", "false"),
        ]);
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:1234");
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.staging.backend, StagingBackend::S3);
        assert_eq!(config.staging.s3.as_ref().unwrap().region, "us-east-1");
        assert!(!config.schedule.enabled);
    }

    #[test]
    fn test_environment_overrides_create_section() {
        let env = MapEnv::new(&[
            ("SNAPSHOT2CATALOG_PROD_CLUSTER_IDENTIFIER", "prod-db"),
            ("SNAPSHOT2CATALOG_PROD_SOURCE_ACCOUNT_ID", "333333333333"),
        ]);
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();

        let prod = &config.environments[&Environment::Prod];
        assert_eq!(prod.cluster_identifier.as_deref(), Some("prod-db"));
        assert_eq!(prod.source_account_id.as_deref(), Some("333333333333"));
        assert_eq!(prod.catalog_database, "test-dwh");
        assert!(!config.environments.contains_key(&Environment::Dev));
    }

    #[test]
    fn test_invalid_numeric_override_is_an_error() {
        let env = MapEnv::new(&[("SNAPSHOT2CATALOG_VENDOR_MAX_ATTEMPTS", "many")]);
        let mut config = RuntimeConfig::default();
        let err = apply_env_overrides(&mut config, &env).unwrap_err();
        assert!(err.to_string().contains("VENDOR_MAX_ATTEMPTS"));
    }
}
