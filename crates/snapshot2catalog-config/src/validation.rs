// Configuration validation
//
// Validates that required fields are present and values are sensible.
// Missing resource identifiers of an environment are not errors here; they
// surface as scope resolution failures when a Run needs them.

use crate::*;
use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_pipeline_config(&config.pipeline)?;
    validate_schedule_config(&config.schedule)?;
    validate_staging_config(&config.staging)?;
    if let Err(reason) = snapshot2catalog_core::Arn::parse(config.identity.caller_arn.as_str()) {
        bail!("identity.caller_arn is invalid: {}", reason);
    }

    if config.environments.is_empty() {
        warn!("No environments configured; triggers will be rejected");
    }
    for (env, section) in &config.environments {
        validate_environment_config(*env, section)?;
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        bail!(
            "server.listen_addr '{}' is not a socket address",
            config.listen_addr
        );
    }
    Ok(())
}

fn validate_pipeline_config(config: &PipelineConfig) -> Result<()> {
    if config.poll_initial_secs == 0 {
        bail!("pipeline.poll_initial_secs must be greater than 0");
    }
    if config.poll_max_interval_secs < config.poll_initial_secs {
        bail!("pipeline.poll_max_interval_secs must be >= pipeline.poll_initial_secs");
    }
    if config.poll_multiplier < 1.0 {
        bail!("pipeline.poll_multiplier must be at least 1.0");
    }
    if config.poll_max_wait_secs == 0 {
        bail!("pipeline.poll_max_wait_secs must be greater than 0");
    }
    if config.vendor_max_attempts == 0 {
        bail!("pipeline.vendor_max_attempts must be greater than 0");
    }
    if config.catalog_max_attempts == 0 {
        bail!("pipeline.catalog_max_attempts must be greater than 0");
    }
    if config.export_grant_secs == 0 || config.catalog_grant_secs == 0 {
        bail!("pipeline grant durations must be greater than 0");
    }
    if config.export_grant_secs < config.poll_max_wait_secs {
        warn!(
            export_grant_secs = config.export_grant_secs,
            poll_max_wait_secs = config.poll_max_wait_secs,
            "export grant may expire before the export wait gives up"
        );
    }
    Ok(())
}

fn validate_schedule_config(config: &ScheduleConfig) -> Result<()> {
    let export_at = config.export_time()?;
    let catalog_at = config.catalog_time()?;
    if export_at == catalog_at {
        bail!("schedule.export_at and schedule.catalog_at must differ");
    }
    Ok(())
}

fn validate_staging_config(config: &StagingConfig) -> Result<()> {
    if config.expiration_days == 0 {
        bail!("staging.expiration_days must be greater than 0");
    }
    if !config.block_public_access {
        warn!("staging.block_public_access is disabled");
    }

    match config.backend {
        StagingBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                anyhow::anyhow!("fs staging backend requires 'fs' configuration")
            })?;
            if fs.path.is_empty() {
                bail!("staging.fs.path must not be empty");
            }
        }
        StagingBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                anyhow::anyhow!("s3 staging backend requires 's3' configuration")
            })?;
            if s3.region.is_empty() {
                bail!("staging.s3.region is required for S3 backend");
            }
        }
        StagingBackend::Memory => return Ok(()),
    }
    if config.catalog_path.trim().is_empty() {
        bail!("staging.catalog_path must not be empty");
    }
    Ok(())
}

fn validate_environment_config(env: Environment, config: &EnvironmentConfig) -> Result<()> {
    if config.region.trim().is_empty() {
        bail!("environments.{}.region must not be empty", env);
    }
    if config.catalog_database.trim().is_empty() {
        bail!("environments.{}.catalog_database must not be empty", env);
    }
    if config.export_role_name.trim().is_empty() {
        bail!("environments.{}.export_role_name must not be empty", env);
    }

    if config.tables.is_empty() {
        bail!("environments.{}.tables must declare at least one table", env);
    }
    let mut names = HashSet::new();
    for table in &config.tables {
        if table.name.trim().is_empty() || table.name.contains(['/', '.']) {
            bail!(
                "environments.{}.tables: '{}' is not a valid table name",
                env,
                table.name
            );
        }
        if !names.insert(table.name.as_str()) {
            bail!("environments.{}.tables: duplicate table '{}'", env, table.name);
        }
        if table.columns.is_empty() {
            bail!(
                "environments.{}.tables.{} must declare at least one column",
                env,
                table.name
            );
        }
        let mut columns = HashSet::new();
        for column in &table.columns {
            if !columns.insert(column.name.as_str()) {
                bail!(
                    "environments.{}.tables.{}: duplicate column '{}'",
                    env,
                    table.name,
                    column.name
                );
            }
        }
    }

    if config.workspace.output_prefix.trim().trim_matches('/').is_empty() {
        bail!(
            "environments.{}.workspace.output_prefix must name a folder below the bucket root",
            env
        );
    }
    if config.workspace.encryption == Encryption::SseKms && config.workspace.kms_key_arn.is_none() {
        bail!(
            "environments.{}.workspace.kms_key_arn is required for SSE_KMS",
            env
        );
    }
    Ok(())
}
