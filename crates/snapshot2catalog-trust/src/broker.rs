//! Trust Broker: issues one grant per Run and purpose

use crate::identity::{AssumeRoleRequest, IdentityProvider};
use crate::scope::required_scope;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use snapshot2catalog_core::{
    grant_id, Arn, Deployment, GrantSummary, PipelineError, Purpose, Result, RunContext, RunId,
    TrustGrant,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Session names are capped by the token service
const MAX_SESSION_NAME_LEN: usize = 64;

/// Expected stage durations used to time-box grants
#[derive(Debug, Clone, Copy)]
pub struct GrantDurations {
    pub export: Duration,
    pub catalog: Duration,
    pub safety_margin: Duration,
}

impl GrantDurations {
    pub fn lifetime(&self, purpose: Purpose) -> Duration {
        let expected = match purpose {
            Purpose::Export => self.export,
            Purpose::Catalog => self.catalog,
        };
        expected + self.safety_margin
    }
}

impl Default for GrantDurations {
    fn default() -> Self {
        Self {
            export: Duration::from_secs(6 * 3600),
            catalog: Duration::from_secs(15 * 60),
            safety_margin: Duration::from_secs(15 * 60),
        }
    }
}

pub struct TrustBroker {
    identity: Arc<dyn IdentityProvider>,
    durations: GrantDurations,
    grants: Mutex<HashMap<(RunId, Purpose), Arc<TrustGrant>>>,
}

impl TrustBroker {
    pub fn new(identity: Arc<dyn IdentityProvider>, durations: GrantDurations) -> Self {
        Self {
            identity,
            durations,
            grants: Mutex::new(HashMap::new()),
        }
    }

    pub async fn issue_grant(&self, ctx: &RunContext, purpose: Purpose) -> Result<Arc<TrustGrant>> {
        self.issue_grant_at(ctx, purpose, Utc::now()).await
    }

    /// Issue (or return the still-valid) grant for `purpose` of the Run in `ctx`.
    #[instrument(
        name = "trust.issue_grant",
        skip_all,
        fields(run_id = %ctx.run_id, environment = %ctx.environment, purpose = %purpose)
    )]
    pub async fn issue_grant_at(
        &self,
        ctx: &RunContext,
        purpose: Purpose,
        now: DateTime<Utc>,
    ) -> Result<Arc<TrustGrant>> {
        let key = (ctx.run_id, purpose);
        if let Some(existing) = self.cached(&key, now) {
            debug!(grant_id = %existing.grant_id, "Reusing grant");
            return Ok(existing);
        }

        let deployment = ctx.deployment.as_ref();
        let scope = required_scope(deployment, &ctx.staging_prefix(), purpose)?;

        let caller = self.identity.caller().await?;
        authorize(deployment, purpose, &caller)?;

        let role_arn = match purpose {
            Purpose::Export => deployment.export_role_arn()?,
            Purpose::Catalog => caller_role(&caller),
        };
        let lifetime = self.durations.lifetime(purpose);
        let expires_in = chrono::Duration::from_std(lifetime)
            .map_err(|_| PipelineError::invalid_config("grant lifetime out of range"))?;
        let session_name = session_name(&ctx.run_id, purpose);

        let credentials = self
            .identity
            .assume_role(AssumeRoleRequest {
                role_arn: role_arn.clone(),
                session_name: session_name.clone(),
                scope: scope.clone(),
                duration: lifetime,
            })
            .await?;

        let grant = Arc::new(TrustGrant {
            grant_id: grant_id(&ctx.run_id, purpose),
            run_id: ctx.run_id,
            environment: ctx.environment,
            purpose,
            principal: caller,
            role_arn,
            session_name,
            scope,
            credentials,
            issued_at: now,
            expires_at: now + expires_in,
        });

        let mut grants = self.grants.lock();
        if let Some(existing) = grants.get(&key).filter(|g| g.is_valid_at(now)) {
            return Ok(Arc::clone(existing));
        }
        grants.insert(key, Arc::clone(&grant));
        info!(
            grant_id = %grant.grant_id,
            role = %grant.role_arn,
            expires_at = %grant.expires_at,
            "Issued grant"
        );
        Ok(grant)
    }

    fn cached(&self, key: &(RunId, Purpose), now: DateTime<Utc>) -> Option<Arc<TrustGrant>> {
        let mut grants = self.grants.lock();
        match grants.get(key) {
            Some(grant) if grant.is_valid_at(now) => Some(Arc::clone(grant)),
            Some(_) => {
                grants.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop every grant of `run_id`. Returns how many were revoked.
    pub fn revoke_run(&self, run_id: &RunId) -> usize {
        let mut grants = self.grants.lock();
        let before = grants.len();
        grants.retain(|(id, _), _| id != run_id);
        let revoked = before - grants.len();
        if revoked > 0 {
            debug!(run_id = %run_id, revoked, "Revoked grants");
        }
        revoked
    }

    pub fn active_grants(&self) -> Vec<GrantSummary> {
        let mut grants: Vec<GrantSummary> =
            self.grants.lock().values().map(|g| g.summary()).collect();
        grants.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        grants
    }
}

fn authorize(deployment: &Deployment, purpose: Purpose, caller: &Arn) -> Result<()> {
    let allowed = deployment.allowed_principals(purpose);
    let role = caller_role(caller);
    if allowed
        .iter()
        .any(|p| p == caller.as_str() || p == role.as_str())
    {
        return Ok(());
    }
    warn!(principal = %caller, purpose = %purpose, "Caller not in allow-list");
    Err(PipelineError::UnauthorizedPrincipal {
        principal: caller.to_string(),
        purpose,
    })
}

/// Role behind an assumed-role session ARN; other ARNs are returned unchanged.
///
/// `arn:aws:sts::<acct>:assumed-role/<role>/<session>` maps to
/// `arn:aws:iam::<acct>:role/<role>`.
fn caller_role(caller: &Arn) -> Arn {
    let parts: Vec<&str> = caller.as_str().splitn(6, ':').collect();
    if parts.len() == 6 && parts[2] == "sts" {
        if let Some(rest) = parts[5].strip_prefix("assumed-role/") {
            let role = rest.split('/').next().unwrap_or_default();
            let mapped = format!("arn:{}:iam::{}:role/{}", parts[1], parts[4], role);
            if let Ok(arn) = Arn::parse(mapped) {
                return arn;
            }
        }
    }
    caller.clone()
}

fn session_name(run_id: &RunId, purpose: Purpose) -> String {
    let mut name = format!("snapshot2catalog-{}-{}", purpose, run_id);
    name.truncate(MAX_SESSION_NAME_LEN);
    name
}
