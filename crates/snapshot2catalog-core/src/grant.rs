//! Time-boxed, scope-limited credentials for one Run's one purpose

use crate::environment::{Environment, Purpose};
use crate::error::{PipelineError, Result};
use crate::run::RunId;
use crate::scope::{Arn, ScopeDescriptor};
use aws_credential_types::Credentials;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Deterministic grant identifier: re-issuing for the same run and purpose
/// yields the same id.
pub fn grant_id(run_id: &RunId, purpose: Purpose) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(run_id.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(purpose.as_str().as_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

#[derive(Debug, Clone)]
pub struct TrustGrant {
    pub grant_id: String,
    pub run_id: RunId,
    pub environment: Environment,
    pub purpose: Purpose,
    /// Identity that requested the grant
    pub principal: Arn,
    /// Role whose session backs the credentials
    pub role_arn: Arn,
    pub session_name: String,
    pub scope: ScopeDescriptor,
    pub credentials: Credentials,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TrustGrant {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Check the grant may be used by `run_id` for `purpose` to touch `needed` at `now`.
    pub fn verify(
        &self,
        run_id: &RunId,
        purpose: Purpose,
        needed: &ScopeDescriptor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if &self.run_id != run_id {
            return Err(PipelineError::invalid_grant(format!(
                "grant {} belongs to run {}, not {}",
                self.grant_id, self.run_id, run_id
            )));
        }
        if self.purpose != purpose {
            return Err(PipelineError::invalid_grant(format!(
                "grant {} is for {}, not {}",
                self.grant_id, self.purpose, purpose
            )));
        }
        if !self.is_valid_at(now) {
            return Err(PipelineError::invalid_grant(format!(
                "grant {} expired at {}",
                self.grant_id, self.expires_at
            )));
        }
        if !self.scope.covers(needed) {
            return Err(PipelineError::invalid_grant(format!(
                "grant {} does not cover the resources this stage needs",
                self.grant_id
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> GrantSummary {
        GrantSummary {
            grant_id: self.grant_id.clone(),
            run_id: self.run_id,
            purpose: self.purpose,
            principal: self.principal.clone(),
            role_arn: self.role_arn.clone(),
            resources: self.scope.resources().into_iter().cloned().collect(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}

/// Secret-free view of a grant for logs and API responses
#[derive(Debug, Clone, Serialize)]
pub struct GrantSummary {
    pub grant_id: String,
    pub run_id: RunId,
    pub purpose: Purpose,
    pub principal: Arn,
    pub role_arn: Arn,
    pub resources: Vec<Arn>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_id_is_deterministic() {
        let run = RunId::new();
        assert_eq!(grant_id(&run, Purpose::Export), grant_id(&run, Purpose::Export));
        assert_ne!(grant_id(&run, Purpose::Export), grant_id(&run, Purpose::Catalog));
        assert_eq!(grant_id(&run, Purpose::Export).len(), 32);
    }
}
