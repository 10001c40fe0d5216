//! Identity collaborator: who is calling, and role assumption

use async_trait::async_trait;
use aws_credential_types::Credentials;
use snapshot2catalog_core::{Arn, Result, ScopeDescriptor};
use std::time::{Duration, SystemTime};

/// Parameters of one role assumption
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    pub role_arn: Arn,
    pub session_name: String,
    /// Session policy; the resulting credentials may do no more than this
    pub scope: ScopeDescriptor,
    pub duration: Duration,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Identity the broker acts on behalf of.
    async fn caller(&self) -> Result<Arn>;

    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<Credentials>;
}

/// Fixed caller with deterministic, locally minted session credentials.
///
/// Stands in for the cloud token service when running against local
/// collaborators.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    caller: Arn,
}

impl StaticIdentity {
    pub fn new(caller: Arn) -> Self {
        Self { caller }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn caller(&self) -> Result<Arn> {
        Ok(self.caller.clone())
    }

    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<Credentials> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.role_arn.as_str().as_bytes());
        hasher.update(request.session_name.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let access_key = format!("ASIA{}", hex::encode_upper(&bytes[..8]));
        let secret = hex::encode(&bytes[8..28]);
        let token = hex::encode(bytes);
        Ok(Credentials::new(
            access_key,
            secret,
            Some(token),
            Some(SystemTime::now() + request.duration),
            "snapshot2catalog-static",
        ))
    }
}
