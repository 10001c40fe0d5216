// snapshot2catalog-trust - least-privilege trust grants
//
// The broker checks the caller against the per-purpose allow-list, derives the
// minimal resource scope for the Run, assumes the stage role with that scope as
// session policy, and caches the grant per (run, purpose) until it expires or
// the Run ends.

pub mod broker;
pub mod identity;
pub mod scope;

pub use broker::{GrantDurations, TrustBroker};
pub use identity::{AssumeRoleRequest, IdentityProvider, StaticIdentity};
pub use scope::required_scope;
