//! Least-privilege scope plan
//!
//! Renders the scope each purpose would be granted, per environment, without
//! issuing anything. Run-scoped resources use a `{run_id}` placeholder.

use serde_json::{json, Map, Value};
use snapshot2catalog_core::{Deployment, Environment, Purpose};
use snapshot2catalog_trust::required_scope;
use std::collections::BTreeMap;

pub const RUN_PLACEHOLDER: &str = "{run_id}";

pub fn scope_plan(deployments: &BTreeMap<Environment, Deployment>) -> Value {
    let mut plan = Map::new();
    for (environment, deployment) in deployments {
        let mut purposes = Map::new();
        for purpose in [Purpose::Export, Purpose::Catalog] {
            let entry = match required_scope(deployment, RUN_PLACEHOLDER, purpose) {
                Ok(scope) => json!({
                    "principals": deployment.allowed_principals(purpose),
                    "scope": scope,
                }),
                Err(err) => json!({
                    "error": err.to_string(),
                    "code": err.code().as_str(),
                }),
            };
            purposes.insert(purpose.to_string(), entry);
        }
        plan.insert(environment.to_string(), Value::Object(purposes));
    }
    Value::Object(plan)
}
