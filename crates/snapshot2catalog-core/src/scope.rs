//! Typed resource-scope descriptors
//!
//! A scope is a set of statements, each pairing a set of actions with a set of
//! resource ARNs. Values are validated on construction so an over-broad grant
//! (a bare `*`, a service-wide action, a type-wide resource) cannot be expressed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Validated resource ARN
///
/// A wildcard may only terminate the resource part and must follow at least two
/// non-empty path segments (`bucket/run-id/*`, `cluster-snapshot:rds:db-1-2*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Arn(String);

impl Arn {
    pub fn parse(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let parts: Vec<&str> = value.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" {
            return Err(format!("'{}' is not an ARN", value));
        }
        if parts[1].is_empty() || parts[2].is_empty() {
            return Err(format!("'{}' has no partition or service", value));
        }
        let resource = parts[5];
        if resource.is_empty() {
            return Err(format!("'{}' has an empty resource", value));
        }
        if let Some(pos) = resource.find('*') {
            if pos != resource.len() - 1 {
                return Err(format!("'{}': wildcard must terminate the resource", value));
            }
            let segments = resource[..pos]
                .split([':', '/'])
                .filter(|s| !s.is_empty())
                .count();
            if segments < 2 {
                return Err(format!("'{}': wildcard is broader than a single owner", value));
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn service(&self) -> &str {
        self.0.split(':').nth(2).unwrap_or_default()
    }

    pub fn is_pattern(&self) -> bool {
        self.0.ends_with('*')
    }

    /// Whether this ARN (possibly a trailing-wildcard pattern) matches `other`.
    pub fn matches(&self, other: &Arn) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => other.0.starts_with(prefix),
            None => self.0 == other.0,
        }
    }
}

impl TryFrom<String> for Arn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Arn::parse(value)
    }
}

impl From<Arn> for String {
    fn from(value: Arn) -> Self {
        value.0
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated `service:Operation` action, optionally ending in a wildcard
/// after a non-empty operation prefix (`kms:GenerateDataKey*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Action(String);

impl Action {
    pub fn parse(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let Some((service, operation)) = value.split_once(':') else {
            return Err(format!("'{}' is not a service:Operation action", value));
        };
        if service.is_empty() || service.contains('*') {
            return Err(format!("'{}' has an invalid service", value));
        }
        let bare = operation.strip_suffix('*').unwrap_or(operation);
        if bare.is_empty() || bare.contains('*') {
            return Err(format!("'{}' grants more than a named operation", value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &Action) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => other.0.starts_with(prefix),
            None => self.0 == other.0,
        }
    }
}

impl TryFrom<String> for Action {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Action::parse(value)
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        value.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One allow statement: every action applies to every resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeStatement {
    pub sid: String,
    pub actions: BTreeSet<Action>,
    pub resources: BTreeSet<Arn>,
}

impl ScopeStatement {
    pub fn new<A, R>(sid: impl Into<String>, actions: A, resources: R) -> Result<Self, String>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator<Item = Arn>,
    {
        let actions = actions
            .into_iter()
            .map(|a| Action::parse(a))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let resources: BTreeSet<Arn> = resources.into_iter().collect();
        let sid = sid.into();
        if actions.is_empty() || resources.is_empty() {
            return Err(format!("statement '{}' must name actions and resources", sid));
        }
        Ok(Self {
            sid,
            actions,
            resources,
        })
    }

    fn allows(&self, action: &Action, resource: &Arn) -> bool {
        self.actions.iter().any(|a| a.matches(action))
            && self.resources.iter().any(|r| r.matches(resource))
    }
}

/// Complete scope of a grant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    pub statements: Vec<ScopeStatement>,
}

impl ScopeDescriptor {
    pub fn new(statements: Vec<ScopeStatement>) -> Self {
        Self { statements }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// All (action, resource) pairs named by the statements.
    pub fn pairs(&self) -> impl Iterator<Item = (&Action, &Arn)> {
        self.statements.iter().flat_map(|s| {
            s.actions
                .iter()
                .flat_map(move |a| s.resources.iter().map(move |r| (a, r)))
        })
    }

    pub fn resources(&self) -> BTreeSet<&Arn> {
        self.statements
            .iter()
            .flat_map(|s| s.resources.iter())
            .collect()
    }

    pub fn allows(&self, action: &Action, resource: &Arn) -> bool {
        self.statements.iter().any(|s| s.allows(action, resource))
    }

    /// True when every pair in `needed` is allowed by this scope.
    pub fn covers(&self, needed: &ScopeDescriptor) -> bool {
        needed.pairs().all(|(a, r)| self.allows(a, r))
    }

    /// True when this scope allows nothing beyond `needed`.
    pub fn is_within(&self, needed: &ScopeDescriptor) -> bool {
        self.pairs().all(|(a, r)| needed.allows(a, r))
    }
}
