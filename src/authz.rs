//! Role and capability model used by the approval gate and the action handlers.
//!
//! Each role owns an explicit set of `(module, action)` capabilities. Privileged roles hold
//! every capability and may decide or list any approval request.

use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::new(value)
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role(value)
    }
}

/// The user performing an operation together with the role they act under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: impl Into<Role>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub module: String,
    pub action: String,
}

impl Capability {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    grants: HashMap<Role, HashSet<Capability>>,
    privileged: HashSet<Role>,
}

impl AccessPolicy {
    pub fn new<I, R>(privileged_roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Role>,
    {
        Self {
            grants: HashMap::new(),
            privileged: privileged_roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn grant(mut self, role: impl Into<Role>, capability: Capability) -> Self {
        self.grants.entry(role.into()).or_default().insert(capability);
        self
    }

    pub fn is_privileged(&self, role: &Role) -> bool {
        self.privileged.contains(role)
    }

    pub fn allows(&self, role: &Role, module: &str, action: &str) -> bool {
        if self.is_privileged(role) {
            return true;
        }
        self.grants
            .get(role)
            .is_some_and(|caps| caps.iter().any(|c| c.module == module && c.action == action))
    }

    pub fn capabilities(&self, role: &Role) -> Vec<&Capability> {
        self.grants
            .get(role)
            .map(|caps| caps.iter().collect())
            .unwrap_or_default()
    }
}
