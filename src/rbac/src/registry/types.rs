/// Scope and role definition types
///
/// Definitions are produced by the registry builder and never mutated
/// afterwards.

use crate::permission;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Roles a holder may hand out to others within the same scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignableRoles {
    /// Any role defined for the scope type (`*`)
    Any,
    /// Only the listed roles
    Only(BTreeSet<String>),
}

impl AssignableRoles {
    pub(crate) fn from_names(names: &[String]) -> Self {
        if names.iter().any(|n| n == permission::WILDCARD) {
            Self::Any
        } else {
            Self::Only(names.iter().cloned().collect())
        }
    }

    pub fn allows(&self, role: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(names) => names.contains(role),
        }
    }

    pub fn to_names(&self) -> Vec<String> {
        match self {
            Self::Any => vec![permission::WILDCARD.to_string()],
            Self::Only(names) => names.iter().cloned().collect(),
        }
    }
}

/// A named bundle of permission patterns and assignment authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefinition {
    pub(crate) name: String,
    pub(crate) permissions: Vec<String>,
    pub(crate) assignable: AssignableRoles,
}

impl RoleDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permission patterns, in declaration order
    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn assignable(&self) -> &AssignableRoles {
        &self.assignable
    }

    /// Whether a holder of this role may assign `role`
    pub fn can_assign(&self, role: &str) -> bool {
        self.assignable.allows(role)
    }

    /// Whether any pattern of this role matches `permission`
    pub fn grants(&self, permission: &str) -> bool {
        permission::matches_any(&self.permissions, permission)
    }
}

/// A scope type with its roles and optional parent scope type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDefinition {
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) roles: BTreeMap<String, RoleDefinition>,
}

impl ScopeDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn role(&self, name: &str) -> Option<&RoleDefinition> {
        self.roles.get(name)
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values()
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

/// Serialisable registry definition, e.g. loaded from JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDefinition {
    #[serde(default)]
    pub scopes: Vec<ScopeEntry>,
}

/// Serialisable scope type definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleEntry>,
}

/// Serialisable role definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub can_assign: Vec<String>,
}
