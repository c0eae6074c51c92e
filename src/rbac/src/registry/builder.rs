//! Registry construction and lookup
//!
//! A registry is assembled once, validated as a whole, and then shared
//! read-only (typically behind an `Arc`).

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::types::{
    AssignableRoles, RegistryDefinition, RoleDefinition, RoleEntry, ScopeDefinition, ScopeEntry,
};
use crate::error::{RbacError, Result};
use crate::permission;

/// Immutable definition of scope types, roles and assignment authority
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    scopes: BTreeMap<String, ScopeDefinition>,
}

impl Registry {
    /// Start a new registry definition
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build and validate a registry from a serialisable definition
    pub fn from_definition(definition: RegistryDefinition) -> Result<Self> {
        let mut scopes = BTreeMap::new();

        for entry in definition.scopes {
            if entry.name.is_empty() {
                return Err(RbacError::InvalidRegistry(
                    "scope type name cannot be empty".to_string(),
                ));
            }
            if scopes.contains_key(&entry.name) {
                return Err(RbacError::InvalidRegistry(format!(
                    "scope type '{}' defined twice",
                    entry.name
                )));
            }
            let scope = Self::build_scope(entry)?;
            scopes.insert(scope.name.clone(), scope);
        }

        let registry = Self { scopes };
        registry.check_parents()?;

        debug!("Registry built with {} scope types", registry.scopes.len());
        Ok(registry)
    }

    /// Parse a JSON registry definition
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: RegistryDefinition = serde_json::from_str(json)
            .map_err(|e| RbacError::InvalidRegistry(format!("malformed definition: {}", e)))?;
        Self::from_definition(definition)
    }

    /// Serialisable form of this registry
    pub fn to_definition(&self) -> RegistryDefinition {
        RegistryDefinition {
            scopes: self
                .scopes
                .values()
                .map(|scope| ScopeEntry {
                    name: scope.name.clone(),
                    parent: scope.parent.clone(),
                    roles: scope
                        .roles
                        .values()
                        .map(|role| RoleEntry {
                            name: role.name.clone(),
                            permissions: role.permissions.clone(),
                            can_assign: role.assignable.to_names(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn build_scope(entry: ScopeEntry) -> Result<ScopeDefinition> {
        let declared: BTreeSet<&str> = entry.roles.iter().map(|r| r.name.as_str()).collect();
        let mut roles = BTreeMap::new();

        for role in &entry.roles {
            if role.name.is_empty() {
                return Err(RbacError::InvalidRegistry(format!(
                    "scope type '{}' has a role with an empty name",
                    entry.name
                )));
            }
            if roles.contains_key(&role.name) {
                return Err(RbacError::InvalidRegistry(format!(
                    "role '{}' defined twice in scope type '{}'",
                    role.name, entry.name
                )));
            }

            for pattern in &role.permissions {
                permission::validate(pattern)?;
            }

            for target in &role.can_assign {
                if target != permission::WILDCARD && !declared.contains(target.as_str()) {
                    return Err(RbacError::InvalidRegistry(format!(
                        "role '{}' in scope type '{}' can assign undefined role '{}'",
                        role.name, entry.name, target
                    )));
                }
            }

            roles.insert(
                role.name.clone(),
                RoleDefinition {
                    name: role.name.clone(),
                    permissions: role.permissions.clone(),
                    assignable: AssignableRoles::from_names(&role.can_assign),
                },
            );
        }

        Ok(ScopeDefinition {
            name: entry.name,
            parent: entry.parent,
            roles,
        })
    }

    fn check_parents(&self) -> Result<()> {
        for scope in self.scopes.values() {
            let mut seen = BTreeSet::from([scope.name.as_str()]);
            let mut current = scope;

            while let Some(parent) = current.parent.as_deref() {
                let Some(next) = self.scopes.get(parent) else {
                    return Err(RbacError::InvalidRegistry(format!(
                        "scope type '{}' declares undefined parent '{}'",
                        current.name, parent
                    )));
                };
                if !seen.insert(parent) {
                    return Err(RbacError::InvalidRegistry(format!(
                        "scope hierarchy cycle through '{}'",
                        parent
                    )));
                }
                current = next;
            }
        }
        Ok(())
    }

    /// Definition of `scope_type`, if any
    pub fn get_scope(&self, scope_type: &str) -> Option<&ScopeDefinition> {
        self.scopes.get(scope_type)
    }

    /// Definition of `role` within `scope_type`, if any
    pub fn role(&self, scope_type: &str, role: &str) -> Option<&RoleDefinition> {
        self.scopes.get(scope_type).and_then(|s| s.role(role))
    }

    /// Ensure `role` exists for `scope_type`
    ///
    /// Fails with `InvalidScope` for an unknown scope type and `InvalidRole`
    /// for a role the scope type does not define.
    pub fn validate_role(&self, role: &str, scope_type: &str) -> Result<&RoleDefinition> {
        let scope = self
            .scopes
            .get(scope_type)
            .ok_or_else(|| RbacError::InvalidScope {
                scope_type: scope_type.to_string(),
            })?;

        scope.role(role).ok_or_else(|| RbacError::InvalidRole {
            role: role.to_string(),
            scope_type: scope_type.to_string(),
        })
    }

    pub fn scope_types(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Parent chain of `scope_type`, nearest first
    pub fn ancestors(&self, scope_type: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.scopes.get(scope_type);

        while let Some(parent) = current.and_then(|s| s.parent.as_deref()) {
            chain.push(parent);
            current = self.scopes.get(parent);
        }
        chain
    }

    /// Every concrete (wildcard-free) permission declared in `scope_type`
    pub fn known_permissions(&self, scope_type: &str) -> Vec<&str> {
        let Some(scope) = self.scopes.get(scope_type) else {
            return Vec::new();
        };

        let known: BTreeSet<&str> = scope
            .roles
            .values()
            .flat_map(|role| role.permissions.iter())
            .map(String::as_str)
            .filter(|p| !p.split(permission::SEPARATOR).any(|s| s == permission::WILDCARD))
            .collect();

        known.into_iter().collect()
    }
}

/// Builder for [`Registry`]
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definition: RegistryDefinition,
}

impl RegistryBuilder {
    /// Define a scope type; roles are declared in the closure
    pub fn scope(
        mut self,
        name: impl Into<String>,
        define: impl FnOnce(ScopeBuilder) -> ScopeBuilder,
    ) -> Self {
        let scope = define(ScopeBuilder {
            entry: ScopeEntry {
                name: name.into(),
                ..Default::default()
            },
        });
        self.definition.scopes.push(scope.entry);
        self
    }

    /// Validate and freeze the registry
    pub fn build(self) -> Result<Registry> {
        Registry::from_definition(self.definition)
    }
}

/// Builder for one scope type
#[derive(Debug)]
pub struct ScopeBuilder {
    entry: ScopeEntry,
}

impl ScopeBuilder {
    pub fn parent(mut self, scope_type: impl Into<String>) -> Self {
        self.entry.parent = Some(scope_type.into());
        self
    }

    pub fn role(
        mut self,
        name: impl Into<String>,
        define: impl FnOnce(RoleBuilder) -> RoleBuilder,
    ) -> Self {
        let role = define(RoleBuilder {
            entry: RoleEntry {
                name: name.into(),
                ..Default::default()
            },
        });
        self.entry.roles.push(role.entry);
        self
    }
}

/// Builder for one role
#[derive(Debug)]
pub struct RoleBuilder {
    entry: RoleEntry,
}

impl RoleBuilder {
    pub fn permissions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entry.permissions.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Roles a holder may assign; `*` means any role of the scope type
    pub fn can_assign<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entry.can_assign.extend(roles.into_iter().map(Into::into));
        self
    }
}
