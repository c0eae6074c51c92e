//! Authorization decisions over one user's assignments
//!
//! A [`Checker`] is built from a user's loaded [`UserRoles`] and the shared
//! [`Registry`]. Every question is answered from that snapshot, so a checker
//! can be shared across tasks freely once constructed.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{RbacError, Result};
use crate::permission;
use crate::registry::Registry;
use crate::store::AssignmentStore;
use crate::types::{scope_id_matches, RoleAssignment, ScopeRef, UserRoles, WILDCARD_SCOPE_ID};

/// Read-only authorization view of one subject
#[derive(Clone)]
pub struct Checker {
    user_id: String,
    roles: UserRoles,
    registry: Arc<Registry>,
    store: Option<Arc<dyn AssignmentStore>>,
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker")
            .field("user_id", &self.user_id)
            .field("assignments", &self.roles.len())
            .finish()
    }
}

impl Checker {
    pub fn new(user_id: impl Into<String>, roles: UserRoles, registry: Arc<Registry>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
            registry,
            store: None,
        }
    }

    /// Attach a store for scope hierarchy lookups
    pub fn with_store(mut self, store: Arc<dyn AssignmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn roles(&self) -> &UserRoles {
        &self.roles
    }

    fn held_in<'a>(
        &'a self,
        scope_type: &'a str,
        scope_id: &'a str,
    ) -> impl Iterator<Item = &'a RoleAssignment> + 'a {
        self.roles
            .assignments()
            .iter()
            .filter(move |a| a.covers(scope_type, scope_id))
    }

    /// Whether the subject holds `role` on the scope
    ///
    /// A stored `*` scope id covers every concrete id, and a queried `*`
    /// matches any stored id.
    pub fn can(&self, role: &str, scope_type: &str, scope_id: &str) -> bool {
        self.held_in(scope_type, scope_id).any(|a| a.role == role)
    }

    /// Whether any held role on the scope grants `permission`
    pub fn has_permission(&self, permission: &str, scope_type: &str, scope_id: &str) -> bool {
        permission::matches_any(self.permission_patterns(scope_type, scope_id), permission)
    }

    pub fn has_any_role<I, S>(&self, roles: I, scope_type: &str, scope_id: &str) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        roles
            .into_iter()
            .any(|role| self.can(role.as_ref(), scope_type, scope_id))
    }

    /// Whether some held role on the scope may assign `target_role`
    ///
    /// Authority over `*` requires a role held on `*` itself; holding a role
    /// on one instance grants nothing over every instance.
    pub fn can_assign_role(&self, target_role: &str, scope_type: &str, scope_id: &str) -> bool {
        self.held_in(scope_type, scope_id)
            .filter(|a| scope_id != WILDCARD_SCOPE_ID || a.scope_id == WILDCARD_SCOPE_ID)
            .any(|a| {
            self.registry
                .role(scope_type, &a.role)
                .is_some_and(|def| def.can_assign(target_role))
            })
    }

    /// Role names held on the scope
    pub fn roles_in(&self, scope_type: &str, scope_id: &str) -> BTreeSet<String> {
        self.held_in(scope_type, scope_id)
            .map(|a| a.role.clone())
            .collect()
    }

    /// Union of permission patterns granted on the scope
    pub fn permission_patterns(&self, scope_type: &str, scope_id: &str) -> BTreeSet<&str> {
        self.held_in(scope_type, scope_id)
            .filter_map(|a| self.registry.role(scope_type, &a.role))
            .flat_map(|def| def.permissions().iter().map(String::as_str))
            .collect()
    }

    /// Concrete permissions from `known` granted on the scope
    pub fn effective_permissions<K: AsRef<str>>(
        &self,
        scope_type: &str,
        scope_id: &str,
        known: &[K],
    ) -> BTreeSet<String> {
        let patterns: Vec<&str> = self
            .permission_patterns(scope_type, scope_id)
            .into_iter()
            .collect();
        permission::expand_permissions(&patterns, known)
    }

    /// Ids of `scope_type` scopes under `parent` where the subject holds `role`
    ///
    /// Uses the parent reference stored on each assignment; assignments
    /// without one are resolved through the store's scope hierarchy when a
    /// store is attached.
    pub async fn descendant_scope_ids(
        &self,
        role: &str,
        scope_type: &str,
        parent: &ScopeRef,
    ) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();

        for assignment in self
            .roles
            .assignments()
            .iter()
            .filter(|a| a.role == role && a.scope_type == scope_type)
        {
            let resolved = match assignment.parent() {
                Some(p) => Some(p),
                None => match &self.store {
                    Some(store) => store
                        .parent_scope(&assignment.scope_type, &assignment.scope_id)
                        .await
                        .map_err(|e| RbacError::database("resolve parent scope", e))?,
                    None => None,
                },
            };

            if let Some(p) = resolved {
                if p.scope_type == parent.scope_type && scope_id_matches(&p.scope_id, &parent.scope_id) {
                    ids.insert(assignment.scope_id.clone());
                }
            }
        }

        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .scope("organization", |s| {
                    s.role("admin", |r| {
                        r.permissions(["members.*", "settings.*"])
                            .can_assign(["member"])
                    })
                    .role("member", |r| r.permissions(["projects.create"]))
                    .role("owner", |r| r.permissions(["*"]).can_assign(["*"]))
                })
                .scope("project", |s| {
                    s.parent("organization")
                        .role("reader", |r| r.permissions(["files.read"]))
                        .role("writer", |r| r.permissions(["files.write"]))
                })
                .build()
                .unwrap(),
        )
    }

    fn checker(assignments: Vec<RoleAssignment>) -> Checker {
        Checker::new("alice", UserRoles::new("alice", assignments), registry())
    }

    #[test]
    fn test_can_exact_scope() {
        let c = checker(vec![RoleAssignment::new("alice", "admin", "organization", "org1")]);

        assert!(c.can("admin", "organization", "org1"));
        assert!(!c.can("admin", "organization", "org2"));
        assert!(!c.can("member", "organization", "org1"));
        assert!(!c.can("admin", "project", "org1"));
    }

    #[test]
    fn test_can_wildcard_scope() {
        let c = checker(vec![RoleAssignment::new("alice", "reader", "project", "*")]);
        assert!(c.can("reader", "project", "anything"));
        assert!(c.can("reader", "project", "p42"));

        let c = checker(vec![RoleAssignment::new("alice", "reader", "project", "p1")]);
        assert!(c.can("reader", "project", "*"));
    }

    #[test]
    fn test_permission_union_across_roles() {
        let c = checker(vec![
            RoleAssignment::new("alice", "reader", "project", "p1"),
            RoleAssignment::new("alice", "writer", "project", "p1"),
        ]);

        assert!(c.has_permission("files.read", "project", "p1"));
        assert!(c.has_permission("files.write", "project", "p1"));
        assert!(!c.has_permission("files.delete", "project", "p1"));
        assert!(!c.has_permission("files.write", "project", "p2"));
    }

    #[test]
    fn test_wildcard_permission() {
        let c = checker(vec![RoleAssignment::new("alice", "admin", "organization", "org1")]);

        assert!(c.has_permission("members.invite", "organization", "org1"));
        assert!(c.has_permission("settings.billing", "organization", "org1"));
        assert!(!c.has_permission("projects.create", "organization", "org1"));
    }

    #[test]
    fn test_has_any_role() {
        let c = checker(vec![RoleAssignment::new("alice", "member", "organization", "org1")]);

        assert!(c.has_any_role(["admin", "member"], "organization", "org1"));
        assert!(!c.has_any_role(["admin", "owner"], "organization", "org1"));
        assert!(!c.has_any_role(Vec::<&str>::new(), "organization", "org1"));
    }

    #[test]
    fn test_can_assign_role() {
        let admin = checker(vec![RoleAssignment::new("alice", "admin", "organization", "org1")]);
        assert!(admin.can_assign_role("member", "organization", "org1"));
        assert!(!admin.can_assign_role("admin", "organization", "org1"));
        assert!(!admin.can_assign_role("member", "organization", "org2"));

        let owner = checker(vec![RoleAssignment::new("alice", "owner", "organization", "*")]);
        assert!(owner.can_assign_role("admin", "organization", "org9"));
        assert!(owner.can_assign_role("owner", "organization", "org9"));
    }

    #[test]
    fn test_assign_authority_over_every_instance() {
        let admin = checker(vec![RoleAssignment::new("alice", "admin", "organization", "org1")]);
        assert!(admin.can("admin", "organization", "*"));
        assert!(!admin.can_assign_role("member", "organization", "*"));

        let owner = checker(vec![RoleAssignment::new("alice", "owner", "organization", "*")]);
        assert!(owner.can_assign_role("admin", "organization", "*"));
    }

    #[test]
    fn test_unknown_role_grants_nothing() {
        let c = checker(vec![RoleAssignment::new("alice", "retired", "organization", "org1")]);

        assert!(c.can("retired", "organization", "org1"));
        assert!(!c.has_permission("members.read", "organization", "org1"));
        assert!(!c.can_assign_role("member", "organization", "org1"));
    }

    #[test]
    fn test_effective_permissions() {
        let c = checker(vec![
            RoleAssignment::new("alice", "admin", "organization", "org1"),
            RoleAssignment::new("alice", "member", "organization", "org1"),
        ]);

        let known = ["members.read", "members.invite", "projects.create", "billing.view"];
        let effective = c.effective_permissions("organization", "org1", &known);

        assert_eq!(effective.len(), 3);
        assert!(!effective.contains("billing.view"));
        assert_eq!(
            c.roles_in("organization", "org1").into_iter().collect::<Vec<_>>(),
            vec!["admin", "member"]
        );
    }

    #[tokio::test]
    async fn test_descendant_scope_ids() {
        let store = MemoryStore::new();
        store.set_parent(ScopeRef::new("project", "p3"), ScopeRef::new("organization", "org1"));

        let c = checker(vec![
            RoleAssignment::new("alice", "reader", "project", "p1")
                .with_parent(ScopeRef::new("organization", "org1")),
            RoleAssignment::new("alice", "reader", "project", "p2")
                .with_parent(ScopeRef::new("organization", "org2")),
            RoleAssignment::new("alice", "reader", "project", "p3"),
            RoleAssignment::new("alice", "writer", "project", "p4")
                .with_parent(ScopeRef::new("organization", "org1")),
        ])
        .with_store(Arc::new(store));

        let ids = c
            .descendant_scope_ids("reader", "project", &ScopeRef::new("organization", "org1"))
            .await
            .unwrap();
        assert_eq!(ids, vec!["p1", "p3"]);
    }
}
