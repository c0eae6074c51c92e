//! Core role assignment types

use crate::error::{RbacError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scope id meaning "every instance of this scope type"
pub const WILDCARD_SCOPE_ID: &str = "*";

/// Scope id match used by every authorization question
///
/// A stored `*` covers any queried id, and a queried `*` matches any stored id.
pub fn scope_id_matches(stored: &str, queried: &str) -> bool {
    stored == queried || stored == WILDCARD_SCOPE_ID || queried == WILDCARD_SCOPE_ID
}

/// A (type, id) pair identifying a permission boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeRef {
    pub scope_type: String,
    pub scope_id: String,
}

impl ScopeRef {
    pub fn new(scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    /// Scope covering every instance of `scope_type`
    pub fn all(scope_type: impl Into<String>) -> Self {
        Self::new(scope_type, WILDCARD_SCOPE_ID)
    }

    pub fn is_wildcard(&self) -> bool {
        self.scope_id == WILDCARD_SCOPE_ID
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type, self.scope_id)
    }
}

/// A persisted (user, role, scope) grant
///
/// Unique on (user id, role, scope type, scope id). Parent scope fields are
/// denormalised from the scope hierarchy at assignment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    pub role: String,
    pub scope_type: String,
    pub scope_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scope_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scope_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

impl RoleAssignment {
    pub fn new(
        user_id: impl Into<String>,
        role: impl Into<String>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
            parent_scope_type: None,
            parent_scope_id: None,
            assigned_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent: ScopeRef) -> Self {
        self.parent_scope_type = Some(parent.scope_type);
        self.parent_scope_id = Some(parent.scope_id);
        self
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef::new(self.scope_type.clone(), self.scope_id.clone())
    }

    pub fn parent(&self) -> Option<ScopeRef> {
        match (&self.parent_scope_type, &self.parent_scope_id) {
            (Some(t), Some(id)) => Some(ScopeRef::new(t.clone(), id.clone())),
            _ => None,
        }
    }

    /// Wildcard-aware scope match
    pub fn covers(&self, scope_type: &str, scope_id: &str) -> bool {
        self.scope_type == scope_type && scope_id_matches(&self.scope_id, scope_id)
    }

    /// Exact identity match on the uniqueness key
    pub fn is_same_grant(&self, user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> bool {
        self.user_id == user_id
            && self.role == role
            && self.scope_type == scope_type
            && self.scope_id == scope_id
    }
}

/// A requested (user, role, scope) grant, as passed to batch operations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleGrant {
    pub user_id: String,
    pub role: String,
    pub scope_type: String,
    pub scope_id: String,
}

impl RoleGrant {
    pub fn new(
        user_id: impl Into<String>,
        role: impl Into<String>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef::new(self.scope_type.clone(), self.scope_id.clone())
    }
}

/// Every assignment held by one user, loaded per check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRoles {
    user_id: String,
    assignments: Vec<RoleAssignment>,
}

impl UserRoles {
    pub fn new(user_id: impl Into<String>, assignments: Vec<RoleAssignment>) -> Self {
        Self {
            user_id: user_id.into(),
            assignments,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn assignments(&self) -> &[RoleAssignment] {
        &self.assignments
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Role names held on exactly this scope (no wildcard expansion)
    pub fn exact_role_names(&self, scope_type: &str, scope_id: &str) -> BTreeSet<String> {
        self.assignments
            .iter()
            .filter(|a| a.scope_type == scope_type && a.scope_id == scope_id)
            .map(|a| a.role.clone())
            .collect()
    }

    /// Whether the exact (role, scope) grant exists
    pub fn holds_exact(&self, role: &str, scope_type: &str, scope_id: &str) -> bool {
        self.assignments
            .iter()
            .any(|a| a.role == role && a.scope_type == scope_type && a.scope_id == scope_id)
    }
}

/// What happened to an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Assigned,
    Revoked,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of an assignment change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: String,
    pub action: AuditAction,
    pub target_user_id: String,
    pub role: String,
    pub scope_type: String,
    pub scope_id: String,
    /// Actor's role names on the scope when the action ran
    #[serde(default)]
    pub actor_roles: Vec<String>,
    /// Target's role names on the scope before the change
    #[serde(default)]
    pub previous_roles: Vec<String>,
    /// Target's role names on the scope after the change
    #[serde(default)]
    pub new_roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry for `action` with request metadata copied from `ctx`
    pub fn new(
        ctx: &AuditContext,
        actor_id: &str,
        action: AuditAction,
        assignment: &RoleAssignment,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor_id.to_string(),
            action,
            target_user_id: assignment.user_id.clone(),
            role: assignment.role.clone(),
            scope_type: assignment.scope_type.clone(),
            scope_id: assignment.scope_id.clone(),
            actor_roles: Vec::new(),
            previous_roles: Vec::new(),
            new_roles: Vec::new(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            request_id: ctx.request_id.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn with_role_sets(
        mut self,
        actor_roles: Vec<String>,
        previous_roles: Vec<String>,
        new_roles: Vec<String>,
    ) -> Self {
        self.actor_roles = actor_roles;
        self.previous_roles = previous_roles;
        self.new_roles = new_roles;
        self
    }
}

/// Acting identity and request metadata threaded through every call
///
/// Writes require an actor id. Cancellation and deadline are optional and
/// only ever imposed by the caller.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    actor_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl AuditContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting as `actor_id`
    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self::new().with_actor(actor_id)
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Actor id, or `NoActorId` when absent or empty
    pub fn require_actor(&self) -> Result<&str> {
        self.actor_id().ok_or(RbacError::NoActorId)
    }

    /// Fails once the caller has cancelled or the deadline has passed
    pub fn check_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RbacError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(RbacError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Rejects empty user ids
pub(crate) fn require_user(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        Err(RbacError::NoUserId)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_id_matching() {
        assert!(scope_id_matches("org1", "org1"));
        assert!(scope_id_matches("*", "org1"));
        assert!(scope_id_matches("org1", "*"));
        assert!(!scope_id_matches("org1", "org2"));
    }

    #[test]
    fn test_assignment_parent() {
        let a = RoleAssignment::new("alice", "editor", "project", "p1")
            .with_parent(ScopeRef::new("organization", "org1"));

        assert_eq!(a.parent(), Some(ScopeRef::new("organization", "org1")));
        assert_eq!(a.scope().to_string(), "project:p1");
        assert!(a.covers("project", "p1"));
        assert!(!a.covers("organization", "p1"));
    }

    #[test]
    fn test_user_roles_exact_names() {
        let roles = UserRoles::new(
            "alice",
            vec![
                RoleAssignment::new("alice", "admin", "organization", "org1"),
                RoleAssignment::new("alice", "member", "organization", "org1"),
                RoleAssignment::new("alice", "viewer", "organization", "*"),
            ],
        );

        let names = roles.exact_role_names("organization", "org1");
        assert_eq!(names.len(), 2);
        assert!(names.contains("admin"));
        assert!(!names.contains("viewer"));
        assert!(roles.holds_exact("viewer", "organization", "*"));
    }

    #[test]
    fn test_audit_context_actor() {
        assert!(matches!(AuditContext::new().require_actor(), Err(RbacError::NoActorId)));
        assert!(matches!(
            AuditContext::for_actor("").require_actor(),
            Err(RbacError::NoActorId)
        ));

        let ctx = AuditContext::for_actor("alice")
            .with_ip_address("10.0.0.1")
            .with_request_id("req-1");
        assert_eq!(ctx.require_actor().unwrap(), "alice");
        assert_eq!(ctx.ip_address(), Some("10.0.0.1"));
        assert_eq!(ctx.user_agent(), None);
    }

    #[tokio::test]
    async fn test_audit_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = AuditContext::for_actor("alice").with_cancellation(token.clone());
        assert!(ctx.check_active().is_ok());

        token.cancel();
        assert!(matches!(ctx.check_active(), Err(RbacError::Cancelled)));

        let expired = AuditContext::for_actor("alice").with_deadline(Instant::now());
        assert!(matches!(expired.check_active(), Err(RbacError::DeadlineExceeded)));
    }
}
