//! Assignment coordinator
//!
//! [`RoleManager`] is the write path for role assignments. Every write runs
//! through the same stages:
//!
//! ```text
//! Validating -> Authorizing -> Persisting -> Auditing -> Done
//! ```
//!
//! and leaves through `Failed` from whichever stage rejected it. Audit
//! failures are logged and never fail the write. The boolean read API
//! (`can`, `has_permission`, ...) loads the subject's roles per call and
//! denies on any load error.
//!
//! Concurrent `assign` and `revoke` of the same (user, role, scope) tuple
//! are not ordered against each other. The final state of such a race
//! depends on which store write lands last; only the store's uniqueness
//! constraint is relied on, surfacing as `RoleAlreadyAssigned`.

mod retry;

pub use retry::{is_transient, RetryConfig};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, trace, warn};

use crate::checker::Checker;
use crate::config::RbacConfig;
use crate::error::{RbacError, Result};
use crate::monitor::{TransactionMetrics, TransactionMonitor};
use crate::registry::Registry;
use crate::store::{AssignmentStore, Conn, StoreTransaction, Unit};
use crate::types::{
    require_user, AuditAction, AuditContext, AuditEntry, RoleAssignment, RoleGrant, ScopeRef,
    UserRoles, WILDCARD_SCOPE_ID,
};

const BATCH_ASSIGN_SAVEPOINT: &str = "rbac_assign_batch";
const BATCH_REVOKE_SAVEPOINT: &str = "rbac_revoke_batch";
const AUDIT_SAVEPOINT: &str = "rbac_audit";

/// Stage of a write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validating,
    Authorizing,
    Persisting,
    Auditing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Authorizing => "authorizing",
            Self::Persisting => "persisting",
            Self::Auditing => "auditing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage tracker for one write
struct Progress {
    operation: &'static str,
    stage: Stage,
}

impl Progress {
    fn start(operation: &'static str) -> Self {
        trace!(operation, stage = %Stage::Validating, "Stage");
        Self {
            operation,
            stage: Stage::Validating,
        }
    }

    fn enter(&mut self, stage: Stage) {
        trace!(operation = self.operation, from = %self.stage, to = %stage, "Stage");
        self.stage = stage;
    }

    fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.enter(Stage::Done),
            Err(err) => {
                debug!(
                    operation = self.operation,
                    stage = %self.stage,
                    error = %err,
                    "Operation failed"
                );
                self.stage = Stage::Failed;
            }
        }
        result
    }
}

/// Result of [`RoleManager::revoke_all`]
#[derive(Debug, Default)]
pub struct RevokeAllOutcome {
    /// Roles removed
    pub revoked: Vec<String>,
    /// Roles whose revocation failed, with the error
    pub failed: Vec<(String, RbacError)>,
}

impl RevokeAllOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Authorized, audited role assignment over a store
#[derive(Clone)]
pub struct RoleManager {
    registry: Arc<Registry>,
    store: Arc<dyn AssignmentStore>,
    monitor: Arc<TransactionMonitor>,
    config: RbacConfig,
}

impl fmt::Debug for RoleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleManager")
            .field("scopes", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl RoleManager {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn AssignmentStore>) -> Self {
        Self::with_config(registry, store, RbacConfig::default())
    }

    pub fn with_config(
        registry: Arc<Registry>,
        store: Arc<dyn AssignmentStore>,
        config: RbacConfig,
    ) -> Self {
        let monitor = Arc::new(TransactionMonitor::with_thresholds(config.health.clone()));
        Self {
            registry,
            store,
            monitor,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn AssignmentStore> {
        &self.store
    }

    pub fn config(&self) -> &RbacConfig {
        &self.config
    }

    // ---- reads ----

    /// Every assignment held by `user_id`
    pub async fn get_user_roles(&self, user_id: &str) -> Result<UserRoles> {
        require_user(user_id)?;
        let assignments = self
            .store
            .user_assignments(user_id)
            .await
            .map_err(|e| RbacError::database("load user roles", e))?;
        Ok(UserRoles::new(user_id, assignments))
    }

    /// Checker over the current assignments of `user_id`
    pub async fn checker(&self, user_id: &str) -> Result<Checker> {
        let roles = self.get_user_roles(user_id).await?;
        Ok(Checker::new(user_id, roles, Arc::clone(&self.registry)).with_store(Arc::clone(&self.store)))
    }

    async fn check_or_deny(
        &self,
        user_id: &str,
        question: &'static str,
        decide: impl FnOnce(&Checker) -> bool,
    ) -> bool {
        match self.checker(user_id).await {
            Ok(checker) => decide(&checker),
            Err(err) => {
                warn!(user_id, question, error = %err, "Could not load roles, denying");
                false
            }
        }
    }

    pub async fn can(&self, user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> bool {
        self.check_or_deny(user_id, "can", |c| c.can(role, scope_type, scope_id))
            .await
    }

    pub async fn has_permission(
        &self,
        user_id: &str,
        permission: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> bool {
        self.check_or_deny(user_id, "has_permission", |c| {
            c.has_permission(permission, scope_type, scope_id)
        })
        .await
    }

    pub async fn has_any_role<I, S>(
        &self,
        user_id: &str,
        roles: I,
        scope_type: &str,
        scope_id: &str,
    ) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.check_or_deny(user_id, "has_any_role", |c| {
            c.has_any_role(roles, scope_type, scope_id)
        })
        .await
    }

    pub async fn can_assign_role(
        &self,
        user_id: &str,
        target_role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> bool {
        self.check_or_deny(user_id, "can_assign_role", |c| {
            c.can_assign_role(target_role, scope_type, scope_id)
        })
        .await
    }

    /// Like [`has_permission`](Self::has_permission), but fails with
    /// `Unauthorized` and propagates load errors
    pub async fn require_permission(
        &self,
        user_id: &str,
        permission: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        let checker = self.checker(user_id).await?;
        if checker.has_permission(permission, scope_type, scope_id) {
            Ok(())
        } else {
            Err(RbacError::Unauthorized {
                user_id: user_id.to_string(),
                permission: permission.to_string(),
                scope: ScopeRef::new(scope_type, scope_id).to_string(),
            })
        }
    }

    // ---- metrics ----

    pub fn transaction_metrics(&self) -> TransactionMetrics {
        self.monitor.get_metrics()
    }

    pub fn reset_transaction_metrics(&self) {
        self.monitor.reset();
    }

    pub fn is_transaction_healthy(&self) -> bool {
        self.monitor.is_healthy()
    }

    // ---- writes ----

    /// Grant `role` on the scope to `user_id`
    ///
    /// The actor needs a role on the scope that may assign `role`, unless
    /// it is assigning to itself and holds no roles at all yet.
    #[instrument(skip(self, ctx), fields(actor = ctx.actor_id()))]
    pub async fn assign(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        let mut progress = Progress::start("assign");
        let result = self
            .assign_inner(&mut progress, ctx, user_id, role, scope_type, scope_id)
            .await;
        progress.finish(result)
    }

    async fn assign_inner(
        &self,
        progress: &mut Progress,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        require_user(user_id)?;
        self.registry.validate_role(role, scope_type)?;
        let actor_id = ctx.require_actor()?;

        progress.enter(Stage::Authorizing);
        let actor = self.checker(actor_id).await?;
        self.authorize(&actor, user_id, role, scope_type, scope_id)?;

        let previous = self.current_roles(user_id, scope_type, scope_id).await?;
        if previous.contains(role) {
            return Err(already_assigned(user_id, role, scope_type, scope_id));
        }

        let assignment = self
            .denormalize(RoleAssignment::new(user_id, role, scope_type, scope_id))
            .await?;
        ctx.check_active()?;

        progress.enter(Stage::Persisting);
        let started = Instant::now();
        let written = self.store.insert_assignment(&assignment).await;
        self.monitor.record(started.elapsed(), written.is_ok());
        written.map_err(|e| {
            if e.is_duplicate() {
                already_assigned(user_id, role, scope_type, scope_id)
            } else {
                RbacError::database("insert role assignment", e)
            }
        })?;

        progress.enter(Stage::Auditing);
        let mut new_roles = previous.clone();
        new_roles.insert(role.to_string());
        let entry = AuditEntry::new(ctx, actor_id, AuditAction::Assigned, &assignment).with_role_sets(
            actor.roles_in(scope_type, scope_id).into_iter().collect(),
            previous.into_iter().collect(),
            new_roles.into_iter().collect(),
        );
        self.write_audit(&entry).await;

        info!(
            actor = actor_id,
            user_id,
            role,
            scope = %assignment.scope(),
            "Role assigned"
        );
        Ok(())
    }

    /// Remove `role` on the scope from `user_id`
    ///
    /// Authorized the same way as [`assign`](Self::assign).
    #[instrument(skip(self, ctx), fields(actor = ctx.actor_id()))]
    pub async fn revoke(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        let mut progress = Progress::start("revoke");
        let result = self
            .revoke_inner(&mut progress, ctx, user_id, role, scope_type, scope_id)
            .await;
        progress.finish(result)
    }

    async fn revoke_inner(
        &self,
        progress: &mut Progress,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        require_user(user_id)?;
        self.registry.validate_role(role, scope_type)?;
        let actor_id = ctx.require_actor()?;

        progress.enter(Stage::Authorizing);
        let actor = self.checker(actor_id).await?;
        self.revoke_as(progress, ctx, &actor, user_id, role, scope_type, scope_id)
            .await
    }

    /// Revoke on behalf of an already loaded actor
    #[allow(clippy::too_many_arguments)]
    async fn revoke_as(
        &self,
        progress: &mut Progress,
        ctx: &AuditContext,
        actor: &Checker,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        let actor_id = actor.user_id();
        self.authorize(actor, user_id, role, scope_type, scope_id)?;

        let previous = self.current_roles(user_id, scope_type, scope_id).await?;
        if !previous.contains(role) {
            return Err(not_assigned(user_id, role, scope_type, scope_id));
        }
        ctx.check_active()?;

        progress.enter(Stage::Persisting);
        let started = Instant::now();
        let deleted = self
            .store
            .delete_assignment(user_id, role, scope_type, scope_id)
            .await;
        self.monitor.record(started.elapsed(), deleted.is_ok());
        let affected = deleted.map_err(|e| RbacError::database("delete role assignment", e))?;
        if affected == 0 {
            return Err(not_assigned(user_id, role, scope_type, scope_id));
        }

        progress.enter(Stage::Auditing);
        let mut new_roles = previous.clone();
        new_roles.remove(role);
        let assignment = RoleAssignment::new(user_id, role, scope_type, scope_id);
        let entry = AuditEntry::new(ctx, actor_id, AuditAction::Revoked, &assignment).with_role_sets(
            actor.roles_in(scope_type, scope_id).into_iter().collect(),
            previous.into_iter().collect(),
            new_roles.into_iter().collect(),
        );
        self.write_audit(&entry).await;

        info!(
            actor = actor_id,
            user_id,
            role,
            scope = %assignment.scope(),
            "Role revoked"
        );
        Ok(())
    }

    /// Revoke every role `user_id` holds on exactly this scope
    ///
    /// Best effort: each role is revoked on its own and failures are
    /// collected rather than stopping the fan-out.
    pub async fn revoke_all(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<RevokeAllOutcome> {
        require_user(user_id)?;
        let actor_id = ctx.require_actor()?;

        let held = self.current_roles(user_id, scope_type, scope_id).await?;
        let mut outcome = RevokeAllOutcome::default();
        if held.is_empty() {
            return Ok(outcome);
        }
        let actor = self.checker(actor_id).await?;

        for role in held {
            let mut progress = Progress::start("revoke");
            progress.enter(Stage::Authorizing);
            let result = self
                .revoke_as(&mut progress, ctx, &actor, user_id, &role, scope_type, scope_id)
                .await;
            match progress.finish(result) {
                Ok(()) => outcome.revoked.push(role),
                Err(err) => {
                    warn!(user_id, role = %role, error = %err, "Revoke failed, continuing");
                    outcome.failed.push((role, err));
                }
            }
        }

        Ok(outcome)
    }

    /// Insert-or-ignore grant without the checker pre-read
    ///
    /// Performs no authority check: callers are trusted. A grant that
    /// already exists fails with `RoleAlreadyAssigned`.
    #[instrument(skip(self, ctx), fields(actor = ctx.actor_id()))]
    pub async fn assign_direct(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        self.assign_direct_once(ctx, user_id, role, scope_type, scope_id, true)
            .await
    }

    async fn assign_direct_once(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
        record: bool,
    ) -> Result<()> {
        let mut progress = Progress::start("assign_direct");
        let result = self
            .assign_direct_inner(&mut progress, ctx, user_id, role, scope_type, scope_id, record)
            .await;
        progress.finish(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn assign_direct_inner(
        &self,
        progress: &mut Progress,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
        record: bool,
    ) -> Result<()> {
        require_user(user_id)?;
        self.registry.validate_role(role, scope_type)?;
        let actor_id = ctx.require_actor()?;

        let assignment = self
            .denormalize(RoleAssignment::new(user_id, role, scope_type, scope_id))
            .await?;
        ctx.check_active()?;

        progress.enter(Stage::Persisting);
        let started = Instant::now();
        let inserted = self.store.insert_assignment_ignore(&assignment).await;
        if record {
            self.monitor.record(started.elapsed(), inserted.is_ok());
        }
        let affected = inserted.map_err(|e| RbacError::database("insert role assignment", e))?;
        if affected == 0 {
            return Err(already_assigned(user_id, role, scope_type, scope_id));
        }

        progress.enter(Stage::Auditing);
        let entry = AuditEntry::new(ctx, actor_id, AuditAction::Assigned, &assignment);
        self.write_audit(&entry).await;

        info!(actor = actor_id, user_id, role, scope = %assignment.scope(), "Role assigned");
        Ok(())
    }

    /// [`assign_direct`](Self::assign_direct) with transient-failure retry
    pub async fn assign_with_retry(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let result = retry::run(&self.config.retry, ctx, "assign", || {
            self.assign_direct_once(ctx, user_id, role, scope_type, scope_id, false)
        })
        .await;
        self.monitor.record(started.elapsed(), result.is_ok());
        result
    }

    /// Grant every entry of `grants` in one transaction
    ///
    /// Each grant is validated and authorized before anything is written.
    /// One failing row rolls back the whole batch. Returns rows inserted.
    pub async fn assign_multiple(&self, ctx: &AuditContext, grants: &[RoleGrant]) -> Result<u64> {
        self.assign_multiple_in(Conn::Pool(self.store.as_ref()), ctx, grants)
            .await
    }

    /// [`assign_multiple`](Self::assign_multiple) on a caller-chosen connection
    ///
    /// With [`Conn::Tx`] the batch runs inside a savepoint of the caller's
    /// transaction and nothing is committed.
    pub async fn assign_multiple_in(
        &self,
        conn: Conn<'_>,
        ctx: &AuditContext,
        grants: &[RoleGrant],
    ) -> Result<u64> {
        self.assign_multiple_once(conn, ctx, grants, true).await
    }

    /// [`assign_multiple`](Self::assign_multiple) with transient-failure retry
    pub async fn assign_multiple_with_retry(
        &self,
        ctx: &AuditContext,
        grants: &[RoleGrant],
    ) -> Result<u64> {
        let started = Instant::now();
        let result = retry::run(&self.config.retry, ctx, "assign_multiple", || {
            self.assign_multiple_once(Conn::Pool(self.store.as_ref()), ctx, grants, false)
        })
        .await;
        self.monitor.record(started.elapsed(), result.is_ok());
        result
    }

    async fn assign_multiple_once(
        &self,
        conn: Conn<'_>,
        ctx: &AuditContext,
        grants: &[RoleGrant],
        record: bool,
    ) -> Result<u64> {
        let mut progress = Progress::start("assign_multiple");
        let result = self
            .assign_multiple_inner(&mut progress, conn, ctx, grants, record)
            .await;
        progress.finish(result)
    }

    async fn assign_multiple_inner(
        &self,
        progress: &mut Progress,
        conn: Conn<'_>,
        ctx: &AuditContext,
        grants: &[RoleGrant],
        record: bool,
    ) -> Result<u64> {
        let actor_id = ctx.require_actor()?;
        if grants.is_empty() {
            return Ok(0);
        }
        for grant in grants {
            require_user(&grant.user_id)?;
            self.registry.validate_role(&grant.role, &grant.scope_type)?;
        }

        progress.enter(Stage::Authorizing);
        let actor = self.checker(actor_id).await?;
        for grant in grants {
            self.authorize(&actor, &grant.user_id, &grant.role, &grant.scope_type, &grant.scope_id)?;
        }

        let mut rows = Vec::with_capacity(grants.len());
        for grant in grants {
            let row = RoleAssignment::new(
                grant.user_id.as_str(),
                grant.role.as_str(),
                grant.scope_type.as_str(),
                grant.scope_id.as_str(),
            );
            rows.push(self.denormalize(row).await?);
        }
        ctx.check_active()?;

        progress.enter(Stage::Persisting);
        let started = Instant::now();
        let mut unit = Unit::open(conn, BATCH_ASSIGN_SAVEPOINT)
            .await
            .map_err(|e| RbacError::database("begin batch assign", e))?;

        let written = insert_batch(unit.tx(), &rows, self.config.batch_size).await;
        let (inserted, previous) = match written {
            Ok(written) => written,
            Err(err) => {
                abandon(unit, "assign_multiple").await;
                if record {
                    self.monitor.record(started.elapsed(), false);
                }
                return Err(err);
            }
        };

        progress.enter(Stage::Auditing);
        for (row, before) in rows.iter().zip(previous) {
            let mut after = before.clone();
            after.push(row.role.clone());
            after.sort();
            let entry = AuditEntry::new(ctx, actor_id, AuditAction::Assigned, row).with_role_sets(
                actor.roles_in(&row.scope_type, &row.scope_id).into_iter().collect(),
                before,
                after,
            );
            audit_in_tx(unit.tx(), &entry).await;
        }

        let committed = unit.commit().await;
        if record {
            self.monitor.record(started.elapsed(), committed.is_ok());
        }
        committed.map_err(|e| RbacError::database("commit batch assign", e))?;

        info!(actor = actor_id, count = inserted, "Roles assigned in batch");
        Ok(inserted)
    }

    /// Revoke every entry of `grants` in one transaction
    ///
    /// Grants the target does not currently hold are skipped. Returns rows
    /// removed.
    pub async fn revoke_multiple(&self, ctx: &AuditContext, grants: &[RoleGrant]) -> Result<u64> {
        self.revoke_multiple_in(Conn::Pool(self.store.as_ref()), ctx, grants)
            .await
    }

    /// [`revoke_multiple`](Self::revoke_multiple) on a caller-chosen connection
    pub async fn revoke_multiple_in(
        &self,
        conn: Conn<'_>,
        ctx: &AuditContext,
        grants: &[RoleGrant],
    ) -> Result<u64> {
        let mut progress = Progress::start("revoke_multiple");
        let result = self
            .revoke_multiple_inner(&mut progress, conn, ctx, grants)
            .await;
        progress.finish(result)
    }

    async fn revoke_multiple_inner(
        &self,
        progress: &mut Progress,
        conn: Conn<'_>,
        ctx: &AuditContext,
        grants: &[RoleGrant],
    ) -> Result<u64> {
        let actor_id = ctx.require_actor()?;
        if grants.is_empty() {
            return Ok(0);
        }
        for grant in grants {
            require_user(&grant.user_id)?;
            self.registry.validate_role(&grant.role, &grant.scope_type)?;
        }

        progress.enter(Stage::Authorizing);
        let actor = self.checker(actor_id).await?;
        for grant in grants {
            self.authorize(&actor, &grant.user_id, &grant.role, &grant.scope_type, &grant.scope_id)?;
        }
        ctx.check_active()?;

        progress.enter(Stage::Persisting);
        let started = Instant::now();
        let mut unit = Unit::open(conn, BATCH_REVOKE_SAVEPOINT)
            .await
            .map_err(|e| RbacError::database("begin batch revoke", e))?;

        let mut revoked = 0;
        for grant in grants {
            let outcome = revoke_in_tx(unit.tx(), ctx, &actor, actor_id, grant).await;
            match outcome {
                Ok(n) => revoked += n,
                Err(err) => {
                    abandon(unit, "revoke_multiple").await;
                    self.monitor.record(started.elapsed(), false);
                    return Err(err);
                }
            }
        }

        let committed = unit.commit().await;
        self.monitor.record(started.elapsed(), committed.is_ok());
        committed.map_err(|e| RbacError::database("commit batch revoke", e))?;

        info!(actor = actor_id, count = revoked, "Roles revoked in batch");
        Ok(revoked)
    }

    // ---- helpers ----

    /// Actor authority over (`role`, scope)
    fn authorize(
        &self,
        actor: &Checker,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<()> {
        if actor.user_id() == user_id && actor.roles().is_empty() {
            debug!(user_id, role, "Bootstrap self-assignment, skipping authority check");
            return Ok(());
        }
        if actor.can_assign_role(role, scope_type, scope_id) {
            Ok(())
        } else {
            Err(RbacError::CannotAssign {
                actor_id: actor.user_id().to_string(),
                role: role.to_string(),
                scope: ScopeRef::new(scope_type, scope_id).to_string(),
            })
        }
    }

    /// Role names held on exactly this scope, from the store
    async fn current_roles(
        &self,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<BTreeSet<String>> {
        let names = self
            .store
            .role_names(user_id, scope_type, scope_id)
            .await
            .map_err(|e| RbacError::database("load current roles", e))?;
        Ok(names.into_iter().collect())
    }

    /// Attach the parent scope when the scope type declares one
    async fn denormalize(&self, assignment: RoleAssignment) -> Result<RoleAssignment> {
        let declares_parent = self
            .registry
            .get_scope(&assignment.scope_type)
            .and_then(|scope| scope.parent())
            .is_some();
        if !declares_parent || assignment.scope_id == WILDCARD_SCOPE_ID {
            return Ok(assignment);
        }

        let parent = self
            .store
            .parent_scope(&assignment.scope_type, &assignment.scope_id)
            .await
            .map_err(|e| RbacError::database("resolve parent scope", e))?;

        Ok(match parent {
            Some(parent) => assignment.with_parent(parent),
            None => {
                debug!(scope = %assignment.scope(), "No parent recorded for scope");
                assignment
            }
        })
    }

    async fn write_audit(&self, entry: &AuditEntry) {
        if let Err(err) = self.store.append_audit(entry).await {
            warn!(
                actor = %entry.actor_id,
                action = %entry.action,
                user_id = %entry.target_user_id,
                role = %entry.role,
                error = %err,
                "Failed to write audit entry"
            );
        }
    }
}

async fn abandon(unit: Unit<'_>, operation: &'static str) {
    if let Err(err) = unit.rollback().await {
        warn!(operation, error = %err, "Rollback failed");
    }
}

/// Read each row's current role names, then insert all rows; returns rows
/// inserted and the role names held before each row
///
/// Earlier rows of the batch on the same (user, scope) count as held by the
/// later ones.
async fn insert_batch(
    tx: &mut dyn StoreTransaction,
    rows: &[RoleAssignment],
    batch_size: usize,
) -> Result<(u64, Vec<Vec<String>>)> {
    let mut earlier: HashMap<(&str, &str, &str), Vec<String>> = HashMap::new();
    let mut previous = Vec::with_capacity(rows.len());
    for row in rows {
        let mut names = tx
            .role_names(&row.user_id, &row.scope_type, &row.scope_id)
            .await
            .map_err(|e| RbacError::database("load current roles", e))?;

        let key = (row.user_id.as_str(), row.scope_type.as_str(), row.scope_id.as_str());
        let batch_roles = earlier.entry(key).or_default();
        names.extend(batch_roles.iter().cloned());
        names.sort();
        names.dedup();
        batch_roles.push(row.role.clone());

        previous.push(names);
    }

    let inserted = tx
        .batch_insert(rows, batch_size)
        .await
        .map_err(|e| RbacError::database("batch insert role assignments", e))?;
    Ok((inserted, previous))
}

/// Revoke one grant inside a batch transaction; returns rows removed
async fn revoke_in_tx(
    tx: &mut dyn StoreTransaction,
    ctx: &AuditContext,
    actor: &Checker,
    actor_id: &str,
    grant: &RoleGrant,
) -> Result<u64> {
    let before = tx
        .role_names(&grant.user_id, &grant.scope_type, &grant.scope_id)
        .await
        .map_err(|e| RbacError::database("load current roles", e))?;
    if !before.iter().any(|r| r == &grant.role) {
        debug!(user_id = %grant.user_id, role = %grant.role, "Not held, skipping");
        return Ok(0);
    }

    let affected = tx
        .delete_assignment(&grant.user_id, &grant.role, &grant.scope_type, &grant.scope_id)
        .await
        .map_err(|e| RbacError::database("delete role assignment", e))?;
    if affected == 0 {
        return Ok(0);
    }

    let after: Vec<String> = before.iter().filter(|r| *r != &grant.role).cloned().collect();
    let assignment = RoleAssignment::new(
        grant.user_id.as_str(),
        grant.role.as_str(),
        grant.scope_type.as_str(),
        grant.scope_id.as_str(),
    );
    let entry = AuditEntry::new(ctx, actor_id, AuditAction::Revoked, &assignment).with_role_sets(
        actor.roles_in(&grant.scope_type, &grant.scope_id).into_iter().collect(),
        before,
        after,
    );
    audit_in_tx(tx, &entry).await;

    Ok(affected)
}

/// Append an audit entry under its own savepoint so a failure leaves the
/// surrounding transaction usable
async fn audit_in_tx(tx: &mut dyn StoreTransaction, entry: &AuditEntry) {
    if let Err(err) = tx.savepoint(AUDIT_SAVEPOINT).await {
        warn!(error = %err, "Could not open audit savepoint");
        return;
    }

    match tx.append_audit(entry).await {
        Ok(()) => {
            if let Err(err) = tx.release_savepoint(AUDIT_SAVEPOINT).await {
                warn!(error = %err, "Could not release audit savepoint");
            }
        }
        Err(err) => {
            warn!(
                actor = %entry.actor_id,
                action = %entry.action,
                user_id = %entry.target_user_id,
                role = %entry.role,
                error = %err,
                "Failed to write audit entry"
            );
            if let Err(err) = tx.rollback_to_savepoint(AUDIT_SAVEPOINT).await {
                warn!(error = %err, "Could not roll back audit savepoint");
            } else if let Err(err) = tx.release_savepoint(AUDIT_SAVEPOINT).await {
                warn!(error = %err, "Could not release audit savepoint");
            }
        }
    }
}

fn already_assigned(user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> RbacError {
    RbacError::RoleAlreadyAssigned {
        user_id: user_id.to_string(),
        role: role.to_string(),
        scope: ScopeRef::new(scope_type, scope_id).to_string(),
    }
}

fn not_assigned(user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> RbacError {
    RbacError::RoleNotAssigned {
        user_id: user_id.to_string(),
        role: role.to_string(),
        scope: ScopeRef::new(scope_type, scope_id).to_string(),
    }
}
