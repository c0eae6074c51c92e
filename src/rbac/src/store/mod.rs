//! Assignment storage
//!
//! The coordinator talks to persistence through two traits: a pool-level
//! [`AssignmentStore`] and a transaction-level [`StoreTransaction`]. Callers
//! that already hold a transaction pass it as [`Conn::Tx`]; batch operations
//! then nest inside a savepoint instead of opening a new transaction.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{AuditEntry, RoleAssignment, ScopeRef};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Default number of rows per batch insert statement
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Pool-level store operations
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// All assignments held by `user_id`
    async fn user_assignments(&self, user_id: &str) -> StoreResult<Vec<RoleAssignment>>;

    /// Role names held by `user_id` on exactly (`scope_type`, `scope_id`)
    async fn role_names(
        &self,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<Vec<String>>;

    /// Insert one assignment; a uniqueness violation is `StoreError::Duplicate`
    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<()>;

    /// Insert unless the grant already exists; returns rows affected
    async fn insert_assignment_ignore(&self, assignment: &RoleAssignment) -> StoreResult<u64>;

    /// Delete one grant; returns rows affected
    async fn delete_assignment(
        &self,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<u64>;

    /// Parent of (`scope_type`, `scope_id`) in the scope hierarchy
    async fn parent_scope(&self, scope_type: &str, scope_id: &str) -> StoreResult<Option<ScopeRef>>;

    /// Append one audit entry
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;

    /// Open a transaction
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Transaction-level store operations
///
/// Dropping a transaction without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn role_names(
        &mut self,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<Vec<String>>;

    /// Insert `rows` in chunks of `batch_size`; fails as a whole on any error
    async fn batch_insert(&mut self, rows: &[RoleAssignment], batch_size: usize) -> StoreResult<u64>;

    async fn delete_assignment(
        &mut self,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<u64>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> StoreResult<()>;

    async fn savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Where a unit of work runs
pub enum Conn<'a> {
    /// Open a fresh transaction on the store
    Pool(&'a dyn AssignmentStore),
    /// Nest inside the caller's transaction
    Tx(&'a mut Box<dyn StoreTransaction>),
}

/// A transaction owned by the unit of work, or a savepoint in a caller's one
pub(crate) enum Unit<'a> {
    Owned(Box<dyn StoreTransaction>),
    Nested {
        tx: &'a mut Box<dyn StoreTransaction>,
        savepoint: &'static str,
    },
}

impl<'a> Unit<'a> {
    pub(crate) async fn open(conn: Conn<'a>, savepoint: &'static str) -> StoreResult<Unit<'a>> {
        match conn {
            Conn::Pool(store) => Ok(Unit::Owned(store.begin().await?)),
            Conn::Tx(tx) => {
                tx.savepoint(savepoint).await?;
                Ok(Unit::Nested { tx, savepoint })
            }
        }
    }

    pub(crate) fn tx(&mut self) -> &mut dyn StoreTransaction {
        match self {
            Unit::Owned(tx) => &mut **tx,
            Unit::Nested { tx, .. } => &mut ***tx,
        }
    }

    pub(crate) async fn commit(self) -> StoreResult<()> {
        match self {
            Unit::Owned(tx) => tx.commit().await,
            Unit::Nested { tx, savepoint } => tx.release_savepoint(savepoint).await,
        }
    }

    pub(crate) async fn rollback(self) -> StoreResult<()> {
        match self {
            Unit::Owned(tx) => tx.rollback().await,
            Unit::Nested { tx, savepoint } => tx.rollback_to_savepoint(savepoint).await,
        }
    }
}
