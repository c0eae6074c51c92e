//! # CretoAI Scoped Role Authorization
//!
//! Multi-role, scope-aware authorization with audited role assignment.
//!
//! ## Features
//!
//! - **Registry** of scope types, their roles, permission patterns and
//!   assignable roles, validated once at build time
//! - **Wildcard permissions** (`members.*`, `*`) and wildcard scope ids
//! - **Checker** answering role, permission and delegation questions from a
//!   user's loaded assignments
//! - **RoleManager** for authorized, idempotent, audited assignment with
//!   batch variants and transient-failure retry
//! - **Transaction metrics** with a health check
//! - In-memory store, plus PostgreSQL via the `postgres` feature
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cretoai_rbac::{AuditContext, MemoryStore, Registry, RoleManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::builder()
//!         .scope("organization", |s| {
//!             s.role("admin", |r| r.permissions(["members.*"]).can_assign(["member"]))
//!                 .role("member", |r| r.permissions(["projects.create"]))
//!         })
//!         .build()?;
//!
//!     let manager = RoleManager::new(Arc::new(registry), Arc::new(MemoryStore::new()));
//!
//!     // First assignment bootstraps itself
//!     let ctx = AuditContext::for_actor("alice");
//!     manager.assign(&ctx, "alice", "admin", "organization", "org1").await?;
//!     manager.assign(&ctx, "bob", "member", "organization", "org1").await?;
//!
//!     assert!(manager.has_permission("alice", "members.invite", "organization", "org1").await);
//!     assert!(!manager.has_permission("bob", "members.invite", "organization", "org1").await);
//!
//!     Ok(())
//! }
//! ```

pub mod checker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod permission;
pub mod registry;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use checker::Checker;
pub use config::RbacConfig;
pub use coordinator::{is_transient, RetryConfig, RevokeAllOutcome, RoleManager, Stage};
pub use error::{ErrorKind, RbacError, Result, StoreError, StoreResult};
pub use monitor::{HealthThresholds, TransactionMetrics, TransactionMonitor};
pub use registry::{Registry, RegistryBuilder, RegistryDefinition};
pub use store::{AssignmentStore, Conn, MemoryStore, StoreTransaction};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use types::{
    AuditAction, AuditContext, AuditEntry, RoleAssignment, RoleGrant, ScopeRef, UserRoles,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
