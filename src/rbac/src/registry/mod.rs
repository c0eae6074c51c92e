//! Scope type and role registry
//!
//! The registry declares, per scope type, which roles exist, which
//! permission patterns each role grants, and which roles a holder may
//! assign to others. It is built once at startup and read-only afterwards.
//!
//! # Examples
//!
//! ```
//! use cretoai_rbac::registry::Registry;
//!
//! let registry = Registry::builder()
//!     .scope("organization", |s| {
//!         s.role("admin", |r| r.permissions(["members.*", "settings.*"]).can_assign(["member"]))
//!             .role("member", |r| r.permissions(["projects.create"]))
//!     })
//!     .scope("project", |s| s.parent("organization").role("editor", |r| r.permissions(["files.*"])))
//!     .build()
//!     .unwrap();
//!
//! assert!(registry.validate_role("admin", "organization").is_ok());
//! assert!(registry.validate_role("admin", "project").is_err());
//! assert_eq!(registry.ancestors("project"), vec!["organization"]);
//! ```

mod builder;
mod types;


pub use builder::{Registry, RegistryBuilder, RoleBuilder, ScopeBuilder};
pub use types::{
    AssignableRoles, RegistryDefinition, RoleDefinition, RoleEntry, ScopeDefinition, ScopeEntry,
};
