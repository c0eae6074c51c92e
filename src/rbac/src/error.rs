//! Error types for role assignment and authorization checks

use thiserror::Error;

/// Failures reported by an assignment store
///
/// Stores classify driver errors into these variants so callers can react
/// to duplicates, missing rows and connection trouble without parsing text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Unique constraint violation
    #[error("duplicate row: {0}")]
    Duplicate(String),

    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Foreign key violation
    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// Connection could not be acquired or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Statement or pool acquisition timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Deadlock or serialization failure
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// Anything else
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_foreign_key(&self) -> bool {
        matches!(self, Self::ForeignKey(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether running the same statement again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Deadlock(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout(err.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::Duplicate(db_err.message().to_string());
                }
                if db_err.is_foreign_key_violation() {
                    return Self::ForeignKey(db_err.message().to_string());
                }
                match db_err.code().as_deref() {
                    // deadlock_detected, serialization_failure, lock_not_available
                    Some("40P01") | Some("40001") | Some("55P03") => {
                        Self::Deadlock(db_err.message().to_string())
                    }
                    Some(code) if code.starts_with("08") => {
                        Self::Connection(db_err.message().to_string())
                    }
                    _ => Self::Other(db_err.message().to_string()),
                }
            }
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Result type for store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error kind, for matching without inspecting message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidScope,
    InvalidRole,
    InvalidPermission,
    InvalidRegistry,
    Unauthorized,
    CannotAssign,
    RoleAlreadyAssigned,
    RoleNotAssigned,
    NoUserId,
    NoActorId,
    Database,
    Cancelled,
    DeadlineExceeded,
}

/// Role assignment and authorization errors
#[derive(Debug, Error)]
pub enum RbacError {
    /// Scope type is not defined in the registry
    #[error("invalid scope type '{scope_type}'")]
    InvalidScope { scope_type: String },

    /// Role is not defined for the scope type
    #[error("invalid role '{role}' for scope type '{scope_type}'")]
    InvalidRole { role: String, scope_type: String },

    /// Malformed permission string
    #[error("invalid permission '{permission}': {reason}")]
    InvalidPermission { permission: String, reason: String },

    /// Registry definition rejected at build time
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),

    /// Subject lacks a required permission
    #[error("user '{user_id}' lacks permission '{permission}' on {scope}")]
    Unauthorized {
        user_id: String,
        permission: String,
        scope: String,
    },

    /// Actor has no authority to assign or revoke the role
    #[error("actor '{actor_id}' cannot assign role '{role}' on {scope}")]
    CannotAssign {
        actor_id: String,
        role: String,
        scope: String,
    },

    /// Target already holds the role in the scope
    #[error("user '{user_id}' already has role '{role}' on {scope}")]
    RoleAlreadyAssigned {
        user_id: String,
        role: String,
        scope: String,
    },

    /// Target does not hold the role in the scope
    #[error("user '{user_id}' does not have role '{role}' on {scope}")]
    RoleNotAssigned {
        user_id: String,
        role: String,
        scope: String,
    },

    /// Target user id missing
    #[error("no user id provided")]
    NoUserId,

    /// Acting user id missing from the audit context
    #[error("no actor id in audit context")]
    NoActorId,

    /// Persistence failure
    #[error("database error: {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: StoreError,
    },

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Caller-supplied deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl RbacError {
    pub fn database(context: impl Into<String>, source: StoreError) -> Self {
        Self::Database {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidScope { .. } => ErrorKind::InvalidScope,
            Self::InvalidRole { .. } => ErrorKind::InvalidRole,
            Self::InvalidPermission { .. } => ErrorKind::InvalidPermission,
            Self::InvalidRegistry(_) => ErrorKind::InvalidRegistry,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::CannotAssign { .. } => ErrorKind::CannotAssign,
            Self::RoleAlreadyAssigned { .. } => ErrorKind::RoleAlreadyAssigned,
            Self::RoleNotAssigned { .. } => ErrorKind::RoleNotAssigned,
            Self::NoUserId => ErrorKind::NoUserId,
            Self::NoActorId => ErrorKind::NoActorId,
            Self::Database { .. } => ErrorKind::Database,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    pub fn is_invalid_scope(&self) -> bool {
        self.kind() == ErrorKind::InvalidScope
    }

    pub fn is_invalid_role(&self) -> bool {
        self.kind() == ErrorKind::InvalidRole
    }

    pub fn is_invalid_permission(&self) -> bool {
        self.kind() == ErrorKind::InvalidPermission
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind() == ErrorKind::Unauthorized
    }

    pub fn is_cannot_assign(&self) -> bool {
        self.kind() == ErrorKind::CannotAssign
    }

    pub fn is_role_already_assigned(&self) -> bool {
        self.kind() == ErrorKind::RoleAlreadyAssigned
    }

    pub fn is_role_not_assigned(&self) -> bool {
        self.kind() == ErrorKind::RoleNotAssigned
    }

    pub fn is_database(&self) -> bool {
        self.kind() == ErrorKind::Database
    }

    /// The underlying store error, if this is a persistence failure
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Database { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for role operations
pub type Result<T> = std::result::Result<T, RbacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        let err = RbacError::CannotAssign {
            actor_id: "alice".to_string(),
            role: "admin".to_string(),
            scope: "organization:org1".to_string(),
        };
        assert!(err.is_cannot_assign());
        assert!(!err.is_unauthorized());
        assert_eq!(err.kind(), ErrorKind::CannotAssign);
    }

    #[test]
    fn test_database_error_keeps_source() {
        let err = RbacError::database("insert assignment", StoreError::Connection("reset".into()));
        assert!(err.is_database());
        assert!(err.store_error().unwrap().is_retryable());
        assert!(err.to_string().contains("insert assignment"));
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Duplicate("k".into()).is_duplicate());
        assert!(!StoreError::Duplicate("k".into()).is_retryable());
        assert!(StoreError::Deadlock("d".into()).is_retryable());
        assert!(StoreError::Timeout("t".into()).is_retryable());
        assert!(StoreError::ForeignKey("f".into()).is_foreign_key());
        assert!(StoreError::NotFound("n".into()).is_not_found());
    }
}
