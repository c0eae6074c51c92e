//! Permission pattern matching
//!
//! Permissions are dot-segmented strings such as `members.invite`. Patterns
//! use the same shape and may replace any segment with `*`; the single
//! pattern `*` matches every permission.
//!
//! ```
//! use cretoai_rbac::permission;
//!
//! assert!(permission::matches("members.*", "members.invite"));
//! assert!(!permission::matches("members.*", "members.invite.bulk"));
//! assert!(permission::matches("*", "settings.billing.update"));
//! ```

use crate::error::{RbacError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Wildcard segment and match-all pattern
pub const WILDCARD: &str = "*";

/// Segment separator
pub const SEPARATOR: char = '.';

fn segment_pattern() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("segment regex is valid"))
}

/// Check a single pattern against a requested permission
pub fn matches(pattern: &str, permission: &str) -> bool {
    if pattern == WILDCARD || pattern == permission {
        return true;
    }

    let mut pattern_segments = pattern.split(SEPARATOR);
    let mut permission_segments = permission.split(SEPARATOR);

    loop {
        match (pattern_segments.next(), permission_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(q)) if p == WILDCARD || p == q => continue,
            _ => return false,
        }
    }
}

/// Short-circuiting OR of [`matches`] over `patterns`
pub fn matches_any<I, S>(patterns: I, permission: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .any(|pattern| matches(pattern.as_ref(), permission))
}

/// Validate a permission or permission pattern
///
/// Rejects empty strings, single-segment strings other than `*`, empty
/// segments, and non-wildcard segments with characters outside
/// `[A-Za-z0-9_]`.
pub fn validate(permission: &str) -> Result<()> {
    let invalid = |reason: &str| RbacError::InvalidPermission {
        permission: permission.to_string(),
        reason: reason.to_string(),
    };

    if permission.is_empty() {
        return Err(invalid("permission cannot be empty"));
    }
    if permission == WILDCARD {
        return Ok(());
    }

    let segments: Vec<&str> = permission.split(SEPARATOR).collect();
    if segments.len() < 2 {
        return Err(invalid("permission must have at least two segments"));
    }

    for segment in segments {
        if segment.is_empty() {
            return Err(invalid("permission segment cannot be empty"));
        }
        if segment != WILDCARD && !segment_pattern().is_match(segment) {
            return Err(invalid(&format!(
                "segment '{}' may only contain letters, digits and underscores",
                segment
            )));
        }
    }

    Ok(())
}

/// Subset of `known` matched by at least one pattern
pub fn expand_permissions<P, K>(patterns: &[P], known: &[K]) -> BTreeSet<String>
where
    P: AsRef<str>,
    K: AsRef<str>,
{
    known
        .iter()
        .map(|permission| permission.as_ref())
        .filter(|permission: &&str| matches_any(patterns, permission))
        .map(str::to_string)
        .collect()
}
