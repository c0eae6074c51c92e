//! Property-based tests for permission matching and scope checks

use cretoai_rbac::permission::{self, matches, matches_any};
use cretoai_rbac::{AuditContext, MemoryStore, Registry, RoleManager};
use proptest::prelude::*;
use std::sync::Arc;

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

fn permission_string() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 2..5).prop_map(|segments| segments.join("."))
}

proptest! {
    #[test]
    fn test_match_all_pattern(perm in permission_string()) {
        prop_assert!(matches("*", &perm));
    }

    #[test]
    fn test_exact_pattern_matches_itself(perm in permission_string()) {
        prop_assert!(matches(&perm, &perm));
        prop_assert!(permission::validate(&perm).is_ok());
    }

    #[test]
    fn test_trailing_wildcard_matches_one_segment(
        prefix in segment(),
        action in segment(),
        extra in segment()
    ) {
        let pattern = format!("{}.*", prefix);
        let one_deeper = format!("{}.{}", prefix, action);
        let two_deeper = format!("{}.{}", one_deeper, extra);

        prop_assert!(matches(&pattern, &one_deeper));
        prop_assert!(!matches(&pattern, &two_deeper));
    }

    #[test]
    fn test_segment_count_must_agree(perm in permission_string(), extra in segment()) {
        let longer = format!("{}.{}", perm, extra);

        prop_assert!(!matches(&perm, &longer));
        prop_assert!(!matches(&longer, &perm));
    }

    #[test]
    fn test_wildcard_in_any_position(
        segments in prop::collection::vec(segment(), 2..5),
        position in any::<prop::sample::Index>()
    ) {
        let idx = position.index(segments.len());
        let perm = segments.join(".");
        let mut pattern_segments = segments.clone();
        pattern_segments[idx] = "*".to_string();
        let pattern = pattern_segments.join(".");

        prop_assert!(matches(&pattern, &perm));
        prop_assert!(permission::validate(&pattern).is_ok());
    }

    #[test]
    fn test_matches_any_is_or(
        patterns in prop::collection::vec(permission_string(), 0..6),
        perm in permission_string()
    ) {
        let expected = patterns.iter().any(|p| matches(p, &perm));
        prop_assert_eq!(matches_any(&patterns, &perm), expected);
    }

    #[test]
    fn test_wildcard_scope_grant_covers_every_id(scope_id in "[a-z0-9]{1,12}") {
        tokio_test::block_on(async {
            let registry = Registry::builder()
                .scope("project", |s| s.role("viewer", |r| r.permissions(["files.read"])))
                .build()
                .unwrap();
            let manager = RoleManager::new(Arc::new(registry), Arc::new(MemoryStore::new()));

            manager
                .assign_direct(&AuditContext::for_actor("ops"), "alice", "viewer", "project", "*")
                .await
                .unwrap();

            assert!(manager.can("alice", "viewer", "project", &scope_id).await);
            assert!(manager.has_permission("alice", "files.read", "project", &scope_id).await);
            assert!(!manager.has_permission("alice", "files.write", "project", &scope_id).await);
        });
    }
}
