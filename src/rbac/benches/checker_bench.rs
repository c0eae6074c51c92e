/// Benchmarks for the authorization hot path
///
/// Measures performance of:
/// - Permission pattern matching
/// - Checker decisions over growing assignment sets
/// - Full assign through the coordinator on the in-memory store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cretoai_rbac::{
    permission, AuditContext, Checker, MemoryStore, Registry, RoleAssignment, RoleManager,
    UserRoles,
};
use std::sync::Arc;

fn registry() -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .scope("organization", |s| {
                s.role("admin", |r| {
                    r.permissions(["members.*", "settings.*", "billing.view"])
                        .can_assign(["member", "viewer"])
                })
                .role("member", |r| r.permissions(["projects.read", "projects.create"]))
                .role("viewer", |r| r.permissions(["projects.read"]))
            })
            .build()
            .unwrap(),
    )
}

fn bench_permission_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("permission_matching");

    let cases = vec![
        ("exact", "members.invite"),
        ("segment_wildcard", "members.*"),
        ("match_all", "*"),
        ("mismatch", "settings.billing.update"),
    ];

    for (name, pattern) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &pattern, |b, &p| {
            b.iter(|| permission::matches(black_box(p), black_box("members.invite")));
        });
    }

    let patterns = ["projects.read", "projects.create", "settings.*", "members.*"];
    group.bench_function("matches_any", |b| {
        b.iter(|| permission::matches_any(black_box(&patterns), black_box("members.remove")));
    });

    group.finish();
}

fn bench_checker(c: &mut Criterion) {
    let mut group = c.benchmark_group("checker");
    let registry = registry();

    for count in [1usize, 10, 100] {
        let assignments = (0..count)
            .map(|i| RoleAssignment::new("alice", "member", "organization", format!("org{}", i)))
            .chain(std::iter::once(RoleAssignment::new(
                "alice",
                "admin",
                "organization",
                "target",
            )))
            .collect();
        let checker = Checker::new(
            "alice",
            UserRoles::new("alice", assignments),
            Arc::clone(&registry),
        );

        group.bench_with_input(BenchmarkId::new("has_permission", count), &checker, |b, c| {
            b.iter(|| c.has_permission(black_box("settings.billing"), "organization", "target"));
        });

        group.bench_with_input(BenchmarkId::new("can_assign_role", count), &checker, |b, c| {
            b.iter(|| c.can_assign_role(black_box("viewer"), "organization", "target"));
        });
    }

    group.finish();
}

fn bench_assign(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let manager = RoleManager::new(registry(), Arc::new(MemoryStore::new()));
    let ctx = AuditContext::for_actor("alice");

    runtime
        .block_on(manager.assign(&ctx, "alice", "admin", "organization", "org1"))
        .unwrap();

    let mut n = 0u64;
    c.bench_function("coordinator_assign", |b| {
        b.to_async(&runtime).iter(|| {
            n += 1;
            let user = format!("user-{}", n);
            let manager = &manager;
            let ctx = &ctx;
            async move {
                manager
                    .assign(ctx, &user, "member", "organization", "org1")
                    .await
                    .unwrap()
            }
        });
    });
}

criterion_group!(benches, bench_permission_matching, bench_checker, bench_assign);

criterion_main!(benches);
