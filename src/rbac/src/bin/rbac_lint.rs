//! # Registry Linter
//!
//! Loads a JSON registry definition, validates it and prints a summary of
//! every scope type, its roles and the permissions they grant.
//!
//! ## Usage
//!
//! ```text
//! rbac-lint registry.json
//! ```
//!
//! Environment variables:
//! - `RUST_LOG` - Log level (default: info)

use anyhow::{bail, Context};
use cretoai_rbac::{Registry, VERSION};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("rbac-lint v{}", VERSION);

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: rbac-lint <registry.json>");
    };

    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read registry file {}", path))?;

    let registry = match Registry::from_json(&json) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Registry rejected: {}", e);
            return Err(e).context(format!("invalid registry in {}", path));
        }
    };

    info!("Registry OK: {} scope type(s)", registry.len());
    for scope_type in registry.scope_types() {
        let Some(scope) = registry.get_scope(scope_type) else {
            continue;
        };

        let ancestors = registry.ancestors(scope_type);
        if ancestors.is_empty() {
            info!("scope {}", scope_type);
        } else {
            info!("scope {} (under {})", scope_type, ancestors.join(" > "));
        }

        for role in scope.roles() {
            info!(
                "  role {:<16} grants [{}] assigns [{}]",
                role.name(),
                role.permissions().join(", "),
                role.assignable().to_names().join(", ")
            );
        }

        let known = registry.known_permissions(scope_type);
        info!("  {} concrete permission(s)", known.len());
    }

    Ok(())
}
