//! Graphloom Hooks - document source providers
//!
//! Implementations of the `SourceHooks` port, selected through the `hooks`
//! config section:
//! - `static`: paragraphs straight from configuration (development, demos)
//! - `sqlite`: a local SQLite table of timestamped documents
//!
//! Hook calls are blocking by contract; the build service runs them on the
//! blocking thread pool.

use std::sync::Arc;

use graphloom_core::config::HooksConfig;
use graphloom_core::ports::{HookError, SourceHooks};

pub mod sqlite_hooks;
pub mod static_hooks;

pub use sqlite_hooks::SqliteHooks;
pub use static_hooks::StaticHooks;

/// Builds the configured hook provider.
pub fn from_config(cfg: &HooksConfig) -> Result<Arc<dyn SourceHooks>, HookError> {
    match cfg.provider.as_str() {
        "static" => Ok(Arc::new(StaticHooks::new(
            cfg.static_full.clone(),
            cfg.static_incremental.clone(),
        ))),
        "sqlite" => {
            let path = cfg
                .sqlite_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| HookError::Config("hooks.sqlite_path is required".into()))?;
            let table = cfg
                .table_name
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| HookError::Config("hooks.table_name is required".into()))?;
            Ok(Arc::new(SqliteHooks::new(path, table)?))
        }
        other => Err(HookError::Config(format!("unknown hooks provider '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> HooksConfig {
        HooksConfig {
            provider: provider.into(),
            static_full: vec!["full text".into()],
            static_incremental: vec![],
            sqlite_path: None,
            table_name: None,
        }
    }

    #[test]
    fn static_provider_builds() {
        let hooks = from_config(&config("static")).unwrap();
        assert_eq!(hooks.get_full_data().unwrap(), vec!["full text"]);
    }

    #[test]
    fn sqlite_provider_requires_path_and_table() {
        let err = match from_config(&config("sqlite")) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, HookError::Config(_)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = match from_config(&config("kafka")) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("kafka"));
    }
}
