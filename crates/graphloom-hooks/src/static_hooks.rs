//! Config-driven hook provider for development and demos.

use graphloom_core::ports::{HookError, SourceHooks};

/// Returns fixed paragraphs from configuration.
#[derive(Debug, Clone)]
pub struct StaticHooks {
    full: Vec<String>,
    incremental: Vec<String>,
}

impl StaticHooks {
    pub fn new(full: Vec<String>, incremental: Vec<String>) -> Self {
        Self { full, incremental }
    }
}

impl SourceHooks for StaticHooks {
    fn get_full_data(&self) -> Result<Vec<String>, HookError> {
        Ok(self.full.clone())
    }

    fn get_incremental_data(&self, _since_version: &str) -> Result<Vec<String>, HookError> {
        Ok(self.incremental.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_configured_texts() {
        let hooks = StaticHooks::new(vec!["a".into()], vec!["b".into()]);
        assert_eq!(hooks.get_full_data().unwrap(), vec!["a"]);
        assert_eq!(hooks.get_incremental_data("123").unwrap(), vec!["b"]);
    }
}
