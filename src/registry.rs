use std::collections::BTreeMap;

use crate::error::SeqstageError;

pub type CommandParams = BTreeMap<String, String>;

type Handler = Box<dyn Fn(&CommandParams) -> Result<(), SeqstageError> + Send + Sync>;

/// Explicit command-name → handler table, populated once at startup. No name
/// is ever resolved by runtime introspection; an unregistered name is
/// `UnknownCommand`.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&CommandParams) -> Result<(), SeqstageError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn dispatch(&self, name: &str, params: &CommandParams) -> Result<(), SeqstageError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| SeqstageError::UnknownCommand(name.to_string()))?;
        handler(params)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn dispatch_registered_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut registry = CommandRegistry::new();
        registry.register("dump", move |params| {
            assert_eq!(params.get("nthread").map(String::as_str), Some("4"));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut params = CommandParams::new();
        params.insert("nthread".to_string(), "4".to_string());
        registry.dispatch("dump", &params).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let registry = CommandRegistry::new();
        let err = registry.dispatch("scrub", &CommandParams::new()).unwrap_err();
        assert_matches!(err, SeqstageError::UnknownCommand(_));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register("list", |_| Ok(()));
        registry.register("add", |_| Ok(()));
        assert_eq!(registry.names(), vec!["add", "list"]);
    }
}
