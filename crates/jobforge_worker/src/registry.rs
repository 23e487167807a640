//! The process-wide `id -> handler` map.
//!
//! A job never carries a pickled closure, only a registered handler id. This
//! is what makes `PROCESS` worker mode possible at all: a subprocess can
//! re-run a handler it knows by name, but it cannot deserialize arbitrary
//! code it was never given.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::HandlerError;

pub type Handler =
    Arc<dyn Fn(&ExecutionContext, Value, Value) -> Result<Value, HandlerError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, handler: F)
    where
        F: Fn(&ExecutionContext, Value, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(id.into(), Arc::new(handler));
    }

    pub fn get(&self, id: &str) -> Option<Handler> {
        self.handlers.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_protocol::JobId;

    #[test]
    fn register_then_lookup_round_trips() {
        let mut registry = HandlerRegistry::new();
        registry.register("identity", |_ctx, args, _kwargs| Ok(args));

        let handler = registry.get("identity").expect("handler should be registered");
        let ctx = ExecutionContext::new(
            JobId::new(),
            false,
            false,
            crate::cancel::CancellationToken::new(),
            Arc::new(crate::context::NullProgressSink),
        );
        let result = handler(&ctx, Value::from(7), Value::Null).unwrap();
        assert_eq!(result, Value::from(7));
    }

    #[test]
    fn unknown_id_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
