//! Step-type to handler lookup, built once at startup.

use super::StepHandler;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own step type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers
            .insert(handler.step_type().to_string(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
