//! Pluggable units of functionality.
//!
//! A feature is anything with an `initialize` that registers method handlers.
//! The engine knows nothing else about it; request handlers and notification
//! handlers share one method table and the method string disambiguates.

use std::{collections::HashMap, sync::Arc};

use crate::{error::ProtocolError, service::MethodHandler};

pub trait Feature: Send + Sync {
    fn initialize(&self, ctx: &mut FeatureContext<'_>) -> Result<(), ProtocolError>;
}

/// The only surface a feature sees during installation.
pub struct FeatureContext<'a> {
    pub(crate) handlers: &'a mut HashMap<String, Arc<dyn MethodHandler>>,
}

impl FeatureContext<'_> {
    /// Register a handler for a method. Registering the same method twice is
    /// an error, whether within one feature or across features.
    pub fn register_handler(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), ProtocolError> {
        let method = method.into();
        if self.handlers.contains_key(&method) {
            return Err(ProtocolError::DuplicateHandler(method));
        }
        tracing::debug!(%method, "handler registered");
        self.handlers.insert(method, handler);
        Ok(())
    }
}
