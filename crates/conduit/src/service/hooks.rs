//! Lifecycle hooks the engine invokes around message processing.
//!
//! All hooks are optional and synchronous; they observe, they do not steer.

use std::sync::Arc;

use crate::{
    model::{ErrorData, JsonRpcMessage},
    session::SessionId,
};

pub type MessageHook = Arc<dyn Fn(&JsonRpcMessage) + Send + Sync>;
pub type SessionHook = Arc<dyn Fn(&SessionId) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ErrorData) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_before_receive: Option<MessageHook>,
    pub on_after_receive: Option<MessageHook>,
    pub on_before_send_request: Option<MessageHook>,
    pub on_after_send_request: Option<MessageHook>,
    pub on_before_send_notification: Option<MessageHook>,
    pub on_after_send_notification: Option<MessageHook>,
    pub on_handler_error: Option<ErrorHook>,
    /// Fired exactly once per session, when its `notifications/initialized`
    /// arrives.
    pub on_ready: Option<SessionHook>,
    pub on_close: Option<CloseHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ready(mut self, hook: impl Fn(&SessionId) + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Arc::new(hook));
        self
    }

    pub fn on_handler_error(mut self, hook: impl Fn(&ErrorData) + Send + Sync + 'static) -> Self {
        self.on_handler_error = Some(Arc::new(hook));
        self
    }

    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_before_receive(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_before_receive = Some(Arc::new(hook));
        self
    }

    pub fn on_after_receive(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_after_receive = Some(Arc::new(hook));
        self
    }

    pub fn on_before_send_request(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_before_send_request = Some(Arc::new(hook));
        self
    }

    pub fn on_after_send_request(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_after_send_request = Some(Arc::new(hook));
        self
    }

    pub fn on_before_send_notification(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_before_send_notification = Some(Arc::new(hook));
        self
    }

    pub fn on_after_send_notification(
        mut self,
        hook: impl Fn(&JsonRpcMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_after_send_notification = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

pub(crate) fn fire_message(hook: &Option<MessageHook>, message: &JsonRpcMessage) {
    if let Some(hook) = hook {
        hook(message);
    }
}
