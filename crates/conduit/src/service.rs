//! The transport-agnostic protocol engine.
//!
//! The engine owns the correlation state for every connected transport:
//! pending outgoing requests keyed by `(connection, session, request-id)`,
//! incoming requests with their abort handles, and the progress-token index.
//! Handlers are registered through [`Feature`]s and run on the tokio pool;
//! every shared map sits behind a lock and is never held across an await.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    error::{ProtocolError, ServiceError},
    model::{
        CancelledNotificationParam, ErrorData, JsonRpcMessage, JsonRpcNotification,
        JsonRpcRequest, ProgressNotificationParam, ProgressToken, RequestId, method,
    },
    session::{SessionContext, SessionId},
    transport::{IncomingHandler, MessageContext, SendRoute, Transport},
};

pub mod feature;
pub mod hooks;
pub mod id;

pub use feature::{Feature, FeatureContext};
pub use hooks::Hooks;
pub use id::{GenerateOptions, IdFormat, IdGenerator, UuidIdGenerator};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Engine-generated connection identifier, unique for the engine's lifetime.
pub type ConnectionId = String;

/// Optional message validation installed on the engine. Implementations own
/// whatever schemas they validate against; a failed validation is answered
/// with the returned error when the message was a request, and dropped
/// otherwise.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, message: &JsonRpcMessage) -> Result<(), ErrorData>;
}

pub type ProgressCallback = Arc<dyn Fn(ProgressNotificationParam) + Send + Sync>;

/// Options for one outgoing send.
#[derive(Clone, Default)]
pub struct SendOptions {
    pub route: SendRoute,
    /// Response wait ceiling; [`DEFAULT_REQUEST_TIMEOUT`] when unset.
    pub timeout: Option<Duration>,
    /// Restart the timeout timer whenever a progress notification arrives for
    /// this request's token.
    pub reset_timeout_on_progress: bool,
    /// Absolute cap on the wait, regardless of progress resets.
    pub max_total_timeout: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
    /// External abort: cancelling this token stops waiting on the response
    /// and cleans up, without notifying the peer.
    pub signal: Option<CancellationToken>,
}

impl SendOptions {
    pub fn routed(route: SendRoute) -> Self {
        SendOptions {
            route,
            ..Self::default()
        }
    }
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct HandlerContext {
    /// Facade for talking back to the peer on the originating connection.
    pub peer: Peer,
    pub session: Option<SessionContext>,
    /// Instance tag of the transport that delivered the message.
    pub instance_id: String,
    pub id_generator: Arc<dyn IdGenerator>,
}

#[derive(Clone)]
pub struct HandlerInfo {
    pub method: String,
    pub received_at: DateTime<Utc>,
    /// Transport-supplied metadata, opaque to the engine.
    pub metadata: Option<Value>,
    /// Tripped when the peer cancels this request. Handlers may ignore it;
    /// the engine suppresses the response either way.
    pub signal: CancellationToken,
}

pub type HandlerResult = Result<Value, ErrorData>;

/// A registered request or notification handler.
pub trait MethodHandler: Send + Sync + 'static {
    fn handle(
        &self,
        message: JsonRpcMessage,
        ctx: HandlerContext,
        info: HandlerInfo,
    ) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(JsonRpcMessage, HandlerContext, HandlerInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(
        &self,
        message: JsonRpcMessage,
        ctx: HandlerContext,
        info: HandlerInfo,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(message, ctx, info))
    }
}

/// Wrap an async closure as a [`MethodHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(JsonRpcMessage, HandlerContext, HandlerInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CorrelationKey {
    connection: ConnectionId,
    session: Option<SessionId>,
    request: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgressKey {
    connection: ConnectionId,
    session: Option<SessionId>,
    token: ProgressToken,
}

struct PendingEntry {
    responder: oneshot::Sender<Result<JsonRpcMessage, ServiceError>>,
    /// Cancelled whenever the entry leaves the table; stops the timer.
    settled: CancellationToken,
    on_progress: Option<ProgressCallback>,
    reset_timeout: Option<mpsc::UnboundedSender<()>>,
    progress_key: Option<ProgressKey>,
}

struct ConnectionEntry {
    transport: Arc<dyn Transport>,
}

pub struct ProtocolOptions {
    pub request_timeout: Duration,
    /// When set, outgoing requests through a [`Peer`] fail unless the
    /// session's negotiated client capabilities cover the method.
    pub enforce_strict_capabilities: bool,
    pub id_generator: Arc<dyn IdGenerator>,
    pub validator: Option<Arc<dyn Validator>>,
    pub hooks: Hooks,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enforce_strict_capabilities: false,
            id_generator: Arc::new(UuidIdGenerator),
            validator: None,
            hooks: Hooks::default(),
        }
    }
}

struct ProtocolCore {
    options: ProtocolOptions,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    pending: Mutex<HashMap<CorrelationKey, PendingEntry>>,
    progress: Mutex<HashMap<ProgressKey, CorrelationKey>>,
    incoming: Mutex<HashMap<CorrelationKey, CancellationToken>>,
    ready_sessions: Mutex<HashSet<SessionId>>,
}

/// The protocol engine. Cheap to clone; all clones share one core.
#[derive(Clone)]
pub struct Protocol {
    core: Arc<ProtocolCore>,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::new(ProtocolOptions::default())
    }
}

impl Protocol {
    pub fn new(options: ProtocolOptions) -> Self {
        Protocol {
            core: Arc::new(ProtocolCore {
                options,
                connections: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                progress: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                ready_sessions: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Install a feature: run its `initialize` against the shared handler
    /// table.
    pub fn add_feature(&self, feature: &dyn Feature) -> Result<(), ProtocolError> {
        let mut handlers = self.core.handlers.write().expect("handler table poisoned");
        let mut ctx = FeatureContext {
            handlers: &mut handlers,
        };
        feature.initialize(&mut ctx)
    }

    /// Attach a transport: mint a connection id, install the incoming
    /// callback, and start the transport.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<ConnectionId, ProtocolError> {
        let connection = self
            .core
            .options
            .id_generator
            .generate(GenerateOptions::prefixed("conn"));
        self.core
            .connections
            .write()
            .expect("connection table poisoned")
            .insert(
                connection.clone(),
                ConnectionEntry {
                    transport: transport.clone(),
                },
            );

        // The callback holds the core weakly; the engine owns its
        // connections, the transport must not own the engine back.
        let weak = Arc::downgrade(&self.core);
        let callback_connection = connection.clone();
        let incoming: IncomingHandler = Arc::new(move |message, context| {
            let weak: Weak<ProtocolCore> = weak.clone();
            let connection = callback_connection.clone();
            Box::pin(async move {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(
                    ProtocolCore::dispatch(core, connection.clone(), message, context)
                        .instrument(tracing::debug_span!("dispatch", %connection)),
                );
            })
        });

        if let Err(error) = transport.connect(incoming).await {
            self.core
                .connections
                .write()
                .expect("connection table poisoned")
                .remove(&connection);
            return Err(error.into());
        }
        tracing::info!(%connection, transport = transport.instance_id(), "transport connected");
        Ok(connection)
    }

    /// Detach a connection: fail its pending requests, trip its incoming
    /// aborts, and stop the transport.
    pub async fn disconnect(&self, connection: &ConnectionId) -> Result<(), ProtocolError> {
        let entry = self
            .core
            .connections
            .write()
            .expect("connection table poisoned")
            .remove(connection);

        self.core
            .fail_pending_matching(|key| key.connection == *connection);
        self.core
            .trip_incoming_matching(|key| key.connection == *connection);

        if let Some(entry) = entry {
            entry.transport.disconnect().await?;
            tracing::info!(%connection, "transport disconnected");
        }
        Ok(())
    }

    /// Send a message on a connection. Notifications (structurally, or by the
    /// `notifications/` method prefix) are fire-and-forget and resolve with
    /// `None`; requests resolve with the full response envelope.
    pub async fn send(
        &self,
        connection: &ConnectionId,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<Option<JsonRpcMessage>, ServiceError> {
        let transport = self
            .core
            .transport_of(connection)
            .ok_or_else(|| ServiceError::UnknownConnection(connection.clone()))?;

        // Type is determined by the method string: the `notifications/`
        // prefix means fire-and-forget even for a message carrying an id.
        let is_notification = matches!(&message, JsonRpcMessage::Notification(_))
            || message
                .method()
                .is_some_and(|m| m.starts_with(method::NOTIFICATION_PREFIX));

        match &message {
            _ if is_notification => {
                hooks::fire_message(
                    &self.core.options.hooks.on_before_send_notification,
                    &message,
                );
                transport.send(message.clone(), options.route).await?;
                hooks::fire_message(
                    &self.core.options.hooks.on_after_send_notification,
                    &message,
                );
                Ok(None)
            }
            JsonRpcMessage::Request(request) => self
                .core
                .send_request(connection, transport, request.clone(), options)
                .await
                .map(Some),
            // Raw responses and errors pass straight through.
            _ => {
                transport.send(message, options.route).await?;
                Ok(None)
            }
        }
    }

    /// Send a request with an id minted by the configured generator.
    pub async fn request(
        &self,
        connection: &ConnectionId,
        method: impl Into<String>,
        params: Option<Value>,
        options: SendOptions,
    ) -> Result<JsonRpcMessage, ServiceError> {
        let id = self
            .core
            .options
            .id_generator
            .generate(GenerateOptions::prefixed("req"));
        let message = JsonRpcMessage::request(id, method, params);
        self.send(connection, message, options)
            .await?
            .ok_or(ServiceError::NotARequest)
    }

    /// Send a notification routed at a session's background channel.
    pub async fn notify(
        &self,
        connection: &ConnectionId,
        method: impl Into<String>,
        params: Option<Value>,
        route: SendRoute,
    ) -> Result<(), ServiceError> {
        self.send(
            connection,
            JsonRpcMessage::notification(method, params),
            SendOptions::routed(route),
        )
        .await
        .map(|_| ())
    }

    /// Shut the engine down: every pending request is rejected with a
    /// connection-closed error, every incoming abort is tripped, every
    /// connection's transport is disconnected, and the maps are cleared.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.core.fail_pending_matching(|_| true);
        self.core.trip_incoming_matching(|_| true);
        self.core
            .progress
            .lock()
            .expect("progress index poisoned")
            .clear();

        let connections: Vec<(ConnectionId, ConnectionEntry)> = self
            .core
            .connections
            .write()
            .expect("connection table poisoned")
            .drain()
            .collect();
        for (id, entry) in connections {
            if let Err(error) = entry.transport.disconnect().await {
                tracing::warn!(connection = %id, %error, "transport disconnect failed during close");
            }
        }
        self.core
            .ready_sessions
            .lock()
            .expect("ready set poisoned")
            .clear();
        if let Some(hook) = &self.core.options.hooks.on_close {
            hook();
        }
        Ok(())
    }
}

impl ProtocolCore {
    fn transport_of(&self, connection: &ConnectionId) -> Option<Arc<dyn Transport>> {
        self.connections
            .read()
            .expect("connection table poisoned")
            .get(connection)
            .map(|entry| entry.transport.clone())
    }

    fn session_of(context: &MessageContext) -> Option<SessionId> {
        context.session.as_ref().map(|s| s.id().clone())
    }

    async fn dispatch(
        core: Arc<Self>,
        connection: ConnectionId,
        message: JsonRpcMessage,
        context: MessageContext,
    ) {
        hooks::fire_message(&core.options.hooks.on_before_receive, &message);

        if let Some(validator) = &core.options.validator {
            if let Err(error) = validator.validate(&message) {
                tracing::warn!(%error, "inbound message failed validation");
                if let JsonRpcMessage::Request(request) = &message {
                    let route = SendRoute {
                        session_id: Self::session_of(&context),
                        request_id: Some(request.id.clone()),
                    };
                    core.reply(
                        &connection,
                        JsonRpcMessage::error(Some(request.id.clone()), error),
                        route,
                    )
                    .await;
                }
                return;
            }
        }

        match &message {
            JsonRpcMessage::Response(response) => {
                let key = CorrelationKey {
                    connection: connection.clone(),
                    session: Self::session_of(&context),
                    request: response.id.clone(),
                };
                core.settle(&key, Ok(message.clone()));
            }
            JsonRpcMessage::Error(error) => match &error.id {
                Some(id) => {
                    let key = CorrelationKey {
                        connection: connection.clone(),
                        session: Self::session_of(&context),
                        request: id.clone(),
                    };
                    core.settle(&key, Err(ServiceError::ErrorResponse(error.error.clone())));
                }
                None => {
                    tracing::info!(error = %error.error, "dropping error envelope without id");
                }
            },
            JsonRpcMessage::Request(request) => {
                core.process_request(&connection, request.clone(), &context)
                    .await;
            }
            JsonRpcMessage::Notification(notification) => {
                core.process_notification(&connection, notification.clone(), &context)
                    .await;
            }
        }

        hooks::fire_message(&core.options.hooks.on_after_receive, &message);
    }

    /// Remove a pending entry and complete its future. Unknown keys are
    /// dropped at info level.
    fn settle(&self, key: &CorrelationKey, outcome: Result<JsonRpcMessage, ServiceError>) {
        let entry = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(key);
        match entry {
            Some(entry) => {
                entry.settled.cancel();
                if let Some(progress_key) = &entry.progress_key {
                    self.progress
                        .lock()
                        .expect("progress index poisoned")
                        .remove(progress_key);
                }
                let _ = entry.responder.send(outcome);
            }
            None => {
                tracing::info!(request_id = %key.request, "dropping response for unknown request");
            }
        }
    }

    /// Remove a pending entry without completing it; used when the caller is
    /// already returning an error of its own.
    fn remove_pending(&self, key: &CorrelationKey) {
        let entry = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(key);
        if let Some(entry) = entry {
            entry.settled.cancel();
            if let Some(progress_key) = &entry.progress_key {
                self.progress
                    .lock()
                    .expect("progress index poisoned")
                    .remove(progress_key);
            }
        }
    }

    fn fail_pending_matching(&self, predicate: impl Fn(&CorrelationKey) -> bool) {
        let drained: Vec<(CorrelationKey, PendingEntry)> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let keys: Vec<CorrelationKey> =
                pending.keys().filter(|key| predicate(key)).cloned().collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        for (key, entry) in drained {
            entry.settled.cancel();
            if let Some(progress_key) = &entry.progress_key {
                self.progress
                    .lock()
                    .expect("progress index poisoned")
                    .remove(progress_key);
            }
            tracing::debug!(request_id = %key.request, "rejecting pending request: connection closed");
            let _ = entry.responder.send(Err(ServiceError::ConnectionClosed));
        }
    }

    fn trip_incoming_matching(&self, predicate: impl Fn(&CorrelationKey) -> bool) {
        let tripped: Vec<CancellationToken> = {
            let mut incoming = self.incoming.lock().expect("incoming table poisoned");
            let keys: Vec<CorrelationKey> =
                incoming.keys().filter(|key| predicate(key)).cloned().collect();
            keys.into_iter()
                .filter_map(|key| incoming.remove(&key))
                .collect()
        };
        for token in tripped {
            token.cancel();
        }
    }

    async fn reply(&self, connection: &ConnectionId, message: JsonRpcMessage, route: SendRoute) {
        match self.transport_of(connection) {
            Some(transport) => {
                if let Err(error) = transport.send(message, route).await {
                    tracing::error!(%connection, %error, "failed to emit reply");
                }
            }
            None => {
                tracing::warn!(%connection, "connection gone, dropping reply");
            }
        }
    }

    async fn process_request(
        self: &Arc<Self>,
        connection: &ConnectionId,
        request: JsonRpcRequest,
        context: &MessageContext,
    ) {
        let session_id = Self::session_of(context);
        let key = CorrelationKey {
            connection: connection.clone(),
            session: session_id.clone(),
            request: request.id.clone(),
        };
        let abort = CancellationToken::new();
        self.incoming
            .lock()
            .expect("incoming table poisoned")
            .insert(key.clone(), abort.clone());
        let _guard = IncomingGuard {
            core: self.clone(),
            key,
        };

        let route = SendRoute {
            session_id,
            request_id: Some(request.id.clone()),
        };

        let handler = self
            .handlers
            .read()
            .expect("handler table poisoned")
            .get(&request.method)
            .cloned();
        let Some(handler) = handler else {
            tracing::debug!(method = %request.method, "no handler registered");
            self.reply(
                connection,
                JsonRpcMessage::error(
                    Some(request.id.clone()),
                    ErrorData::method_not_found(&request.method),
                ),
                route,
            )
            .await;
            return;
        };

        let ctx = HandlerContext {
            peer: Peer {
                protocol: Protocol { core: self.clone() },
                connection: connection.clone(),
                session: context.session.clone(),
            },
            session: context.session.clone(),
            instance_id: context.transport_id.clone(),
            id_generator: self.options.id_generator.clone(),
        };
        let info = HandlerInfo {
            method: request.method.clone(),
            received_at: Utc::now(),
            metadata: context.metadata.clone(),
            signal: abort.clone(),
        };

        let outcome = AssertUnwindSafe(handler.handle(
            JsonRpcMessage::Request(request.clone()),
            ctx,
            info,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(method = %request.method, "handler panicked");
            Err(ErrorData::internal_error("handler panicked"))
        });

        if abort.is_cancelled() {
            tracing::debug!(request_id = %request.id, "request cancelled, response suppressed");
            return;
        }

        let envelope = match outcome {
            Ok(result) => JsonRpcMessage::response(request.id.clone(), result),
            Err(error) => {
                if let Some(hook) = &self.options.hooks.on_handler_error {
                    hook(&error);
                }
                tracing::warn!(method = %request.method, %error, "handler returned error");
                JsonRpcMessage::error(Some(request.id.clone()), error)
            }
        };
        self.reply(connection, envelope, route).await;
    }

    async fn process_notification(
        self: &Arc<Self>,
        connection: &ConnectionId,
        notification: JsonRpcNotification,
        context: &MessageContext,
    ) {
        match notification.method.as_str() {
            method::CANCELLED => {
                self.handle_cancelled(connection, &notification, context);
                return;
            }
            method::PROGRESS => {
                self.handle_progress(connection, &notification, context);
                return;
            }
            method::INITIALIZED => {
                self.fire_ready(context);
                // falls through to any registered handler
            }
            _ => {}
        }

        let handler = self
            .handlers
            .read()
            .expect("handler table poisoned")
            .get(&notification.method)
            .cloned();
        let Some(handler) = handler else {
            tracing::debug!(method = %notification.method, "no handler for notification");
            return;
        };

        let ctx = HandlerContext {
            peer: Peer {
                protocol: Protocol { core: self.clone() },
                connection: connection.clone(),
                session: context.session.clone(),
            },
            session: context.session.clone(),
            instance_id: context.transport_id.clone(),
            id_generator: self.options.id_generator.clone(),
        };
        let info = HandlerInfo {
            method: notification.method.clone(),
            received_at: Utc::now(),
            metadata: context.metadata.clone(),
            signal: CancellationToken::new(),
        };

        // Notification handlers may not reply; the result is discarded.
        let outcome = AssertUnwindSafe(handler.handle(
            JsonRpcMessage::Notification(notification.clone()),
            ctx,
            info,
        ))
        .catch_unwind()
        .await;
        match outcome {
            Ok(Err(error)) => {
                if let Some(hook) = &self.options.hooks.on_handler_error {
                    hook(&error);
                }
                tracing::warn!(method = %notification.method, %error, "notification handler failed");
            }
            Err(_) => {
                tracing::error!(method = %notification.method, "notification handler panicked");
            }
            Ok(Ok(_)) => {}
        }
    }

    fn handle_cancelled(
        &self,
        connection: &ConnectionId,
        notification: &JsonRpcNotification,
        context: &MessageContext,
    ) {
        let params = notification.params.clone().unwrap_or(Value::Null);
        let params: CancelledNotificationParam = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(error) => {
                tracing::warn!(%error, "malformed cancellation notification");
                return;
            }
        };
        let key = CorrelationKey {
            connection: connection.clone(),
            session: Self::session_of(context),
            request: params.request_id.clone(),
        };
        let token = self
            .incoming
            .lock()
            .expect("incoming table poisoned")
            .get(&key)
            .cloned();
        match token {
            Some(token) => {
                tracing::info!(
                    request_id = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or("unspecified"),
                    "request cancelled by peer"
                );
                token.cancel();
            }
            None => {
                tracing::debug!(request_id = %params.request_id, "cancellation for unknown request");
            }
        }
    }

    fn handle_progress(
        &self,
        connection: &ConnectionId,
        notification: &JsonRpcNotification,
        context: &MessageContext,
    ) {
        let params = notification.params.clone().unwrap_or(Value::Null);
        let params: ProgressNotificationParam = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(error) => {
                tracing::warn!(%error, "malformed progress notification");
                return;
            }
        };
        let progress_key = ProgressKey {
            connection: connection.clone(),
            session: Self::session_of(context),
            token: params.progress_token.clone(),
        };
        let correlation = self
            .progress
            .lock()
            .expect("progress index poisoned")
            .get(&progress_key)
            .cloned();
        let Some(correlation) = correlation else {
            tracing::debug!(token = %params.progress_token, "progress for unknown token");
            return;
        };
        let (callback, reset) = {
            let pending = self.pending.lock().expect("pending table poisoned");
            match pending.get(&correlation) {
                Some(entry) => (entry.on_progress.clone(), entry.reset_timeout.clone()),
                None => (None, None),
            }
        };
        if let Some(callback) = callback {
            callback(params);
        }
        if let Some(reset) = reset {
            let _ = reset.send(());
        }
    }

    fn fire_ready(&self, context: &MessageContext) {
        let Some(session) = &context.session else {
            return;
        };
        let first = self
            .ready_sessions
            .lock()
            .expect("ready set poisoned")
            .insert(session.id().clone());
        if first {
            tracing::info!(session_id = %session.id(), "session initialized");
            if let Some(hook) = &self.options.hooks.on_ready {
                hook(session.id());
            }
        }
    }

    async fn send_request(
        self: &Arc<Self>,
        connection: &ConnectionId,
        transport: Arc<dyn Transport>,
        request: JsonRpcRequest,
        options: SendOptions,
    ) -> Result<JsonRpcMessage, ServiceError> {
        let key = CorrelationKey {
            connection: connection.clone(),
            session: options.route.session_id.clone(),
            request: request.id.clone(),
        };
        let settled = CancellationToken::new();
        let (responder, receiver) = oneshot::channel();

        let progress_key = match (&options.on_progress, request.progress_token()) {
            (Some(_), Some(token)) => {
                let progress_key = ProgressKey {
                    connection: connection.clone(),
                    session: options.route.session_id.clone(),
                    token,
                };
                self.progress
                    .lock()
                    .expect("progress index poisoned")
                    .insert(progress_key.clone(), key.clone());
                Some(progress_key)
            }
            _ => None,
        };

        let mut reset_channel = options
            .reset_timeout_on_progress
            .then(mpsc::unbounded_channel::<()>);
        let reset_tx = reset_channel.as_ref().map(|(tx, _)| tx.clone());

        self.pending.lock().expect("pending table poisoned").insert(
            key.clone(),
            PendingEntry {
                responder,
                settled: settled.clone(),
                on_progress: options.on_progress.clone(),
                reset_timeout: reset_tx,
                progress_key,
            },
        );

        // Timer task: fires the timeout unless the entry settles first;
        // progress notifications may restart it, the max-total deadline may
        // not be pushed back.
        {
            let core = self.clone();
            let key = key.clone();
            let settled = settled.clone();
            let session_id = options.route.session_id.clone();
            let request_id = request.id.clone();
            let timeout = options.timeout.unwrap_or(core.options.request_timeout);
            let max_deadline = options
                .max_total_timeout
                .map(|cap| tokio::time::Instant::now() + cap);
            let mut reset_rx = reset_channel.take().map(|(_, rx)| rx);
            tokio::spawn(async move {
                loop {
                    let deadline = {
                        let next = tokio::time::Instant::now() + timeout;
                        match max_deadline {
                            Some(max) => next.min(max),
                            None => next,
                        }
                    };
                    let reset = async {
                        match reset_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = settled.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => {
                            core.settle(
                                &key,
                                Err(ServiceError::Timeout {
                                    request_id: request_id.clone(),
                                    session_id: session_id.clone(),
                                    timeout,
                                }),
                            );
                            return;
                        }
                        reset = reset => {
                            if reset.is_none() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let message = JsonRpcMessage::Request(request.clone());
        hooks::fire_message(&self.options.hooks.on_before_send_request, &message);
        let route = SendRoute {
            session_id: options.route.session_id.clone(),
            request_id: Some(request.id.clone()),
        };
        if let Err(error) = transport.send(message.clone(), route).await {
            self.remove_pending(&key);
            return Err(ServiceError::Transport(error));
        }
        hooks::fire_message(&self.options.hooks.on_after_send_request, &message);

        let external = options.signal.clone();
        let aborted = async move {
            match external {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(ServiceError::ConnectionClosed),
            },
            _ = aborted => {
                self.remove_pending(&key);
                Err(ServiceError::Aborted)
            }
        }
    }
}

struct IncomingGuard {
    core: Arc<ProtocolCore>,
    key: CorrelationKey,
}

impl Drop for IncomingGuard {
    fn drop(&mut self) {
        self.core
            .incoming
            .lock()
            .expect("incoming table poisoned")
            .remove(&self.key);
    }
}

/// Handler-side facade for talking to the peer on one connection.
#[derive(Clone)]
pub struct Peer {
    protocol: Protocol,
    connection: ConnectionId,
    session: Option<SessionContext>,
}

impl Peer {
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    fn route(&self) -> SendRoute {
        SendRoute {
            session_id: self.session.as_ref().map(|s| s.id().clone()),
            request_id: None,
        }
    }

    /// Fire a notification at the peer's background channel.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.protocol
            .notify(&self.connection, method, params, self.route())
            .await
    }

    /// Send a server-initiated request and wait for the response envelope.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        mut options: SendOptions,
    ) -> Result<JsonRpcMessage, ServiceError> {
        let method = method.into();
        if self.protocol.core.options.enforce_strict_capabilities {
            self.assert_capability(&method).await?;
        }
        options.route = self.route();
        self.protocol
            .request(&self.connection, method, params, options)
            .await
    }

    pub async fn ping(&self) -> Result<(), ServiceError> {
        self.request(method::PING, None, SendOptions::default())
            .await
            .map(|_| ())
    }

    async fn assert_capability(&self, method: &str) -> Result<(), ServiceError> {
        let required = match method {
            "sampling/createMessage" => "sampling",
            "roots/list" => "roots",
            "elicitation/create" => "elicitation",
            _ => return Ok(()),
        };
        let capabilities = match &self.session {
            Some(session) => session.client_capabilities().await,
            None => None,
        };
        let supported = capabilities
            .as_ref()
            .and_then(|caps| caps.get(required))
            .is_some();
        if supported {
            Ok(())
        } else {
            Err(ServiceError::MissingCapability(required.to_owned()))
        }
    }
}
