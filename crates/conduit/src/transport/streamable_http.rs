//! Broker-routed streamable HTTP transport.
//!
//! One configured endpoint (default `/mcp`) multiplexes three roles:
//!
//! * `POST` — client-to-server messages. The response is either buffered JSON
//!   or an SSE stream, chosen per request batch by the response-mode
//!   strategy. Responses are correlated over the broker: the handler may run
//!   on any node, the node that accepted the POST is subscribed to the
//!   request's outbound subject and relays whatever shows up there.
//! * `GET` — the background channel: an SSE stream of server-initiated
//!   notifications and requests for one session, resumable via
//!   `Last-Event-ID`.
//! * `DELETE` — idempotent session termination.
//!
//! `GET /health` and `GET /readiness` ride alongside on fixed paths.

use std::{
    collections::HashSet,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
    routing::get,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::http_header::{
    EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
};
use crate::{
    broker::{Broker, Delivery, SubscribeOptions, Subscription, subject},
    error::TransportError,
    model::{ErrorData, JsonRpcMessage, JsonRpcRequest, RequestId},
    session::{RequestMetadata, Session, SessionContext, SessionId, SessionStore},
    transport::{IncomingHandler, MessageContext, SendRoute, Transport},
};

pub const DEFAULT_ENDPOINT: &str = "/mcp";
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Methods that tend to stream or take long enough to want progress.
const STREAMING_PRONE_METHODS: &[&str] = &["tools/call", "prompts/get", "sampling/createMessage"];

/// How a POST's response is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Json,
    Sse,
}

/// Pure policy choosing the response mode from the batch (and optionally the
/// session). Overridable per deployment.
pub type ResponseModeStrategy =
    Arc<dyn Fn(&[JsonRpcMessage], Option<&Session>) -> ResponseMode + Send + Sync>;

/// Default policy: SSE when any request's method is streaming-prone or any
/// request carries `_meta.progressToken`, JSON otherwise.
pub fn default_response_mode(
    messages: &[JsonRpcMessage],
    _session: Option<&Session>,
) -> ResponseMode {
    let wants_sse = messages.iter().any(|message| match message {
        JsonRpcMessage::Request(request) => {
            STREAMING_PRONE_METHODS.contains(&request.method.as_str())
                || request.progress_token().is_some()
        }
        _ => false,
    });
    if wants_sse {
        ResponseMode::Sse
    } else {
        ResponseMode::Json
    }
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

impl HttpServerConfig {
    pub fn new(port: u16) -> Self {
        HttpServerConfig {
            host: "0.0.0.0".to_owned(),
            port,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct StreamableHttpConfig {
    /// JSON-mode wait ceiling across all requests of one POST.
    pub response_timeout: Duration,
    pub response_mode_strategy: ResponseModeStrategy,
    /// Enables GET.
    pub enable_background_channel: bool,
    /// Enables DELETE.
    pub enable_session_termination: bool,
    /// `:ping` comment frames on SSE streams; `None` disables them.
    pub sse_keep_alive: Option<Duration>,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        StreamableHttpConfig {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            response_mode_strategy: Arc::new(default_response_mode),
            enable_background_channel: true,
            enable_session_termination: true,
            sse_keep_alive: Some(DEFAULT_SSE_KEEP_ALIVE),
        }
    }
}

impl std::fmt::Debug for StreamableHttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpConfig")
            .field("response_timeout", &self.response_timeout)
            .field("enable_background_channel", &self.enable_background_channel)
            .field("enable_session_termination", &self.enable_session_termination)
            .field("sse_keep_alive", &self.sse_keep_alive)
            .finish_non_exhaustive()
    }
}

/// The transport object the engine connects to. Holds the broker, the
/// optional session store, and the incoming-message callback installed by
/// [`Protocol::connect`](crate::service::Protocol::connect).
pub struct StreamableHttpTransport<B: Broker> {
    instance_id: String,
    broker: Arc<B>,
    session_store: Option<Arc<dyn SessionStore>>,
    config: StreamableHttpConfig,
    incoming: Mutex<Option<IncomingHandler>>,
    /// Every open broker subscription held by an in-flight HTTP request.
    active_subscriptions: Arc<Mutex<HashSet<String>>>,
    listening: Arc<AtomicBool>,
    shutdown: CancellationToken,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<B: Broker> StreamableHttpTransport<B> {
    pub fn new(
        broker: Arc<B>,
        session_store: Option<Arc<dyn SessionStore>>,
        config: StreamableHttpConfig,
    ) -> Arc<Self> {
        Arc::new(StreamableHttpTransport {
            instance_id: format!("streamable-http-{}", &Uuid::new_v4().simple().to_string()[..8]),
            broker,
            session_store,
            config,
            incoming: Mutex::new(None),
            active_subscriptions: Arc::new(Mutex::new(HashSet::new())),
            listening: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            on_close: Mutex::new(None),
        })
    }

    /// Hook invoked exactly once when the transport disconnects.
    pub fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().expect("on_close poisoned") = Some(Box::new(hook));
    }

    /// Number of broker subscriptions currently held open by HTTP requests.
    pub fn active_subscription_count(&self) -> usize {
        self.active_subscriptions
            .lock()
            .expect("subscription set poisoned")
            .len()
    }

    fn incoming_handler(&self) -> Option<IncomingHandler> {
        self.incoming.lock().expect("incoming poisoned").clone()
    }

    async fn deliver(&self, message: JsonRpcMessage, session: SessionContext) {
        let Some(handler) = self.incoming_handler() else {
            tracing::warn!("message dropped: no engine connected to transport");
            return;
        };
        let context = MessageContext {
            transport_id: self.instance_id.clone(),
            session: Some(session),
            metadata: None,
        };
        handler(message, context).await;
    }
}

impl<B: Broker> Transport for StreamableHttpTransport<B> {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn connect(
        &self,
        incoming: IncomingHandler,
    ) -> futures::future::BoxFuture<'_, Result<(), TransportError>> {
        *self.incoming.lock().expect("incoming poisoned") = Some(incoming);
        Box::pin(std::future::ready(Ok(())))
    }

    fn disconnect(&self) -> futures::future::BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            // Stopping the server drops every in-flight request task, whose
            // guards unsubscribe whatever is still open.
            self.shutdown.cancel();
            let hook = self.on_close.lock().expect("on_close poisoned").take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(())
        })
    }

    fn send(
        &self,
        message: JsonRpcMessage,
        route: SendRoute,
    ) -> futures::future::BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let Some(session_id) = route.session_id else {
                return Err(TransportError::Config(
                    "send requires a session id in its route".into(),
                ));
            };
            let subject = match route.request_id {
                Some(request_id) => subject::request_outbound(&session_id, &request_id),
                // Requests go to the client's background inbound; everything
                // else is outbound fan-out.
                None => match &message {
                    JsonRpcMessage::Request(_) => subject::background_inbound(&session_id),
                    _ => subject::background_outbound(&session_id),
                },
            };
            self.broker
                .publish(&subject, &message)
                .await
                .map_err(TransportError::broker)?;
            Ok(())
        })
    }
}

/// A broker subscription registered in the transport's active set; leaving
/// the set and unsubscribing happen together, on every exit path.
struct TrackedSubscription<S: Subscription> {
    sub: S,
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
    done: bool,
}

impl<S: Subscription> TrackedSubscription<S> {
    fn new(sub: S, subject: &subject::Subject, active: Arc<Mutex<HashSet<String>>>) -> Self {
        let key = format!(
            "{}#{}",
            subject,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        active
            .lock()
            .expect("subscription set poisoned")
            .insert(key.clone());
        TrackedSubscription {
            sub,
            key,
            active,
            done: false,
        }
    }

    fn unsubscribe(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.sub.unsubscribe();
        self.active
            .lock()
            .expect("subscription set poisoned")
            .remove(&self.key);
    }
}

impl<S: Subscription> Stream for TrackedSubscription<S> {
    type Item = Delivery;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.sub).poll_next(cx)
    }
}

impl<S: Subscription> Drop for TrackedSubscription<S> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A bound, serving HTTP server for one transport.
pub struct StreamableHttpServer {
    pub local_addr: SocketAddr,
    ct: CancellationToken,
}

impl StreamableHttpServer {
    /// Bind and serve. Returns once the listener is up; the accept loop runs
    /// on a spawned task until [`cancel`](Self::cancel) or the transport
    /// disconnects.
    pub async fn serve<B: Broker>(
        transport: Arc<StreamableHttpTransport<B>>,
        http: HttpServerConfig,
    ) -> std::io::Result<Self> {
        Self::serve_with_layers(transport, http, |router| router).await
    }

    /// Like [`serve`](Self::serve), but runs the router through `layers`
    /// first. This is the middleware chain: apply tower layers in order; a
    /// layer that writes a complete response short-circuits the MCP handler.
    pub async fn serve_with_layers<B: Broker>(
        transport: Arc<StreamableHttpTransport<B>>,
        http: HttpServerConfig,
        layers: impl FnOnce(Router) -> Router,
    ) -> std::io::Result<Self> {
        let listener =
            tokio::net::TcpListener::bind((http.host.as_str(), http.port)).await?;
        let local_addr = listener.local_addr()?;

        let router = layers(mcp_router(transport.clone(), &http.endpoint));

        let ct = CancellationToken::new();
        let serve_ct = ct.clone();
        let linked = transport.shutdown.clone();
        let link_ct = ct.clone();
        tokio::spawn(async move {
            linked.cancelled().await;
            link_ct.cancel();
        });

        transport.listening.store(true, Ordering::SeqCst);
        let listening = transport.listening.clone();
        tokio::spawn(
            async move {
                let server = axum::serve(listener, router);
                tokio::select! {
                    result = server => {
                        if let Err(error) = result {
                            tracing::error!(%error, "http server exited with error");
                        }
                    }
                    _ = serve_ct.cancelled() => {
                        tracing::info!("http server shutting down");
                    }
                }
                listening.store(false, Ordering::SeqCst);
            }
            .instrument(tracing::info_span!("mcp-http", bind = %local_addr)),
        );

        tracing::info!(addr = %local_addr, endpoint = %http.endpoint, "mcp server listening");
        Ok(StreamableHttpServer { local_addr, ct })
    }

    pub fn cancel(&self) {
        self.ct.cancel();
    }
}

struct AppState<B: Broker> {
    transport: Arc<StreamableHttpTransport<B>>,
}

/// Build the router: the MCP endpoint plus the fixed health paths.
fn mcp_router<B: Broker>(transport: Arc<StreamableHttpTransport<B>>, endpoint: &str) -> Router {
    let state = Arc::new(AppState { transport });
    Router::new()
        .route(
            endpoint,
            get(handle_get::<B>)
                .post(handle_post::<B>)
                .delete(handle_delete::<B>)
                .options(handle_options::<B>)
                .fallback(handle_bad_method::<B>),
        )
        .route("/health", get(handle_health))
        .route("/readiness", get(handle_readiness::<B>))
        .fallback(handle_not_found)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostPayload {
    Batch(Vec<JsonRpcMessage>),
    Single(JsonRpcMessage),
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(mime) || accept.contains("*/*"))
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("static response")
}

fn envelope_response(status: StatusCode, envelope: &JsonRpcMessage) -> Response {
    let body = serde_json::to_vec(envelope).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
        .body(Body::from(body))
        .expect("static response")
}

fn internal_error_response(message: &str) -> Response {
    envelope_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &JsonRpcMessage::error(None, ErrorData::internal_error(message.to_owned())),
    )
}

/// Resolved session for one HTTP request.
struct ResolvedSession {
    context: SessionContext,
    /// The stored session snapshot, when a store is configured.
    stored: Option<Session>,
}

enum SessionOutcome {
    Found(ResolvedSession),
    Missing,
    StoreError,
}

async fn resolve_session<B: Broker>(
    transport: &StreamableHttpTransport<B>,
    provided: Option<String>,
    meta: &RequestMetadata,
) -> SessionOutcome {
    match (provided, &transport.session_store) {
        (Some(id), Some(store)) => match store.get(&id, meta).await {
            Ok(Some(session)) => SessionOutcome::Found(ResolvedSession {
                context: SessionContext::stored(id, store.clone()),
                stored: Some(session),
            }),
            Ok(None) => SessionOutcome::Missing,
            Err(error) => {
                tracing::error!(%error, "session store lookup failed");
                SessionOutcome::StoreError
            }
        },
        // Stateless mode: accept whatever id the client presents, but there
        // is no state behind it.
        (Some(id), None) => SessionOutcome::Found(ResolvedSession {
            context: SessionContext::synthetic(id),
            stored: None,
        }),
        (None, Some(store)) => match store.create(meta).await {
            Ok(session) => SessionOutcome::Found(ResolvedSession {
                context: SessionContext::stored(session.id.clone(), store.clone()),
                stored: Some(session),
            }),
            Err(error) => {
                tracing::error!(%error, "session creation failed");
                SessionOutcome::StoreError
            }
        },
        (None, None) => {
            let id = Uuid::new_v4().to_string();
            SessionOutcome::Found(ResolvedSession {
                context: SessionContext::synthetic(id),
                stored: None,
            })
        }
    }
}

async fn handle_post<B: Broker>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let transport = &state.transport;

    let accepts_json = accepts(&headers, JSON_MIME_TYPE);
    let accepts_sse = accepts(&headers, EVENT_STREAM_MIME_TYPE);
    if !accepts_json && !accepts_sse {
        return text_response(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Accept must include application/json or text/event-stream",
        );
    }

    if transport.incoming_handler().is_none() {
        return internal_error_response("no protocol engine connected");
    }

    // Session id comes from the header or the query string.
    let provided = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or(query.session_id);
    let meta = RequestMetadata::from_headers(headers.clone());
    let resolved = match resolve_session(transport, provided, &meta).await {
        SessionOutcome::Found(resolved) => resolved,
        SessionOutcome::Missing => {
            return text_response(StatusCode::NOT_FOUND, "Session Not Found");
        }
        SessionOutcome::StoreError => return internal_error_response("session store failure"),
    };
    let session = resolved.context.clone();
    let session_id: SessionId = session.id().clone();

    let (messages, is_batch) = match serde_json::from_slice::<PostPayload>(&body) {
        Ok(PostPayload::Single(message)) => (vec![message], false),
        Ok(PostPayload::Batch(messages)) => {
            if messages.is_empty() {
                return envelope_response(
                    StatusCode::BAD_REQUEST,
                    &JsonRpcMessage::error(
                        None,
                        ErrorData::invalid_request("empty batch"),
                    ),
                );
            }
            (messages, true)
        }
        Err(error) => {
            tracing::debug!(%error, "rejecting unparseable POST body");
            return envelope_response(
                StatusCode::BAD_REQUEST,
                &JsonRpcMessage::error(None, ErrorData::parse_error(error.to_string())),
            );
        }
    };

    let requests: Vec<JsonRpcRequest> = messages
        .iter()
        .filter_map(|message| match message {
            JsonRpcMessage::Request(request) => Some(request.clone()),
            _ => None,
        })
        .collect();

    tracing::debug!(
        session_id = %session_id,
        messages = messages.len(),
        requests = requests.len(),
        "POST accepted"
    );

    // Fast path: no requests means nothing to correlate. Deliver, fan out on
    // the background channel for audit, and acknowledge.
    if requests.is_empty() {
        let audit_subject = subject::background_outbound(&session_id);
        for message in messages {
            transport.deliver(message.clone(), session.clone()).await;
            if let Err(error) = transport.broker.publish(&audit_subject, &message).await {
                tracing::warn!(%error, "failed to fan out notification");
            }
        }
        return Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(HEADER_SESSION_ID, session_id.as_str())
            .body(Body::empty())
            .expect("static response");
    }

    let mode = (transport.config.response_mode_strategy)(&messages, resolved.stored.as_ref());
    match mode {
        ResponseMode::Json if !accepts_json => {
            return text_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: this request requires application/json in Accept",
            );
        }
        ResponseMode::Sse if !accepts_sse => {
            return text_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: this request requires text/event-stream in Accept",
            );
        }
        _ => {}
    }

    // Correlation subscriptions are opened and live *before* the engine sees
    // the messages; a fast handler cannot outrun them and publish into the
    // void.
    let mut subscriptions: Vec<(RequestId, TrackedSubscription<B::Subscription>)> =
        Vec::with_capacity(requests.len());
    for request in &requests {
        let outbound = subject::request_outbound(&session_id, &request.id);
        let mut sub = match transport
            .broker
            .subscribe(&outbound, SubscribeOptions::default())
            .await
        {
            Ok(sub) => sub,
            Err(error) => {
                tracing::error!(%error, subject = %outbound, "correlation subscribe failed");
                return internal_error_response("broker subscribe failed");
            }
        };
        sub.ready().await;
        subscriptions.push((
            request.id.clone(),
            TrackedSubscription::new(sub, &outbound, transport.active_subscriptions.clone()),
        ));
    }

    for message in messages {
        transport.deliver(message, session.clone()).await;
    }

    match mode {
        ResponseMode::Json => {
            respond_json(transport, subscriptions, &session_id, is_batch).await
        }
        ResponseMode::Sse => respond_sse(transport, subscriptions, &session_id),
    }
}

/// JSON mode: one terminal message per request, bounded by a batch-wide
/// deadline. Requests still pending at the deadline are materialized as
/// `Request timeout` errors with their original ids.
async fn respond_json<B: Broker>(
    transport: &StreamableHttpTransport<B>,
    subscriptions: Vec<(RequestId, TrackedSubscription<B::Subscription>)>,
    session_id: &SessionId,
    is_batch: bool,
) -> Response {
    let deadline = tokio::time::Instant::now() + transport.config.response_timeout;
    let mut responses = Vec::with_capacity(subscriptions.len());
    for (request_id, mut sub) in subscriptions {
        let response = loop {
            match tokio::time::timeout_at(deadline, sub.next()).await {
                Ok(Some(delivery)) => {
                    if delivery.payload.is_terminal() {
                        delivery.ack();
                        break delivery.payload;
                    }
                    // Progress and other interim messages have nowhere to go
                    // in a buffered response.
                    delivery.ack();
                }
                Ok(None) | Err(_) => {
                    tracing::debug!(request_id = %request_id, "request timed out in JSON mode");
                    break JsonRpcMessage::error(
                        Some(request_id.clone()),
                        ErrorData::internal_error("Request timeout"),
                    );
                }
            }
        };
        sub.unsubscribe();
        responses.push(response);
    }

    let body = if is_batch {
        serde_json::to_vec(&responses)
    } else {
        serde_json::to_vec(&responses[0])
    };
    let body = match body {
        Ok(body) => body,
        Err(_) => return internal_error_response("response serialization failed"),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
        .header(HEADER_SESSION_ID, session_id.as_str())
        .body(Body::from(body))
        .expect("static response")
}

/// SSE mode: every delivered message becomes an event; a terminal message
/// closes that request's subscription; the response ends when all of them
/// have closed or the client goes away.
fn respond_sse<B: Broker>(
    transport: &StreamableHttpTransport<B>,
    subscriptions: Vec<(RequestId, TrackedSubscription<B::Subscription>)>,
    session_id: &SessionId,
) -> Response {
    let mut streams = StreamMap::new();
    for (index, (_, sub)) in subscriptions.into_iter().enumerate() {
        streams.insert(index, sub);
    }
    let keep_alive = transport.config.sse_keep_alive;

    let stream = async_stream::stream! {
        let mut streams = streams;
        let mut keep_alive_timer = keep_alive.map(tokio::time::interval);
        loop {
            tokio::select! {
                next = streams.next() => {
                    let Some((key, delivery)) = next else { break };
                    let terminal = delivery.payload.is_terminal();
                    // Write the event first, ack second: an un-acked message
                    // survives a crash under an at-least-once backend.
                    yield Ok::<_, Infallible>(Bytes::from(sse_frame(&delivery)));
                    delivery.ack();
                    if terminal {
                        streams.remove(&key);
                        if streams.is_empty() {
                            break;
                        }
                    }
                }
                _ = keep_alive_tick(&mut keep_alive_timer) => {
                    yield Ok(Bytes::from(":ping\n\n"));
                }
            }
        }
    };

    sse_response_builder(session_id).body(Body::from_stream(stream)).expect("static response")
}

fn sse_frame(delivery: &Delivery) -> String {
    let data = serde_json::to_string(&delivery.payload).unwrap_or_else(|_| "{}".to_owned());
    format!(
        "id: {}\nevent: message\ndata: {}\n\n",
        delivery.event_id, data
    )
}

async fn keep_alive_tick(timer: &mut Option<tokio::time::Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn sse_response_builder(session_id: &SessionId) -> axum::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(HEADER_SESSION_ID, session_id.as_str())
}

async fn handle_get<B: Broker>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Response {
    let transport = &state.transport;

    if !transport.config.enable_background_channel {
        return method_not_allowed(transport);
    }
    if !accepts(&headers, EVENT_STREAM_MIME_TYPE) {
        return text_response(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Accept must include text/event-stream",
        );
    }

    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return text_response(StatusCode::BAD_REQUEST, "Mcp-Session-Id header is required");
    };

    let meta = RequestMetadata::from_headers(headers.clone());
    if let Some(store) = &transport.session_store {
        match store.get(&session_id, &meta).await {
            Ok(Some(_)) => {}
            Ok(None) => return text_response(StatusCode::NOT_FOUND, "Session Not Found"),
            Err(error) => {
                tracing::error!(%error, "session store lookup failed");
                return internal_error_response("session store failure");
            }
        }
    }

    let last_event_id = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let options = || SubscribeOptions {
        from_event_id: last_event_id.clone(),
        queue_group: None,
    };

    tracing::debug!(
        session_id = %session_id,
        last_event_id = last_event_id.as_deref().unwrap_or(""),
        "background channel opened"
    );

    let mut streams = StreamMap::new();
    for subject in [
        subject::background_outbound(&session_id),
        subject::background_inbound(&session_id),
    ] {
        let mut sub = match transport.broker.subscribe(&subject, options()).await {
            Ok(sub) => sub,
            Err(error) => {
                tracing::error!(%error, subject = %subject, "background subscribe failed");
                return internal_error_response("broker subscribe failed");
            }
        };
        sub.ready().await;
        streams.insert(
            subject.as_str().to_owned(),
            TrackedSubscription::new(sub, &subject, transport.active_subscriptions.clone()),
        );
    }

    let keep_alive = transport.config.sse_keep_alive;
    let shutdown = transport.shutdown.clone();
    let stream = async_stream::stream! {
        let mut streams = streams;
        let mut keep_alive_timer = keep_alive.map(tokio::time::interval);
        yield Ok::<_, Infallible>(Bytes::from(": connected to background channel\n\n"));
        loop {
            tokio::select! {
                next = streams.next() => {
                    let Some((_, delivery)) = next else { break };
                    // The background channel carries notifications and
                    // server-initiated requests only; stray responses are
                    // acked and dropped.
                    if delivery.payload.is_terminal() {
                        delivery.ack();
                        continue;
                    }
                    yield Ok(Bytes::from(sse_frame(&delivery)));
                    delivery.ack();
                }
                _ = keep_alive_tick(&mut keep_alive_timer) => {
                    yield Ok(Bytes::from(":ping\n\n"));
                }
                _ = shutdown.cancelled() => break,
            }
        }
    };

    sse_response_builder(&session_id).body(Body::from_stream(stream)).expect("static response")
}

async fn handle_delete<B: Broker>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Response {
    let transport = &state.transport;

    if !transport.config.enable_session_termination {
        return method_not_allowed(transport);
    }
    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return text_response(StatusCode::BAD_REQUEST, "Mcp-Session-Id header is required");
    };

    if let Some(store) = &transport.session_store {
        let meta = RequestMetadata::from_headers(headers.clone());
        if let Err(error) = store.delete(&session_id, &meta).await {
            tracing::error!(%error, "session delete failed");
            return internal_error_response("session store failure");
        }
    }
    tracing::debug!(session_id = %session_id, "session terminated");

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("static response")
}

async fn handle_options<B: Broker>(State(_state): State<Arc<AppState<B>>>) -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("static response")
}

async fn handle_bad_method<B: Broker>(State(state): State<Arc<AppState<B>>>) -> Response {
    method_not_allowed(&state.transport)
}

fn allowed_methods<B: Broker>(transport: &StreamableHttpTransport<B>) -> String {
    let mut allow = vec!["POST", "OPTIONS"];
    if transport.config.enable_background_channel {
        allow.insert(0, "GET");
    }
    if transport.config.enable_session_termination {
        allow.push("DELETE");
    }
    allow.join(", ")
}

fn method_not_allowed<B: Broker>(transport: &StreamableHttpTransport<B>) -> Response {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(header::ALLOW, allowed_methods(transport))
        .body(Body::from("Method Not Allowed"))
        .expect("static response")
}

async fn handle_health() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
        .body(Body::from(r#"{"status":"healthy"}"#))
        .expect("static response")
}

async fn handle_readiness<B: Broker>(State(state): State<Arc<AppState<B>>>) -> Response {
    let listening = state.transport.listening.load(Ordering::SeqCst);
    let (status, body) = if listening {
        (StatusCode::OK, r#"{"status":"ready","listening":true}"#)
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"status":"not_ready","listening":false}"#,
        )
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
        .body(Body::from(body))
        .expect("static response")
}

async fn handle_not_found() -> Response {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}
