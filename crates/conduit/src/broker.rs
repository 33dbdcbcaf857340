//! Typed pub/sub over named subjects.
//!
//! The transport routes every JSON-RPC message through a [`Broker`], which is
//! what makes the server horizontally scalable: any node subscribed to the
//! right subject can pick up the response, regardless of which node ran the
//! handler. Backends implement the narrow contract here; the crate ships an
//! in-memory backend in [`memory`] for single-node deployments and tests.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::Stream;

use crate::model::JsonRpcMessage;

pub mod memory;
pub mod subject;

pub use subject::Subject;

/// Broker-assigned event identifier. Opaque to everyone but the broker that
/// minted it; monotone per (subject, broker instance).
pub type EventId = String;

/// Options for [`Broker::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay all retained events with an id strictly greater than this one
    /// before delivering live events.
    pub from_event_id: Option<EventId>,
    /// Competing-consumer group: each message is delivered to exactly one
    /// member of the group.
    pub queue_group: Option<String>,
}

impl SubscribeOptions {
    pub fn from_event_id(id: impl Into<EventId>) -> Self {
        Self {
            from_event_id: Some(id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AckKind {
    Ack,
    Nack { delay: Option<Duration> },
}

/// Acknowledge handle attached to a delivery. Backends without delivery
/// tracking use [`Acker::noop`].
#[derive(Clone)]
pub struct Acker(Option<Arc<dyn Fn(AckKind) + Send + Sync>>);

impl Acker {
    pub fn noop() -> Self {
        Acker(None)
    }

    pub fn from_fn(f: impl Fn(AckKind) + Send + Sync + 'static) -> Self {
        Acker(Some(Arc::new(f)))
    }

    fn signal(&self, kind: AckKind) {
        if let Some(f) = &self.0 {
            f(kind);
        }
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Acker")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

/// A single message delivered on a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: Subject,
    pub event_id: EventId,
    pub payload: JsonRpcMessage,
    pub published_at: DateTime<Utc>,
    /// 1 for the first delivery, incremented on redelivery after a nack.
    pub attempt: u32,
    acker: Acker,
}

impl Delivery {
    pub fn new(
        subject: Subject,
        event_id: EventId,
        payload: JsonRpcMessage,
        published_at: DateTime<Utc>,
        attempt: u32,
        acker: Acker,
    ) -> Self {
        Self {
            subject,
            event_id,
            payload,
            published_at,
            attempt,
            acker,
        }
    }

    pub fn ack(&self) {
        self.acker.signal(AckKind::Ack);
    }

    pub fn nack(&self, delay: Option<Duration>) {
        self.acker.signal(AckKind::Nack { delay });
    }
}

/// An ordered, lazy sequence of deliveries for one subscribe call.
///
/// Dropping a subscription must also unsubscribe it; `unsubscribe` exists so
/// callers can be explicit and is idempotent.
pub trait Subscription: Stream<Item = Delivery> + Send + Unpin + 'static {
    /// Resolves once the subscription is live: no message published strictly
    /// after `ready` returns can be missed. Backends whose subscribe is
    /// synchronous resolve immediately.
    fn ready(&mut self) -> impl Future<Output = ()> + Send;

    fn unsubscribe(&mut self);
}

/// Pub/sub backend contract. See the crate-level docs for the delivery
/// guarantees backends must provide: per-subject publish-order delivery,
/// exactly-one-member queue-group delivery, and replay of retained history
/// from an event id.
///
/// Subscribe patterns may use `*` (one segment) and `>` (trailing rest); a
/// backend may refuse wildcards it cannot implement but must accept literal
/// patterns.
pub trait Broker: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Subscription: Subscription;

    fn publish(
        &self,
        subject: &Subject,
        payload: &JsonRpcMessage,
    ) -> impl Future<Output = Result<EventId, Self::Error>> + Send;

    fn subscribe(
        &self,
        pattern: &Subject,
        options: SubscribeOptions,
    ) -> impl Future<Output = Result<Self::Subscription, Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
