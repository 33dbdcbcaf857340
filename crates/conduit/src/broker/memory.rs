//! In-memory broker backend.
//!
//! Single-process pub/sub with the full [`Broker`](super::Broker) contract:
//! per-subject retained history for replay, wildcard patterns, and
//! round-robin queue groups. Delivery is at-most-once; `ack` is a no-op and
//! `nack` redelivers to the same subscriber with an incremented attempt
//! counter.
//!
//! The retained log is unbounded by default. Deployments that publish
//! long-lived sessions should cap it with [`MemoryBroker::with_retention`];
//! replay via `from_event_id` then only reaches back as far as the cap.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Acker, AckKind, Broker, Delivery, EventId, SubscribeOptions, Subject, subject};
use crate::model::JsonRpcMessage;

#[derive(Debug, Error)]
pub enum MemoryBrokerError {
    #[error("broker closed")]
    Closed,

    #[error("event id not minted by this broker: {0}")]
    ForeignEventId(String),
}

struct RetainedEvent {
    id: u64,
    payload: JsonRpcMessage,
    published_at: DateTime<Utc>,
}

struct Subscriber {
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    retained: HashMap<String, Vec<RetainedEvent>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    round_robin: HashMap<(String, String), usize>,
}

struct Inner {
    state: Mutex<State>,
    next_event: AtomicU64,
    retention: Option<usize>,
    closed: AtomicBool,
}

/// See the [module docs](self).
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_event: AtomicU64::new(0),
                retention: None,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Cap the retained history at `events_per_subject`.
    pub fn with_retention(events_per_subject: usize) -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_event: AtomicU64::new(0),
                retention: Some(events_per_subject),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

fn make_delivery(
    inner: &Arc<Inner>,
    subscriber: u64,
    subject: Subject,
    event_id: u64,
    payload: JsonRpcMessage,
    published_at: DateTime<Utc>,
    attempt: u32,
) -> Delivery {
    let acker = {
        let inner = inner.clone();
        let subject = subject.clone();
        let payload = payload.clone();
        Acker::from_fn(move |kind| {
            let AckKind::Nack { delay } = kind else {
                return;
            };
            let inner = inner.clone();
            let subject = subject.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let state = inner.state.lock().expect("broker state poisoned");
                if let Some(entry) = state.subscribers.get(&subscriber) {
                    let redelivery = make_delivery(
                        &inner,
                        subscriber,
                        subject,
                        event_id,
                        payload,
                        published_at,
                        attempt + 1,
                    );
                    let _ = entry.tx.send(redelivery);
                }
            });
        })
    };
    Delivery::new(
        subject,
        event_id.to_string(),
        payload,
        published_at,
        attempt,
        acker,
    )
}

impl Broker for MemoryBroker {
    type Error = MemoryBrokerError;
    type Subscription = MemorySubscription;

    async fn publish(
        &self,
        subject: &Subject,
        payload: &JsonRpcMessage,
    ) -> Result<EventId, Self::Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MemoryBrokerError::Closed);
        }
        // The state lock covers id assignment through fan-out, so per-subject
        // delivery order equals publish order.
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        let event_id = self.inner.next_event.fetch_add(1, Ordering::SeqCst) + 1;
        let published_at = Utc::now();

        let log = state.retained.entry(subject.as_str().to_owned()).or_default();
        log.push(RetainedEvent {
            id: event_id,
            payload: payload.clone(),
            published_at,
        });
        if let Some(cap) = self.inner.retention {
            if log.len() > cap {
                let excess = log.len() - cap;
                log.drain(..excess);
            }
        }

        // Plain subscribers all get a copy; each queue group gets exactly one.
        let mut groups: HashMap<(String, String), Vec<u64>> = HashMap::new();
        let mut plain: Vec<u64> = Vec::new();
        for (id, sub) in &state.subscribers {
            if !subject::matches(&sub.pattern, subject.as_str()) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups
                    .entry((sub.pattern.clone(), group.clone()))
                    .or_default()
                    .push(*id),
                None => plain.push(*id),
            }
        }
        for (key, mut members) in groups {
            members.sort_unstable();
            let cursor = state.round_robin.entry(key).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            plain.push(chosen);
        }
        for id in plain {
            let Some(sub) = state.subscribers.get(&id) else {
                continue;
            };
            let delivery = make_delivery(
                &self.inner,
                id,
                subject.clone(),
                event_id,
                payload.clone(),
                published_at,
                1,
            );
            let _ = sub.tx.send(delivery);
        }

        Ok(event_id.to_string())
    }

    async fn subscribe(
        &self,
        pattern: &Subject,
        options: SubscribeOptions,
    ) -> Result<Self::Subscription, Self::Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MemoryBrokerError::Closed);
        }
        let from = options
            .from_event_id
            .as_deref()
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| MemoryBrokerError::ForeignEventId(raw.to_owned()))
            })
            .transpose()?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration happen under one lock acquisition, so the
        // subscription is live the moment this returns: `ready` has nothing
        // left to wait for.
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        if let Some(from) = from {
            let mut replay: Vec<(String, u64, JsonRpcMessage, DateTime<Utc>)> = Vec::new();
            for (subject, log) in &state.retained {
                if !subject::matches(pattern.as_str(), subject) {
                    continue;
                }
                for event in log.iter().filter(|event| event.id > from) {
                    replay.push((
                        subject.clone(),
                        event.id,
                        event.payload.clone(),
                        event.published_at,
                    ));
                }
            }
            replay.sort_by_key(|(_, id, _, _)| *id);
            for (subject, event_id, payload, published_at) in replay {
                let delivery = make_delivery(
                    &self.inner,
                    id,
                    subject.into(),
                    event_id,
                    payload,
                    published_at,
                    1,
                );
                let _ = tx.send(delivery);
            }
        }

        state.subscribers.insert(
            id,
            Subscriber {
                pattern: pattern.as_str().to_owned(),
                queue_group: options.queue_group,
                tx,
            },
        );

        Ok(MemorySubscription {
            id,
            inner: self.inner.clone(),
            rx: UnboundedReceiverStream::new(rx),
            live: true,
        })
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        state.subscribers.clear();
        state.retained.clear();
        state.round_robin.clear();
        Ok(())
    }
}

pub struct MemorySubscription {
    id: u64,
    inner: Arc<Inner>,
    rx: UnboundedReceiverStream<Delivery>,
    live: bool,
}

impl super::Subscription for MemorySubscription {
    async fn ready(&mut self) {}

    fn unsubscribe(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        state.subscribers.remove(&self.id);
        self.rx.close();
    }
}

impl Stream for MemorySubscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        use super::Subscription as _;
        self.unsubscribe();
    }
}
