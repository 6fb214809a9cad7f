//! In-process relay.
//!
//! Every connection opened on the same [`MemoryRelay`] shares one hub, so two
//! endpoints connected to it can talk to each other without a network. The
//! hub has switches to misbehave the way a public relay does: go offline,
//! refuse publishes, silently lose events, or hold them back.

use super::{Filter, InboundEvent, OutboundEvent, PublishError, Relay, RelayConnection, RelayError};
use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{Authenticity, Keypair, PublicId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Address scheme accepted by [`MemoryRelay::connect`].
pub const MEMORY_SCHEME: &str = "memory://";

/// Events buffered per subscription before new ones are dropped.
const SUBSCRIPTION_CAPACITY: usize = 1024;

struct Subscriber {
    connection: u64,
    tx: mpsc::Sender<InboundEvent>,
}

#[derive(Default)]
struct Hub {
    subscribers: DashMap<Filter, Vec<Subscriber>>,
    next_connection: AtomicU64,
    published: AtomicU64,
    offline: AtomicBool,
    reject_publishes: AtomicBool,
    tamper: AtomicBool,
    drop_every: AtomicU64,
    holding: AtomicBool,
    held: Mutex<Vec<(Filter, InboundEvent)>>,
}

impl Hub {
    /// Hand an event to every live subscriber of `filter`, pruning closed ones.
    fn deliver(&self, filter: &Filter, event: InboundEvent) -> usize {
        let Some(mut subscribers) = self.subscribers.get_mut(filter) else {
            tracing::trace!(recipient = filter.recipient.short(), "no subscriber for event");
            return 0;
        };
        let mut delivered = 0;
        subscribers.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(recipient = filter.recipient.short(), "subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Vec<(Filter, InboundEvent)>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A relay hub living in this process.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Hub>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, new connections fail with `Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.hub.offline.store(offline, Ordering::SeqCst);
    }

    /// While set, every publish is refused.
    pub fn reject_publishes(&self, reject: bool) {
        self.hub.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Acknowledge but never deliver every `n`-th published event. 0 disables.
    pub fn drop_every(&self, n: u64) {
        self.hub.drop_every.store(n, Ordering::SeqCst);
    }

    /// Deliver events with a failing signature verdict.
    pub fn tamper_signatures(&self, tamper: bool) {
        self.hub.tamper.store(tamper, Ordering::SeqCst);
    }

    /// While holding, accepted events are queued instead of delivered.
    pub fn hold_events(&self, hold: bool) {
        self.hub.holding.store(hold, Ordering::SeqCst);
    }

    /// Deliver everything queued while holding. Returns how many were queued.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut *self.hub.held());
        let count = held.len();
        for (filter, event) in held {
            self.hub.deliver(&filter, event);
        }
        count
    }

    /// Discard everything queued while holding.
    pub fn discard_held(&self) -> usize {
        std::mem::take(&mut *self.hub.held()).len()
    }

    /// Events accepted by the hub so far, including dropped ones.
    pub fn published_count(&self) -> u64 {
        self.hub.published.load(Ordering::SeqCst)
    }

    /// End every subscription from the relay side, as if it went away.
    pub fn sever_subscriptions(&self) {
        self.hub.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscribers.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn connect(
        &self,
        address: &str,
        identity: &Keypair,
    ) -> Result<Arc<dyn RelayConnection>, RelayError> {
        if !address.starts_with(MEMORY_SCHEME) {
            return Err(RelayError::UnsupportedAddress(address.to_string()));
        }
        if self.hub.offline.load(Ordering::SeqCst) {
            return Err(RelayError::Unreachable(address.to_string()));
        }
        let id = self.hub.next_connection.fetch_add(1, Ordering::SeqCst);
        let author = identity.public_id();
        tracing::debug!(address, connection = id, author = author.short(), "memory relay connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            author,
            hub: self.hub.clone(),
            connected: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    author: PublicId,
    hub: Arc<Hub>,
    connected: AtomicBool,
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<InboundEvent>, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Closed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.hub
            .subscribers
            .entry(filter)
            .or_default()
            .push(Subscriber { connection: self.id, tx });
        Ok(rx)
    }

    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Closed);
        }
        if self.hub.reject_publishes.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("publishing disabled".into()));
        }
        if event.author != self.author {
            return Err(PublishError::Rejected("author does not match connection".into()));
        }

        let n = self.hub.published.fetch_add(1, Ordering::SeqCst) + 1;
        let drop_every = self.hub.drop_every.load(Ordering::SeqCst);
        if drop_every > 0 && n % drop_every == 0 {
            tracing::debug!(event = n, "memory relay dropping event");
            return Ok(());
        }

        let authenticity = if self.hub.tamper.load(Ordering::SeqCst) {
            Authenticity::Invalid
        } else {
            Authenticity::Valid
        };
        let filter = Filter {
            kind: event.kind,
            recipient: event.recipient,
        };
        let inbound = InboundEvent {
            sender: event.author,
            payload: event.payload,
            authenticity,
        };

        if self.hub.holding.load(Ordering::SeqCst) {
            self.hub.held().push((filter, inbound));
        } else {
            self.hub.deliver(&filter, inbound);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            for mut entry in self.hub.subscribers.iter_mut() {
                entry.value_mut().retain(|s| s.connection != self.id);
            }
            tracing::debug!(connection = self.id, "memory relay connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
