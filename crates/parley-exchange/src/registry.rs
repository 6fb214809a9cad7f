//! In-flight exchange registry.
//!
//! Keyed by the request form of the correlation id, so a request and the
//! chunks of its response find the same entry. Exchanges retire themselves
//! through a [`RegistryHandle`] when they reach a terminal state; the handle
//! is weak so an exchange never keeps the map alive.
//!
//! An inbound request whose response went out leaves the map but its id stays
//! reserved until the request's deadline. Chunks the relay redelivers in that
//! window are dropped instead of opening a second exchange.

use crate::exchange::Exchange;
use dashmap::DashMap;
use parley_core::{now_millis, CorrelationId};
use std::sync::{Arc, Weak};

type Map = DashMap<CorrelationId, Exchange>;

#[derive(Default)]
struct Tables {
    exchanges: Map,
    /// Answered request id → deadline (Unix ms).
    answered: DashMap<CorrelationId, u64>,
}

#[derive(Clone, Default)]
pub struct Registry {
    tables: Arc<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange, replacing any previous entry for the same id.
    pub fn insert(&self, exchange: Exchange) -> Option<Exchange> {
        self.tables
            .exchanges
            .insert(exchange.id().request_form(), exchange)
    }

    /// Look up by either form of the id. The handle is cloned out so no map
    /// guard outlives this call.
    pub fn get(&self, id: &CorrelationId) -> Option<Exchange> {
        self.tables
            .exchanges
            .get(&id.request_form())
            .map(|entry| entry.value().clone())
    }

    /// Remove `exchange` if it is still the registered entry for its id.
    pub fn retire(&self, exchange: &Exchange) -> bool {
        retire_from(&self.tables.exchanges, exchange)
    }

    pub fn len(&self) -> usize {
        self.tables.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.exchanges.is_empty()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.tables
            .exchanges
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// True while `id` belongs to a request answered from here whose deadline
    /// has not passed.
    pub(crate) fn is_answered(&self, id: &CorrelationId) -> bool {
        let key = id.request_form();
        let live = self
            .tables
            .answered
            .get(&key)
            .map(|until| *until > now_millis());
        match live {
            Some(true) => true,
            Some(false) => {
                self.tables
                    .answered
                    .remove_if(&key, |_, until| *until <= now_millis());
                false
            }
            None => false,
        }
    }

    pub(crate) fn handle(&self) -> RegistryHandle {
        RegistryHandle(Arc::downgrade(&self.tables))
    }
}

/// Weak back-reference from an exchange to the registry holding it.
#[derive(Clone)]
pub(crate) struct RegistryHandle(Weak<Tables>);

impl RegistryHandle {
    pub(crate) fn retire(&self, exchange: &Exchange) -> bool {
        match self.0.upgrade() {
            Some(tables) => retire_from(&tables.exchanges, exchange),
            None => false,
        }
    }

    /// Retire an answered request, reserving its id until its deadline.
    pub(crate) fn settle(&self, exchange: &Exchange) {
        let Some(tables) = self.0.upgrade() else {
            return;
        };
        let now = now_millis();
        tables.answered.retain(|_, until| *until > now);
        if let Some(deadline) = exchange.deadline().filter(|d| *d > now) {
            tables
                .answered
                .insert(exchange.id().request_form(), deadline);
            tracing::trace!(correlation_id = %exchange.id(), deadline, "request id reserved");
        }
        retire_from(&tables.exchanges, exchange);
    }
}

fn retire_from(map: &Map, exchange: &Exchange) -> bool {
    let removed = map
        .remove_if(&exchange.id().request_form(), |_, current| current.same(exchange))
        .is_some();
    if removed {
        tracing::debug!(correlation_id = %exchange.id(), remaining = map.len(), "exchange retired");
    }
    removed
}
