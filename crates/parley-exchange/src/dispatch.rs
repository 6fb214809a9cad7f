//! Inbound dispatch: relay events → envelopes → exchanges.
//!
//! One task per connection drains the subscription and handles exactly one
//! envelope at a time, in delivery order. Handling never awaits, so a slow
//! application cannot stall other exchanges.

use crate::endpoint::{EndpointEvent, EndpointShared};
use crate::exchange::Exchange;
use crate::relay::InboundEvent;
use parley_core::{now_millis, Authenticity, Envelope, ExchangeKind};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

pub(crate) async fn receive_loop(
    endpoint: Weak<EndpointShared>,
    mut inbound: mpsc::Receiver<InboundEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(shared) = endpoint.upgrade() else {
            return;
        };
        route(&shared, event);
    }

    if let Some(shared) = endpoint.upgrade() {
        shared.take_connection();
        tracing::info!("relay subscription ended");
        shared.emit(EndpointEvent::Disconnected);
    }
}

/// Decode one relay event and hand it to the exchange it belongs to.
pub(crate) fn route(shared: &Arc<EndpointShared>, event: InboundEvent) {
    let authenticity = if shared.read_config().validate_authenticity {
        event.authenticity
    } else {
        Authenticity::Unknown
    };

    let envelope = match Envelope::decode(&event.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(sender = event.sender.short(), error = %e, "dropping malformed envelope");
            shared.emit(EndpointEvent::Error(e));
            return;
        }
    };
    tracing::trace!(
        correlation_id = %envelope.correlation_id,
        chunk = envelope.chunk_index,
        sender = event.sender.short(),
        "envelope received"
    );
    deliver(shared, &envelope, authenticity);
}

fn deliver(shared: &Arc<EndpointShared>, envelope: &Envelope, authenticity: Authenticity) {
    let id = &envelope.correlation_id;
    let existing = shared.registry.get(id);

    let target = if id.is_request() {
        match existing {
            Some(request) => request,
            None if shared.registry.is_answered(id) => {
                tracing::debug!(correlation_id = %id, "ignoring chunk of answered request");
                return;
            }
            None if envelope.deadline <= now_millis() => {
                tracing::debug!(correlation_id = %id, "ignoring chunk of expired request");
                return;
            }
            None => {
                let request = Exchange::inbound(
                    id.clone(),
                    Arc::downgrade(shared),
                    Some(shared.registry.handle()),
                    None,
                    Some(envelope.deadline),
                );
                shared.registry.insert(request.clone());
                request.arm_timer();
                tracing::info!(correlation_id = %id, "inbound request");
                shared.emit(EndpointEvent::Request(request.clone()));
                request
            }
        }
    } else {
        match existing.and_then(|request| request.inbound_response()) {
            Some(response) => response,
            None => {
                tracing::trace!(correlation_id = %id, "ignoring response to unknown request");
                return;
            }
        }
    };

    match target.add_chunk(envelope, authenticity) {
        Ok(true) => {
            let event = match target.kind() {
                ExchangeKind::Request => EndpointEvent::RequestReceived(target),
                ExchangeKind::Response => EndpointEvent::ResponseReceived(target),
            };
            shared.emit(event);
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(correlation_id = %id, error = %e, "chunk rejected");
            shared.emit(EndpointEvent::Error(e));
        }
    }
}
