//! Relay boundary.
//!
//! A relay is a public pub/sub service that stores and forwards small signed,
//! encrypted events addressed to a recipient identity. Parley only needs four
//! things from it: connect, subscribe by recipient, publish, close. Sealing
//! and signature checks happen on the relay side of this boundary; parley sees
//! decrypted envelope bytes plus an [`Authenticity`] verdict.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::codec::sealed_event_len;
use parley_core::{Authenticity, Keypair, PublicId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryRelay;

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub kind: u16,
    pub recipient: PublicId,
}

/// A decrypted event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub sender: PublicId,
    pub payload: Bytes,
    pub authenticity: Authenticity,
}

/// An event handed to the relay for sealing and publication.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub kind: u16,
    pub author: PublicId,
    pub recipient: PublicId,
    pub payload: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("unsupported relay address {0}")]
    UnsupportedAddress(String),
    #[error("relay {0} unreachable")]
    Unreachable(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
}

/// Something that can open relay connections.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        identity: &Keypair,
    ) -> Result<Arc<dyn RelayConnection>, RelayError>;
}

/// One live connection to a relay.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Start receiving events matching `filter`. The channel closing means the
    /// connection is gone.
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<InboundEvent>, RelayError>;

    /// Resolves once the relay acknowledged (or refused) the event.
    async fn publish(&self, event: OutboundEvent) -> Result<(), PublishError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;

    /// Published size of an event carrying `plaintext_len` bytes of envelope.
    fn framed_len(&self, plaintext_len: usize) -> usize {
        sealed_event_len(plaintext_len)
    }
}
