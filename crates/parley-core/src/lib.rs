//! parley-core — envelope wire format, chunk codec, errors, configuration and
//! identity. Pure code with no async runtime; parley-exchange builds the
//! protocol engine on top of it.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod wire;

pub use codec::{reassemble, sealed_event_len, split, SplitParams};
pub use config::EndpointConfig;
pub use crypto::{Keypair, PublicId};
pub use error::{ErrorKind, ParleyError, Result};
pub use wire::{now_millis, Authenticity, CorrelationId, Envelope, ExchangeKind};
