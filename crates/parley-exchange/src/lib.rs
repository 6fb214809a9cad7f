//! parley-exchange — the request/response engine.
//!
//! An [`Endpoint`] connects to a relay, splits outgoing payloads into chunks,
//! tracks every in-flight [`Exchange`], and reassembles what comes back.

mod dispatch;
pub mod endpoint;
pub mod exchange;
pub mod registry;
pub mod relay;

pub use endpoint::{Endpoint, EndpointEvent, RequestOptions};
pub use exchange::{Direction, Exchange, ExchangeEvent, ExchangeStatus, ResponseOptions};
pub use registry::Registry;
pub use relay::{MemoryRelay, Relay, RelayConnection};

pub use parley_core::{
    Authenticity, CorrelationId, EndpointConfig, ErrorKind, ExchangeKind, Keypair, ParleyError,
    PublicId, Result,
};
