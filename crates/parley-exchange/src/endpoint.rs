//! Endpoint: the application's handle on parley.
//!
//! Owns the local identity, configuration, the exchange registry and the
//! relay connection. Inbound traffic is drained by one dispatch task per
//! connection (see `dispatch`); everything the application needs to react to
//! is published as an [`EndpointEvent`].

use crate::dispatch;
use crate::exchange::{Direction, Exchange, ExchangeStatus, Init};
use crate::registry::Registry;
use crate::relay::{Filter, Relay, RelayConnection};
use parley_core::codec::validate_chunk_size;
use parley_core::config::validate_max_response_size;
use parley_core::{
    now_millis, CorrelationId, EndpointConfig, ErrorKind, Keypair, ParleyError, PublicId, Result,
};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Endpoint event channel depth.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Connecting { address: String },
    Connected { address: String },
    Disconnected,
    /// Something went wrong outside any caller's control: a malformed
    /// envelope, a failed relay connection.
    Error(ParleyError),
    /// First chunk of a new inbound request arrived.
    Request(Exchange),
    /// An inbound request has been fully assembled.
    RequestReceived(Exchange),
    /// The response to a request sent from here has been fully assembled.
    ResponseReceived(Exchange),
}

/// Overrides for [`Endpoint::create_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub max_bytes_per_chunk: Option<usize>,
    pub timeout: Option<Duration>,
    /// Largest response the peer may send back.
    pub max_response_size: Option<u64>,
}

pub(crate) struct EndpointShared {
    pub(crate) identity: Keypair,
    pub(crate) public_id: PublicId,
    pub(crate) registry: Registry,
    config: RwLock<EndpointConfig>,
    connection: RwLock<Option<Arc<dyn RelayConnection>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<EndpointEvent>,
}

impl EndpointShared {
    pub(crate) fn read_config(&self) -> RwLockReadGuard<'_, EndpointConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live relay connection, if any.
    pub(crate) fn connection(&self) -> Option<Arc<dyn RelayConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_connected())
            .cloned()
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn RelayConnection>> {
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn emit(&self, event: EndpointEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn take_dispatch_task(&self) -> Option<JoinHandle<()>> {
        self.dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for EndpointShared {
    fn drop(&mut self) {
        let task = self
            .dispatch_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Create an endpoint for `identity`. The configuration is validated, not
    /// clamped.
    pub fn new(identity: Keypair, config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let public_id = identity.public_id();
        tracing::debug!(public_id = public_id.short(), "endpoint created");
        Ok(Self {
            shared: Arc::new(EndpointShared {
                identity,
                public_id,
                registry: Registry::new(),
                config: RwLock::new(config),
                connection: RwLock::new(None),
                dispatch_task: Mutex::new(None),
                events,
            }),
        })
    }

    pub fn public_id(&self) -> &PublicId {
        &self.shared.public_id
    }

    pub fn config(&self) -> EndpointConfig {
        self.shared.read_config().clone()
    }

    pub fn max_bytes_per_chunk(&self) -> usize {
        self.shared.read_config().max_bytes_per_chunk
    }

    pub fn set_max_bytes_per_chunk(&self, max_bytes_per_chunk: usize) -> Result<()> {
        validate_chunk_size(max_bytes_per_chunk)?;
        self.shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .max_bytes_per_chunk = max_bytes_per_chunk;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection().is_some()
    }

    /// In-flight requests, inbound and outbound.
    pub fn pending_requests(&self) -> Vec<Exchange> {
        self.shared.registry.exchanges()
    }

    /// Look up an in-flight request by either form of its id.
    pub fn request(&self, id: &CorrelationId) -> Option<Exchange> {
        self.shared.registry.get(id)
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Connect to `address` through `relay` and start receiving. Any previous
    /// connection is closed first.
    pub async fn connect(&self, relay: &dyn Relay, address: &str) -> Result<()> {
        self.disconnect().await;

        self.shared.emit(EndpointEvent::Connecting {
            address: address.to_string(),
        });
        tracing::info!(address, public_id = self.shared.public_id.short(), "connecting to relay");

        let connection = relay
            .connect(address, &self.shared.identity)
            .await
            .map_err(|e| self.connection_failed(address, e))?;

        let filter = Filter {
            kind: self.shared.read_config().kind,
            recipient: self.shared.public_id.clone(),
        };
        let inbound = match connection.subscribe(filter).await {
            Ok(inbound) => inbound,
            Err(e) => {
                connection.close().await;
                return Err(self.connection_failed(address, e));
            }
        };

        *self
            .shared
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        let task = tokio::spawn(dispatch::receive_loop(Arc::downgrade(&self.shared), inbound));
        *self
            .shared
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!(address, "connected to relay");
        self.shared.emit(EndpointEvent::Connected {
            address: address.to_string(),
        });
        Ok(())
    }

    fn connection_failed(&self, address: &str, e: impl std::fmt::Display) -> ParleyError {
        let error = ParleyError::new(
            ErrorKind::RelayConnectionError,
            format!("could not connect to {address}: {e}"),
        )
        .with_data(json!({ "address": address, "reason": e.to_string() }));
        tracing::warn!(address, error = %e, "relay connection failed");
        self.shared.emit(EndpointEvent::Error(error.clone()));
        error
    }

    /// Stop receiving and close the relay connection. Exchanges in flight keep
    /// running until their deadlines.
    pub async fn disconnect(&self) {
        if let Some(task) = self.shared.take_dispatch_task() {
            task.abort();
            let _ = task.await;
        }
        if let Some(connection) = self.shared.take_connection() {
            connection.close().await;
            tracing::info!("disconnected from relay");
            self.shared.emit(EndpointEvent::Disconnected);
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Create and register a request to `receiver`. Nothing is sent until
    /// [`Exchange::send`].
    pub fn create_request(
        &self,
        receiver: &PublicId,
        payload: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Exchange> {
        let (max_bytes_per_chunk, timeout, max_response_size) = {
            let config = self.shared.read_config();
            (
                options.max_bytes_per_chunk.unwrap_or(config.max_bytes_per_chunk),
                options.timeout.unwrap_or_else(|| config.default_timeout()),
                options.max_response_size.or(config.max_response_size),
            )
        };
        validate_chunk_size(max_bytes_per_chunk)?;
        validate_max_response_size(max_response_size)?;

        let request = Exchange::build(Init {
            id: CorrelationId::generate(),
            direction: Direction::Outbound,
            status: ExchangeStatus::Ready,
            endpoint: Arc::downgrade(&self.shared),
            registry: Some(self.shared.registry.handle()),
            parent: Weak::new(),
            payload: Some(payload.into()),
            sender: Some(self.shared.public_id.clone()),
            receiver: Some(receiver.clone()),
            deadline: Some(now_millis().saturating_add(timeout.as_millis() as u64)),
            max_bytes_per_chunk,
            max_response_size,
        });
        self.shared.registry.insert(request.clone());
        request.arm_timer();

        tracing::debug!(
            correlation_id = %request.id(),
            recipient = receiver.short(),
            "request created"
        );
        Ok(request)
    }

    /// Create a request, send it, and wait for the response.
    pub async fn send_request(
        &self,
        receiver: &PublicId,
        payload: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Exchange> {
        let request = self.create_request(receiver, payload, options)?;
        request
            .send()
            .await?
            .ok_or_else(|| ParleyError::unexpected("request completed without a response"))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("public_id", &self.shared.public_id)
            .field("pending", &self.shared.registry.len())
            .finish()
    }
}
