//! Exchange state machine.
//!
//! An [`Exchange`] is one request or one response in flight. Outbound
//! exchanges start `Ready` with their payload known locally; inbound ones
//! start `Receiving` and collect chunks until the payload can be assembled.
//!
//! Legal transitions:
//!
//! ```text
//!   Ready     → Sending | TimedOut
//!   Sending   → Sent | Responded (requests) | Aborted | TimedOut
//!   Sent      → Responded (requests) | TimedOut
//!   Receiving → Received | Aborted | TimedOut
//!   Received  → TimedOut
//! ```
//!
//! `Responded`, `Aborted` and `TimedOut` are terminal. Every status change
//! goes through [`Exchange::transition`], which holds the state lock while it
//! publishes the new status, then runs side effects (timer, registry, parent
//! request) after releasing it.

use crate::endpoint::EndpointShared;
use crate::registry::RegistryHandle;
use crate::relay::{OutboundEvent, RelayConnection};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parley_core::codec::{self, validate_chunk_size, SplitParams, MAX_BYTES_PER_CHUNK};
use parley_core::{
    now_millis, Authenticity, CorrelationId, Envelope, ErrorKind, ExchangeKind, ParleyError,
    PublicId, Result,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Per-exchange event channel depth. Slow subscribers lag, never block.
const EVENT_CAPACITY: usize = 64;

/// Chunks buffered before chunk 0 says how many to expect. Further distinct
/// indices are dropped until it arrives.
const MAX_UNCOUNTED_CHUNKS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Created locally.
    Outbound,
    /// First seen on the wire.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeStatus {
    Ready,
    Sending,
    Sent,
    Receiving,
    Received,
    Responded,
    Aborted,
    TimedOut,
}

impl ExchangeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeStatus::Responded | ExchangeStatus::Aborted | ExchangeStatus::TimedOut
        )
    }
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExchangeStatus::Ready => "ready",
            ExchangeStatus::Sending => "sending",
            ExchangeStatus::Sent => "sent",
            ExchangeStatus::Receiving => "receiving",
            ExchangeStatus::Received => "received",
            ExchangeStatus::Responded => "responded",
            ExchangeStatus::Aborted => "aborted",
            ExchangeStatus::TimedOut => "timedOut",
        };
        f.write_str(s)
    }
}

fn legal(kind: ExchangeKind, from: ExchangeStatus, to: ExchangeStatus) -> bool {
    use ExchangeStatus::*;
    let request = kind == ExchangeKind::Request;
    match (from, to) {
        (Ready, Sending) | (Ready, TimedOut) => true,
        (Sending, Sent) | (Sending, Aborted) | (Sending, TimedOut) => true,
        (Sending, Responded) | (Sent, Responded) => request,
        (Sent, TimedOut) => true,
        (Receiving, Received) | (Receiving, Aborted) | (Receiving, TimedOut) => true,
        (Received, TimedOut) => true,
        _ => false,
    }
}

/// Observable happenings on one exchange.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Status(ExchangeStatus),
    /// A chunk was handed to the relay or accepted from it.
    Chunk(Envelope),
}

/// Overrides for [`Exchange::create_response`].
#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    pub max_bytes_per_chunk: Option<usize>,
    pub timeout: Option<Duration>,
}

struct Buffered {
    envelope: Envelope,
    authenticity: Authenticity,
}

struct State {
    payload: Option<String>,
    sender: Option<PublicId>,
    receiver: Option<PublicId>,
    chunk_count: Option<u64>,
    buffer: BTreeMap<u64, Buffered>,
    deadline: Option<u64>,
    authenticity: Authenticity,
    max_bytes_per_chunk: usize,
    max_response_size: Option<u64>,
    response: Option<Exchange>,
    timer: Option<JoinHandle<()>>,
    error: Option<ParleyError>,
}

pub(crate) struct Inner {
    id: CorrelationId,
    kind: ExchangeKind,
    direction: Direction,
    endpoint: Weak<EndpointShared>,
    registry: Option<RegistryHandle>,
    parent: Weak<Inner>,
    state: Mutex<State>,
    status: watch::Sender<ExchangeStatus>,
    events: broadcast::Sender<ExchangeEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Shared handle to one in-flight exchange. Clones refer to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

/// Everything needed to build an exchange.
pub(crate) struct Init {
    pub id: CorrelationId,
    pub direction: Direction,
    pub status: ExchangeStatus,
    pub endpoint: Weak<EndpointShared>,
    pub registry: Option<RegistryHandle>,
    pub parent: Weak<Inner>,
    pub payload: Option<String>,
    pub sender: Option<PublicId>,
    pub receiver: Option<PublicId>,
    pub deadline: Option<u64>,
    pub max_bytes_per_chunk: usize,
    pub max_response_size: Option<u64>,
}

impl Exchange {
    // ── Construction ──────────────────────────────────────────────────────────

    /// Build without arming the deadline timer. Callers register the exchange
    /// first and then call [`Exchange::arm_timer`].
    pub(crate) fn build(init: Init) -> Exchange {
        let (status, _) = watch::channel(init.status);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Exchange {
            inner: Arc::new(Inner {
                kind: init.id.kind(),
                id: init.id,
                direction: init.direction,
                endpoint: init.endpoint,
                registry: init.registry,
                parent: init.parent,
                state: Mutex::new(State {
                    payload: init.payload,
                    sender: init.sender,
                    receiver: init.receiver,
                    chunk_count: None,
                    buffer: BTreeMap::new(),
                    deadline: init.deadline,
                    authenticity: Authenticity::Unknown,
                    max_bytes_per_chunk: init.max_bytes_per_chunk,
                    max_response_size: init.max_response_size,
                    response: None,
                    timer: None,
                    error: None,
                }),
                status,
                events,
            }),
        }
    }

    /// An exchange first seen on the wire, collecting chunks.
    pub(crate) fn inbound(
        id: CorrelationId,
        endpoint: Weak<EndpointShared>,
        registry: Option<RegistryHandle>,
        parent: Option<&Exchange>,
        deadline: Option<u64>,
    ) -> Exchange {
        let receiver = endpoint.upgrade().map(|e| e.public_id.clone());
        Exchange::build(Init {
            id,
            direction: Direction::Inbound,
            status: ExchangeStatus::Receiving,
            endpoint,
            registry,
            parent: parent.map_or_else(Weak::new, |p| Arc::downgrade(&p.inner)),
            payload: None,
            sender: None,
            receiver,
            deadline,
            max_bytes_per_chunk: MAX_BYTES_PER_CHUNK,
            max_response_size: None,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &CorrelationId {
        &self.inner.id
    }

    pub fn kind(&self) -> ExchangeKind {
        self.inner.kind
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn status(&self) -> ExchangeStatus {
        *self.inner.status.borrow()
    }

    /// Complete payload: known from the start when outbound, after assembly
    /// when inbound. Cleared on abort and timeout.
    pub fn payload(&self) -> Option<String> {
        self.lock().payload.clone()
    }

    pub fn sender(&self) -> Option<PublicId> {
        self.lock().sender.clone()
    }

    pub fn receiver(&self) -> Option<PublicId> {
        self.lock().receiver.clone()
    }

    pub fn chunk_count(&self) -> Option<u64> {
        self.lock().chunk_count
    }

    pub fn deadline(&self) -> Option<u64> {
        self.lock().deadline
    }

    pub fn authenticity(&self) -> Authenticity {
        self.lock().authenticity
    }

    pub fn max_bytes_per_chunk(&self) -> usize {
        self.lock().max_bytes_per_chunk
    }

    pub fn max_response_size(&self) -> Option<u64> {
        self.lock().max_response_size
    }

    /// The linked response, once created or first seen.
    pub fn response(&self) -> Option<Exchange> {
        self.lock().response.clone()
    }

    /// Why the exchange failed, if it did.
    pub fn error(&self) -> Option<ParleyError> {
        self.lock().error.clone()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.inner.events.subscribe()
    }

    pub fn status_watch(&self) -> watch::Receiver<ExchangeStatus> {
        self.inner.status.subscribe()
    }

    /// True if both handles refer to the same exchange.
    pub fn same(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parent(&self) -> Option<Exchange> {
        self.inner.parent.upgrade().map(|inner| Exchange { inner })
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Move to `to` if legal. Returns false and changes nothing otherwise.
    pub(crate) fn transition(&self, to: ExchangeStatus) -> bool {
        self.transition_with(to, None)
    }

    fn fail(&self, to: ExchangeStatus, error: ParleyError) -> bool {
        self.transition_with(to, Some(error))
    }

    fn transition_with(&self, to: ExchangeStatus, error: Option<ParleyError>) -> bool {
        let from;
        let timer;
        {
            let mut state = self.lock();
            from = self.status();
            if !legal(self.inner.kind, from, to) {
                return false;
            }
            let settled = self.inner.kind == ExchangeKind::Response
                && matches!(to, ExchangeStatus::Sent | ExchangeStatus::Received);
            timer = if to.is_terminal() || settled {
                state.timer.take()
            } else {
                None
            };
            if matches!(to, ExchangeStatus::Aborted | ExchangeStatus::TimedOut) {
                state.buffer.clear();
                state.payload = None;
            }
            if error.is_some() {
                state.error = error;
            }
            self.inner.status.send_replace(to);
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        let _ = self.inner.events.send(ExchangeEvent::Status(to));
        tracing::debug!(correlation_id = %self.inner.id, %from, %to, "exchange status");

        if to.is_terminal() {
            self.retire();
        }
        if self.inner.kind == ExchangeKind::Response {
            if let Some(parent) = self.parent() {
                match to {
                    ExchangeStatus::Received => {
                        parent.transition(ExchangeStatus::Responded);
                    }
                    ExchangeStatus::Sent => parent.settle(),
                    _ => {}
                }
            }
        }
        true
    }

    fn retire(&self) {
        if let Some(registry) = &self.inner.registry {
            registry.retire(self);
        }
    }

    /// The request has been answered: stop its clock and let it go. Its id
    /// stays reserved until the deadline so a redelivered chunk cannot open it
    /// again.
    fn settle(&self) {
        let timer = self.lock().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(registry) = &self.inner.registry {
            registry.settle(self);
        }
    }

    /// Deadline reached.
    fn expire(&self) {
        if self.fail(
            ExchangeStatus::TimedOut,
            ParleyError::new(ErrorKind::TimedOut, format!("exchange {} timed out", self.inner.id)),
        ) {
            tracing::info!(correlation_id = %self.inner.id, "exchange timed out");
        }
    }

    /// (Re)start the deadline timer from the current deadline. The timer task
    /// holds only a weak handle.
    pub(crate) fn arm_timer(&self) {
        let Some(deadline) = self.deadline() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(correlation_id = %self.inner.id, "no runtime, deadline not enforced");
                return;
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let wait = deadline.saturating_sub(now_millis());
            tokio::time::sleep(Duration::from_millis(wait)).await;
            if let Some(inner) = weak.upgrade() {
                Exchange { inner }.expire();
            }
        });

        let previous = {
            let mut state = self.lock();
            if self.status().is_terminal() {
                Some(task)
            } else {
                state.timer.replace(task)
            }
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Split the payload into chunks and hand them all to the relay.
    ///
    /// A request resolves with its response once the peer answered, or fails
    /// with `Aborted` / `TimedOut`. A response resolves with `None` once every
    /// chunk has been handed off.
    pub async fn send(&self) -> Result<Option<Exchange>> {
        match self.status() {
            ExchangeStatus::Ready => {}
            ExchangeStatus::Sent => {
                return Err(ParleyError::new(
                    ErrorKind::AlreadySent,
                    format!("exchange {} was already sent", self.inner.id),
                ))
            }
            other => {
                return Err(ParleyError::new(
                    ErrorKind::NotReady,
                    format!("exchange {} cannot be sent while {other}", self.inner.id),
                ))
            }
        }

        let outgoing = self.prepare()?;
        let mut status_rx = self.inner.status.subscribe();
        if !self.transition(ExchangeStatus::Sending) {
            return Err(ParleyError::new(
                ErrorKind::NotReady,
                format!("exchange {} is {}", self.inner.id, self.status()),
            ));
        }
        tracing::info!(
            correlation_id = %self.inner.id,
            chunks = outgoing.chunks.len(),
            recipient = outgoing.recipient.short(),
            "sending exchange"
        );

        let interrupted = tokio::select! {
            result = self.hand_off(outgoing) => {
                if let Err(e) = result {
                    tracing::warn!(correlation_id = %self.inner.id, error = %e, "send failed");
                    self.fail(ExchangeStatus::Aborted, e.clone());
                    return Err(e);
                }
                None
            }
            status = status_rx.wait_for(|s| matches!(s, ExchangeStatus::Aborted | ExchangeStatus::TimedOut)) => {
                Some(status.map(|s| *s))
            }
        };
        if let Some(status) = interrupted {
            return Err(self.outcome_error(status.unwrap_or(ExchangeStatus::Aborted)));
        }

        self.transition(ExchangeStatus::Sent);
        if self.inner.kind == ExchangeKind::Response {
            return match self.status() {
                ExchangeStatus::Sent => Ok(None),
                other => Err(self.outcome_error(other)),
            };
        }

        let status = status_rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| ParleyError::unexpected("status channel closed"))?;
        match status {
            ExchangeStatus::Responded => Ok(self.response()),
            other => Err(self.outcome_error(other)),
        }
    }

    /// Create a response and send it. Fails with `ResponseAlreadySent` if a
    /// response already went out.
    pub async fn send_response(
        &self,
        payload: impl Into<String>,
        options: ResponseOptions,
    ) -> Result<Exchange> {
        if let Some(existing) = self.response() {
            if existing.status() == ExchangeStatus::Sent {
                return Err(ParleyError::new(
                    ErrorKind::ResponseAlreadySent,
                    format!("response to {} was already sent", self.inner.id),
                ));
            }
        }
        let response = self.create_response(payload, options)?;
        response.send().await?;
        Ok(response)
    }

    fn outcome_error(&self, status: ExchangeStatus) -> ParleyError {
        match status {
            ExchangeStatus::TimedOut => ParleyError::new(
                ErrorKind::TimedOut,
                format!("exchange {} timed out", self.inner.id),
            ),
            ExchangeStatus::Aborted => self.error().unwrap_or_else(|| {
                ParleyError::new(
                    ErrorKind::Aborted,
                    format!("exchange {} was aborted", self.inner.id),
                )
            }),
            other => ParleyError::unexpected(format!(
                "exchange {} ended in unexpected status {other}",
                self.inner.id
            )),
        }
    }

    /// Everything `hand_off` needs, gathered without holding any lock across
    /// an await.
    fn prepare(&self) -> Result<Outgoing> {
        let no_transport = || {
            ParleyError::new(
                ErrorKind::NoTransport,
                format!("exchange {} has no relay connection", self.inner.id),
            )
        };
        let endpoint = self.inner.endpoint.upgrade().ok_or_else(no_transport)?;
        let connection = endpoint.connection().ok_or_else(no_transport)?;
        let (kind, wait_for_ack) = {
            let config = endpoint.read_config();
            (config.kind, config.wait_for_transport_ack)
        };

        let state = self.lock();
        let recipient = state.receiver.clone().ok_or_else(|| {
            ParleyError::new(
                ErrorKind::NotReady,
                format!("exchange {} has no recipient", self.inner.id),
            )
        })?;
        let params = SplitParams {
            correlation_id: &self.inner.id,
            payload: state.payload.as_deref().unwrap_or_default(),
            deadline: state.deadline.unwrap_or_else(now_millis),
            sender_id: &endpoint.public_id,
            max_bytes_per_chunk: state.max_bytes_per_chunk,
            max_response_size: state.max_response_size,
        };
        let chunks = codec::split(&params, |n| connection.framed_len(n))?;

        Ok(Outgoing {
            connection,
            chunks,
            kind,
            author: endpoint.public_id.clone(),
            recipient,
            wait_for_ack,
        })
    }

    /// Submit every chunk without waiting on the previous one. With
    /// acknowledgments on, the first refusal fails the whole send.
    async fn hand_off(&self, outgoing: Outgoing) -> Result<()> {
        let Outgoing {
            connection,
            chunks,
            kind,
            author,
            recipient,
            wait_for_ack,
        } = outgoing;

        let mut pending = FuturesUnordered::new();
        for chunk in chunks {
            let index = chunk.chunk_index;
            let event = OutboundEvent {
                kind,
                author: author.clone(),
                recipient: recipient.clone(),
                payload: Bytes::from(chunk.encode()?),
            };
            let _ = self.inner.events.send(ExchangeEvent::Chunk(chunk));
            let connection = connection.clone();

            if wait_for_ack {
                pending.push(async move {
                    connection.publish(event).await.map_err(|e| (index, e))
                });
            } else {
                let id = self.inner.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.publish(event).await {
                        tracing::warn!(correlation_id = %id, chunk = index, error = %e, "chunk publish failed");
                    }
                });
            }
        }

        while let Some(result) = pending.next().await {
            if let Err((index, e)) = result {
                return Err(ParleyError::new(
                    ErrorKind::PublishFailed,
                    format!("chunk {index} of {} was not accepted: {e}", self.inner.id),
                )
                .with_data(json!({ "reason": e.to_string(), "chunk": index })));
            }
        }
        Ok(())
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Accept one inbound chunk. Returns true if it completed the payload.
    ///
    /// Chunks arriving when the exchange is no longer receiving are dropped.
    /// A chunk whose deadline has passed times the exchange out.
    pub fn add_chunk(&self, envelope: &Envelope, authenticity: Authenticity) -> Result<bool> {
        enum Outcome {
            Pending,
            Expired,
            Complete,
        }

        if self.status() != ExchangeStatus::Receiving {
            tracing::trace!(correlation_id = %self.inner.id, chunk = envelope.chunk_index, "stale chunk dropped");
            return Ok(false);
        }
        if envelope.correlation_id != self.inner.id {
            return Err(ParleyError::new(
                ErrorKind::CorrelationMismatch,
                format!(
                    "chunk for {} delivered to exchange {}",
                    envelope.correlation_id, self.inner.id
                ),
            )
            .with_data(json!({
                "expected": self.inner.id,
                "actual": envelope.correlation_id,
            })));
        }
        let _ = self.inner.events.send(ExchangeEvent::Chunk(envelope.clone()));

        let mut rearm = false;
        let outcome = {
            let mut state = self.lock();
            if envelope.deadline <= now_millis() {
                Outcome::Expired
            } else {
                if state.deadline != Some(envelope.deadline) {
                    state.deadline = Some(envelope.deadline);
                    rearm = true;
                }
                if envelope.is_first() {
                    state.sender = envelope.sender_id.clone();
                    state.chunk_count = envelope.chunk_count;
                    state.max_response_size = envelope.max_response_size;
                    if let Some(count) = state.chunk_count {
                        state.buffer.retain(|index, _| *index < count);
                    }
                }

                let beyond = match state.chunk_count {
                    Some(count) => envelope.chunk_index >= count,
                    None => {
                        state.buffer.len() >= MAX_UNCOUNTED_CHUNKS
                            && !state.buffer.contains_key(&envelope.chunk_index)
                    }
                };
                if beyond {
                    tracing::debug!(correlation_id = %self.inner.id, chunk = envelope.chunk_index, "chunk index out of range dropped");
                } else {
                    state.buffer.insert(
                        envelope.chunk_index,
                        Buffered {
                            envelope: envelope.clone(),
                            authenticity,
                        },
                    );
                    state.authenticity =
                        Authenticity::combine(state.buffer.values().map(|b| b.authenticity));
                }

                match state.chunk_count {
                    Some(count) if state.buffer.len() as u64 == count => {
                        let payload =
                            codec::reassemble(state.buffer.values().map(|b| &b.envelope))?;
                        state.payload = Some(payload);
                        state.buffer.clear();
                        Outcome::Complete
                    }
                    _ => Outcome::Pending,
                }
            }
        };

        match outcome {
            Outcome::Expired => {
                tracing::debug!(correlation_id = %self.inner.id, "chunk past deadline");
                self.expire();
                Ok(false)
            }
            Outcome::Pending => {
                if rearm {
                    self.arm_timer();
                }
                Ok(false)
            }
            Outcome::Complete => {
                if rearm {
                    self.arm_timer();
                }
                let completed = self.transition(ExchangeStatus::Received);
                if completed {
                    tracing::info!(
                        correlation_id = %self.inner.id,
                        chunks = self.chunk_count().unwrap_or_default(),
                        authenticity = ?self.authenticity(),
                        "exchange received"
                    );
                }
                Ok(completed)
            }
        }
    }

    /// Lazily create the inbound response of a request sent from here.
    pub(crate) fn inbound_response(&self) -> Option<Exchange> {
        if self.inner.kind != ExchangeKind::Request || self.inner.direction != Direction::Outbound {
            return None;
        }
        let mut state = self.lock();
        if let Some(response) = &state.response {
            return Some(response.clone());
        }
        if !matches!(self.status(), ExchangeStatus::Sending | ExchangeStatus::Sent) {
            return None;
        }
        let response = Exchange::inbound(
            self.inner.id.response_form(),
            self.inner.endpoint.clone(),
            None,
            Some(self),
            None,
        );
        state.response = Some(response.clone());
        Some(response)
    }

    // ── Responding ────────────────────────────────────────────────────────────

    /// Create the single response to an inbound request, addressed to the
    /// requester. The response is `Ready`; call [`Exchange::send`] on it.
    pub fn create_response(
        &self,
        payload: impl Into<String>,
        options: ResponseOptions,
    ) -> Result<Exchange> {
        if self.inner.kind != ExchangeKind::Request || self.inner.direction != Direction::Inbound {
            return Err(ParleyError::new(
                ErrorKind::InvalidOperation,
                format!("{} is not an inbound request", self.inner.id),
            ));
        }
        let payload = payload.into();

        let mut state = self.lock();
        if state.response.is_some() {
            return Err(ParleyError::new(
                ErrorKind::AlreadyCreated,
                format!("response to {} already exists", self.inner.id),
            ));
        }
        match self.status() {
            ExchangeStatus::TimedOut => {
                return Err(ParleyError::new(
                    ErrorKind::TimedOut,
                    format!("request {} timed out", self.inner.id),
                ))
            }
            ExchangeStatus::Aborted => {
                return Err(ParleyError::new(
                    ErrorKind::Aborted,
                    format!("request {} was aborted", self.inner.id),
                ))
            }
            _ => {}
        }
        let Some(requester) = state.sender.clone() else {
            return Err(ParleyError::new(
                ErrorKind::NotReady,
                format!("sender of {} not known yet", self.inner.id),
            ));
        };
        if let Some(limit) = state.max_response_size {
            let size = payload.len() as u64;
            if size > limit {
                return Err(ParleyError::new(
                    ErrorKind::ResponseTooLarge,
                    format!("response of {size} bytes exceeds the requested limit of {limit}"),
                )
                .with_data(json!({ "size": size, "limit": limit })));
            }
        }

        let endpoint = self.inner.endpoint.upgrade().ok_or_else(|| {
            ParleyError::new(ErrorKind::NoTransport, "endpoint has been dropped")
        })?;
        let (max_bytes_per_chunk, timeout) = {
            let config = endpoint.read_config();
            (
                options.max_bytes_per_chunk.unwrap_or(config.max_bytes_per_chunk),
                options.timeout.unwrap_or_else(|| config.default_timeout()),
            )
        };
        validate_chunk_size(max_bytes_per_chunk)?;

        let response = Exchange::build(Init {
            id: self.inner.id.response_form(),
            direction: Direction::Outbound,
            status: ExchangeStatus::Ready,
            endpoint: Arc::downgrade(&endpoint),
            registry: None,
            parent: Arc::downgrade(&self.inner),
            payload: Some(payload),
            sender: Some(endpoint.public_id.clone()),
            receiver: Some(requester),
            deadline: Some(now_millis().saturating_add(timeout.as_millis() as u64)),
            max_bytes_per_chunk,
            max_response_size: None,
        });
        state.response = Some(response.clone());
        drop(state);

        response.arm_timer();
        tracing::debug!(correlation_id = %response.id(), "response created");
        Ok(response)
    }

    /// Stop a send or receive in progress. No effect in any other status.
    pub fn abort(&self) -> bool {
        if !matches!(self.status(), ExchangeStatus::Sending | ExchangeStatus::Receiving) {
            return false;
        }
        let aborted = self.fail(
            ExchangeStatus::Aborted,
            ParleyError::new(ErrorKind::Aborted, format!("exchange {} was aborted", self.inner.id)),
        );
        if aborted {
            tracing::info!(correlation_id = %self.inner.id, "exchange aborted");
        }
        aborted
    }
}

struct Outgoing {
    connection: Arc<dyn RelayConnection>,
    chunks: Vec<Envelope>,
    kind: u16,
    author: PublicId,
    recipient: PublicId,
    wait_for_ack: bool,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("status", &self.status())
            .finish()
    }
}
