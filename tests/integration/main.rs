//! Parley integration test harness.
//!
//! Every test runs two (or more) endpoints against an in-process
//! `MemoryRelay`, so nothing here needs a network. Set RUST_LOG to see the
//! endpoints' tracing output:
//!
//!   RUST_LOG=parley_exchange=debug cargo test --test integration
//!
//! Each test builds its own relay; tests never share state.

mod exchange;
mod faults;
mod timeouts;

use anyhow::{bail, Context, Result};
use parley_exchange::{
    Endpoint, EndpointConfig, EndpointEvent, Exchange, Keypair, MemoryRelay, ResponseOptions,
};
use std::time::Duration;
use tokio::sync::broadcast;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const RELAY_ADDR: &str = "memory://integration";

/// Upper bound on how long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber once per process. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh endpoint connected to `relay`.
pub async fn connected(relay: &MemoryRelay, config: EndpointConfig) -> Result<Endpoint> {
    let endpoint = Endpoint::new(Keypair::generate(), config)?;
    endpoint
        .connect(relay, RELAY_ADDR)
        .await
        .context("connecting to memory relay")?;
    Ok(endpoint)
}

/// Two connected endpoints sharing one relay.
pub async fn pair(config: EndpointConfig) -> Result<(MemoryRelay, Endpoint, Endpoint)> {
    init_tracing();
    let relay = MemoryRelay::new();
    let a = connected(&relay, config.clone()).await?;
    let b = connected(&relay, config).await?;
    Ok((relay, a, b))
}

/// Answer every completed inbound request on `endpoint` with `reply(payload)`
/// after `delay`. Outcomes of `send_response` are forwarded on the returned
/// channel.
pub fn spawn_responder<F>(
    endpoint: &Endpoint,
    delay: Duration,
    reply: F,
) -> tokio::sync::mpsc::UnboundedReceiver<parley_exchange::Result<Exchange>>
where
    F: Fn(&str) -> String + Send + 'static,
{
    let mut events = endpoint.subscribe();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let EndpointEvent::RequestReceived(request) = event {
                tokio::time::sleep(delay).await;
                let body = reply(request.payload().as_deref().unwrap_or_default());
                let outcome = request.send_response(body, ResponseOptions::default()).await;
                if tx.send(outcome).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Wait for the first endpoint event matching `pick`.
pub async fn wait_for_event<T>(
    events: &mut broadcast::Receiver<EndpointEvent>,
    mut pick: impl FnMut(EndpointEvent) -> Option<T>,
) -> Result<T> {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => bail!("event channel closed: {e}"),
            }
        }
    })
    .await
    .context("timed out waiting for endpoint event")?;
    found
}
