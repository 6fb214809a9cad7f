//! Relay misbehaviour and connection lifecycle.

use crate::*;
use bytes::Bytes;
use parley_exchange::relay::{OutboundEvent, Relay};
use parley_exchange::{ErrorKind, ExchangeStatus, RequestOptions};

#[tokio::test]
async fn refused_publish_aborts_when_acknowledged() -> Result<()> {
    let config = EndpointConfig {
        wait_for_transport_ack: true,
        ..Default::default()
    };
    let (relay, alice, bob) = pair(config).await?;
    relay.reject_publishes(true);

    let request = alice.create_request(bob.public_id(), "Ping", RequestOptions::default())?;
    let err = request.send().await.err().context("refused publish went unnoticed")?;
    assert!(err.is(ErrorKind::PublishFailed));
    let data = err.data.context("publish failure carries no detail")?;
    assert_eq!(data["chunk"], 0);
    assert!(data["reason"].as_str().is_some_and(|r| r.contains("publishing disabled")));

    assert_eq!(request.status(), ExchangeStatus::Aborted);
    assert!(request.error().is_some_and(|e| e.is(ErrorKind::PublishFailed)));
    assert!(alice.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn refused_publish_unnoticed_without_ack() -> Result<()> {
    let (relay, alice, bob) = pair(EndpointConfig::default()).await?;
    relay.reject_publishes(true);

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let err = alice
        .send_request(bob.public_id(), "Ping", options)
        .await
        .err()
        .context("request resolved with publishing disabled")?;
    assert!(err.is(ErrorKind::TimedOut));
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_surfaces_as_error() -> Result<()> {
    let (relay, alice, _bob) = pair(EndpointConfig::default()).await?;
    let mut events = alice.subscribe();

    let stranger = Keypair::generate();
    let connection = relay.connect(RELAY_ADDR, &stranger).await?;
    connection
        .publish(OutboundEvent {
            kind: alice.config().kind,
            author: stranger.public_id(),
            recipient: alice.public_id().clone(),
            payload: Bytes::from_static(br#"{"correlationId":"req.1","chunkIndex":-1}"#),
        })
        .await?;

    let err = wait_for_event(&mut events, |e| match e {
        EndpointEvent::Error(e) => Some(e),
        _ => None,
    })
    .await?;
    assert!(err.is(ErrorKind::InvalidEnvelope));
    let errors = err.data.context("no violation list")?;
    let errors: Vec<String> = serde_json::from_value(errors["errors"].clone())?;
    assert!(errors.iter().any(|e| e.contains("chunkIndex")));
    assert!(errors.iter().any(|e| e.contains("deadline")));
    assert!(alice.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn offline_relay_reports_connection_error() -> Result<()> {
    init_tracing();
    let relay = MemoryRelay::new();
    relay.set_offline(true);

    let endpoint = Endpoint::new(Keypair::generate(), EndpointConfig::default())?;
    let mut events = endpoint.subscribe();
    let err = endpoint
        .connect(&relay, RELAY_ADDR)
        .await
        .err()
        .context("connected to an offline relay")?;
    assert!(err.is(ErrorKind::RelayConnectionError));
    assert!(!endpoint.is_connected());

    let reported = wait_for_event(&mut events, |e| match e {
        EndpointEvent::Error(e) => Some(e),
        _ => None,
    })
    .await?;
    assert!(reported.is(ErrorKind::RelayConnectionError));
    assert_eq!(reported.data.context("no detail")?["address"], RELAY_ADDR);

    relay.set_offline(false);
    endpoint.connect(&relay, RELAY_ADDR).await?;
    assert!(endpoint.is_connected());
    Ok(())
}

#[tokio::test]
async fn aborting_partial_inbound_request() -> Result<()> {
    let config = EndpointConfig {
        max_bytes_per_chunk: 1000,
        ..Default::default()
    };
    let (relay, alice, bob) = pair(config).await?;
    let mut bob_events = bob.subscribe();
    // The last of five chunks never arrives.
    relay.drop_every(5);

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let request = alice.create_request(bob.public_id(), "Ping".repeat(61), options)?;
    let waiting = tokio::spawn(async move { request.send().await });

    let inbound = wait_for_event(&mut bob_events, |e| match e {
        EndpointEvent::Request(r) => Some(r),
        _ => None,
    })
    .await?;
    tokio::time::timeout(WAIT, async {
        while inbound.buffered_chunks() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("delivered chunks never buffered")?;
    assert_eq!(inbound.status(), ExchangeStatus::Receiving);

    assert!(inbound.abort());
    assert_eq!(inbound.status(), ExchangeStatus::Aborted);
    assert!(inbound.payload().is_none());
    assert!(bob.pending_requests().is_empty());
    assert!(!inbound.abort());

    let err = inbound
        .create_response("Pong", ResponseOptions::default())
        .err()
        .context("responded to an aborted request")?;
    assert!(err.is(ErrorKind::Aborted));

    let err = waiting.await?.err().context("aborted request was answered")?;
    assert!(err.is(ErrorKind::TimedOut));
    Ok(())
}

#[tokio::test]
async fn send_after_disconnect_has_no_transport() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    alice.disconnect().await;
    assert!(!alice.is_connected());

    let request = alice.create_request(bob.public_id(), "Ping", RequestOptions::default())?;
    let err = request.send().await.err().context("sent without a relay")?;
    assert!(err.is(ErrorKind::NoTransport));
    assert_eq!(request.status(), ExchangeStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn reconnect_restores_traffic() -> Result<()> {
    let (relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |_| "Pong".to_string());
    let mut events = alice.subscribe();

    alice.connect(&relay, RELAY_ADDR).await?;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(match event {
            EndpointEvent::Disconnected => "disconnected",
            EndpointEvent::Connecting { .. } => "connecting",
            EndpointEvent::Connected { .. } => "connected",
            other => bail!("unexpected event {other:?}"),
        });
    }
    assert_eq!(seen, vec!["disconnected", "connecting", "connected"]);
    assert_eq!(relay.subscriber_count(), 2);

    let response = alice
        .send_request(bob.public_id(), "Ping", RequestOptions::default())
        .await?;
    assert_eq!(response.payload().as_deref(), Some("Pong"));
    Ok(())
}
