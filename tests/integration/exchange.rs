//! Request/response exchanges between two endpoints.

use crate::*;
use parley_exchange::{Authenticity, ErrorKind, ExchangeEvent, ExchangeStatus, RequestOptions};

fn chunk_events(events: &mut broadcast::Receiver<ExchangeEvent>) -> Vec<u64> {
    let mut indices = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExchangeEvent::Chunk(chunk) = event {
            indices.push(chunk.chunk_index);
        }
    }
    indices
}

#[tokio::test]
async fn ping_pong_single_chunk() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |_| "Pong".to_string());

    let request = alice.create_request(bob.public_id(), "Ping", RequestOptions::default())?;
    let mut events = request.subscribe();
    let response = request.send().await?.context("request resolved without response")?;

    assert_eq!(response.payload().as_deref(), Some("Pong"));
    assert_eq!(response.chunk_count(), Some(1));
    assert_eq!(request.status(), ExchangeStatus::Responded);
    assert!(request.response().is_some_and(|r| r.same(&response)));
    assert_eq!(chunk_events(&mut events), vec![0]);
    assert!(alice.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn five_chunk_request_reassembles() -> Result<()> {
    let config = EndpointConfig {
        max_bytes_per_chunk: 1000,
        ..Default::default()
    };
    let (_relay, alice, bob) = pair(config).await?;
    let mut bob_events = bob.subscribe();
    let _responder = spawn_responder(&bob, Duration::ZERO, |body| body.to_string());

    let payload = format!("{}END", "Ping".repeat(60));
    assert_eq!(payload.len(), 244);

    let request = alice.create_request(bob.public_id(), payload.clone(), RequestOptions::default())?;
    let mut events = request.subscribe();
    let response = request.send().await?.context("no response")?;

    let mut sent = chunk_events(&mut events);
    sent.sort_unstable();
    assert_eq!(sent, vec![0, 1, 2, 3, 4]);

    let received = wait_for_event(&mut bob_events, |e| match e {
        EndpointEvent::RequestReceived(r) => Some(r),
        _ => None,
    })
    .await?;
    assert_eq!(received.chunk_count(), Some(5));
    assert_eq!(received.payload().as_deref(), Some(payload.as_str()));
    assert_eq!(received.sender().as_ref(), Some(alice.public_id()));

    assert_eq!(response.payload(), Some(payload));
    Ok(())
}

#[tokio::test]
async fn chunked_both_ways_with_multibyte_text() -> Result<()> {
    let config = EndpointConfig {
        max_bytes_per_chunk: 1000,
        ..Default::default()
    };
    let (_relay, alice, bob) = pair(config).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |body| body.chars().rev().collect());

    let payload = "grüße, 世界! 🚀 ".repeat(150);
    let response = alice
        .send_request(bob.public_id(), payload.clone(), RequestOptions::default())
        .await?;

    assert!(response.chunk_count().unwrap_or_default() > 1);
    let expected: String = payload.chars().rev().collect();
    assert_eq!(response.payload(), Some(expected));
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_are_correlated() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let _responder = spawn_responder(&bob, Duration::from_millis(5), |body| format!("echo:{body}"));

    let mut handles = Vec::new();
    for i in 0..20 {
        let alice = alice.clone();
        let bob_id = bob.public_id().clone();
        handles.push(tokio::spawn(async move {
            alice
                .send_request(&bob_id, format!("n{i}"), RequestOptions::default())
                .await
                .map(|r| (i, r.payload()))
        }));
    }
    for handle in handles {
        let (i, payload) = handle.await??;
        assert_eq!(payload, Some(format!("echo:n{i}")));
    }
    assert!(alice.pending_requests().is_empty());
    assert!(bob.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn advertised_response_limit_enforced() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let mut outcomes = spawn_responder(&bob, Duration::ZERO, |_| "far too long".to_string());

    let options = RequestOptions {
        max_response_size: Some(4),
        timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let request = alice.create_request(bob.public_id(), "Ping", options)?;
    let waiting = tokio::spawn(async move { request.send().await });

    let outcome = tokio::time::timeout(WAIT, outcomes.recv())
        .await?
        .context("responder stopped")?;
    let err = outcome.err().context("oversized response was accepted")?;
    assert!(err.is(ErrorKind::ResponseTooLarge));

    let err = waiting.await?.err().context("request should not resolve")?;
    assert!(err.is(ErrorKind::TimedOut));
    Ok(())
}

#[tokio::test]
async fn authenticity_reported_when_validating() -> Result<()> {
    let config = EndpointConfig {
        validate_authenticity: true,
        ..Default::default()
    };
    let (relay, alice, bob) = pair(config).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |_| "Pong".to_string());

    let response = alice
        .send_request(bob.public_id(), "Ping", RequestOptions::default())
        .await?;
    assert_eq!(response.authenticity(), Authenticity::Valid);

    relay.tamper_signatures(true);
    let response = alice
        .send_request(bob.public_id(), "Ping", RequestOptions::default())
        .await?;
    assert_eq!(response.authenticity(), Authenticity::Invalid);
    Ok(())
}

#[tokio::test]
async fn authenticity_unknown_by_default() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |_| "Pong".to_string());

    let response = alice
        .send_request(bob.public_id(), "Ping", RequestOptions::default())
        .await?;
    assert_eq!(response.authenticity(), Authenticity::Unknown);
    Ok(())
}
