//! Deadlines: slow peers, lost chunks and responses that show up too late.

use crate::*;
use parley_exchange::{ErrorKind, ExchangeStatus, RequestOptions};

fn within(ms: u64) -> RequestOptions {
    RequestOptions {
        timeout: Some(Duration::from_millis(ms)),
        ..Default::default()
    }
}

#[tokio::test]
async fn slow_responder_times_out_both_sides() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let mut outcomes = spawn_responder(&bob, Duration::from_millis(1000), |_| "Pong".to_string());

    let request = alice.create_request(bob.public_id(), "Ping", within(100))?;
    let err = request.send().await.err().context("slow response was accepted")?;
    assert!(err.is(ErrorKind::TimedOut));
    assert_eq!(request.status(), ExchangeStatus::TimedOut);
    assert!(request.response().is_none());

    // The responder only wakes up after the shared deadline.
    let outcome = tokio::time::timeout(WAIT, outcomes.recv())
        .await?
        .context("responder stopped")?;
    let err = outcome.err().context("response to an expired request went out")?;
    assert!(err.is(ErrorKind::TimedOut));
    assert!(alice.pending_requests().is_empty());
    assert!(bob.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn lost_chunk_times_out() -> Result<()> {
    let config = EndpointConfig {
        max_bytes_per_chunk: 1000,
        ..Default::default()
    };
    let (relay, alice, bob) = pair(config).await?;
    let _responder = spawn_responder(&bob, Duration::ZERO, |body| body.to_string());
    relay.drop_every(3);

    let payload = format!("{}END", "Ping".repeat(60));
    let request = alice.create_request(bob.public_id(), payload, within(300))?;
    let err = request.send().await.err().context("request completed without chunk 2")?;
    assert!(err.is(ErrorKind::TimedOut));
    assert_eq!(relay.published_count(), 5);

    // Bob holds the same deadline; give its timer a moment to fire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice.pending_requests().is_empty());
    assert!(bob.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn late_response_dropped_silently() -> Result<()> {
    let (relay, alice, bob) = pair(EndpointConfig::default()).await?;
    let mut bob_events = bob.subscribe();
    let mut alice_events = alice.subscribe();

    let request = alice.create_request(bob.public_id(), "Ping", within(150))?;
    let waiting = {
        let request = request.clone();
        tokio::spawn(async move { request.send().await })
    };

    let inbound = wait_for_event(&mut bob_events, |e| match e {
        EndpointEvent::RequestReceived(r) => Some(r),
        _ => None,
    })
    .await?;

    relay.hold_events(true);
    inbound
        .send_response("Pong", ResponseOptions::default())
        .await
        .context("responding")?;

    let err = waiting.await?.err().context("held response reached alice")?;
    assert!(err.is(ErrorKind::TimedOut));

    relay.hold_events(false);
    assert_eq!(relay.release_held(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    while let Ok(event) = alice_events.try_recv() {
        match event {
            EndpointEvent::ResponseReceived(r) => bail!("late response surfaced: {r:?}"),
            EndpointEvent::Error(e) => bail!("late response reported as error: {e}"),
            _ => {}
        }
    }
    assert_eq!(request.status(), ExchangeStatus::TimedOut);
    assert!(request.response().is_none());
    assert!(alice.pending_requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn expired_request_cannot_be_sent() -> Result<()> {
    let (_relay, alice, bob) = pair(EndpointConfig::default()).await?;

    let request = alice.create_request(bob.public_id(), "Ping", within(50))?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(request.status(), ExchangeStatus::TimedOut);

    let err = request.send().await.err().context("expired request was sent")?;
    assert!(err.is(ErrorKind::NotReady));
    assert!(alice.pending_requests().is_empty());
    Ok(())
}
