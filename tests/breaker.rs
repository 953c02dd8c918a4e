mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use breakwater::breaker::BreakerState;
use breakwater::config::BreakerConfig;
use breakwater::error::Error;
use breakwater::events::{Event, EventKind};
use breakwater::{Client, OutboundRequest};
use common::*;

fn breaker_client(breaker: BreakerConfig) -> Client {
    Client::builder()
        .max_in_flight(10)
        .max_queue(10)
        .enqueue_timeout(Duration::from_millis(500))
        .request_timeout(Duration::from_millis(500))
        .breaker(breaker)
        .build()
        .unwrap()
}

#[tokio::test]
async fn breaker_opens_and_stops_all_io() {
    let upstream = start_scripted_upstream(vec![500]).await;
    let client = breaker_client(BreakerConfig {
        window_size: 10,
        min_requests: 4,
        failure_threshold: 0.5,
        cooldown: Duration::from_secs(60),
        half_open_probe_count: 2,
    });

    // Four upstream 500s satisfy min_requests at failure rate 1.0.
    for _ in 0..4 {
        let resp = client
            .request(OutboundRequest::get(upstream.url()))
            .await
            .unwrap();
        assert_eq!(resp.status, 500);
    }
    assert_eq!(upstream.hits(), 4);

    let snapshot = client.snapshot();
    assert_eq!(snapshot.breakers[0].state, BreakerState::Open);
    assert!(snapshot.breakers[0].opened_at.is_some());

    // Rejected fail-fast: the upstream must not see request five.
    match client.request(OutboundRequest::get(upstream.url())).await {
        Err(Error::CircuitOpen { key, retry_after }) => {
            assert_eq!(key, "127.0.0.1");
            assert!(retry_after <= Duration::from_secs(60));
            assert!(retry_after > Duration::from_secs(50));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(upstream.hits(), 4);
}

#[tokio::test]
async fn breaker_recovers_through_half_open() {
    // Fails once, then healthy.
    let upstream = start_scripted_upstream(vec![500, 200]).await;
    let client = breaker_client(BreakerConfig {
        window_size: 5,
        min_requests: 1,
        failure_threshold: 1.0,
        cooldown: Duration::from_millis(200),
        half_open_probe_count: 1,
    });

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    client.on_event(EventKind::BreakerState, move |event| {
        if let Event::BreakerState { from, to, .. } = event {
            seen.lock().unwrap().push((*from, *to));
        }
    });

    // Trip the circuit.
    let resp = client
        .request(OutboundRequest::get(upstream.url()))
        .await
        .unwrap();
    assert_eq!(resp.status, 500);
    assert!(matches!(
        client.request(OutboundRequest::get(upstream.url())).await,
        Err(Error::CircuitOpen { .. })
    ));

    // Wait out the cooldown, then the probe finds a healthy upstream.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let resp = client
        .request(OutboundRequest::get(upstream.url()))
        .await
        .unwrap();
    assert_eq!(resp.status, 200);

    let snapshot = client.snapshot();
    assert_eq!(snapshot.breakers[0].state, BreakerState::Closed);
    // Window was reset on close; the pre-outage failure is gone.
    assert_eq!(snapshot.breakers[0].window_failures, 0);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );

    // Only the tripping request and the probe reached the upstream; the
    // fail-fast rejection performed no I/O.
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let upstream = start_scripted_upstream(vec![500, 500, 200]).await;
    let client = breaker_client(BreakerConfig {
        window_size: 5,
        min_requests: 1,
        failure_threshold: 1.0,
        cooldown: Duration::from_millis(150),
        half_open_probe_count: 2,
    });

    let resp = client
        .request(OutboundRequest::get(upstream.url()))
        .await
        .unwrap();
    assert_eq!(resp.status, 500);
    assert_eq!(client.snapshot().breakers[0].state, BreakerState::Open);

    // The probe also gets a 500: straight back to open, no second probe.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let resp = client
        .request(OutboundRequest::get(upstream.url()))
        .await
        .unwrap();
    assert_eq!(resp.status, 500);

    let snapshot = client.snapshot();
    assert_eq!(snapshot.breakers[0].state, BreakerState::Open);
    assert!(matches!(
        client.request(OutboundRequest::get(upstream.url())).await,
        Err(Error::CircuitOpen { .. })
    ));
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn upstreams_get_independent_circuits() {
    let failing = start_scripted_upstream(vec![500]).await;
    let healthy_addr = start_upstream("ok").await;

    // Key on the full authority so the two 127.0.0.1 upstreams get
    // separate circuits despite sharing a host.
    let client = Client::builder()
        .max_in_flight(10)
        .breaker(BreakerConfig {
            window_size: 5,
            min_requests: 1,
            failure_threshold: 1.0,
            cooldown: Duration::from_secs(60),
            half_open_probe_count: 1,
        })
        .key_fn(|req| {
            req.url
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        })
        .build()
        .unwrap();

    let resp = client
        .request(OutboundRequest::get(failing.url()))
        .await
        .unwrap();
    assert_eq!(resp.status, 500);
    assert!(matches!(
        client.request(OutboundRequest::get(failing.url())).await,
        Err(Error::CircuitOpen { .. })
    ));

    // The healthy upstream is unaffected.
    let resp = client
        .request(OutboundRequest::get(url_for(healthy_addr)))
        .await
        .unwrap();
    assert_eq!(resp.status, 200);

    let snapshot = client.snapshot();
    let states: Vec<BreakerState> = snapshot.breakers.iter().map(|b| b.state).collect();
    assert!(states.contains(&BreakerState::Open));
    assert!(states.contains(&BreakerState::Closed));
}
