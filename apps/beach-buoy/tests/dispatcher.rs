mod support;

use beach_buoy::call::{CallSettings, CallState};
use beach_buoy::dispatcher::SignalingDispatcher;
use beach_buoy::protocol::{ClientMessage, Signal};
use serde_json::json;
use support::{Harness, OFFER_SDP, wait_until};

fn dispatcher(harness: &Harness) -> SignalingDispatcher {
    SignalingDispatcher::new(harness.manager.clone(), harness.outbound.clone())
}

fn offer_from(peer: &str) -> String {
    json!({
        "type": "signal",
        "sender": peer,
        "payload": {
            "type": "offer",
            "sdp": { "type": "offer", "sdp": OFFER_SDP },
        },
    })
    .to_string()
}

#[test_timeout::tokio_timeout_test]
async fn answers_each_ping_in_order() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    for frame in [
        r#"{"type":"connected","payload":{"userId":"abc"}}"#,
        r#"{"type":"ping"}"#,
        r#"{"type":"user-joined","payload":{"userId":"xyz"}}"#,
        r#"{"type":"ping"}"#,
    ] {
        dispatcher.handle_text(frame).await.unwrap();
    }

    assert_eq!(harness.next_message().await, ClientMessage::Pong);
    assert_eq!(
        harness.next_message().await,
        ClientMessage::signal(
            "xyz",
            Signal::MyUuid {
                uuid: "abc".into()
            }
        )
    );
    assert_eq!(harness.next_message().await, ClientMessage::Pong);
    assert!(harness.try_next_message().is_none());
    assert_eq!(dispatcher.self_id(), Some("abc"));
}

#[test_timeout::tokio_timeout_test]
async fn user_joined_before_connected_is_silent() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    dispatcher
        .handle_text(r#"{"type":"user-joined","payload":{"userId":"xyz"}}"#)
        .await
        .unwrap();

    assert!(harness.try_next_message().is_none());
    assert_eq!(dispatcher.self_id(), None);
}

#[test_timeout::tokio_timeout_test]
async fn malformed_envelopes_are_dropped() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    for frame in [
        "not json",
        r#"{"payload":{}}"#,
        r#"{"type":"mystery"}"#,
        r#"{"type":"connected","payload":{}}"#,
        r#"{"type":"signal","payload":{"type":"offer"}}"#,
        r#"{"type":"signal","sender":"p1","payload":{"type":"offer"}}"#,
    ] {
        dispatcher.handle_text(frame).await.unwrap();
    }

    assert!(harness.try_next_message().is_none());
    assert!(harness.manager.is_empty());
    assert!(harness.engine.handles().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn offer_gets_exactly_one_answer_and_hangup_closes() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    dispatcher.handle_text(&offer_from("p1")).await.unwrap();

    match harness.next_message().await {
        ClientMessage::Signal {
            target,
            payload: Signal::Answer { sdp, identity },
        } => {
            assert_eq!(target, "p1");
            assert!(sdp.sdp.contains("o=fake 0"));
            assert_eq!(identity.unwrap().username, "WebRTC Bot");
        }
        other => panic!("expected answer, got {other:?}"),
    }
    assert_eq!(
        harness.manager.session_state("p1"),
        Some(CallState::AwaitingConnectivity)
    );
    assert!(harness.try_next_message().is_none());

    let session = harness.manager.session("p1").unwrap();
    dispatcher
        .handle_text(r#"{"type":"signal","sender":"p1","payload":{"type":"hangup"}}"#)
        .await
        .unwrap();

    assert!(harness.manager.is_empty());
    assert_eq!(session.state(), CallState::Closed);
    assert_eq!(harness.engine.handle(0).close_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn user_left_closes_the_session() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    dispatcher.handle_text(&offer_from("p1")).await.unwrap();
    harness.expect_answer("p1").await;

    dispatcher
        .handle_text(r#"{"type":"user-left","payload":{"userId":"p1"}}"#)
        .await
        .unwrap();

    assert!(harness.manager.is_empty());
    assert_eq!(harness.engine.handle(0).close_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn candidates_route_to_the_sender_only() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    dispatcher
        .handle_text(
            &json!({
                "type": "signal",
                "sender": "ghost",
                "payload": {
                    "type": "ice-candidate",
                    "candidate": {
                        "candidate": "candidate:9 1 udp 2122260223 10.0.0.9 50000 typ host",
                        "sdpMid": "0",
                        "sdpMLineIndex": 0,
                    },
                },
            })
            .to_string(),
        )
        .await
        .unwrap();
    assert!(harness.manager.is_empty());

    dispatcher.handle_text(&offer_from("p1")).await.unwrap();
    harness.expect_answer("p1").await;

    dispatcher
        .handle_text(
            &json!({
                "type": "signal",
                "sender": "p1",
                "payload": {
                    "type": "ice-candidate",
                    "candidate": {
                        "candidate": "candidate:7 1 udp 2122260223 10.0.0.7 50000 typ host",
                        "sdpMid": "0",
                        "sdpMLineIndex": 0,
                    },
                },
            })
            .to_string(),
        )
        .await
        .unwrap();

    let handle = harness.engine.handle(0);
    wait_until(|| handle.calls().iter().any(|call| call == "candidate:7")).await;
    assert!(!handle.calls().iter().any(|call| call == "candidate:9"));
}

#[test_timeout::tokio_timeout_test]
async fn hangup_for_unknown_peer_is_a_no_op() {
    let mut harness = Harness::new(CallSettings::default());
    let mut dispatcher = dispatcher(&harness);

    dispatcher
        .handle_text(r#"{"type":"signal","sender":"nobody","payload":{"type":"hangup"}}"#)
        .await
        .unwrap();
    dispatcher
        .handle_text(r#"{"type":"user-left","payload":{"userId":"nobody"}}"#)
        .await
        .unwrap();

    assert!(harness.try_next_message().is_none());
    assert!(harness.manager.is_empty());
}
