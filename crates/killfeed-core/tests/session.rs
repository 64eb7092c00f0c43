//! Session behavior against an in-memory server.

use killfeed_core::{
    ChannelSession, CloseReason, EventKind, JoinFailure, RequestKind, SessionConfig, SessionError,
    SessionEvent, SessionState,
};
use killfeed_protocol::{Endpoint, InboundEvent, Ref, ReplyStatus};
use killfeed_transport::{MemoryPeer, MemoryTransport};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const LOBBY: &str = "killmails:lobby";

fn config() -> SessionConfig {
    let endpoint = Endpoint::new("ws://localhost:4004", "test_client").unwrap();
    SessionConfig::new(endpoint)
}

fn reply(reference: u64, status: &str, response: Value) -> String {
    json!({
        "topic": LOBBY,
        "event": "phx_reply",
        "payload": {"status": status, "response": response},
        "ref": reference,
    })
    .to_string()
}

fn push(event: &str, payload: Value) -> String {
    json!({"topic": LOBBY, "event": event, "payload": payload, "ref": null}).to_string()
}

fn set(systems: &[u64]) -> BTreeSet<u64> {
    systems.iter().copied().collect()
}

async fn next_event(rx: &mut broadcast::Receiver<Arc<SessionEvent>>) -> Arc<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Connect a session whose join is answered with `subscription_id: "sub-1"`.
async fn joined_session(config: SessionConfig) -> (ChannelSession, MemoryPeer) {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config);

    let (joined, peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        let join = peer.recv_frame().await.unwrap();
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.reference, Some(Ref(1)));
        peer.send_text(reply(1, "ok", json!({"subscription_id": "sub-1"})))
            .unwrap();
        peer
    });

    assert_eq!(joined.unwrap(), json!({"subscription_id": "sub-1"}));
    (session, peer)
}

#[tokio::test]
async fn test_example_scenario() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut counts = session.events().subscribe(EventKind::KillCountUpdate);

    let (joined, mut peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(
            peer.url(),
            "ws://localhost:4004/socket/websocket?vsn=2.0.0&client_identifier=test_client"
        );
        let join = peer.recv_frame().await.unwrap();
        assert_eq!(join.topic, LOBBY);
        assert_eq!(join.payload, json!({}));
        peer.send_text(reply(1, "ok", json!({"subscription_id": "sub-1"})))
            .unwrap();
        peer
    });

    assert_eq!(joined.unwrap(), json!({"subscription_id": "sub-1"}));
    assert!(session.is_running());
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.subscription_id().as_deref(), Some("sub-1"));

    let systems = session
        .subscribe_to_topics(&[30000142, 30002659])
        .await
        .unwrap();
    assert_eq!(systems, set(&[30000142, 30002659]));

    let sent = peer.recv_frame().await.unwrap();
    assert_eq!(sent.event, "subscribe_systems");
    assert_eq!(sent.reference, Some(Ref(2)));
    assert_eq!(sent.payload, json!({"systems": [30000142, 30002659]}));

    peer.send_text(push(
        "kill_count_update",
        json!({"system_id": 30000142, "count": 3}),
    ))
    .unwrap();

    let event = next_event(&mut counts).await;
    assert_eq!(
        event.inbound(),
        Some(&InboundEvent::KillCountUpdate {
            system_id: 30000142,
            count: 3
        })
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_join_rejected() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());

    let (joined, mut peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.send_text(reply(1, "error", json!({"reason": "unauthorized"})))
            .unwrap();
        peer
    });

    match joined {
        Err(SessionError::ConnectionFailure(JoinFailure::Rejected { status, response })) => {
            assert_eq!(status, "error");
            assert_eq!(response, json!({"reason": "unauthorized"}));
        }
        other => panic!("Expected rejected join, got {:?}", other),
    }
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.subscription_id().is_none());

    // The connection is closed after a rejected join.
    assert!(peer.recv().await.is_none());
    assert!(peer.client_closed());
}

#[tokio::test(start_paused = true)]
async fn test_join_timeout() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(
        Arc::new(transport),
        config().with_join_timeout(Duration::from_secs(5)),
    );

    let (joined, _peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer
    });

    assert!(matches!(
        joined,
        Err(SessionError::ConnectionFailure(JoinFailure::Timeout(t))) if t == Duration::from_secs(5)
    ));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_peer_closes_before_join_reply() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());

    let (joined, _) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.close();
    });

    assert!(matches!(
        joined,
        Err(SessionError::ConnectionFailure(JoinFailure::Closed))
    ));
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_failed_join_emits_closed() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut closed = session.events().subscribe(EventKind::Closed);

    let (joined, _peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.send_text(reply(1, "error", json!({"reason": "unauthorized"})))
            .unwrap();
        peer
    });
    assert!(joined.is_err());

    let event = next_event(&mut closed).await;
    match &*event {
        SessionEvent::Closed(CloseReason::JoinFailed(message)) => {
            assert!(message.contains("unauthorized"));
        }
        other => panic!("Expected join failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_peer_close_during_join_then_disconnect_emits_one_closed() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut closed = session.events().subscribe(EventKind::Closed);

    let (joined, _) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.close();
    });
    assert!(joined.is_err());
    session.disconnect().await;

    let event = next_event(&mut closed).await;
    assert_eq!(
        *event,
        SessionEvent::Closed(CloseReason::JoinFailed(
            "connection closed before join reply".into()
        ))
    );
    assert!(closed.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_during_join_closes_connection() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut closed = session.events().subscribe(EventKind::Closed);

    let (joined, mut peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        session.disconnect().await;
        peer.send_text(reply(1, "ok", json!({"subscription_id": "sub-1"})))
            .unwrap();
        peer
    });

    assert!(matches!(
        joined,
        Err(SessionError::ConnectionFailure(JoinFailure::Closed))
    ));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Closed);

    // No leave for a channel that was never joined, and the socket is closed.
    assert!(peer.recv().await.is_none());
    assert!(peer.client_closed());

    let event = next_event(&mut closed).await;
    assert_eq!(*event, SessionEvent::Closed(CloseReason::Disconnected));
    assert!(closed.try_recv().is_err());
    assert!(matches!(
        session.subscribe_to_topics(&[1]).await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test]
async fn test_frames_before_join_reply_are_skipped() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut counts = session.events().subscribe(EventKind::KillCountUpdate);

    let (joined, _peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.send_text("not json at all").unwrap();
        peer.send_text(push("kill_count_update", json!({"system_id": 1, "count": 1})))
            .unwrap();
        peer.send_text(reply(1, "ok", json!({"subscription_id": "sub-2"})))
            .unwrap();
        peer
    });

    assert_eq!(joined.unwrap()["subscription_id"], "sub-2");
    assert!(counts.try_recv().is_err());
    session.disconnect().await;
}

#[tokio::test]
async fn test_connect_twice_is_invalid() {
    let (session, _peer) = joined_session(config()).await;

    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState(SessionState::Joined))
    ));
    assert!(session.is_running());

    session.disconnect().await;
    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState(SessionState::Closed))
    ));
}

#[tokio::test]
async fn test_refs_are_monotonic() {
    let (session, mut peer) = joined_session(config()).await;

    session.subscribe_to_topics(&[1, 2]).await.unwrap();
    session.unsubscribe_from_topics(&[1]).await.unwrap();
    session.get_status().await.unwrap();

    let mut refs = Vec::new();
    let mut events = Vec::new();
    for _ in 0..3 {
        let frame = peer.recv_frame().await.unwrap();
        refs.push(frame.reference.unwrap());
        events.push(frame.event);
    }
    assert_eq!(refs, vec![Ref(2), Ref(3), Ref(4)]);
    assert_eq!(
        events,
        vec!["subscribe_systems", "unsubscribe_systems", "get_status"]
    );
    assert_eq!(
        session.pending_requests(),
        vec![
            (Ref(2), RequestKind::Subscribe),
            (Ref(3), RequestKind::Unsubscribe),
            (Ref(4), RequestKind::Status),
        ]
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_requests_are_bounded() {
    let (session, peer) = joined_session(config().with_pending_limit(2)).await;

    session.subscribe_to_topics(&[1]).await.unwrap();
    session.subscribe_to_topics(&[2]).await.unwrap();
    let visible = session.subscribe_to_topics(&[3]).await.unwrap();

    // Ref 2 was never answered and has been given up on.
    assert_eq!(visible, set(&[2, 3]));
    assert_eq!(
        session.pending_requests(),
        vec![(Ref(3), RequestKind::Subscribe), (Ref(4), RequestKind::Subscribe)]
    );

    // A late reply for the dropped request changes nothing.
    let mut replies = session.events().subscribe(EventKind::Reply);
    peer.send_text(reply(2, "ok", json!({}))).unwrap();
    next_event(&mut replies).await;
    assert_eq!(session.subscriptions(), set(&[2, 3]));
    assert!(session.confirmed_subscriptions().is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn test_optimistic_composition() {
    let (session, _peer) = joined_session(config()).await;

    session.subscribe_to_topics(&[1, 2, 3]).await.unwrap();
    session.unsubscribe_from_topics(&[2, 9]).await.unwrap();
    let visible = session.subscribe_to_topics(&[2, 4]).await.unwrap();

    assert_eq!(visible, set(&[1, 2, 3, 4]));
    assert_eq!(session.subscriptions(), visible);
    assert!(session.confirmed_subscriptions().is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn test_malformed_frame_does_not_stop_receiving() {
    let (session, peer) = joined_session(config()).await;
    let mut counts = session.events().subscribe(EventKind::KillCountUpdate);

    peer.send_text("{\"topic\": ").unwrap();
    peer.send_text(push("kill_count_update", json!({"system_id": 30002187, "count": 7})))
        .unwrap();

    let event = next_event(&mut counts).await;
    assert_eq!(
        event.inbound(),
        Some(&InboundEvent::KillCountUpdate {
            system_id: 30002187,
            count: 7
        })
    );
    assert!(session.is_running());

    session.disconnect().await;
}

#[tokio::test]
async fn test_replies_commit_and_roll_back() {
    let (session, mut peer) = joined_session(config()).await;
    let mut replies = session.events().subscribe(EventKind::Reply);

    session.subscribe_to_topics(&[1, 2]).await.unwrap();
    let first = peer.recv_frame().await.unwrap().reference.unwrap();
    peer.send_text(reply(first.value(), "ok", json!({}))).unwrap();
    next_event(&mut replies).await;

    assert_eq!(session.confirmed_subscriptions(), set(&[1, 2]));

    assert_eq!(
        session.subscribe_to_topics(&[3]).await.unwrap(),
        set(&[1, 2, 3])
    );
    let second = peer.recv_frame().await.unwrap().reference.unwrap();
    peer.send_text(reply(second.value(), "error", json!({"reason": "limit"})))
        .unwrap();

    let event = next_event(&mut replies).await;
    match event.inbound() {
        Some(InboundEvent::Reply {
            reference, status, ..
        }) => {
            assert_eq!(*reference, Some(second));
            assert_eq!(*status, ReplyStatus::Error);
        }
        other => panic!("Expected Reply, got {:?}", other),
    }

    assert_eq!(session.subscriptions(), set(&[1, 2]));
    assert_eq!(session.confirmed_subscriptions(), set(&[1, 2]));
    assert!(session.pending_requests().is_empty());
    assert!(session.is_running());

    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_twice_sends_one_leave() {
    let (session, mut peer) = joined_session(config()).await;
    let mut closed = session.events().subscribe(EventKind::Closed);

    session.disconnect().await;
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Closed);

    let leave = peer.recv_frame().await.unwrap();
    assert_eq!(leave.event, "phx_leave");
    assert_eq!(leave.topic, LOBBY);
    assert_eq!(leave.reference, Some(Ref(2)));
    assert!(peer.recv().await.is_none());

    session.disconnect().await;
    assert!(peer.try_recv().is_none());

    let event = next_event(&mut closed).await;
    assert_eq!(*event, SessionEvent::Closed(CloseReason::Disconnected));
    assert!(matches!(
        session.subscribe_to_topics(&[1]).await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test]
async fn test_peer_close_ends_session() {
    let (session, mut peer) = joined_session(config()).await;
    let mut closed = session.events().subscribe(EventKind::Closed);

    peer.close();

    let event = next_event(&mut closed).await;
    assert_eq!(*event, SessionEvent::Closed(CloseReason::PeerClosed));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.get_status().await,
        Err(SessionError::NotConnected)
    ));

    // Nothing is sent on a connection the server already closed.
    session.disconnect().await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_transport_error_ends_session() {
    let (session, peer) = joined_session(config()).await;
    let mut closed = session.events().subscribe(EventKind::Closed);

    peer.fail("connection reset");

    let event = next_event(&mut closed).await;
    match &*event {
        SessionEvent::Closed(CloseReason::TransportError(message)) => {
            assert!(message.contains("connection reset"));
        }
        other => panic!("Expected transport error, got {:?}", other),
    }
    assert!(!session.is_running());
    session.disconnect().await;
}

#[tokio::test]
async fn test_unrecognized_events_are_delivered() {
    let (session, peer) = joined_session(config()).await;
    let mut unknown = session.events().subscribe(EventKind::Unrecognized);

    peer.send_text(push("presence_diff", json!({"joins": {}}))).unwrap();

    let event = next_event(&mut unknown).await;
    match event.inbound() {
        Some(InboundEvent::Unrecognized {
            topic,
            event,
            payload,
        }) => {
            assert_eq!(topic, LOBBY);
            assert_eq!(event, "presence_diff");
            assert_eq!(payload, &json!({"joins": {}}));
        }
        other => panic!("Expected Unrecognized, got {:?}", other),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_killmail_update_is_delivered() {
    let (session, peer) = joined_session(config()).await;
    let mut kills = session.events().subscribe(EventKind::KillmailUpdate);

    peer.send_text(push(
        "killmail_update",
        json!({
            "system_id": 30000142,
            "timestamp": "2024-05-01T12:00:00Z",
            "killmails": [{
                "killmail_id": 117000001,
                "victim": {"character_name": "Pilot", "ship_type_name": "Rifter"},
                "attackers": [{"character_id": 9}]
            }]
        }),
    ))
    .unwrap();

    let event = next_event(&mut kills).await;
    match event.inbound() {
        Some(InboundEvent::KillmailUpdate {
            system_id,
            killmails,
            timestamp,
        }) => {
            assert_eq!(*system_id, 30000142);
            assert_eq!(timestamp.as_deref(), Some("2024-05-01T12:00:00Z"));
            assert_eq!(killmails[0].killmail_id, Some(117000001));
        }
        other => panic!("Expected KillmailUpdate, got {:?}", other),
    }
    assert!(session.subscriptions().is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn test_status_snapshot() {
    let (session, mut peer) = joined_session(config()).await;
    let mut all = session.events().subscribe_all();

    session.subscribe_to_topics(&[30000142]).await.unwrap();
    let status = session.get_status().await.unwrap();

    assert_eq!(status.subscription_id.as_deref(), Some("sub-1"));
    assert_eq!(status.subscribed_systems, set(&[30000142]));
    assert!(status.connected);

    peer.recv_frame().await.unwrap();
    let request = peer.recv_frame().await.unwrap();
    assert_eq!(request.event, "get_status");
    let reference = request.reference.unwrap();
    peer.send_text(reply(
        reference.value(),
        "ok",
        json!({"subscribed_systems": [30000142]}),
    ))
    .unwrap();

    let event = next_event(&mut all).await;
    assert_eq!(event.kind(), EventKind::Reply);
    assert!(!session
        .pending_requests()
        .contains(&(reference, RequestKind::Status)));

    session.disconnect().await;
    assert!(!session.status().connected);
}

#[tokio::test]
async fn test_join_reply_is_dispatched() {
    let (transport, mut listener) = MemoryTransport::new();
    let session = ChannelSession::new(Arc::new(transport), config());
    let mut joins = session.events().subscribe(EventKind::JoinReply);

    let (joined, _peer) = tokio::join!(session.connect(), async {
        let mut peer = listener.accept().await.unwrap();
        peer.recv_frame().await.unwrap();
        peer.send_text(reply(1, "ok", json!({"subscription_id": "sub-9"})))
            .unwrap();
        peer
    });
    joined.unwrap();

    let event = next_event(&mut joins).await;
    assert_eq!(
        event.inbound(),
        Some(&InboundEvent::JoinReply {
            reference: Ref(1),
            status: ReplyStatus::Ok,
            response: json!({"subscription_id": "sub-9"}),
        })
    );

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat() {
    let (session, mut peer) =
        joined_session(config().with_heartbeat(Duration::from_secs(30))).await;

    let heartbeat = peer.recv_frame().await.unwrap();
    assert_eq!(heartbeat.topic, "phoenix");
    assert_eq!(heartbeat.event, "heartbeat");
    assert_eq!(heartbeat.reference, Some(Ref(2)));

    peer.send_text(
        json!({
            "topic": "phoenix",
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {}},
            "ref": 2,
        })
        .to_string(),
    )
    .unwrap();

    let next = peer.recv_frame().await.unwrap();
    assert_eq!(next.event, "heartbeat");
    assert_eq!(next.reference, Some(Ref(3)));

    session.disconnect().await;
}
