//! End-to-end relay session watchdog scenarios, driven through the
//! real wire frames a TCP session's reader would decode (rather than
//! calling `RelaySessionManager::on_heartbeat` with a bare `NodeId`),
//! but against a fake in-process [`RelaySession`] instead of a socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use transit_core::async_runtime::CancellationToken;
use transit_core::dispatcher::WireCodec;
use transit_core::identifiers::{NodeId, SessionId};
use transit_core::relay::{HeartBeat, RelaySession, RelaySessionManager, ShutdownMessage};
use transit_core::router::{PayloadKind, RouteLayerPacket};

struct FakeSession {
    id: SessionId,
    closed: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Bytes>>>,
}

impl FakeSession {
    fn new(id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

impl RelaySession for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, bytes: Bytes) {
        self.sent.lock().unwrap().push(bytes);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Encodes a `HeartBeat` the same way a real client's dispatcher would
/// before handing it to the relay.
fn heartbeat_frame(from: NodeId, to: NodeId) -> RouteLayerPacket {
    RouteLayerPacket {
        from,
        to,
        ttl: 1,
        seq: 0,
        payload: PayloadKind::P2PPacket {
            kind: HeartBeat::KIND,
            bytes: HeartBeat.encode(),
        },
    }
}

#[tokio::test(start_paused = true)]
async fn silent_session_is_evicted_with_a_shutdown_message_after_the_watchdog_timeout() {
    let local = NodeId::from(0);
    let client = NodeId::from(7);
    let manager = RelaySessionManager::new(local, Duration::from_secs(10));

    let id = SessionId::from(1);
    let session = FakeSession::new(id);
    manager.attach(id, session.clone());

    // Two heartbeats two seconds apart, matching the assumed client
    // period, then silence.
    let frame = heartbeat_frame(client, local);
    manager.on_heartbeat(id, frame.from).unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    manager.on_heartbeat(id, frame.from).unwrap();

    let cancel = CancellationToken::new();
    let watchdog = manager.spawn_watchdog(cancel.clone());

    // Nowhere near the timeout yet.
    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    assert!(manager.is_attached(id));

    // Past the 10s timeout counted from the *second* heartbeat.
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;

    assert!(!manager.is_attached(id));
    assert!(session.closed.load(Ordering::SeqCst));

    let sent = session.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let shutdown = RouteLayerPacket::decode(&sent[0]).unwrap();
    assert_eq!(shutdown.to, client);
    assert!(matches!(
        shutdown.payload,
        PayloadKind::P2PPacket { kind, .. } if kind == ShutdownMessage::KIND
    ));

    cancel.cancel();
    let _ = watchdog.await;

    // Re-attaching the same id after eviction must succeed cleanly.
    let reattached = FakeSession::new(id);
    manager.attach(id, reattached.clone());
    assert!(manager.is_attached(id));
    manager.on_heartbeat(id, client).unwrap();
}

#[test]
fn heartbeat_on_a_session_never_attached_is_rejected_and_caller_can_shut_it_down() {
    let local = NodeId::from(0);
    let manager = RelaySessionManager::with_default_timeout(local);

    let id = SessionId::from(42);
    let rogue = FakeSession::new(id);
    let frame = heartbeat_frame(NodeId::from(5), local);

    let result = manager.on_heartbeat(id, frame.from);
    assert!(result.is_err());
    assert!(!manager.is_attached(id));

    // The rejecting caller (the relay's reader loop, in production)
    // has no session entry to evict through, so it sends the shutdown
    // itself via the exposed best-effort helper.
    let rogue_dyn: Arc<dyn RelaySession> = rogue.clone();
    manager.send_shutdown(&rogue_dyn, frame.from);
    let sent = rogue.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let shutdown = RouteLayerPacket::decode(&sent[0]).unwrap();
    assert_eq!(shutdown.to, NodeId::from(5));
    assert!(matches!(
        shutdown.payload,
        PayloadKind::P2PPacket { kind, .. } if kind == ShutdownMessage::KIND
    ));
}
