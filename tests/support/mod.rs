//! Shared in-process test harness: two (or more) nodes wired together
//! through direct `NeighborLink`s that call straight into each other's
//! `Router`, skipping sockets entirely. Good enough to drive the full
//! L1/L2/L3 stack end to end deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use transit_core::connection::{ConnectionManager, Flags, InboundDelivery, TransDatagram};
use transit_core::dispatcher::{RouterPacketDispatcher, WireCodec};
use transit_core::identifiers::NodeId;
use transit_core::router::{NeighborLink, PayloadKind, RouteLayerPacket, Router, RoutingTable};

const DEDUP_CAPACITY: usize = 4096;

/// A direct link to a peer's router. Every frame is handed straight to
/// `peer_router.handle_inbound`, synchronously, with no socket and no
/// task hop — the peer's own task only actually reacts to it once the
/// runtime schedules that peer's connection actor.
pub struct DirectLink {
    peer_router: Arc<Router>,
}

impl NeighborLink for DirectLink {
    fn send(&self, bytes: Bytes) {
        if let Ok(packet) = RouteLayerPacket::decode(&bytes) {
            self.peer_router.handle_inbound(packet);
        }
    }
}

/// Like [`DirectLink`], but drops a data `SYN` the first time its slot
/// number is forwarded, letting the retransmission resend through.
/// Handshake and ACK frames are never dropped — only a bare `SYN` (no
/// `CON`) identifies an L3 data segment (see `connection::Flags`).
pub struct FirstAttemptDropLink {
    peer_router: Arc<Router>,
    first_seen_slots: Mutex<HashSet<u16>>,
    drop_slot: Box<dyn Fn(u16) -> bool + Send + Sync>,
}

impl FirstAttemptDropLink {
    pub fn new(peer_router: Arc<Router>, drop_slot: impl Fn(u16) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            peer_router,
            first_seen_slots: Mutex::new(HashSet::new()),
            drop_slot: Box::new(drop_slot),
        })
    }
}

impl NeighborLink for FirstAttemptDropLink {
    fn send(&self, bytes: Bytes) {
        let Ok(packet) = RouteLayerPacket::decode(&bytes) else {
            return;
        };
        if let PayloadKind::P2PPacket { kind, bytes: body } = &packet.payload {
            if *kind == TransDatagram::KIND {
                if let Ok(datagram) = TransDatagram::decode(body) {
                    if datagram.flag == Flags::SYN {
                        let first_attempt = self.first_seen_slots.lock().unwrap().insert(datagram.syn_or_ack);
                        if first_attempt && (self.drop_slot)(datagram.syn_or_ack) {
                            return;
                        }
                    }
                }
            }
        }
        self.peer_router.handle_inbound(packet);
    }
}

/// A link that never delivers anything, simulating an unreachable
/// neighbor for handshake-timeout scenarios.
pub struct BlackHoleLink;

impl NeighborLink for BlackHoleLink {
    fn send(&self, _bytes: Bytes) {}
}

/// Collects every payload an established connection hands up to the
/// application.
#[derive(Clone, Default)]
pub struct CollectingInbound {
    pub received: Arc<Mutex<Vec<Bytes>>>,
}

impl InboundDelivery for CollectingInbound {
    fn deliver(&self, _from: NodeId, payload: Bytes) {
        self.received.lock().unwrap().push(payload);
    }
}

/// One simulated node: its own router, L2 dispatcher, and connection
/// manager, wired together the same way a real binary would wire them.
pub struct Node {
    pub id: NodeId,
    pub router: Arc<Router>,
    pub manager: Arc<ConnectionManager>,
    pub inbound: CollectingInbound,
    pub seq: AtomicUsize,
}

impl Node {
    pub fn new(id: u128) -> Arc<Self> {
        let node_id = NodeId::from(id);
        let table = Arc::new(RoutingTable::new());
        let router = Arc::new(Router::new(node_id, table, DEDUP_CAPACITY));
        let dispatcher = RouterPacketDispatcher::new(router.clone());
        let inbound = CollectingInbound::default();
        let manager = ConnectionManager::new(dispatcher, Arc::new(inbound.clone()));
        Arc::new(Self {
            id: node_id,
            router,
            manager,
            inbound,
            seq: AtomicUsize::new(0),
        })
    }

    pub fn received_count(&self) -> usize {
        self.inbound.received.lock().unwrap().len()
    }

    pub fn received_payloads(&self) -> Vec<Bytes> {
        self.inbound.received.lock().unwrap().clone()
    }

    /// A small distinguishable payload, unique per call on this node.
    pub fn next_payload(&self) -> Bytes {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        Bytes::from(format!("payload-{n}").into_bytes())
    }
}

/// Wires `a` and `b` together with lossless direct links in both
/// directions.
pub fn link(a: &Node, b: &Node) {
    a.router.set_neighbor(b.id, Arc::new(DirectLink { peer_router: b.router.clone() }));
    b.router.set_neighbor(a.id, Arc::new(DirectLink { peer_router: a.router.clone() }));
}

/// Wires `a -> b` through a link that drops the first attempt at any
/// slot `drop_slot` accepts, and `b -> a` lossless.
pub fn link_with_loss(a: &Node, b: &Node, drop_slot: impl Fn(u16) -> bool + Send + Sync + 'static) {
    a.router.set_neighbor(b.id, FirstAttemptDropLink::new(b.router.clone(), drop_slot));
    b.router.set_neighbor(a.id, Arc::new(DirectLink { peer_router: a.router.clone() }));
}

/// Points `a`'s route to `dest` at a neighbor that swallows everything,
/// simulating an unreachable peer.
pub fn black_hole(a: &Node, dest: NodeId) {
    a.router.set_neighbor(dest, Arc::new(BlackHoleLink));
}

/// Polls `condition` until it's true or `deadline` elapses, sleeping
/// briefly between checks rather than busy-spinning the executor.
pub async fn wait_until(deadline: std::time::Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true before the deadline");
}
