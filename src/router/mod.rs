//! L1 — the routed packet dispatcher's substrate.
//!
//! Forwards [`RouteLayerPacket`] frames between [`NodeId`]s across
//! direct or multi-hop paths, decrementing `ttl` at each hop and
//! dropping expired or looping frames. A frame not addressed to this
//! node is forwarded through a next-hop lookup plus an opaque
//! [`NeighborLink`], rather than dialed directly.

mod dedup;

use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::collections::HashMap;
use crate::error::{ErrorKind, Result, ResultWrappedExt};
use crate::identifiers::NodeId;

use dedup::RecentIds;

/// Wire frame forwarded by the router. Exact byte layout is given by
/// [`RouteLayerPacket::encode`] / [`RouteLayerPacket::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLayerPacket {
    pub from: NodeId,
    pub to: NodeId,
    pub ttl: u8,
    pub seq: u32,
    pub payload: PayloadKind,
}

/// Discriminated payload carried by a [`RouteLayerPacket`].
///
/// `P2PPacket` is the generic carrier for every typed packet the L2
/// dispatcher multiplexes (including `TransDatagram`, `HeartBeat`, and
/// `ShutdownMessage`) — see `WireCodec` in the `dispatcher` module.
/// `Ping`/`Pong`/`RoutingUpdate` are native L1 concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    P2PPacket { kind: u16, bytes: Bytes },
    Ping,
    Pong,
    RoutingUpdate { entries: Vec<(NodeId, NodeId)> },
}

const TAG_P2P_PACKET: u8 = 0;
const TAG_PING: u8 = 1;
const TAG_PONG: u8 = 2;
const TAG_ROUTING_UPDATE: u8 = 3;

impl RouteLayerPacket {
    /// Serializes this frame into its wire representation: `from`
    /// (16 bytes), `to` (16 bytes), `ttl` (1 byte), `seq` (4 bytes),
    /// then a payload-kind tag and its own length-prefixed body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + 16 + 1 + 4 + 1 + 8);
        buf.put_u128(self.from.into());
        buf.put_u128(self.to.into());
        buf.put_u8(self.ttl);
        buf.put_u32(self.seq);
        match &self.payload {
            PayloadKind::P2PPacket { kind, bytes } => {
                buf.put_u8(TAG_P2P_PACKET);
                buf.put_u16(*kind);
                buf.put_u32(bytes.len() as u32);
                buf.extend_from_slice(bytes);
            }
            PayloadKind::Ping => buf.put_u8(TAG_PING),
            PayloadKind::Pong => buf.put_u8(TAG_PONG),
            PayloadKind::RoutingUpdate { entries } => {
                buf.put_u8(TAG_ROUTING_UPDATE);
                buf.put_u32(entries.len() as u32);
                for (dest, next_hop) in entries {
                    buf.put_u128((*dest).into());
                    buf.put_u128((*next_hop).into());
                }
            }
        }
        buf.freeze()
    }

    /// Parses a frame out of `buf`, which must contain exactly one
    /// encoded frame (framing/length-prefixing onto a byte stream is
    /// the caller's concern — see `relay::server`).
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 + 16 + 1 + 4 + 1 {
            return Err("route layer packet too short").wrapped(ErrorKind::Codec);
        }
        let from = NodeId::from(buf.get_u128());
        let to = NodeId::from(buf.get_u128());
        let ttl = buf.get_u8();
        let seq = buf.get_u32();
        let tag = buf.get_u8();
        let payload = match tag {
            TAG_P2P_PACKET => {
                if buf.len() < 2 + 4 {
                    return Err("truncated p2p packet header").wrapped(ErrorKind::Codec);
                }
                let kind = buf.get_u16();
                let len = buf.get_u32() as usize;
                if buf.len() < len {
                    return Err("truncated p2p packet body").wrapped(ErrorKind::Codec);
                }
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                PayloadKind::P2PPacket { kind, bytes }
            }
            TAG_PING => PayloadKind::Ping,
            TAG_PONG => PayloadKind::Pong,
            TAG_ROUTING_UPDATE => {
                if buf.len() < 4 {
                    return Err("truncated routing update header").wrapped(ErrorKind::Codec);
                }
                let count = buf.get_u32() as usize;
                if buf.len() < count * 32 {
                    return Err("truncated routing update body").wrapped(ErrorKind::Codec);
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let dest = NodeId::from(buf.get_u128());
                    let next_hop = NodeId::from(buf.get_u128());
                    entries.push((dest, next_hop));
                }
                PayloadKind::RoutingUpdate { entries }
            }
            other => {
                return Err(format!("unknown payload tag {}", other)).wrapped(ErrorKind::Codec)
            }
        };
        Ok(RouteLayerPacket {
            from,
            to,
            ttl,
            seq,
            payload,
        })
    }
}

/// The (out-of-scope) external overlay network's per-neighbor
/// channel, reduced to the one capability the router needs: enqueue
/// an encoded frame for delivery.
pub trait NeighborLink: Send + Sync {
    fn send(&self, bytes: Bytes);
}

/// Hook invoked with frames addressed to the local node.
pub trait LocalDelivery: Send + Sync {
    fn deliver(&self, from: NodeId, payload: PayloadKind);
}

/// `NodeId -> next-hop NodeId` forwarding table.
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<NodeId, NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_route(&self, dest: NodeId, next_hop: NodeId) {
        self.routes.write().insert(dest, next_hop);
    }

    pub fn remove_route(&self, dest: NodeId) {
        self.routes.write().remove(&dest);
    }

    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        self.routes.read().get(&dest).copied()
    }
}

/// L1 forwarder. Given a routing table mapping destinations to direct
/// neighbors, forwards each [`RouteLayerPacket`] either up to the
/// local delivery hook (`to == self`) or onward to the next hop.
/// Unknown destinations and TTL-expired or duplicate frames are
/// dropped silently — forwarding is best-effort.
pub struct Router {
    local: NodeId,
    table: Arc<RoutingTable>,
    neighbors: RwLock<HashMap<NodeId, Arc<dyn NeighborLink>>>,
    recent: parking_lot::Mutex<RecentIds>,
    // A weak back-reference, not an owning one: the L2 dispatcher
    // installed here (see `RouterPacketDispatcher`'s `LocalDelivery`
    // impl) itself holds a strong `Arc<Router>`. Storing a strong
    // pointer back down here would close that into a reference cycle
    // that never gets freed.
    local_delivery: RwLock<Option<Weak<dyn LocalDelivery>>>,
}

impl Router {
    pub fn new(local: NodeId, table: Arc<RoutingTable>, dedup_capacity: usize) -> Self {
        Self {
            local,
            table,
            neighbors: RwLock::new(HashMap::new()),
            recent: parking_lot::Mutex::new(RecentIds::new(dedup_capacity)),
            local_delivery: RwLock::new(None),
        }
    }

    /// Installs (or replaces) the local-delivery hook invoked on frames
    /// addressed to this node. Stored as a weak reference: the caller
    /// keeps owning `delivery` (typically an `Arc<RouterPacketDispatcher>`
    /// that already owns an `Arc<Router>` pointing back here).
    pub fn set_local_delivery(&self, delivery: &Arc<dyn LocalDelivery>) {
        *self.local_delivery.write() = Some(Arc::downgrade(delivery));
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Registers (or replaces) the direct link to `neighbor`.
    pub fn set_neighbor(&self, neighbor: NodeId, link: Arc<dyn NeighborLink>) {
        self.neighbors.write().insert(neighbor, link);
    }

    pub fn remove_neighbor(&self, neighbor: NodeId) {
        self.neighbors.write().remove(&neighbor);
    }

    /// Applies the forwarding rules to an inbound frame, received
    /// over some neighbor's link: drop if TTL-expired or a recently
    /// seen duplicate, deliver locally if addressed to this node,
    /// otherwise forward to the next hop.
    pub fn handle_inbound(&self, packet: RouteLayerPacket) {
        if packet.ttl == 0 {
            trace!(from = %packet.from, to = %packet.to, "dropping ttl-expired frame");
            return;
        }

        if self.recent.lock().check_and_insert(packet.from, packet.seq) {
            trace!(from = %packet.from, seq = packet.seq, "dropping duplicate frame");
            return;
        }

        let mut packet = packet;
        packet.ttl -= 1;

        if packet.to == self.local {
            match self.local_delivery.read().as_ref().and_then(Weak::upgrade) {
                Some(delivery) => delivery.deliver(packet.from, packet.payload),
                None => warn!(from = %packet.from, "no local delivery hook installed, dropping frame"),
            }
            return;
        }

        match self.table.next_hop(packet.to) {
            Some(next_hop) => self.forward_to(next_hop, &packet),
            None => {
                debug!(to = %packet.to, "no route, dropping frame");
            }
        }
    }

    /// Originates a fresh frame locally (used by the L2 dispatcher),
    /// addressing it either directly (if `to` is a known neighbor) or
    /// via the routing table's next hop.
    pub fn send(&self, to: NodeId, seq: u32, ttl: u8, payload: PayloadKind) {
        let packet = RouteLayerPacket {
            from: self.local,
            to,
            ttl,
            seq,
            payload,
        };
        if self.neighbors.read().contains_key(&to) {
            self.forward_to(to, &packet);
            return;
        }
        match self.table.next_hop(to) {
            Some(next_hop) => self.forward_to(next_hop, &packet),
            None => {
                warn!(to = %to, "no route for locally originated frame, dropping");
            }
        }
    }

    fn forward_to(&self, next_hop: NodeId, packet: &RouteLayerPacket) {
        let link = self.neighbors.read().get(&next_hop).cloned();
        match link {
            Some(link) => link.send(packet.encode()),
            None => {
                debug!(next_hop = %next_hop, "next hop has no live link, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingLink {
        received: Arc<Mutex<Vec<Bytes>>>,
    }

    impl NeighborLink for RecordingLink {
        fn send(&self, bytes: Bytes) {
            self.received.lock().unwrap().push(bytes);
        }
    }

    struct RecordingDelivery {
        received: Arc<Mutex<Vec<(NodeId, PayloadKind)>>>,
    }

    impl LocalDelivery for RecordingDelivery {
        fn deliver(&self, from: NodeId, payload: PayloadKind) {
            self.received.lock().unwrap().push((from, payload));
        }
    }

    fn router_with_delivery(
        table: Arc<RoutingTable>,
        delivery: Arc<dyn LocalDelivery>,
    ) -> Router {
        let router = Router::new(NodeId::from(1), table, 16);
        router.set_local_delivery(&delivery);
        router
    }

    #[test]
    fn round_trip_encode_decode_p2p_packet() {
        let packet = RouteLayerPacket {
            from: NodeId::from(1),
            to: NodeId::from(2),
            ttl: 16,
            seq: 42,
            payload: PayloadKind::P2PPacket {
                kind: 7,
                bytes: Bytes::from_static(b"hello"),
            },
        };
        let encoded = packet.encode();
        let decoded = RouteLayerPacket::decode(&encoded).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn round_trip_encode_decode_routing_update() {
        let packet = RouteLayerPacket {
            from: NodeId::from(9),
            to: NodeId::from(0),
            ttl: 1,
            seq: 1,
            payload: PayloadKind::RoutingUpdate {
                entries: vec![(NodeId::from(1), NodeId::from(2))],
            },
        };
        let decoded = RouteLayerPacket::decode(&packet.encode()).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn ttl_zero_is_dropped() {
        let table = Arc::new(RoutingTable::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let delivery = Arc::new(RecordingDelivery {
            received: received.clone(),
        });
        let router = router_with_delivery(table, delivery);

        router.handle_inbound(RouteLayerPacket {
            from: NodeId::from(2),
            to: NodeId::from(1),
            ttl: 0,
            seq: 1,
            payload: PayloadKind::Ping,
        });

        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn local_delivery_decrements_ttl_is_observed_before_delivery() {
        let table = Arc::new(RoutingTable::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let delivery = Arc::new(RecordingDelivery {
            received: received.clone(),
        });
        let router = router_with_delivery(table, delivery);

        router.handle_inbound(RouteLayerPacket {
            from: NodeId::from(2),
            to: NodeId::from(1),
            ttl: 5,
            seq: 1,
            payload: PayloadKind::Ping,
        });

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, NodeId::from(2));
    }

    #[test]
    fn duplicate_frame_is_dropped() {
        let table = Arc::new(RoutingTable::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let delivery = Arc::new(RecordingDelivery {
            received: received.clone(),
        });
        let router = router_with_delivery(table, delivery);

        let make = || RouteLayerPacket {
            from: NodeId::from(2),
            to: NodeId::from(1),
            ttl: 5,
            seq: 7,
            payload: PayloadKind::Ping,
        };
        router.handle_inbound(make());
        router.handle_inbound(make());

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_destination_is_dropped_not_errored() {
        let table = Arc::new(RoutingTable::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let delivery = Arc::new(RecordingDelivery {
            received: received.clone(),
        });
        let router = router_with_delivery(table, delivery);

        router.handle_inbound(RouteLayerPacket {
            from: NodeId::from(2),
            to: NodeId::from(99),
            ttl: 5,
            seq: 1,
            payload: PayloadKind::Ping,
        });

        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn forwards_to_next_hop_with_decremented_ttl() {
        let table = Arc::new(RoutingTable::new());
        table.set_route(NodeId::from(99), NodeId::from(3));

        let received = Arc::new(Mutex::new(Vec::new()));
        let delivery = Arc::new(RecordingDelivery {
            received: Arc::new(Mutex::new(Vec::new())),
        });
        let router = router_with_delivery(table, delivery);

        let link_received = Arc::new(Mutex::new(Vec::new()));
        router.set_neighbor(
            NodeId::from(3),
            Arc::new(RecordingLink {
                received: link_received.clone(),
            }),
        );

        router.handle_inbound(RouteLayerPacket {
            from: NodeId::from(2),
            to: NodeId::from(99),
            ttl: 5,
            seq: 1,
            payload: PayloadKind::Ping,
        });

        let forwarded = link_received.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        let decoded = RouteLayerPacket::decode(&forwarded[0]).unwrap();
        assert_eq!(decoded.ttl, 4);
        let _ = received;
    }
}
