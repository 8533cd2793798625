//! L3 — a reliable, ordered-enough, single-peer connection built on
//! top of the L2 dispatcher's typed packets.
//!
//! Each connection is a per-peer actor: one task owns all mutable
//! window and retransmission state for the link, driven by an mpsc
//! command channel, and a three-way connect/accept handshake brings
//! a new connection up on both sides before any data flows.

use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use linked_hash_map::LinkedHashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::async_runtime::CancellationToken;
use crate::collections::HashMap;
use crate::config::{
    BUFFER_LENGTH, DUP_INBOUND_CAPACITY, HANDSHAKE_TIMEOUT, RETRANSMIT_IDLE_TIMEOUT,
    RETRANSMIT_POLL_INTERVAL,
};
use crate::dispatcher::{DispatchContext, RouterPacketDispatcher, WireCodec};
use crate::error::{Error, ErrorKind, Result};
use crate::identifiers::NodeId;

/// Depth of a connection's command queue. Does not bound the sliding
/// window itself (that is `BUFFER_LENGTH`); it only bounds how many
/// not-yet-processed commands can sit ahead of the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Bitset of `TransDatagram` control flags, plus the three named
/// composites used by the handshake. Hand-rolled rather than pulled
/// from the `bitflags` crate since the set is tiny and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const SYN: Flags = Flags(0b0001);
    pub const ACK: Flags = Flags(0b0010);
    pub const CON: Flags = Flags(0b0100);
    pub const FIN: Flags = Flags(0b1000);

    /// First handshake leg: initiator -> responder.
    pub const FIRST_HAND_SHAKE_FLAG: Flags = Flags(Self::SYN.0 | Self::CON.0);
    /// Second handshake leg: responder -> initiator.
    pub const SECOND_HAND_SHAKE_FLAG: Flags = Flags(Self::SYN.0 | Self::ACK.0 | Self::CON.0);
    /// Third handshake leg: initiator -> responder, informational only.
    pub const THIRD_HAND_SHAKE_FLAG: Flags = Flags(Self::ACK.0 | Self::CON.0);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// The single typed packet exchanged by a `P2PConnection`: a
/// handshake/control/data frame carrying an optional payload. Wire
/// layout: one flag byte, a big-endian `u16` sequence/ack number, a
/// big-endian `u32` payload length (`0` for "no payload"), then the
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransDatagram {
    pub flag: Flags,
    pub syn_or_ack: u16,
    pub payload: Option<Bytes>,
}

impl WireCodec for TransDatagram {
    const KIND: u16 = 1;

    fn encode(&self) -> Bytes {
        let body_len = self.payload.as_ref().map(Bytes::len).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(1 + 2 + 4 + body_len);
        buf.put_u8(self.flag.bits());
        buf.put_u16(self.syn_or_ack);
        buf.put_u32(body_len as u32);
        if let Some(payload) = &self.payload {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 1 + 2 + 4 {
            return Err(Error::simple(ErrorKind::Codec));
        }
        let mut buf = bytes;
        let flag = Flags::from_bits(buf.get_u8());
        let syn_or_ack = buf.get_u16();
        let len = buf.get_u32() as usize;
        if buf.len() < len {
            return Err(Error::simple(ErrorKind::Codec));
        }
        let payload = if len == 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(&buf[..len]))
        };
        Ok(TransDatagram {
            flag,
            syn_or_ack,
            payload,
        })
    }
}

/// Hook invoked with application payloads delivered by an established
/// connection, one call per distinct (non-duplicate) inbound segment.
pub trait InboundDelivery: Send + Sync {
    fn deliver(&self, from: NodeId, payload: Bytes);
}

enum Command {
    AppSend(Bytes, oneshot::Sender<Result<()>>),
    Inbound(TransDatagram),
    Tick,
}

/// A lightweight, cloneable reference to a running connection actor.
#[derive(Clone)]
pub struct P2PConnectionHandle {
    peer: NodeId,
    commands: mpsc::Sender<Command>,
}

impl P2PConnectionHandle {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Queues `payload` for reliable delivery. Suspends if the send
    /// window is full (the chosen back-pressure policy — see
    /// `DESIGN.md`), resuming once a slot frees.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::AppSend(payload, tx))
            .await
            .map_err(|_| Error::simple(ErrorKind::Connection))?;
        rx.await.map_err(|_| Error::simple(ErrorKind::Connection))?
    }

    /// Feeds one inbound `TransDatagram` addressed to this connection.
    /// Non-blocking; drops the frame (with a warning) if the actor's
    /// queue is saturated rather than exert back-pressure on the
    /// dispatcher's inbound path.
    pub fn deliver_inbound(&self, datagram: TransDatagram) {
        if self.commands.try_send(Command::Inbound(datagram)).is_err() {
            warn!(peer = %self.peer, "connection command queue saturated, dropping inbound frame");
        }
    }
}

/// `NodeId -> P2PConnectionHandle` directory, shared by
/// `ConnectionManager` and anyone dispatching inbound frames by
/// sender id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<NodeId, P2PConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: NodeId) -> Option<P2PConnectionHandle> {
        self.connections.read().get(&peer).cloned()
    }

    pub fn insert(&self, handle: P2PConnectionHandle) {
        self.connections.write().insert(handle.peer(), handle);
    }

    pub fn remove(&self, peer: NodeId) {
        self.connections.write().remove(&peer);
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns every piece of mutable per-connection state (`send_buffer_ack`,
/// `send_pointer`, `ack_pointer`, `last_ack_time`) behind a single
/// task, so no lock is needed to serialize access to them.
///
/// `send_buffer_ack[i] == true` means slot `i` is not currently
/// awaiting an ACK (either never allocated, or its ACK already
/// arrived); `false` means a SYN is outstanding on that slot. The
/// unacked window is always the ring segment `[ack_pointer,
/// send_pointer)` modulo `BUFFER_LENGTH`.
struct ConnectionActor {
    peer: NodeId,
    dispatcher: Arc<RouterPacketDispatcher>,
    registry: Arc<ConnectionRegistry>,
    inbound_delivery: Arc<dyn InboundDelivery>,
    commands: mpsc::Receiver<Command>,
    is_connected: bool,
    send_buffer_ack: Vec<bool>,
    pending_payload: Vec<Option<Bytes>>,
    send_pointer: u16,
    ack_pointer: u16,
    queued_sends: VecDeque<(Bytes, oneshot::Sender<Result<()>>)>,
    dup_inbound: LinkedHashMap<u16, ()>,
    last_ack_time: Instant,
    should_close: bool,
}

impl ConnectionActor {
    fn new(
        peer: NodeId,
        dispatcher: Arc<RouterPacketDispatcher>,
        registry: Arc<ConnectionRegistry>,
        inbound_delivery: Arc<dyn InboundDelivery>,
        commands: mpsc::Receiver<Command>,
        is_connected: bool,
    ) -> Self {
        Self {
            peer,
            dispatcher,
            registry,
            inbound_delivery,
            commands,
            is_connected,
            send_buffer_ack: vec![true; BUFFER_LENGTH as usize],
            pending_payload: vec![None; BUFFER_LENGTH as usize],
            send_pointer: 0,
            ack_pointer: 0,
            queued_sends: VecDeque::new(),
            dup_inbound: LinkedHashMap::new(),
            last_ack_time: Instant::now(),
            should_close: false,
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(RETRANSMIT_POLL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => self.on_command(Command::Tick),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
            }
            if self.should_close {
                break;
            }
        }
        self.registry.remove(self.peer);
        trace!(peer = %self.peer, "connection actor stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::AppSend(bytes, done) => self.on_app_send(bytes, done),
            Command::Inbound(datagram) => self.on_inbound(datagram),
            Command::Tick => self.on_tick(),
        }
    }

    fn on_app_send(&mut self, bytes: Bytes, done: oneshot::Sender<Result<()>>) {
        if !self.is_connected {
            let _ = done.send(Err(Error::simple(ErrorKind::Connection)));
            return;
        }
        if self.window_is_full() {
            self.queued_sends.push_back((bytes, done));
            return;
        }
        self.transmit_new(bytes, done);
    }

    /// `true` once the ring segment `[ack_pointer, send_pointer)`
    /// would wrap onto `ack_pointer` if one more slot were allocated —
    /// the window is closed for new sends until an ACK frees a slot.
    fn window_is_full(&self) -> bool {
        (self.send_pointer + 1) % BUFFER_LENGTH == self.ack_pointer
    }

    /// Allocates `send_pointer` as this payload's slot, retains the
    /// payload for retransmission, emits the `SYN` datagram, and
    /// advances `send_pointer` modulo `BUFFER_LENGTH`.
    fn transmit_new(&mut self, bytes: Bytes, done: oneshot::Sender<Result<()>>) {
        let slot = self.send_pointer;
        self.send_buffer_ack[slot as usize] = false;
        self.pending_payload[slot as usize] = Some(bytes.clone());
        self.send_pointer = (self.send_pointer + 1) % BUFFER_LENGTH;

        self.dispatcher.send(
            self.peer,
            &TransDatagram {
                flag: Flags::SYN,
                syn_or_ack: slot,
                payload: Some(bytes),
            },
        );
        let _ = done.send(Ok(()));
    }

    fn try_dequeue_sends(&mut self) {
        while !self.window_is_full() {
            match self.queued_sends.pop_front() {
                Some((bytes, done)) => self.transmit_new(bytes, done),
                None => break,
            }
        }
    }

    fn on_inbound(&mut self, datagram: TransDatagram) {
        if datagram.flag == Flags::FIRST_HAND_SHAKE_FLAG {
            self.on_repeated_first_handshake(datagram);
            return;
        }
        if datagram.flag.contains(Flags::FIN) {
            self.on_fin();
            return;
        }
        if datagram.flag.contains(Flags::SYN) {
            self.on_data(datagram.syn_or_ack, datagram.payload);
            return;
        }
        if datagram.flag.contains(Flags::ACK) {
            self.on_ack(datagram.syn_or_ack);
        }
    }

    /// A first-handshake frame arriving on an already-established
    /// connection means our prior `SYN|ACK` reply was lost.
    /// Re-acknowledge without disturbing any existing window state.
    fn on_repeated_first_handshake(&mut self, datagram: TransDatagram) {
        if !self.is_connected {
            return;
        }
        debug!(peer = %self.peer, "re-acknowledging duplicate handshake SYN");
        self.dispatcher.send(
            self.peer,
            &TransDatagram {
                flag: Flags::SECOND_HAND_SHAKE_FLAG,
                syn_or_ack: datagram.syn_or_ack.wrapping_add(1),
                payload: None,
            },
        );
    }

    /// `syn_or_ack` outside `[0, BUFFER_LENGTH)` cannot name a real
    /// slot and is ignored outright.
    fn on_ack(&mut self, seq: u16) {
        if seq >= BUFFER_LENGTH {
            return;
        }
        let seq_idx = seq as usize;
        // idempotent: re-marking an already-true bit, or one outside
        // the current window, is a no-op by construction.
        self.send_buffer_ack[seq_idx] = true;

        if seq == self.ack_pointer {
            self.last_ack_time = Instant::now();
            while self.send_buffer_ack[self.ack_pointer as usize] && self.ack_pointer != self.send_pointer {
                self.pending_payload[self.ack_pointer as usize] = None;
                self.send_buffer_ack[self.ack_pointer as usize] = false;
                self.ack_pointer = (self.ack_pointer + 1) % BUFFER_LENGTH;
            }
            self.try_dequeue_sends();
        }
    }

    fn on_data(&mut self, seq: u16, payload: Option<Bytes>) {
        let is_duplicate = self.dup_inbound.contains_key(&seq);
        if !is_duplicate {
            if self.dup_inbound.len() >= DUP_INBOUND_CAPACITY {
                self.dup_inbound.pop_front();
            }
            self.dup_inbound.insert(seq, ());
            if let Some(payload) = payload {
                self.inbound_delivery.deliver(self.peer, payload);
            }
        } else {
            self.dup_inbound.get_refresh(&seq);
            trace!(peer = %self.peer, seq, "dropping duplicate data segment, re-acking");
        }
        self.dispatcher.send(
            self.peer,
            &TransDatagram {
                flag: Flags::ACK,
                syn_or_ack: seq,
                payload: None,
            },
        );
    }

    fn on_fin(&mut self) {
        self.is_connected = false;
        self.should_close = true;
        while let Some((_, done)) = self.queued_sends.pop_front() {
            let _ = done.send(Err(Error::simple(ErrorKind::Connection)));
        }
    }

    /// `need_resend := ack_pointer != send_pointer && now - last_ack_time
    /// > TIMEOUT`. On fire, resends every still-pending slot in
    /// `[ack_pointer, send_pointer)` with its retained original
    /// payload and resets `last_ack_time`.
    fn on_tick(&mut self) {
        if self.ack_pointer == self.send_pointer {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_ack_time) < RETRANSMIT_IDLE_TIMEOUT {
            return;
        }

        let mut slot = self.ack_pointer;
        while slot != self.send_pointer {
            let idx = slot as usize;
            if !self.send_buffer_ack[idx] {
                if let Some(bytes) = self.pending_payload[idx].clone() {
                    trace!(peer = %self.peer, slot, "retransmitting unacked segment");
                    self.dispatcher.send(
                        self.peer,
                        &TransDatagram {
                            flag: Flags::SYN,
                            syn_or_ack: slot,
                            payload: Some(bytes),
                        },
                    );
                }
            }
            slot = (slot + 1) % BUFFER_LENGTH;
        }
        self.last_ack_time = now;
    }
}

/// Owns the dispatcher subscription that fans inbound `TransDatagram`s
/// out to the right `ConnectionActor`, and originates new connections
/// on request. One `ConnectionManager` per local node.
pub struct ConnectionManager {
    dispatcher: Arc<RouterPacketDispatcher>,
    registry: Arc<ConnectionRegistry>,
    inbound_delivery: Arc<dyn InboundDelivery>,
}

impl ConnectionManager {
    pub fn new(
        dispatcher: Arc<RouterPacketDispatcher>,
        inbound_delivery: Arc<dyn InboundDelivery>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            dispatcher,
            registry: Arc::new(ConnectionRegistry::new()),
            inbound_delivery,
        });
        manager.install_dispatcher_handler();
        manager
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn install_dispatcher_handler(self: &Arc<Self>) {
        let manager = self.clone();
        self.dispatcher
            .on_receive::<TransDatagram, _>(move |datagram, ctx: DispatchContext| {
                manager.route_inbound(ctx.from, datagram);
            });
    }

    fn route_inbound(self: &Arc<Self>, from: NodeId, datagram: TransDatagram) {
        if let Some(handle) = self.registry.get(from) {
            handle.deliver_inbound(datagram);
            return;
        }
        if datagram.flag == Flags::FIRST_HAND_SHAKE_FLAG {
            self.accept(from, datagram);
        } else {
            trace!(from = %from, "inbound frame for unknown connection, dropping");
        }
    }

    /// Responder side of the handshake: replies `SYN|ACK` and spawns
    /// the actor optimistically connected, per the decided handshake
    /// asymmetry (an established connection is assumed the moment the
    /// first SYN is seen, not after the third leg).
    fn accept(self: &Arc<Self>, peer: NodeId, syn: TransDatagram) -> P2PConnectionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = P2PConnectionHandle {
            peer,
            commands: tx,
        };
        self.registry.insert(handle.clone());

        self.dispatcher.send(
            peer,
            &TransDatagram {
                flag: Flags::SECOND_HAND_SHAKE_FLAG,
                syn_or_ack: syn.syn_or_ack.wrapping_add(1),
                payload: None,
            },
        );

        let actor = ConnectionActor::new(
            peer,
            self.dispatcher.clone(),
            self.registry.clone(),
            self.inbound_delivery.clone(),
            rx,
            true,
        );
        crate::async_runtime::spawn(actor.run());
        handle
    }

    /// Initiator side of the handshake. Suspends until the `SYN|ACK`
    /// reply arrives, `HANDSHAKE_TIMEOUT` elapses, or `cancel` fires.
    pub async fn connect(
        self: &Arc<Self>,
        peer: NodeId,
        cancel: CancellationToken,
    ) -> Result<P2PConnectionHandle> {
        if let Some(existing) = self.registry.get(peer) {
            return Ok(existing);
        }

        // First leg carries 0, the expected second leg carries 1, the
        // third leg carries 2.
        let syn = TransDatagram {
            flag: Flags::FIRST_HAND_SHAKE_FLAG,
            syn_or_ack: 0,
            payload: None,
        };

        self.dispatcher
            .send_and_listen_once::<TransDatagram, TransDatagram>(
                peer,
                &syn,
                move |resp: &TransDatagram| {
                    resp.flag == Flags::SECOND_HAND_SHAKE_FLAG && resp.syn_or_ack == 1
                },
                Some(HANDSHAKE_TIMEOUT),
                cancel,
            )
            .await?;

        // third, informational leg
        self.dispatcher.send(
            peer,
            &TransDatagram {
                flag: Flags::THIRD_HAND_SHAKE_FLAG,
                syn_or_ack: 2,
                payload: None,
            },
        );

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = P2PConnectionHandle {
            peer,
            commands: tx,
        };
        self.registry.insert(handle.clone());

        let actor = ConnectionActor::new(
            peer,
            self.dispatcher.clone(),
            self.registry.clone(),
            self.inbound_delivery.clone(),
            rx,
            true,
        );
        crate::async_runtime::spawn(actor.run());

        Ok(handle)
    }
}
