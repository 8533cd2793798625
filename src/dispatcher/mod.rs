//! L2 — multiplexes typed packets on top of the [`Router`], and
//! correlates one-shot request/response exchanges.
//!
//! Request/response correlation is built on the `oneshot` crate rather
//! than a raw mpsc channel, since `send_and_listen_once` only ever
//! needs exactly one reply.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::async_runtime::CancellationToken;
use crate::collections::HashMap;
use crate::config::DEFAULT_TTL;
use crate::error::{Error, ErrorKind, Result};
use crate::identifiers::{NodeId, SessionId};
use crate::router::{LocalDelivery, PayloadKind, Router};

/// A type multiplexed by the dispatcher must know its own wire-kind
/// discriminant and how to encode/decode itself, so packet types can
/// be told apart on the wire.
pub trait WireCodec: Sized + Send + Sync + 'static {
    const KIND: u16;

    fn encode(&self) -> Bytes;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Context handed to every inbound handler: who sent the frame, and
/// (on the relay) which session it arrived on — needed to check whether
/// a heartbeat is arriving from the control plane.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext {
    pub from: NodeId,
    pub session: Option<SessionId>,
}

type Handler = Box<dyn Fn(Bytes, DispatchContext) + Send + Sync>;

/// A single pending `send_and_listen_once` subscription for one wire
/// kind. `try_consume` decodes the raw bytes as the waiter's own
/// `Resp` type, tests the caller's predicate, and — on a match —
/// fulfills the oneshot and reports `true`.
struct Waiter {
    id: u64,
    try_consume: Box<dyn FnMut(&Bytes) -> bool + Send>,
}

/// Multiplexes typed packets over a [`Router`]. See the module docs
/// for the contract.
pub struct RouterPacketDispatcher {
    router: Arc<Router>,
    next_seq: AtomicU32,
    next_waiter_id: AtomicU64,
    handlers: RwLock<HashMap<u16, Handler>>,
    waiters: Mutex<HashMap<u16, Vec<Waiter>>>,
}

impl RouterPacketDispatcher {
    /// Builds a dispatcher on top of `router` and installs itself as
    /// the router's local-delivery hook (a weak back-reference — see
    /// `Router::set_local_delivery`), so callers never have to
    /// remember to wire the two layers together by hand.
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            router: router.clone(),
            next_seq: AtomicU32::new(1),
            next_waiter_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        });
        let local_delivery: Arc<dyn LocalDelivery> = dispatcher.clone();
        router.set_local_delivery(&local_delivery);
        dispatcher
    }

    fn fresh_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Fire-and-forget send. Never suspends.
    pub fn send<T: WireCodec>(&self, to: NodeId, packet: &T) {
        let seq = self.fresh_seq();
        self.router.send(
            to,
            seq,
            DEFAULT_TTL,
            PayloadKind::P2PPacket {
                kind: T::KIND,
                bytes: packet.encode(),
            },
        );
    }

    /// Sends `req` and suspends until the first inbound `Resp` from
    /// any peer satisfying `predicate` arrives, `deadline` elapses, or
    /// `cancel` fires. The subscription is removed on every terminal
    /// outcome.
    pub async fn send_and_listen_once<Req, Resp>(
        &self,
        to: NodeId,
        req: &Req,
        predicate: impl Fn(&Resp) -> bool + Send + 'static,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: WireCodec,
        Resp: WireCodec,
    {
        let id = self.next_waiter_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, rx) = oneshot::channel::<Resp>();
        let mut tx = Some(tx);
        let try_consume: Box<dyn FnMut(&Bytes) -> bool + Send> = Box::new(move |bytes: &Bytes| {
            match Resp::decode(bytes) {
                Ok(resp) if predicate(&resp) => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(resp);
                    }
                    true
                }
                _ => false,
            }
        });

        self.waiters
            .lock()
            .entry(Resp::KIND)
            .or_default()
            .push(Waiter { id, try_consume });

        self.send(to, req);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = Self::deadline_future(deadline) => None,
            res = rx => res.ok(),
        };

        // guarantee no leak regardless of which branch won
        self.remove_waiter(Resp::KIND, id);

        outcome.ok_or_else(|| Error::timeout(ErrorKind::Dispatcher))
    }

    async fn deadline_future(deadline: Option<Duration>) {
        match deadline {
            Some(d) => futures_timer::Delay::new(d).await,
            None => std::future::pending().await,
        }
    }

    fn remove_waiter(&self, kind: u16, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(&kind) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waiters.remove(&kind);
            }
        }
    }

    /// Registers a persistent handler for inbound packets of type
    /// `T`. Replaces any previously registered handler for the same
    /// kind.
    pub fn on_receive<T, F>(&self, handler: F)
    where
        T: WireCodec,
        F: Fn(T, DispatchContext) + Send + Sync + 'static,
    {
        let boxed: Handler = Box::new(move |bytes, ctx| match T::decode(&bytes) {
            Ok(packet) => handler(packet, ctx),
            Err(e) => warn!(kind = T::KIND, error = %e, "decode failure on inbound packet"),
        });
        self.handlers.write().insert(T::KIND, boxed);
    }

    /// Removes the persistent handler for `T`, if any.
    pub fn remove_handler<T: WireCodec>(&self) {
        self.handlers.write().remove(&T::KIND);
    }

    /// Entry point invoked once an inbound `P2PPacket` frame addressed
    /// to this node arrives. Waiters registered for `kind` are tried
    /// first (first match wins and is consumed); if none match, the
    /// frame falls through to the persistent handler, if any.
    ///
    /// Ordering: this method is expected to be invoked sequentially,
    /// once per inbound frame, by a single reader task per peer link
    /// — that is what gives handlers of the same type their
    /// per-sender ordering guarantee. Distinct peer
    /// links run on distinct reader tasks, so distinct senders may be
    /// dispatched concurrently.
    pub fn dispatch_inbound(&self, kind: u16, bytes: Bytes, ctx: DispatchContext) {
        if self.try_satisfy_waiter(kind, &bytes) {
            return;
        }
        let handlers = self.handlers.read();
        match handlers.get(&kind) {
            Some(handler) => handler(bytes, ctx),
            None => trace!(kind, from = %ctx.from, "no subscriber for inbound packet kind"),
        }
    }

    fn try_satisfy_waiter(&self, kind: u16, bytes: &Bytes) -> bool {
        let mut waiters = self.waiters.lock();
        let Some(list) = waiters.get_mut(&kind) else {
            return false;
        };
        let matched = list.iter_mut().position(|w| (w.try_consume)(bytes));
        match matched {
            Some(i) => {
                list.remove(i);
                if list.is_empty() {
                    waiters.remove(&kind);
                }
                true
            }
            None => false,
        }
    }
}

/// The dispatcher is the router's local-delivery hook on a client node:
/// any `P2PPacket` addressed to this node is unwrapped and handed to
/// `dispatch_inbound`. `Ping`/`Pong`/`RoutingUpdate` frames carry no L2
/// payload and are not this layer's concern.
impl LocalDelivery for RouterPacketDispatcher {
    fn deliver(&self, from: NodeId, payload: PayloadKind) {
        if let PayloadKind::P2PPacket { kind, bytes } = payload {
            self.dispatch_inbound(kind, bytes, DispatchContext { from, session: None });
        }
    }
}
