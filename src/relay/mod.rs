//! L3′ — watches over sessions that reach this node only through a
//! relay server rather than a direct or routed link, evicting ones
//! that go quiet.
//!
//! A session is attached before it has necessarily disclosed its
//! `NodeId`; its claimed identity is bound on first heartbeat and
//! enforced against every heartbeat after that.

mod server;

use std::sync::Arc;

use bytes::Bytes;
// `tokio::time::Instant` rather than `std::time::Instant`: identical
// API, but honors `tokio::time::{pause, advance}` in tests, so the
// watchdog's elapsed-time checks are deterministic to test under a
// paused clock.
use tokio::time::Instant;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::async_runtime::{self, CancellationToken};
use crate::collections::HashMap;
use crate::config::{DEFAULT_WATCHDOG_TIMEOUT, WATCHDOG_SCAN_INTERVAL};
use crate::dispatcher::WireCodec;
use crate::error::{Error, ErrorKind, Result};
use crate::identifiers::{NodeId, SessionId};
use crate::router::{PayloadKind, RouteLayerPacket};

pub use server::{run_relay_server, TcpRelaySession};

/// Client-to-relay liveness probe, carried as a `P2PPacket` over the
/// session's [`RouteLayerPacket`] framing. Empty body: the identity
/// check lives in the enclosing frame's `from` field, not in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat;

impl WireCodec for HeartBeat {
    const KIND: u16 = 2;

    fn encode(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(_bytes: &[u8]) -> Result<Self> {
        Ok(HeartBeat)
    }
}

/// Sent to a session the relay is about to close on its own
/// initiative (watchdog eviction, identity mismatch), so a well-behaved
/// peer learns the link is going away instead of just seeing it drop.
/// Best-effort: the manager never waits for this to land before
/// closing the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownMessage;

impl WireCodec for ShutdownMessage {
    const KIND: u16 = 3;

    fn encode(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(_bytes: &[u8]) -> Result<Self> {
        Ok(ShutdownMessage)
    }
}

/// Wraps `msg` in the `P2PPacket { kind, bytes }` envelope the other
/// end's dispatcher (or, here, the relay's own raw reader) expects.
fn encode_p2p<T: WireCodec>(msg: &T) -> PayloadKind {
    PayloadKind::P2PPacket {
        kind: T::KIND,
        bytes: msg.encode(),
    }
}

/// A relay-attached session, reduced to the three capabilities the
/// manager needs: its own id, the ability to push bytes back out, and
/// the ability to be torn down.
pub trait RelaySession: Send + Sync {
    fn id(&self) -> SessionId;
    fn send(&self, bytes: Bytes);
    fn close(&self);
}

struct SessionEntry {
    session: Arc<dyn RelaySession>,
    last_seen: Instant,
    bound_identity: Option<NodeId>,
    is_control_plane: bool,
}

type DisconnectHandler = Box<dyn Fn(SessionId) + Send + Sync>;

/// Tracks attached relay sessions, validates their heartbeats, and
/// evicts ones that have gone silent past their timeout.
pub struct RelaySessionManager {
    local: NodeId,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    on_disconnect: RwLock<Option<DisconnectHandler>>,
    watchdog_timeout: std::time::Duration,
}

impl RelaySessionManager {
    pub fn new(local: NodeId, watchdog_timeout: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            local,
            sessions: RwLock::new(HashMap::new()),
            on_disconnect: RwLock::new(None),
            watchdog_timeout,
        })
    }

    pub fn with_default_timeout(local: NodeId) -> Arc<Self> {
        Self::new(local, DEFAULT_WATCHDOG_TIMEOUT)
    }

    /// Registers `session` under `id`. Idempotent: attaching an
    /// already-attached id is a no-op that returns the same id.
    pub fn attach(&self, id: SessionId, session: Arc<dyn RelaySession>) -> SessionId {
        let mut sessions = self.sessions.write();
        sessions.entry(id).or_insert_with(|| SessionEntry {
            session,
            last_seen: Instant::now(),
            bound_identity: None,
            is_control_plane: false,
        });
        id
    }

    /// Marks `id` as the control-plane session, exempting it from the
    /// watchdog's timeout eviction and from the heartbeat identity
    /// check.
    pub fn mark_control_plane(&self, id: SessionId) {
        if let Some(entry) = self.sessions.write().get_mut(&id) {
            entry.is_control_plane = true;
        }
    }

    /// Registers the callback invoked once per eviction or explicit
    /// `detach`.
    pub fn on_session_disconnected<F>(&self, handler: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        *self.on_disconnect.write() = Some(Box::new(handler));
    }

    /// Validates and records a heartbeat claiming to originate from
    /// `from` on session `id`. Rejects heartbeats on unattached
    /// sessions, and heartbeats whose claimed identity doesn't match
    /// the session's first-observed identity (unless the session is
    /// the control plane).
    pub fn on_heartbeat(&self, id: SessionId, from: NodeId) -> Result<()> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&id)
            .ok_or_else(|| Error::simple(ErrorKind::Relay))?;

        match entry.bound_identity {
            None => entry.bound_identity = Some(from),
            Some(bound) if bound == from || entry.is_control_plane => {}
            Some(_) => return Err(Error::simple(ErrorKind::Relay)),
        }

        entry.last_seen = Instant::now();
        Ok(())
    }

    /// Removes `id`, closes its session, and fires the disconnect
    /// callback. Safe to call on an id that is no longer attached.
    pub fn detach(&self, id: SessionId) {
        let removed = self.sessions.write().remove(&id);
        if let Some(entry) = removed {
            entry.session.close();
            if let Some(handler) = self.on_disconnect.read().as_ref() {
                handler(id);
            }
        }
    }

    fn send_shutdown_to(&self, session: &Arc<dyn RelaySession>, to: NodeId) {
        let frame = RouteLayerPacket {
            from: self.local,
            to,
            ttl: 1,
            seq: 0,
            payload: encode_p2p(&ShutdownMessage),
        };
        session.send(frame.encode());
    }

    /// Sends a best-effort [`ShutdownMessage`] to `session`, addressed
    /// to `to`. Exposed for callers rejecting a heartbeat on a session
    /// this manager never attached — there's no [`SessionEntry`] to
    /// evict through.
    pub fn send_shutdown(&self, session: &Arc<dyn RelaySession>, to: NodeId) {
        self.send_shutdown_to(session, to);
    }

    /// Evicts `id`: sends a best-effort [`ShutdownMessage`] to its
    /// bound identity (or back to this node if none was ever bound),
    /// then tears the session down the same way as [`Self::detach`].
    fn evict(&self, id: SessionId) {
        let target = self.sessions.read().get(&id).map(|entry| {
            (entry.session.clone(), entry.bound_identity.unwrap_or(self.local))
        });
        if let Some((session, to)) = target {
            self.send_shutdown_to(&session, to);
        }
        self.detach(id);
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the watchdog loop: every [`WATCHDOG_SCAN_INTERVAL`],
    /// evicts sessions (other than the control plane) that haven't
    /// heartbeated within `watchdog_timeout`.
    pub fn spawn_watchdog(self: &Arc<Self>, cancel: CancellationToken) -> async_runtime::JoinHandle<()> {
        let manager = self.clone();
        async_runtime::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_SCAN_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.scan_once(),
                }
            }
            debug!("relay session watchdog stopped");
        })
    }

    fn scan_once(&self) {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| {
                !entry.is_control_plane && now.duration_since(entry.last_seen) >= self.watchdog_timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            info!(session = %id, "evicting session past watchdog timeout");
            self.evict(id);
        }
    }
}
