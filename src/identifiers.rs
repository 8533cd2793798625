//! Opaque identifiers used across every layer of the transport core.

use std::fmt;

/// Opaque 128-bit identifier of a client, stable for the lifetime of
/// a signin. The zero value is reserved for "unset/broadcast
/// suppressed" and is never assigned to a real peer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct NodeId(u128);

impl NodeId {
    /// The reserved "unset" identifier.
    pub const UNSET: NodeId = NodeId(0);

    /// Maps an iterator of raw ids into `NodeId`s, used to build
    /// broadcast target lists.
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u128>,
    {
        into_iterator.into_iter().map(Self)
    }

    /// Whether this id is the reserved "unset" value.
    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl From<u128> for NodeId {
    #[inline]
    fn from(id: u128) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for u128 {
    #[inline]
    fn from(id: NodeId) -> u128 {
        id.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:#034x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#034x}", self.0)
    }
}

/// Opaque handle assigned by the relay to an attached session. Distinct
/// from `NodeId` — a session is a transport-level concept, while a
/// `NodeId` identifies the client logically.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        SessionId(raw)
    }
}

impl From<u64> for SessionId {
    #[inline]
    fn from(raw: u64) -> SessionId {
        SessionId(raw)
    }
}

impl From<SessionId> for u64 {
    #[inline]
    fn from(id: SessionId) -> u64 {
        id.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates fresh, process-unique `SessionId`s.
pub struct SessionIdGenerator {
    next: std::sync::atomic::AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> SessionId {
        let raw = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        SessionId(raw)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unset() {
        assert!(NodeId::UNSET.is_unset());
        assert!(NodeId::from(0u128).is_unset());
        assert!(!NodeId::from(1u128).is_unset());
    }

    #[test]
    fn targets_maps_raw_ids() {
        let ids: Vec<NodeId> = NodeId::targets(0..3u128).collect();
        assert_eq!(ids, vec![NodeId::from(0), NodeId::from(1), NodeId::from(2)]);
    }

    #[test]
    fn session_id_generator_is_monotonic_and_unique() {
        let gen = SessionIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
    }
}
