//! `transit_core` — a reliable point-to-point transport built on top
//! of a routed, multi-hop packet substrate.
//!
//! Three layers, bottom to top:
//!
//! - [`router`]: L1, forwards [`router::RouteLayerPacket`] frames
//!   hop-by-hop, dropping TTL-expired and duplicate frames.
//! - [`dispatcher`]: L2, multiplexes typed packets on top of the
//!   router and correlates one-shot request/response exchanges.
//! - [`connection`]: L3, a reliable sliding-window connection between
//!   two peers, built on [`connection::TransDatagram`].
//! - [`relay`]: L3′, a session watchdog and accept loop for peers that
//!   reach each other only through a relay server rather than directly.

pub mod async_runtime;
pub mod collections;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod identifiers;
pub mod relay;
pub mod router;

pub use error::{Error, ErrorKind, Result};
pub use identifiers::{NodeId, SessionId};
