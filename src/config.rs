//! Configuration surface and tunable constants.
//!
//! Loading these values from a file, environment, or DI container is
//! out of scope; this module only defines their shapes and defaults
//! so the rest of the crate has a single source of truth to
//! reference.

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Number of slots in a connection's sliding send/receive window.
pub const BUFFER_LENGTH: u16 = 256;

/// Capacity of a connection's recently-seen inbound data-slot cache,
/// used to suppress re-delivering a retransmitted SYN to the
/// application. Kept strictly below `BUFFER_LENGTH`: the `syn_or_ack`
/// slot number is itself drawn from `[0, BUFFER_LENGTH)`, so a cache
/// sized at the full buffer length would, after one full pass of the
/// sender's window, hold every possible slot value and never evict —
/// misclassifying every subsequent (legitimately reused) slot as a
/// duplicate forever. Half the buffer length is comfortably larger
/// than any realistic run of retransmissions still in flight for a
/// slot that hasn't yet been ACKed and reused.
pub const DUP_INBOUND_CAPACITY: usize = (BUFFER_LENGTH / 2) as usize;

/// Default TTL stamped onto a freshly originated `RouteLayerPacket`.
pub const DEFAULT_TTL: u8 = 16;

/// Capacity of the router's recent-`(from, seq)` dedup cache.
pub const DEDUP_CACHE_CAPACITY: usize = 4096;

/// Deadline for the three-way handshake's second leg.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time after which an unacked slot is considered lost and
/// retransmitted.
pub const RETRANSMIT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Wake interval of the per-connection retransmission task.
pub const RETRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wake interval of the relay's session watchdog scan.
pub const WATCHDOG_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-session liveness timeout on the relay, absent an
/// explicit override. Must exceed the client heartbeat period (~2s) by
/// a margin of at least 3x.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Client heartbeat period assumed by the relay when validating
/// `DEFAULT_WATCHDOG_TIMEOUT` against it.
pub const CLIENT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(2);

/// Configuration keys for the relay server's accept socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayServerConfig {
    /// `RelayServer.ListenAddress`.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// `RelayServer.ListenPort`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// `RelayServer.PublicListenAddress`, advertised to clients.
    pub public_listen_address: Option<String>,
    /// `RelayServer.PublicListenPort`, advertised to clients.
    pub public_listen_port: Option<u16>,
    /// Per-session watchdog timeout; defaults to
    /// [`DEFAULT_WATCHDOG_TIMEOUT`].
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_listen_port() -> u16 {
    3536
}

fn default_watchdog_timeout_secs() -> u64 {
    DEFAULT_WATCHDOG_TIMEOUT.as_secs()
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            public_listen_address: None,
            public_listen_port: None,
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
        }
    }
}

impl RelayServerConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }
}

/// Configuration for the link to the central coordinator, kept
/// separate from the relay's own listen socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorLinkConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub server_id: u128,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watchdog_timeout_exceeds_heartbeat_period_by_3x() {
        assert!(DEFAULT_WATCHDOG_TIMEOUT >= CLIENT_HEARTBEAT_PERIOD * 3);
    }

    #[test]
    fn relay_config_defaults_are_stable() {
        let cfg = RelayServerConfig::default();
        assert_eq!(cfg.listen_port, 3536);
        assert_eq!(cfg.listen_address, "0.0.0.0");
    }
}
