//! A concrete TCP accept loop realizing the relay's "fallback when
//! peers can't reach each other directly" role.
//!
//! One reader task and one writer task run per peer link, the writer
//! fed by an mpsc queue so a slow peer can't block anyone else's send.

use std::process::ExitCode;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::async_runtime::{self, CancellationToken};
use crate::config::RelayServerConfig;
use crate::dispatcher::WireCodec;
use crate::identifiers::{NodeId, SessionId, SessionIdGenerator};
use crate::router::{NeighborLink, PayloadKind, RouteLayerPacket, Router};

use super::{encode_p2p, HeartBeat, RelaySession, RelaySessionManager};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Refuse to allocate more than this for a single framed message,
/// regardless of what the 4-byte length prefix claims.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One accepted TCP peer, addressable both as a [`NeighborLink`] (so
/// the router can forward frames to it) and a [`RelaySession`] (so the
/// watchdog can evict it).
pub struct TcpRelaySession {
    id: SessionId,
    outbound: mpsc::Sender<Bytes>,
    close_signal: CancellationToken,
}

impl NeighborLink for TcpRelaySession {
    fn send(&self, bytes: Bytes) {
        if self.outbound.try_send(bytes).is_err() {
            warn!(session = %self.id, "relay outbound queue saturated, dropping frame");
        }
    }
}

impl RelaySession for TcpRelaySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, bytes: Bytes) {
        NeighborLink::send(self, bytes);
    }

    fn close(&self) {
        self.close_signal.cancel();
    }
}

/// Binds `config.listen_address:listen_port` and accepts relay
/// sessions until `cancel` fires, returning the process exit code.
pub async fn run_relay_server(
    config: RelayServerConfig,
    router: Arc<Router>,
    manager: Arc<RelaySessionManager>,
    cancel: CancellationToken,
) -> ExitCode {
    let addr = format!("{}:{}", config.listen_address, config.listen_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind relay listen socket");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "relay server listening");

    let session_ids = Arc::new(SessionIdGenerator::new());
    let watchdog = manager.spawn_watchdog(cancel.clone());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    let id = session_ids.next();
                    debug!(session = %id, %peer_addr, "accepted relay session");
                    spawn_session(socket, id, router.clone(), manager.clone(), cancel.clone());
                }
                Err(e) => warn!(error = %e, "relay accept failed"),
            },
        }
    }

    info!("relay server shutting down");
    ExitCode::SUCCESS
}

fn spawn_session(
    socket: tokio::net::TcpStream,
    id: SessionId,
    router: Arc<Router>,
    manager: Arc<RelaySessionManager>,
    server_cancel: CancellationToken,
) {
    let _ = socket.set_nodelay(true);
    let (read_half, write_half) = socket.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);
    let close_signal = CancellationToken::new();

    let session = Arc::new(TcpRelaySession {
        id,
        outbound: outbound_tx,
        close_signal: close_signal.clone(),
    });
    manager.attach(id, session.clone());

    async_runtime::spawn(writer_task(write_half, outbound_rx, close_signal.clone()));
    async_runtime::spawn(reader_task(
        read_half,
        id,
        session,
        router,
        manager,
        close_signal,
        server_cancel,
    ));
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    close_signal: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = close_signal.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(bytes) => {
                    if write_framed(&mut write_half, &bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_framed(write_half: &mut OwnedWriteHalf, bytes: &Bytes) -> std::io::Result<()> {
    write_half.write_u32(bytes.len() as u32).await?;
    write_half.write_all(bytes).await
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    id: SessionId,
    session: Arc<TcpRelaySession>,
    router: Arc<Router>,
    manager: Arc<RelaySessionManager>,
    close_signal: CancellationToken,
    server_cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = close_signal.cancelled() => break,
            _ = server_cancel.cancelled() => break,
            frame = read_framed(&mut read_half) => frame,
        };

        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                debug!(session = %id, error = %e, "relay session read error");
                break;
            }
        };

        let packet = match RouteLayerPacket::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(session = %id, error = %e, "dropping malformed relay frame");
                continue;
            }
        };

        router.set_neighbor(packet.from, session.clone());

        if let PayloadKind::P2PPacket { kind, .. } = &packet.payload {
            if *kind == HeartBeat::KIND {
                handle_heartbeat(&manager, &session, id, packet.from, router.local_id());
                continue;
            }
        }

        router.handle_inbound(packet);
    }

    manager.detach(id);
}

fn handle_heartbeat(
    manager: &Arc<RelaySessionManager>,
    session: &Arc<TcpRelaySession>,
    id: SessionId,
    from: NodeId,
    local: NodeId,
) {
    match manager.on_heartbeat(id, from) {
        Ok(()) => {
            let reply = RouteLayerPacket {
                from: local,
                to: from,
                ttl: 1,
                seq: 0,
                payload: encode_p2p(&HeartBeat),
            };
            RelaySession::send(session.as_ref(), reply.encode());
        }
        Err(e) => {
            warn!(session = %id, from = %from, error = %e, "rejecting heartbeat");
            session.close_signal.cancel();
        }
    }
}

async fn read_framed(read_half: &mut OwnedReadHalf) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = read_half.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "relay frame exceeds maximum length",
        ));
    }
    let mut body = BytesMut::zeroed(len as usize);
    read_half.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}
