//! Per-connection state: the bounded outbound queue and the reader/writer
//! worker pair.
//!
//! Each accepted socket gets one reader task (socket → shared inbound
//! queue) and one writer task (outbound queue → socket). The first of the
//! two to exit takes the other down with it; the supervisor driving that is
//! `RelayServer::handle_connection`.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::dispatch::InboundEnvelope;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 24;

/// Priority attached to every relayed line. The priority dimension exists
/// for future differentiation; with a single producer level the queue
/// behaves as a plain bounded FIFO.
pub const RELAY_PRIORITY: u8 = 5;

/// Bounded priority queue feeding one connection's writer.
///
/// Pushes never block: a full queue drops the message instead of stalling
/// the dispatcher or another connection.
pub struct OutboundQueue {
    tx: mpsc::Sender<(u8, String)>,
}

impl OutboundQueue {
    /// Create a queue of [`OUTBOUND_QUEUE_CAPACITY`] entries, returning the
    /// receiving end for the writer task.
    pub fn bounded() -> (Self, mpsc::Receiver<(u8, String)>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue. Returns false when the line was dropped
    /// because the queue is full (or the writer is gone).
    pub fn push(&self, priority: u8, line: String) -> bool {
        self.tx.try_send((priority, line)).is_ok()
    }
}

/// Connection lifecycle states.
///
/// `Handshaking` and `Closed` are never visible in the connection table —
/// an entry exists only between registration and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// Table entry for one live connection.
pub struct ConnectionHandle {
    /// Generation id distinguishing this entry from a replaced (reconnected)
    /// one with the same name.
    pub id: u64,
    /// Handshake-supplied name, or the peer address as fallback.
    pub name: String,
    /// Outbound queue sender; dropping the entry closes the writer's queue.
    pub queue: OutboundQueue,
    pub state: ConnState,
    pub(crate) reader: AbortHandle,
    pub(crate) writer: AbortHandle,
}

impl ConnectionHandle {
    /// Forcibly cancel both workers. Never fails; the tasks observe the
    /// abort at their next suspension point.
    pub fn abort_workers(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    #[cfg(test)]
    pub(crate) fn stub(id: u64, name: &str) -> (Self, mpsc::Receiver<(u8, String)>) {
        let (queue, rx) = OutboundQueue::bounded();
        let park = || tokio::spawn(std::future::pending::<()>()).abort_handle();
        (
            Self {
                id,
                name: name.to_string(),
                queue,
                state: ConnState::Active,
                reader: park(),
                writer: park(),
            },
            rx,
        )
    }
}

/// Live connections keyed by client name.
pub type ConnectionTable = HashMap<String, ConnectionHandle>;

/// Reader worker: socket lines onto the shared inbound queue.
///
/// Exits on EOF or a fatal read error. An undecodable (non-UTF-8) line is
/// dropped and the loop continues — a bad line is not a bad connection.
pub(crate) async fn reader_loop<R>(
    mut reader: BufReader<R>,
    name: String,
    inbound: mpsc::Sender<InboundEnvelope>,
) where
    R: AsyncRead + Unpin,
{
    debug!(client = %name, "incoming worker started");
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!(client = %name, "peer disconnected");
                break;
            }
            Ok(_) => {
                let line = match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(line) => line,
                    Err(e) => {
                        info!(client = %name, error = %e, "undecodable line dropped");
                        continue;
                    }
                };
                if inbound
                    .try_send(InboundEnvelope {
                        source: name.clone(),
                        line,
                    })
                    .is_err()
                {
                    warn!(client = %name, "inbound queue full, message dropped");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                info!(client = %name, "connection reset by peer");
                break;
            }
            Err(e) => {
                info!(client = %name, error = %e, "read failed");
                break;
            }
        }
    }
    info!(client = %name, "incoming worker exited");
}

/// Writer worker: drains the outbound queue into the socket.
///
/// The queue's sender side living in the connection table is the worker's
/// lifeline: once the entry is removed the channel closes and `recv`
/// returns `None` — the only normal path by which the writer stops itself.
pub(crate) async fn writer_loop<W>(
    mut outbound: mpsc::Receiver<(u8, String)>,
    mut writer: W,
    name: String,
) where
    W: AsyncWrite + Unpin,
{
    debug!(client = %name, "outgoing worker started");
    while let Some((_priority, line)) = outbound.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(client = %name, error = %e, "write failed, shutting down");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(client = %name, error = %e, "flush failed, shutting down");
            break;
        }
    }
    info!(client = %name, "outgoing worker exited");
}
