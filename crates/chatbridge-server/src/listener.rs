//! TCP stream server with a pluggable handshake-handler slot.
//!
//! In the deployed system the relay does not own the listening socket — an
//! outer transport accepts connections and hands them to whichever protocol
//! handler registered for them. That indirection is kept here: the relay
//! registers exactly one entry point ("handle one accepted connection")
//! under a protocol key, and can unregister it to stop taking connections
//! while the listener keeps running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// An accepted socket together with its peer address.
pub type Accepted = (TcpStream, SocketAddr);

/// Intake channel a protocol handler registers with the stream server.
pub type ConnectionSink = mpsc::Sender<Accepted>;

/// Accept loop plus the handshake-handler registry.
pub struct StreamServer {
    handlers: Arc<RwLock<HashMap<String, ConnectionSink>>>,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamServer {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection handler under a protocol key, replacing any
    /// previous registration for that key.
    pub async fn register_handshake(&self, key: &str, sink: ConnectionSink) {
        self.handlers.write().await.insert(key.to_string(), sink);
        info!(protocol = %key, "handshake handler registered");
    }

    /// Unregister a protocol's handler. Connections accepted afterwards are
    /// dropped until a handler registers again.
    pub async fn unregister_handshake(&self, key: &str) {
        if self.handlers.write().await.remove(key).is_some() {
            info!(protocol = %key, "handshake handler unregistered");
        }
    }

    /// Bind the listener and spawn the accept loop. Returns the actually
    /// bound address (port 0 lets the OS pick one).
    ///
    /// Accepted sockets go to the registered handler's intake; with no
    /// handler registered they are closed immediately. No handshake or read
    /// timeout is applied anywhere downstream — peers are trusted LAN
    /// processes.
    pub async fn listen(&self, bind: &str, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((bind, port)).await?;
        let addr = listener.local_addr()?;
        let handlers = self.handlers.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let handlers = handlers.read().await;
                        // One listener serves one protocol; demultiplexing
                        // several keys on a single port is not supported.
                        match handlers.values().next() {
                            Some(sink) => {
                                if sink.try_send((stream, peer)).is_err() {
                                    warn!(%peer, "connection intake full, socket dropped");
                                }
                            }
                            None => {
                                debug!(%peer, "no handshake handler registered, socket dropped");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        info!(%addr, "stream server listening");
        Ok(addr)
    }
}
