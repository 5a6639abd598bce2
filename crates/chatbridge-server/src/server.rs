//! Core relay server: owns the registries, the connection table, and the
//! lifecycle of every accepted connection.
//!
//! The server registers a single entry point with the [`StreamServer`] —
//! "handle one accepted connection" — and runs one supervisor future per
//! connection plus the shared inbound dispatcher. Operator commands map
//! 1:1 onto registry/routing operations and persist the relay state after
//! every successful mutation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatbridge_core::{
    parse_handshake, BridgeError, BridgeResult, MessageType, RoutingTable, TypeRegistry,
    MSG_PREFIX, SYS_PREFIX,
};

use crate::chat::{ChannelPost, ChatSink};
use crate::config::{self, ServerConfig};
use crate::connection::{
    self, ConnState, ConnectionHandle, ConnectionTable, OutboundQueue, RELAY_PRIORITY,
};
use crate::dispatch::{self, InboundEnvelope, INBOUND_QUEUE_CAPACITY};
use crate::listener::StreamServer;

/// Protocol key the relay registers under with the stream server.
pub const PROTOCOL_KEY: &str = "chat-relay";

/// Status snapshot returned by [`RelayServer::status`].
#[derive(Debug, Clone)]
pub struct RelayStatus {
    /// Currently connected clients.
    pub clients: Vec<ClientStatus>,
    /// Client → channel bindings (configured, connected or not).
    pub bindings: Vec<(String, String)>,
    /// Channel restrictions as (channel, type prefix, consume).
    pub restrictions: Vec<(String, String, bool)>,
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub name: String,
    pub state: ConnState,
}

/// The relay hub.
pub struct RelayServer {
    pub(crate) config: ServerConfig,
    pub(crate) registry: RwLock<TypeRegistry>,
    pub(crate) routing: RwLock<RoutingTable>,
    pub(crate) connections: RwLock<ConnectionTable>,
    pub(crate) inbound_tx: mpsc::Sender<InboundEnvelope>,
    /// Parked receiver the dispatcher worker (re)claims on each start.
    pub(crate) inbound_rx: Mutex<mpsc::Receiver<InboundEnvelope>>,
    pub(crate) chat_tx: ChatSink,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    intake: Mutex<Option<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    /// Create a server, loading the persisted relay state.
    pub fn new(config: ServerConfig, chat_tx: ChatSink) -> BridgeResult<Arc<Self>> {
        let (registry, routing) = config::load_state(&config.state_path)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        Ok(Arc::new(Self {
            config,
            registry: RwLock::new(registry),
            routing: RwLock::new(routing),
            connections: RwLock::new(ConnectionTable::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            chat_tx,
            shutdown_tx: broadcast::channel(1).0,
            dispatcher: Mutex::new(None),
            intake: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
        }))
    }

    /// Register with the stream server and start the dispatcher. The
    /// operator's "init" command.
    pub async fn initialize(self: &Arc<Self>, streams: &StreamServer) {
        let (conn_tx, mut conn_rx) = mpsc::channel(8);
        streams.register_handshake(PROTOCOL_KEY, conn_tx).await;

        let server = self.clone();
        let intake = tokio::spawn(async move {
            while let Some((stream, peer)) = conn_rx.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_connection(stream, peer).await;
                });
            }
        });
        *self.intake.lock().await = Some(intake);

        self.start_dispatcher().await;
        info!("relay initialized");
    }

    /// Unregister from the stream server and shut the relay down. The
    /// operator's "stop" command; the listener itself stays up and drops
    /// whatever it accepts afterwards.
    pub async fn close(&self, streams: &StreamServer) {
        streams.unregister_handshake(PROTOCOL_KEY).await;
        self.shutdown().await;
    }

    /// Stop the dispatcher, then cancel both workers of every live
    /// connection. Queued outbound messages are discarded, not flushed.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.intake.lock().await.take() {
            handle.abort();
        }

        let mut connections = self.connections.write().await;
        for handle in connections.values_mut() {
            handle.state = ConnState::Closing;
            handle.abort_workers();
        }
        drop(connections);
        info!("relay closed, all clients disconnected");
    }

    async fn start_dispatcher(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock().await;
        if let Some(handle) = dispatcher.as_ref() {
            if !handle.is_finished() {
                debug!("dispatcher already running");
                return;
            }
        }
        *dispatcher = Some(dispatch::spawn_supervised(self.clone()));
    }

    // ── Connection lifecycle ───────────────────────────────────────────

    /// Handle one accepted connection: handshake, worker pair, teardown.
    ///
    /// This is the single entry point the stream server drives. The
    /// handshake read deliberately has no timeout; a silent peer occupies
    /// its connection until it closes (trusted-network assumption).
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut state = ConnState::Handshaking;
        debug!(%peer, state = ?state, "connection received");

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut handshake = Vec::new();
        match reader.read_until(b'\n', &mut handshake).await {
            Ok(0) => {
                info!(%peer, "closed before handshake");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                info!(%peer, error = %e, "handshake read failed");
                return;
            }
        }

        // A malformed handshake degrades to the peer address as the name.
        let name = match std::str::from_utf8(&handshake).ok().and_then(parse_handshake) {
            Some(name) => name.to_string(),
            None => {
                warn!(%peer, "invalid handshake, using peer address as name");
                peer.to_string()
            }
        };

        // Reconnect after a messy exit: the stale entry's workers get
        // cancelled before the replacement registers.
        {
            let mut connections = self.connections.write().await;
            if let Some(stale) = connections.remove(&name) {
                warn!(client = %name, "reconnecting before old workers exited, cleaning up");
                stale.abort_workers();
            }
        }

        let (queue, outbound_rx) = OutboundQueue::bounded();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let mut reader_task = tokio::spawn(connection::reader_loop(
            reader,
            name.clone(),
            self.inbound_tx.clone(),
        ));
        let mut writer_task = tokio::spawn(connection::writer_loop(
            outbound_rx,
            write_half,
            name.clone(),
        ));

        {
            let mut connections = self.connections.write().await;
            connections.insert(
                name.clone(),
                ConnectionHandle {
                    id,
                    name: name.clone(),
                    queue,
                    state: ConnState::Active,
                    reader: reader_task.abort_handle(),
                    writer: writer_task.abort_handle(),
                },
            );
        }
        state = ConnState::Active;
        info!(client = %name, %peer, state = ?state, "client connected");
        self.announce(&name, "connected").await;

        // First worker out takes the other down with it.
        tokio::select! {
            _ = &mut reader_task => writer_task.abort(),
            _ = &mut writer_task => reader_task.abort(),
        }
        state = ConnState::Closing;
        debug!(client = %name, state = ?state, "worker pair wound down");

        // Remove only our own entry — a reconnect may have replaced it
        // already, and the replacement must survive this teardown.
        {
            let mut connections = self.connections.write().await;
            if connections.get(&name).is_some_and(|handle| handle.id == id) {
                connections.remove(&name);
            }
        }
        self.announce(&name, "disconnected").await;
        state = ConnState::Closed;
        info!(client = %name, state = ?state, "connection closed");
    }

    /// Push a `SYS` notice through the normal inbound path so it reaches
    /// the operator's status channel like any other system message.
    async fn announce(&self, client: &str, event: &str) {
        let line = {
            let registry = self.registry.read().await;
            match registry.get(SYS_PREFIX) {
                Some(sys) => sys.encode(&[&format!("{client} {event}")]),
                None => return,
            }
        };
        let envelope = InboundEnvelope {
            source: client.to_string(),
            line,
        };
        if self.inbound_tx.try_send(envelope).is_err() {
            warn!(client = %client, "inbound queue full, notice dropped");
        }
    }

    // ── Dispatcher support ─────────────────────────────────────────────

    /// Hand a rendered post to the chat surface.
    pub(crate) async fn post_to_channel(&self, channel_id: &str, text: String) {
        let post = ChannelPost {
            channel_id: channel_id.to_string(),
            text,
        };
        if self.chat_tx.send(post).await.is_err() {
            debug!("chat surface closed, post dropped");
        }
    }

    /// Mirror direction: a message arriving from the chat surface, bound
    /// for the clients of `channel_id`. Bypasses the inbound queue.
    pub async fn relay_from_channel(&self, channel_id: &str, user: &str, content: &str) {
        let (line, targets) = {
            let routing = self.routing.read().await;
            let registry = self.registry.read().await;

            let msgtype = match routing.restriction_for_channel(channel_id) {
                Some((prefix, _)) => match registry.get(prefix) {
                    Some(ty) if ty.sendable => ty,
                    Some(_) => {
                        debug!(channel = %channel_id, "restricted type is not sendable, dropped");
                        return;
                    }
                    None => return,
                },
                None => match registry.get(MSG_PREFIX) {
                    Some(ty) => ty,
                    None => return,
                },
            };

            let line = dispatch::surface_line(msgtype, &self.config.surface_name, user, content);
            let targets: Vec<String> = routing
                .clients_for_channel(channel_id)
                .into_iter()
                .map(str::to_string)
                .collect();
            (line, targets)
        };

        let connections = self.connections.read().await;
        for client in &targets {
            if let Some(handle) = connections.get(client.as_str()) {
                if !handle.queue.push(RELAY_PRIORITY, line.clone()) {
                    warn!(client = %client, "outbound queue full, message dropped");
                }
            }
        }
    }

    // ── Operator commands ──────────────────────────────────────────────

    /// Bind a client to a channel.
    pub async fn bind_client(&self, client: &str, channel_id: &str) -> BridgeResult<()> {
        if !self.connections.read().await.contains_key(client) {
            info!(client = %client, "client not currently connected, registering anyway");
        }
        self.routing.write().await.bind_client(client, channel_id)?;
        self.save_state().await?;
        info!(client = %client, channel = %channel_id, "client bound to channel");
        Ok(())
    }

    /// Remove a client's channel binding.
    pub async fn unbind_client(&self, client: &str) -> BridgeResult<()> {
        self.routing.write().await.unbind_client(client)?;
        self.save_state().await?;
        info!(client = %client, "client unbound");
        Ok(())
    }

    /// Add or modify a message type.
    pub async fn add_type(
        &self,
        prefix: &str,
        formatstr: &str,
        sendable: bool,
    ) -> BridgeResult<MessageType> {
        let ty = self
            .registry
            .write()
            .await
            .register(prefix, formatstr, sendable)?;
        self.save_state().await?;
        info!(prefix = %prefix, sendable, "message type saved");
        Ok(ty)
    }

    /// Remove a message type (built-ins refuse).
    pub async fn remove_type(&self, prefix: &str) -> BridgeResult<()> {
        self.registry.write().await.remove(prefix)?;
        self.save_state().await?;
        info!(prefix = %prefix, "message type removed");
        Ok(())
    }

    /// All registered message types, sorted by prefix.
    pub async fn list_types(&self) -> Vec<MessageType> {
        let registry = self.registry.read().await;
        let mut types: Vec<MessageType> = registry.iter().cloned().collect();
        types.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        types
    }

    /// Restrict a channel to one message type.
    pub async fn restrict_channel(
        &self,
        channel_id: &str,
        prefix: &str,
        consume: bool,
    ) -> BridgeResult<()> {
        if !self.registry.read().await.contains(prefix) {
            return Err(BridgeError::UnknownType(prefix.to_string()));
        }
        self.routing
            .write()
            .await
            .bind_restriction(channel_id, prefix, consume)?;
        self.save_state().await?;
        info!(channel = %channel_id, prefix = %prefix, consume, "channel restricted");
        Ok(())
    }

    /// Lift a channel's type restriction.
    pub async fn unrestrict_channel(&self, channel_id: &str) -> BridgeResult<()> {
        self.routing.write().await.unbind_restriction(channel_id)?;
        self.save_state().await?;
        info!(channel = %channel_id, "channel restriction lifted");
        Ok(())
    }

    /// Names of the currently connected clients, sorted.
    pub async fn connected_clients(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut names: Vec<String> = connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot for the operator's status view.
    pub async fn status(&self) -> RelayStatus {
        let connections = self.connections.read().await;
        let mut clients: Vec<ClientStatus> = connections
            .values()
            .map(|handle| ClientStatus {
                name: handle.name.clone(),
                state: handle.state,
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        drop(connections);

        let routing = self.routing.read().await;
        let mut bindings: Vec<(String, String)> = routing
            .client_bindings()
            .map(|(client, channel)| (client.to_string(), channel.to_string()))
            .collect();
        bindings.sort();
        let mut restrictions: Vec<(String, String, bool)> = routing
            .type_bindings()
            .map(|(prefix, route)| (route.channel_id.clone(), prefix.to_string(), route.consume))
            .collect();
        restrictions.sort();

        RelayStatus {
            clients,
            bindings,
            restrictions,
        }
    }

    async fn save_state(&self) -> BridgeResult<()> {
        let registry = self.registry.read().await.clone();
        let routing = self.routing.read().await.clone();
        config::save_state(&self.config.state_path, &registry, &routing).await
    }
}
