//! Inbound dispatcher: the single worker draining the shared inbound queue.
//!
//! Every connection's reader feeds the same queue; the dispatcher
//! classifies each line by its type prefix, fans sendable lines out to the
//! other connections, and renders lines into posts for the bound chat
//! channels. One malformed line never kills the worker, and an unexpected
//! fault escaping the per-message handling is caught at the task boundary
//! and answered with a restart.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chatbridge_core::{split_fields, MessageType};

use crate::connection::RELAY_PRIORITY;
use crate::server::RelayServer;

/// Capacity of the shared inbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 64;

/// One raw line received from a connection, tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Name of the connection the line came from.
    pub source: String,
    /// The raw wire line, newline included.
    pub line: String,
}

/// Spawn the dispatcher under a supervisor that restarts it on faults.
///
/// A clean return (shutdown signal) ends the supervisor; a panic escaping
/// the worker is logged and answered with exactly one restart per fault.
/// Repeated immediate faults loop without rate limiting.
pub(crate) fn spawn_supervised(server: Arc<RelayServer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let worker = tokio::spawn(run_worker(server.clone()));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(error = %e, "dispatcher fault, restarting worker");
                }
            }
        }
    })
}

/// The dispatcher worker proper. Returns when the shutdown signal fires or
/// the inbound queue closes.
async fn run_worker(server: Arc<RelayServer>) {
    info!("dispatcher started");
    let mut shutdown = server.shutdown_tx.subscribe();
    // The receiver is parked in the server so a restarted worker resumes
    // draining the same queue.
    let mut inbound = server.inbound_rx.lock().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            envelope = inbound.recv() => match envelope {
                Some(envelope) => handle_envelope(&server, envelope).await,
                None => break,
            },
        }
    }
    info!("dispatcher exited");
}

/// Route one inbound line.
pub(crate) async fn handle_envelope(server: &RelayServer, envelope: InboundEnvelope) {
    let InboundEnvelope { source, line } = envelope;
    let fields = split_fields(&line);
    let Some(prefix) = fields.first().copied() else {
        return;
    };

    let msgtype = {
        let registry = server.registry.read().await;
        registry.get(prefix).cloned()
    };
    let Some(msgtype) = msgtype else {
        debug!(client = %source, line = %line.trim_end(), "unknown message type, dropped");
        return;
    };

    // Sendable lines fan out, unchanged, to every other connection.
    if msgtype.sendable {
        let connections = server.connections.read().await;
        for (name, handle) in connections.iter() {
            if name == &source {
                continue;
            }
            if !handle.queue.push(RELAY_PRIORITY, line.clone()) {
                warn!(client = %name, "outbound queue full, message dropped");
            }
        }
    }

    let values = &fields[1..];

    // A type route delivers to its own channel, and with `consume` set it
    // suppresses the client-bound path entirely.
    let route = {
        let routing = server.routing.read().await;
        routing.route_for_type(&msgtype.prefix).cloned()
    };
    if let Some(route) = route {
        server
            .post_to_channel(&route.channel_id, msgtype.render(values))
            .await;
        if route.consume {
            return;
        }
    }

    let channel = {
        let routing = server.routing.read().await;
        routing.channel_for_client(&source).map(str::to_string)
    };
    let Some(channel) = channel else {
        // The common case for a client nobody registered a channel for.
        debug!(client = %source, "no channel bound, message dropped");
        return;
    };
    server.post_to_channel(&channel, msgtype.render(values)).await;
}

/// Encode a surface-originated message as the given type.
///
/// The type's fields are filled from the surface context by name; fields a
/// custom type declares beyond client/user/content encode as empty.
pub(crate) fn surface_line(
    msgtype: &MessageType,
    surface_name: &str,
    user: &str,
    content: &str,
) -> String {
    let values: Vec<&str> = msgtype
        .formatfields
        .iter()
        .map(|field| match field.as_str() {
            "client" => surface_name,
            "user" => user,
            "content" => content,
            _ => "",
        })
        .collect();
    msgtype.encode(&values)
}
