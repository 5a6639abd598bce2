//! Chat-surface seam.
//!
//! The hub never talks to a chat service directly. The dispatcher renders
//! messages and posts them here; whoever embeds the hub owns the receiving
//! end and forwards posts to the real surface. The standalone binary just
//! drains them into the log.

use tokio::sync::mpsc;

/// Capacity of the surface channel.
pub const CHAT_QUEUE_CAPACITY: usize = 64;

/// A rendered message addressed to one chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPost {
    /// Target channel id, as used in the routing tables.
    pub channel_id: String,
    /// Human-readable text, already rendered through the type's template.
    pub text: String,
}

/// Sending half handed to the relay server.
pub type ChatSink = mpsc::Sender<ChannelPost>;

/// Create the surface channel pair.
pub fn channel() -> (ChatSink, mpsc::Receiver<ChannelPost>) {
    mpsc::channel(CHAT_QUEUE_CAPACITY)
}
