//! The physical channel collaborator.
//!
//! A [`Channel`] moves raw text messages. It reports connection changes and
//! inbound messages on the event receiver handed out by [`Channel::connect`];
//! reconnecting is the channel's own business, announced by a fresh
//! [`ChannelEvent::Connected`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::MessagingResult, types::Headers};

/// Identifies one physical connection of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionEpoch(pub u64);

/// Notifications from the channel, in receive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection was (re)established and can carry traffic.
    Connected { epoch: ConnectionEpoch },
    /// The connection was lost.
    Disconnected {
        epoch: ConnectionEpoch,
        reason: String,
    },
    /// An inbound text message.
    Message(String),
}

/// An outbound message with its transport headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub headers: Headers,
    pub payload: String,
}

/// Bidirectional message channel driven by a
/// [`MessagingProvider`](crate::MessagingProvider).
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Open the channel and return its event stream.
    ///
    /// The stream ends when the channel is gone for good.
    async fn connect(&self) -> MessagingResult<mpsc::Receiver<ChannelEvent>>;

    /// Send one message on the current connection.
    async fn send(&self, message: Outbound) -> MessagingResult<()>;

    /// Close the channel.
    async fn close(&self) -> MessagingResult<()>;
}
