//! Receive side of an attached channel

use crate::error::NetworkError;
use crate::network::ChannelId;
use crate::protocol::Frame;
use tokio::sync::mpsc;

/// Event fed to a connection's task
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame),
    Disconnect,
}

/// Pushes inbound frames into the node that owns a connection
///
/// Frames delivered through one handle are processed in order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    channel: ChannelId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(channel: ChannelId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { channel, tx }
    }

    /// Channel the handle feeds
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Enqueue a frame received from the neighbour
    pub fn deliver(&self, frame: Frame) -> Result<(), NetworkError> {
        self.tx
            .send(Inbound::Frame(frame))
            .map_err(|_| NetworkError::ChannelClosed {
                channel: self.channel.to_string(),
            })
    }

    /// Tell the node the channel went away
    pub fn disconnect(&self) {
        let _ = self.tx.send(Inbound::Disconnect);
    }

    /// Whether the connection task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
