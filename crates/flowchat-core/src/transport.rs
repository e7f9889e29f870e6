use tokio::sync::mpsc;

use crate::traits::Transport;
use crate::types::StreamEvent;

/// Transport backed by an unbounded tokio channel.
///
/// The receiving half stands in for the client connection: dropping it
/// marks the transport closed.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: StreamEvent) {
        // Ignore error if the receiver is gone
        let _ = self.tx.send(event);
    }
}

/// Transport for non-streaming requests: never closed, discards writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn is_closed(&self) -> bool {
        false
    }

    fn send(&self, _event: StreamEvent) {}
}
