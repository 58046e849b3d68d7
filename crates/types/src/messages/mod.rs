//! Decoded message tables for the three protocol channels.

pub mod distributed;
pub mod peer;
pub mod server;

use serde::{Deserialize, Serialize};

use self::{distributed::DistributedMessage, peer::PeerMessage, server::ServerMessage};

/// A decoded frame, tagged with the channel it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Server(ServerMessage),
    Peer(PeerMessage),
    Distributed(DistributedMessage),
}

impl From<ServerMessage> for Frame {
    fn from(msg: ServerMessage) -> Self {
        Self::Server(msg)
    }
}

impl From<PeerMessage> for Frame {
    fn from(msg: PeerMessage) -> Self {
        Self::Peer(msg)
    }
}

impl From<DistributedMessage> for Frame {
    fn from(msg: DistributedMessage) -> Self {
        Self::Distributed(msg)
    }
}
