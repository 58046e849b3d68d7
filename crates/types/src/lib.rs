//! Shared protocol data model for the SoulSeek client.
//!
//! The wire protocol has three framed channels, each with its own message
//! table: the server channel, the peer channel and the distributed-search
//! channel. This crate defines the decoded form of each table together with
//! the [`codec::Codec`] interface a wire codec must implement. The byte-level
//! encoding itself lives outside the core.

pub mod codec;
pub mod messages;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use messages::{
    distributed::DistributedMessage, peer::PeerMessage, server::ServerMessage, Frame,
};

/// Client version advertised at login.
pub const CLIENT_VERSION: u32 = 157;
/// Client minor version advertised at login.
pub const CLIENT_MINOR_VERSION: u32 = 19;

/// Reverse-handshake nonce, minted locally and relayed through the server so
/// a firewalled peer can connect back and identify itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer request identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReqId(pub u32);

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three peer-init kinds, sent as a single byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// `'P'`: generic peer messages.
    Peer,
    /// `'F'`: file transfer socket.
    File,
    /// `'D'`: distributed-search socket.
    Distributed,
}

impl ConnectionKind {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Peer => b'P',
            Self::File => b'F',
            Self::Distributed => b'D',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'P' => Some(Self::Peer),
            b'F' => Some(Self::File),
            b'D' => Some(Self::Distributed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// Direction of a transfer, as encoded in `TransferRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Download => 0,
            Self::Upload => 1,
        }
    }

    /// The direction the *other* side sees.
    pub fn reverse(&self) -> Self {
        match self {
            Self::Download => Self::Upload,
            Self::Upload => Self::Download,
        }
    }
}

/// Online status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Offline,
            1 => Self::Away,
            _ => Self::Online,
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_kind_bytes_round_trip() {
        for kind in [
            ConnectionKind::Peer,
            ConnectionKind::File,
            ConnectionKind::Distributed,
        ] {
            assert_eq!(ConnectionKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(ConnectionKind::from_byte(b'X'), None);
    }

    #[test]
    fn status_codes() {
        assert_eq!(UserStatus::from_u32(0), UserStatus::Offline);
        assert_eq!(UserStatus::from_u32(1), UserStatus::Away);
        assert_eq!(UserStatus::from_u32(2), UserStatus::Online);
        assert!(!UserStatus::Offline.is_online());
        assert!(UserStatus::Away.is_online());
    }
}
