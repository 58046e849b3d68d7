//! The wire-codec interface.
//!
//! Frame *boundaries* (the length prefix) are handled by the socket reactor;
//! a codec only turns a complete frame payload into a decoded message and
//! back. The real SoulSeek byte tables are provided by an external codec
//! implementation; [`JsonCodec`] is the symmetric reference codec used by the
//! daemon and the round-trip tests.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::messages::{distributed::DistributedMessage, peer::PeerMessage, server::ServerMessage};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message code {0}")]
    UnknownCode(u32),
}

/// Encoders and decoders for the three channel tables.
pub trait Codec: Send + 'static {
    fn encode_server(&self, msg: &ServerMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_server(&self, payload: &[u8]) -> Result<ServerMessage, CodecError>;

    fn encode_peer(&self, msg: &PeerMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_peer(&self, payload: &[u8]) -> Result<PeerMessage, CodecError>;

    fn encode_distributed(&self, msg: &DistributedMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_distributed(&self, payload: &[u8]) -> Result<DistributedMessage, CodecError>;

    /// Decode a peer message from its numeric code and raw payload. Used for
    /// the deprecated server-tunneled path, where the peer table code arrives
    /// out of band.
    fn decode_peer_code(&self, code: u32, payload: &[u8]) -> Result<PeerMessage, CodecError>;
}

/// Reference codec: serde_json payloads. Symmetric by construction.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

impl Codec for JsonCodec {
    fn encode_server(&self, msg: &ServerMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn decode_server(&self, payload: &[u8]) -> Result<ServerMessage, CodecError> {
        Self::decode(payload)
    }

    fn encode_peer(&self, msg: &PeerMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn decode_peer(&self, payload: &[u8]) -> Result<PeerMessage, CodecError> {
        Self::decode(payload)
    }

    fn encode_distributed(&self, msg: &DistributedMessage) -> Result<Vec<u8>, CodecError> {
        Self::encode(msg)
    }

    fn decode_distributed(&self, payload: &[u8]) -> Result<DistributedMessage, CodecError> {
        Self::decode(payload)
    }

    fn decode_peer_code(&self, _code: u32, payload: &[u8]) -> Result<PeerMessage, CodecError> {
        Self::decode(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        messages::peer::PeerInit, ConnectionKind, ReqId, Token, TransferDirection,
    };

    #[test]
    fn server_messages_round_trip() {
        let codec = JsonCodec;
        let msgs = [
            ServerMessage::Login {
                username: "alice".into(),
                password: "hunter2".into(),
                version: crate::CLIENT_VERSION,
                minor: crate::CLIENT_MINOR_VERSION,
            },
            ServerMessage::ConnectToPeer {
                token: Token(42),
                user: "bob".into(),
                kind: ConnectionKind::Peer,
                addr: Some((Ipv4Addr::new(1, 2, 3, 4), 2234)),
            },
            ServerMessage::PossibleParents(vec![(
                "carol".into(),
                Ipv4Addr::new(10, 0, 0, 1),
                2234,
            )]),
        ];

        for msg in msgs {
            let bytes = codec.encode_server(&msg).unwrap();
            assert_eq!(codec.decode_server(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn peer_messages_round_trip() {
        let codec = JsonCodec;
        let msgs = [
            PeerMessage::Init(PeerInit::new("alice", ConnectionKind::File)),
            PeerMessage::PierceFireWall { token: Token(7) },
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                req: ReqId(3),
                file: "music\\song.mp3".into(),
                size: 4_000_000,
            },
            PeerMessage::TransferResponse {
                req: ReqId(3),
                allowed: false,
                reason: Some("Queued".into()),
                filesize: None,
            },
        ];

        for msg in msgs {
            let bytes = codec.encode_peer(&msg).unwrap();
            assert_eq!(codec.decode_peer(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn distributed_messages_round_trip() {
        let codec = JsonCodec;
        let msg = DistributedMessage::SearchRequest {
            unknown: 0,
            user: "dave".into(),
            id: 99,
            term: "test".into(),
        };
        let bytes = codec.encode_distributed(&msg).unwrap();
        assert_eq!(codec.decode_distributed(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_is_rejected() {
        let codec = JsonCodec;
        assert!(codec.decode_peer(b"\x00\x01garbage").is_err());
    }
}
