//! Networking core types: socket handles, connection links, disconnect
//! reasons and the service interface the reactor drives.

pub mod error;
pub mod reactor;
pub mod time;

use std::{fmt, io, sync::Arc};

pub use time::{Clock, LocalDuration, LocalTime, RefClock, TimerWheel};

/// Handle of a socket owned by the reactor. The core refers to connections
/// by handle only; it never touches the socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Link direction of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

impl Link {
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Why a connection went away.
#[derive(Debug, Clone)]
pub enum Disconnect {
    /// The dial itself failed; no connection was ever established.
    DialError(Arc<io::Error>),
    /// An established connection broke.
    ConnectionError(Arc<io::Error>),
    /// The remote closed the connection.
    PeerClosed,
    /// We closed it ourselves.
    Local,
}

impl Disconnect {
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }

    /// Whether the remote refused the connection outright.
    pub fn is_refused(&self) -> bool {
        match self {
            Self::DialError(e) | Self::ConnectionError(e) => {
                e.kind() == io::ErrorKind::ConnectionRefused
            }
            _ => false,
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "dial error: {}", err),
            Self::ConnectionError(err) => write!(f, "connection error: {}", err),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// A service the reactor can drive: consumes [`crate::fsm::Event`]s one at a
/// time and yields [`crate::fsm::Io`] instructions through its iterator.
pub trait Service: Iterator<Item = crate::fsm::Io> {
    fn handle(&mut self, event: crate::fsm::Event);
}
