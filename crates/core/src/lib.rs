//! Core of a SoulSeek peer-to-peer file-sharing client.
//!
//! The crate is split the way the protocol is layered:
//!
//! * [`fsm`] is the sans-IO protocol state machine: a single event loop that
//!   demultiplexes server, peer and distributed messages, maintains the
//!   peer-connection registry (including the firewall-piercing reverse
//!   handshake) and drives the transfer manager.
//! * [`net`] is the socket reactor that owns all I/O, the virtual clock and
//!   the named-timer wheel.
//! * [`common`] holds configuration and the interfaces of the external
//!   collaborators (share database, GeoIP, plugin host).
//!
//! The state machine performs no I/O and never blocks: it consumes
//! [`fsm::Event`]s and yields [`fsm::Io`] instructions, which makes every
//! protocol path testable with a simulated clock and no sockets.

pub mod common;
pub mod fsm;
pub mod net;

pub use fsm::{Command, Event, Io, Notification, StateMachine};
pub use net::{Clock, LocalDuration, LocalTime, RefClock, SocketId};
