//! Protocol output queue.
//!
//! The state machine never performs I/O. Every effect it wants (dialing,
//! writing a frame, closing a socket, arming a timer, handing a file to the
//! reactor) is pushed onto the [`Outbox`] as an [`Io`] instruction and
//! drained by whoever drives the machine: the reactor, or a test.

use std::collections::VecDeque;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use slsk_types::{Frame, ReqId, ServerMessage};

use crate::fsm::event::Notification;
use crate::fsm::peermgr::ConnId;
use crate::net::{LocalDuration, SocketId};

/// Stable identity of a named one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// Server reconnect backoff.
    Server,
    /// 120 s indirect-connect timeout for one peer attempt.
    PeerConnect(ConnId),
    /// 30 s transfer-negotiation timeout for one request id.
    TransferRequest(ReqId),
    /// 60 s download-queue watchdog tick.
    DownloadQueue,
}

/// Output of a state transition of the protocol state machine.
#[derive(Debug)]
pub enum Io {
    /// Dial a peer or the server.
    Connect(SocketAddr),
    /// Write a frame to a socket. Per-socket FIFO order is preserved.
    Write(SocketId, Frame),
    /// Close a socket.
    Close(SocketId),
    /// Arm a named one-shot timer.
    SetTimer(TimerKey, LocalDuration),
    /// Cancel a named timer. Racy by design; a late expiry must be a no-op.
    CancelTimer(TimerKey),
    /// Hand an opened file to the reactor to receive download bytes into.
    ReceiveFile {
        socket: SocketId,
        file: File,
        offset: u64,
        size: u64,
    },
    /// Hand an opened file to the reactor to send from, starting at `offset`.
    SendFile {
        socket: SocketId,
        file: File,
        offset: u64,
    },
    /// A user-facing notification. Absent subscribers degrade to logging.
    Notify(Notification),
}

/// Holds protocol outputs and pending I/O.
///
/// Clones share the same queue, so every sub-manager gets a handle.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<Io>>>,
    /// The server socket, once the session is up. Server-bound messages are
    /// dropped with a warning while it is absent.
    server: Arc<Mutex<Option<SocketId>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, io: Io) {
        self.queue.lock().unwrap().push_back(io);
    }

    pub fn connect(&self, addr: SocketAddr) {
        self.push(Io::Connect(addr));
    }

    pub fn close(&self, socket: SocketId) {
        self.push(Io::Close(socket));
    }

    pub fn write(&self, socket: SocketId, frame: impl Into<Frame>) {
        let frame = frame.into();
        debug!(target: "slsk", "sending {:?} on {}", frame, socket);
        self.push(Io::Write(socket, frame));
    }

    /// Send a message on the server channel.
    pub fn to_server(&self, msg: ServerMessage) {
        match *self.server.lock().unwrap() {
            Some(socket) => self.write(socket, msg),
            None => warn!(target: "slsk", "no server connection, dropping {:?}", msg),
        }
    }

    pub fn set_server(&self, socket: Option<SocketId>) {
        *self.server.lock().unwrap() = socket;
    }

    pub fn server_socket(&self) -> Option<SocketId> {
        *self.server.lock().unwrap()
    }

    pub fn set_timer(&self, key: TimerKey, duration: LocalDuration) {
        self.push(Io::SetTimer(key, duration));
    }

    pub fn cancel_timer(&self, key: TimerKey) {
        self.push(Io::CancelTimer(key));
    }

    pub fn notify(&self, notification: Notification) {
        self.push(Io::Notify(notification));
    }
}
