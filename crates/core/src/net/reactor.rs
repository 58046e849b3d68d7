//! Poll-based socket reactor. A single-threaded `poll` loop that owns every
//! socket, frames and decodes inbound traffic, writes queued frames, runs
//! the named timers and the file phase of transfers, and feeds the state
//! machine one event at a time. It never touches protocol state.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{self, SocketAddr};
use std::sync::Arc;
use crate::net::time::Clock;
use std::time::SystemTime;

use flume as chan;
use tracing::{debug, error, trace, warn};

use slsk_types::{codec::Codec, ConnectionKind, Frame, PeerMessage, ServerMessage};

use crate::fsm::event::{Command, Event, Notification};
use crate::fsm::output::{Io, TimerKey};
use crate::net::error::Error;
use crate::net::time::TimerWheel;
use crate::net::{Disconnect, Link, LocalDuration, RefClock, Service, SocketId};

/// Maximum amount of time to wait for i/o.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;
/// File chunk size for uploads.
const FILE_CHUNK_SIZE: usize = 64 * 1024;
/// Frames larger than this are considered garbage.
const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Poll source key.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Listener,
    Waker,
    Socket(SocketId),
}

/// Which message table a socket speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Server,
    Peer,
    Distributed,
    /// File socket, still exchanging framed messages (`FileTransferInit`).
    File,
}

/// The byte phase of a file socket, once the core handed us a file.
enum FilePhase {
    /// Download: write our resume offset, then sink bytes into the file.
    Receiving { file: File, written: u64, size: u64 },
    /// Upload: wait for the remote's 8-byte resume offset.
    AwaitingOffset { file: File },
    /// Upload: stream the file from `offset`.
    Sending { file: File, offset: u64, sent: u64 },
}

struct Conn {
    stream: net::TcpStream,
    addr: SocketAddr,
    link: Link,
    channel: Channel,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    transfer: Option<FilePhase>,
}

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor<C> {
    codec: C,
    sources: popol::Sources<Source>,
    sockets: HashMap<SocketId, Conn>,
    /// Sockets dialed but not yet writable.
    connecting: HashMap<SocketId, SocketAddr>,
    next_socket: u64,
    timers: TimerWheel<TimerKey>,
    waker: Waker,
    clock: RefClock,
    notifications: chan::Sender<Notification>,
}

impl<C: Codec> Reactor<C> {
    pub fn new(
        codec: C,
        clock: RefClock,
        notifications: chan::Sender<Notification>,
    ) -> Result<Self, io::Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker(Arc::new(popol::Waker::new(&mut sources, Source::Waker)?));

        Ok(Self {
            codec,
            sources,
            sockets: HashMap::new(),
            connecting: HashMap::new(),
            next_socket: 0,
            timers: TimerWheel::new(),
            waker,
            clock,
            notifications,
        })
    }

    /// A waker for the command-sending thread.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Run the service until the command channel closes.
    pub fn run<S: Service>(
        &mut self,
        listen_addr: Option<SocketAddr>,
        mut service: S,
        commands: chan::Receiver<Command>,
    ) -> Result<(), Error> {
        let listener = match listen_addr {
            Some(addr) => {
                let listener = listen(addr)?;
                let port = listener.local_addr()?.port();
                self.sources
                    .register(Source::Listener, &listener, popol::interest::READ);
                debug!(target: "net", "listening for connections on port {}", port);
                service.handle(Event::Listening { port });
                Some(listener)
            }
            None => None,
        };

        let mut events = Vec::with_capacity(32);
        let mut woken = Vec::with_capacity(32);

        self.clock.set(SystemTime::now().into());
        self.process(&mut service);

        loop {
            let now = self.clock.local_time();
            let timeout = self
                .timers
                .next(now)
                .map(|t| t.min(WAIT_TIMEOUT))
                .unwrap_or(WAIT_TIMEOUT);

            trace!(target: "net",
                   "polling {} source(s) and {} timer(s), waking up in {}",
                   self.sources.len(), self.timers.len(), timeout);

            let result = self.sources.wait_timeout(&mut events, timeout.into());
            self.clock.set(SystemTime::now().into());
            let now = self.clock.local_time();

            match result {
                Ok(_) => {
                    for event in events.drain(..) {
                        match event.key.clone() {
                            Source::Socket(id) => self.socket_event(id, &event, &mut service),
                            Source::Listener => self.accept_all(&listener, &mut service),
                            Source::Waker => {
                                popol::Waker::reset(event.source).ok();
                                loop {
                                    match commands.try_recv() {
                                        Ok(cmd) => service.handle(Event::Command(cmd)),
                                        Err(chan::TryRecvError::Empty) => break,
                                        Err(chan::TryRecvError::Disconnected) => return Ok(()),
                                    }
                                }
                            }
                        }
                        self.process(&mut service);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }

            self.timers.wake(now, &mut woken);
            for key in woken.drain(..) {
                service.handle(Event::TimerExpired(key));
                self.process(&mut service);
            }

            if commands.is_disconnected() && commands.is_empty() {
                return Ok(());
            }
        }
    }

    /// Drain the service outbox and apply each instruction.
    fn process<S: Service>(&mut self, service: &mut S) {
        let now = self.clock.local_time();

        while let Some(out) = service.next() {
            match out {
                Io::Connect(addr) => self.dial(addr, service),
                Io::Write(id, frame) => self.write_frame(id, frame),
                Io::Close(id) => {
                    if let Some(conn) = self.sockets.get(&id) {
                        conn.stream.shutdown(net::Shutdown::Both).ok();
                    }
                    self.unregister(id);
                }
                Io::SetTimer(key, duration) => {
                    self.timers.register(key, now + duration);
                }
                Io::CancelTimer(key) => {
                    self.timers.cancel(&key);
                }
                Io::ReceiveFile { socket, file, offset, size } => {
                    self.receive_file(socket, file, offset, size);
                }
                Io::SendFile { socket, file, .. } => {
                    if let Some(conn) = self.sockets.get_mut(&socket) {
                        conn.transfer = Some(FilePhase::AwaitingOffset { file });
                    }
                }
                Io::Notify(notification) => {
                    trace!(target: "net", "notification: {:?}", notification);
                    self.notifications.send(notification).ok();
                }
            }
        }
    }

    fn next_socket(&mut self) -> SocketId {
        self.next_socket += 1;
        SocketId(self.next_socket)
    }

    fn register(&mut self, stream: net::TcpStream, addr: SocketAddr, link: Link) -> SocketId {
        let id = self.next_socket();
        self.sources
            .register(Source::Socket(id), &stream, popol::interest::ALL);
        self.sockets.insert(
            id,
            Conn {
                stream,
                addr,
                link,
                channel: Channel::Peer,
                read_buf: Vec::new(),
                write_buf: VecDeque::new(),
                transfer: None,
            },
        );
        id
    }

    fn unregister(&mut self, id: SocketId) {
        self.connecting.remove(&id);
        self.sockets.remove(&id);
        self.sources.unregister(&Source::Socket(id));
    }

    fn dial<S: Service>(&mut self, addr: SocketAddr, service: &mut S) {
        match dial(&addr) {
            Ok(stream) => {
                let id = self.register(stream, addr, Link::Outbound);
                self.connecting.insert(id, addr);
            }
            Err(err) => {
                error!(target: "net", "{}: dial error: {}", addr, err);
                service.handle(Event::ConnectFailed {
                    addr,
                    err: Arc::new(err),
                });
            }
        }
    }

    fn accept_all<S: Service>(&mut self, listener: &Option<net::TcpListener>, service: &mut S) {
        while let Some(listener) = listener {
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "net", "accept error: {}", e);
                    break;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                error!(target: "net", "{}: couldn't accept: {}", addr, e);
                continue;
            }

            let id = self.register(stream, addr, Link::Inbound);
            trace!(target: "net", "{}: accepted peer connection as {}", addr, id);
            service.handle(Event::Connected {
                socket: id,
                addr,
                link: Link::Inbound,
            });
        }
    }

    fn socket_event<S: Service>(
        &mut self,
        id: SocketId,
        event: &popol::Event<Source>,
        service: &mut S,
    ) {
        if event.is_invalid() {
            // The descriptor was closed under us; the source wasn't properly
            // unregistered.
            error!(target: "net", "{}: socket is invalid, removing", id);
            self.sources.unregister(&event.key);
            self.sockets.remove(&id);
            return;
        }

        // A connecting socket becomes writable (or errors) when the dial
        // resolves.
        if let Some(addr) = self.connecting.remove(&id) {
            let err = self
                .sockets
                .get(&id)
                .and_then(|c| c.stream.take_error().ok().flatten());
            if let Some(err) = err {
                self.unregister(id);
                service.handle(Event::ConnectFailed {
                    addr,
                    err: Arc::new(err),
                });
                return;
            }
            service.handle(Event::Connected {
                socket: id,
                addr,
                link: Link::Outbound,
            });
            self.process(service);
        }

        if event.is_writable() {
            self.writable(id, service);
        }
        if event.is_readable() || event.is_hangup() || event.is_error() {
            self.readable(id, service);
        }
    }

    fn disconnect<S: Service>(&mut self, id: SocketId, reason: Disconnect, service: &mut S) {
        let addr = match self.sockets.get(&id) {
            Some(conn) => {
                conn.stream.shutdown(net::Shutdown::Both).ok();
                conn.addr
            }
            None => return,
        };
        self.unregister(id);
        service.handle(Event::Disconnected {
            socket: id,
            addr,
            reason,
        });
    }

    // Reads //////////////////////////////////////////////////////////////////

    fn readable<S: Service>(&mut self, id: SocketId, service: &mut S) {
        let mut buffer = [0; READ_BUFFER_SIZE];

        let conn = match self.sockets.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };

        match conn.stream.read(&mut buffer) {
            Ok(0) => {
                self.disconnect(id, Disconnect::PeerClosed, service);
            }
            Ok(count) => {
                conn.read_buf.extend_from_slice(&buffer[..count]);
                self.drain_read_buffer(id, service);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                trace!(target: "net", "{}: read error: {}", id, err);
                self.disconnect(id, Disconnect::ConnectionError(Arc::new(err)), service);
            }
        }
    }

    /// Parse as much of the buffered input as possible: raw file bytes in a
    /// transfer phase, length-prefixed frames otherwise.
    fn drain_read_buffer<S: Service>(&mut self, id: SocketId, service: &mut S) {
        loop {
            let conn = match self.sockets.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };

            match &mut conn.transfer {
                Some(FilePhase::Receiving { file, written, size }) => {
                    if conn.read_buf.is_empty() {
                        return;
                    }
                    let chunk = std::mem::take(&mut conn.read_buf);
                    if let Err(err) = file.write_all(&chunk) {
                        let err = Arc::new(err);
                        service.handle(Event::FileError { socket: id, err });
                        return;
                    }
                    *written += chunk.len() as u64;
                    let bytes = *written;
                    let done = *written >= *size;
                    service.handle(Event::FileProgress { socket: id, bytes });
                    if done {
                        return;
                    }
                }
                Some(FilePhase::AwaitingOffset { .. }) => {
                    if conn.read_buf.len() < 8 {
                        return;
                    }
                    let mut offset_bytes = [0u8; 8];
                    offset_bytes.copy_from_slice(&conn.read_buf[..8]);
                    conn.read_buf.drain(..8);
                    let offset = u64::from_le_bytes(offset_bytes);

                    if let Some(FilePhase::AwaitingOffset { mut file }) = conn.transfer.take() {
                        if let Err(err) = file.seek(SeekFrom::Start(offset)) {
                            let err = Arc::new(err);
                            service.handle(Event::FileError { socket: id, err });
                            return;
                        }
                        conn.transfer = Some(FilePhase::Sending {
                            file,
                            offset,
                            sent: 0,
                        });
                        if let Some(source) = self.sources.get_mut(&Source::Socket(id)) {
                            source.set(popol::interest::WRITE);
                        }
                    }
                }
                Some(FilePhase::Sending { .. }) => {
                    // The downloader shouldn't talk during the stream.
                    conn.read_buf.clear();
                    return;
                }
                None => {
                    // Framed message: u32 length prefix, then the payload.
                    if conn.read_buf.len() < 4 {
                        return;
                    }
                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&conn.read_buf[..4]);
                    let frame_len = u32::from_le_bytes(len_bytes) as usize;

                    if frame_len > MAX_FRAME_SIZE {
                        warn!(target: "net", "{}: oversized frame ({} bytes)", id, frame_len);
                        self.disconnect(
                            id,
                            Disconnect::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::InvalidData,
                            ))),
                            service,
                        );
                        return;
                    }
                    if conn.read_buf.len() < 4 + frame_len {
                        return;
                    }
                    let payload: Vec<u8> = conn.read_buf[4..4 + frame_len].to_vec();
                    conn.read_buf.drain(..4 + frame_len);
                    let channel = conn.channel;

                    if !self.decode_frame(id, channel, &payload, service) {
                        return;
                    }
                }
            }
        }
    }

    /// Decode one frame payload and feed it to the service. Returns false if
    /// the socket died in the process.
    fn decode_frame<S: Service>(
        &mut self,
        id: SocketId,
        channel: Channel,
        payload: &[u8],
        service: &mut S,
    ) -> bool {
        let frame = match channel {
            Channel::Server => self.codec.decode_server(payload).map(Frame::Server),
            Channel::Peer | Channel::File => self.codec.decode_peer(payload).map(Frame::Peer),
            Channel::Distributed => self
                .codec
                .decode_distributed(payload)
                .map(Frame::Distributed),
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "net", "{}: decode error: {}", id, err);
                self.disconnect(
                    id,
                    Disconnect::ConnectionError(Arc::new(io::Error::from(
                        io::ErrorKind::InvalidData,
                    ))),
                    service,
                );
                return false;
            }
        };

        // An identification frame fixes the socket's message table.
        if let Frame::Peer(PeerMessage::Init(init)) = &frame {
            self.set_channel(id, init.kind);
        }

        // The deprecated tunneled path: decode the relayed payload through
        // the peer table and re-inject it as if it came from the peer.
        if let Frame::Server(ServerMessage::TunneledMessage { user, req, code, addr, payload }) =
            &frame
        {
            match self.codec.decode_peer_code(*code, payload) {
                Ok(message) => {
                    service.handle(Event::Tunneled {
                        user: user.clone(),
                        req: *req,
                        addr: *addr,
                        message,
                    });
                    return true;
                }
                Err(err) => {
                    debug!(target: "net", "unknown tunneled message: {}", err);
                }
            }
        }

        service.handle(Event::Frame { socket: id, frame });
        true
    }

    fn set_channel(&mut self, id: SocketId, kind: ConnectionKind) {
        if let Some(conn) = self.sockets.get_mut(&id) {
            conn.channel = match kind {
                ConnectionKind::Peer => Channel::Peer,
                ConnectionKind::Distributed => Channel::Distributed,
                ConnectionKind::File => Channel::File,
            };
        }
    }

    // Writes /////////////////////////////////////////////////////////////////

    fn write_frame(&mut self, id: SocketId, frame: Frame) {
        let channel = match self.sockets.get(&id) {
            Some(conn) => conn.channel,
            None => {
                debug!(target: "net", "{}: write on closed socket, dropping frame", id);
                return;
            }
        };

        // The first server frame marks the socket as the server channel.
        let channel = match &frame {
            Frame::Server(_) => {
                if let Some(conn) = self.sockets.get_mut(&id) {
                    conn.channel = Channel::Server;
                }
                Channel::Server
            }
            _ => channel,
        };

        let encoded = match &frame {
            Frame::Server(msg) => self.codec.encode_server(msg),
            Frame::Peer(msg) => self.codec.encode_peer(msg),
            Frame::Distributed(msg) => self.codec.encode_distributed(msg),
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(err) => {
                error!(target: "net", "{}: encode error on {:?} channel: {}", id, channel, err);
                return;
            }
        };

        if let Frame::Peer(PeerMessage::Init(init)) = &frame {
            self.set_channel(id, init.kind);
        }

        if let Some(conn) = self.sockets.get_mut(&id) {
            conn.write_buf
                .extend((payload.len() as u32).to_le_bytes());
            conn.write_buf.extend(payload);
            if let Some(source) = self.sources.get_mut(&Source::Socket(id)) {
                source.set(popol::interest::WRITE);
            }
        }
    }

    fn receive_file(&mut self, id: SocketId, file: File, offset: u64, size: u64) {
        if let Some(conn) = self.sockets.get_mut(&id) {
            // The downloader opens the byte phase by sending its resume
            // offset.
            conn.write_buf.extend(offset.to_le_bytes());
            conn.transfer = Some(FilePhase::Receiving {
                file,
                written: offset,
                size,
            });
            if let Some(source) = self.sources.get_mut(&Source::Socket(id)) {
                source.set(popol::interest::WRITE);
            }
        }
    }

    fn writable<S: Service>(&mut self, id: SocketId, service: &mut S) {
        let conn = match self.sockets.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };

        // Flush the buffered frames first.
        while !conn.write_buf.is_empty() {
            let (chunk, _) = conn.write_buf.as_slices();
            match conn.stream.write(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    conn.write_buf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(err) => {
                    error!(target: "net", "{}: write error: {}", id, err);
                    self.disconnect(id, Disconnect::ConnectionError(Arc::new(err)), service);
                    return;
                }
            }
        }

        // Then stream file bytes, if this socket is in its sending phase.
        let mut progress = None;
        let mut file_error = None;
        let mut keep_writing = false;

        if let Some(FilePhase::Sending { file, offset, sent }) = &mut conn.transfer {
            let mut chunk = [0u8; FILE_CHUNK_SIZE];
            match file.read(&mut chunk) {
                Ok(0) => {
                    // Everything sent; the downloader closes when done.
                }
                Ok(count) => match conn.stream.write(&chunk[..count]) {
                    Ok(n) => {
                        *sent += n as u64;
                        if n < count {
                            // Rewind what the socket didn't take.
                            if let Err(err) =
                                file.seek(SeekFrom::Start(*offset + *sent))
                            {
                                file_error = Some(err);
                            }
                        }
                        progress = Some(*offset + *sent);
                        keep_writing = true;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(err) = file.seek(SeekFrom::Start(*offset + *sent)) {
                            file_error = Some(err);
                        }
                        keep_writing = true;
                    }
                    Err(err) => {
                        error!(target: "net", "{}: write error: {}", id, err);
                        self.disconnect(
                            id,
                            Disconnect::ConnectionError(Arc::new(err)),
                            service,
                        );
                        return;
                    }
                },
                Err(err) => file_error = Some(err),
            }
        }

        if let Some(err) = file_error {
            service.handle(Event::FileError {
                socket: id,
                err: Arc::new(err),
            });
            return;
        }
        if let Some(source) = self.sources.get_mut(&Source::Socket(id)) {
            if keep_writing {
                source.set(popol::interest::WRITE);
            } else {
                source.unset(popol::interest::WRITE);
            }
        }
        if let Some(bytes) = progress {
            service.handle(Event::FileProgress { socket: id, bytes });
        }
    }
}

/// Connect to a peer given a remote address.
fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Listen for connections on the given address.
fn listen(addr: SocketAddr) -> Result<net::TcpListener, io::Error> {
    let sock = net::TcpListener::bind(addr)?;

    sock.set_nonblocking(true)?;

    Ok(sock)
}
