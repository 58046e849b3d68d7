//! Peer connection registry and handshake.
//!
//! One [`PeerConn`] per logical peer interaction attempt. Entries are indexed
//! by socket handle, by `(user, kind)` and by reverse-connect token. The
//! direct/indirect handshake lives here: a failed direct dial converts the
//! entry to an indirect attempt with a freshly minted token, and the entry is
//! dropped on success, explicit `CantConnectToPeer`, timeout or replacement.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tracing::{debug, warn};

use slsk_types::{
    messages::peer::PeerInit, ConnectionKind, PeerMessage, ReqId, ServerMessage, Token,
    TransferDirection,
};

use crate::fsm::output::{Outbox, TimerKey};
use crate::net::{LocalDuration, SocketId};

/// How long we wait for a firewalled peer to pierce back.
pub const CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_secs(120);
/// Give up re-requesting an address after this many port-0 replies.
pub const MAX_ADDR_RETRIES: u32 = 10;

/// Registry-internal connection id. Stable for the lifetime of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// One peer interaction attempt.
#[derive(Debug)]
pub struct PeerConn {
    pub id: ConnId,
    pub user: String,
    pub kind: ConnectionKind,
    pub addr: Option<(Ipv4Addr, u16)>,
    pub socket: Option<SocketId>,
    /// Outbound messages queued until the socket is ready. Drained exactly
    /// when `socket` transitions from `None` to a live socket.
    pub pending: Vec<PeerMessage>,
    pub token: Option<Token>,
    pub init: PeerInit,
    /// Port-0 address re-request counter.
    pub try_addr: Option<u32>,
}

impl PeerConn {
    /// Transfer requests waiting on this connection, for status feedback.
    pub(crate) fn pending_transfer_reqs(&self) -> Vec<(ReqId, TransferDirection)> {
        self.pending
            .iter()
            .filter_map(|m| match m {
                PeerMessage::TransferRequest { req, direction, .. } => Some((*req, *direction)),
                _ => None,
            })
            .collect()
    }

    /// Request ids of pending transfer and file-init messages, for the
    /// cannot-connect path.
    pub(crate) fn pending_reqs(&self) -> Vec<ReqId> {
        self.pending
            .iter()
            .filter_map(|m| match m {
                PeerMessage::TransferRequest { req, .. } => Some(*req),
                PeerMessage::FileTransferInit { req } => Some(*req),
                _ => None,
            })
            .collect()
    }
}

/// What happened to a dial that failed.
#[derive(Debug)]
pub enum ConnectErrorOutcome {
    /// Converted to an indirect attempt: `ConnectToPeer` sent, 120 s timer
    /// armed. The user should be marked as behind a firewall.
    Indirect {
        user: String,
        reqs: Vec<(ReqId, TransferDirection)>,
    },
    /// Both ways failed: `CantConnectToPeer` sent, entry removed.
    Gone { user: String, reqs: Vec<ReqId> },
    /// No matching attempt; not ours to handle.
    Unmatched,
}

/// Result of an address reply for a waiting connection.
#[derive(Debug)]
pub enum AddressOutcome {
    /// The address was accepted and an outbound dial was issued.
    Dialing {
        user: String,
        reqs: Vec<(ReqId, TransferDirection)>,
    },
    /// Port 0: the address was re-requested.
    Retry { user: String, tries: u32 },
    /// No connection was waiting for this user's address.
    NoPending,
}

/// A connection whose socket just came up; pending messages were flushed.
#[derive(Debug)]
pub struct OpenedConn {
    pub id: ConnId,
    pub user: String,
    pub kind: ConnectionKind,
    pub socket: SocketId,
    /// The messages that were drained onto the socket, for cross-manager
    /// feedback (transfer status updates, browse windows).
    pub drained: Vec<PeerMessage>,
}

#[derive(Debug)]
pub struct PeerManager {
    /// Our login, stamped into every `PeerInit` we send.
    login: String,
    conns: HashMap<ConnId, PeerConn>,
    by_socket: HashMap<SocketId, ConnId>,
    by_token: HashMap<Token, ConnId>,
    by_user: HashMap<(String, ConnectionKind), Vec<ConnId>>,
    next_id: u64,
    rng: fastrand::Rng,
    upstream: Outbox,
}

impl PeerManager {
    pub fn new(login: String, rng: fastrand::Rng, upstream: Outbox) -> Self {
        Self {
            login,
            conns: HashMap::new(),
            by_socket: HashMap::new(),
            by_token: HashMap::new(),
            by_user: HashMap::new(),
            next_id: 0,
            rng,
            upstream,
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn set_login(&mut self, login: String) {
        self.login = login;
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, id: ConnId) -> Option<&PeerConn> {
        self.conns.get(&id)
    }

    pub fn by_socket(&self, socket: SocketId) -> Option<&PeerConn> {
        self.by_socket.get(&socket).and_then(|id| self.conns.get(id))
    }

    pub fn user_for_socket(&self, socket: SocketId) -> Option<&str> {
        self.by_socket(socket).map(|c| c.user.as_str())
    }

    /// A live generic peer connection for this user, if one exists.
    pub fn usable_peer(&self, user: &str) -> Option<&PeerConn> {
        self.by_user
            .get(&(user.to_owned(), ConnectionKind::Peer))
            .into_iter()
            .flatten()
            .filter_map(|id| self.conns.get(id))
            .find(|c| c.socket.is_some())
    }

    /// All distributed-search connections.
    pub fn distributed(&self) -> impl Iterator<Item = &PeerConn> {
        self.conns
            .values()
            .filter(|c| c.kind == ConnectionKind::Distributed)
    }

    pub fn mint_token(&mut self) -> Token {
        Token(self.rng.u32(..))
    }

    fn insert(&mut self, conn: PeerConn) -> ConnId {
        let id = conn.id;
        if let Some(socket) = conn.socket {
            self.by_socket.insert(socket, id);
        }
        if let Some(token) = conn.token {
            self.by_token.insert(token, id);
        }
        self.by_user
            .entry((conn.user.clone(), conn.kind))
            .or_default()
            .push(id);
        self.conns.insert(id, conn);
        id
    }

    fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    /// Register an outbound interaction attempt created by
    /// `request_to_peer`. The caller has already decided whether this is a
    /// direct dial (token `None`) or a server-relayed request.
    pub fn add_request(
        &mut self,
        user: &str,
        kind: ConnectionKind,
        addr: Option<(Ipv4Addr, u16)>,
        token: Option<Token>,
        pending: Vec<PeerMessage>,
    ) -> ConnId {
        let id = self.next_id();
        let conn = PeerConn {
            id,
            user: user.to_owned(),
            kind,
            addr,
            socket: None,
            pending,
            token,
            init: PeerInit::new(self.login.clone(), kind),
            try_addr: None,
        };
        let id = self.insert(conn);

        if token.is_some() {
            self.upstream
                .set_timer(TimerKey::PeerConnect(id), CONNECT_TIMEOUT);
        }
        id
    }

    /// The server relayed a `ConnectToPeer` request: the remote wants us to
    /// dial them and pierce with their token.
    pub fn add_reverse_request(
        &mut self,
        user: &str,
        kind: ConnectionKind,
        addr: (Ipv4Addr, u16),
        token: Token,
    ) -> ConnId {
        let id = self.next_id();
        self.insert(PeerConn {
            id,
            user: user.to_owned(),
            kind,
            addr: Some(addr),
            socket: None,
            pending: Vec::new(),
            token: Some(token),
            init: PeerInit::new(user.to_owned(), kind),
            try_addr: None,
        });
        self.upstream
            .connect(SocketAddr::V4(SocketAddrV4::new(addr.0, addr.1)));
        id
    }

    /// An incoming connection identified itself with `PeerInit`.
    pub fn add_inbound(
        &mut self,
        socket: SocketId,
        addr: Option<(Ipv4Addr, u16)>,
        init: PeerInit,
    ) -> ConnId {
        let id = self.next_id();
        self.insert(PeerConn {
            id,
            user: init.user.clone(),
            kind: init.kind,
            addr,
            socket: Some(socket),
            pending: Vec::new(),
            token: None,
            init,
            try_addr: None,
        })
    }

    /// An outbound socket opened. Write the identification frame (`PeerInit`
    /// for direct attempts, `PierceFireWall` for relayed ones), then flush
    /// the pending messages in order.
    pub fn socket_opened(&mut self, addr: SocketAddr, socket: SocketId) -> Option<OpenedConn> {
        let peer_addr = match addr {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(_) => return None,
        };

        let id = self
            .conns
            .values()
            .find(|c| c.addr == Some(peer_addr) && c.socket.is_none())
            .map(|c| c.id)?;

        let conn = self.conns.get_mut(&id)?;
        match conn.token {
            None => self
                .upstream
                .write(socket, PeerMessage::Init(conn.init.clone())),
            Some(token) => self
                .upstream
                .write(socket, PeerMessage::PierceFireWall { token }),
        }

        Some(self.attach_socket(id, socket))
    }

    /// The remote pierced back with a token we relayed earlier.
    pub fn pierced(&mut self, token: Token, socket: SocketId) -> Option<OpenedConn> {
        let id = *self.by_token.get(&token)?;
        let conn = self.conns.get(&id)?;
        if conn.socket.is_some() {
            return None;
        }

        self.upstream.cancel_timer(TimerKey::PeerConnect(id));
        self.upstream
            .write(socket, PeerMessage::Init(conn.init.clone()));

        Some(self.attach_socket(id, socket))
    }

    /// Attach a live socket and drain pending messages. Upholds the
    /// invariant that `pending` is empty whenever `socket` is set.
    fn attach_socket(&mut self, id: ConnId, socket: SocketId) -> OpenedConn {
        let conn = self.conns.get_mut(&id).expect("conn exists");

        conn.socket = Some(socket);
        let drained = std::mem::take(&mut conn.pending);
        for msg in &drained {
            self.upstream.write(socket, msg.clone());
        }
        self.by_socket.insert(socket, id);

        debug!(target: "slsk", "{}: {} connection to {} is up, {} message(s) flushed",
               id, conn.kind, conn.user, drained.len());

        OpenedConn {
            id,
            user: conn.user.clone(),
            kind: conn.kind,
            socket,
            drained,
        }
    }

    /// Attach an already-open socket to an existing entry and send one
    /// message on it (the short-circuit path of `request_to_peer`).
    pub fn send_on(&self, socket: SocketId, msg: PeerMessage) {
        self.upstream.write(socket, msg);
    }

    /// A dial failed. Direct attempts convert to indirect; indirect attempts
    /// give up and tell the server.
    pub fn connect_error(&mut self, addr: SocketAddr) -> ConnectErrorOutcome {
        let peer_addr = match addr {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(_) => return ConnectErrorOutcome::Unmatched,
        };

        let id = match self
            .conns
            .values()
            .find(|c| c.addr == Some(peer_addr) && c.socket.is_none())
        {
            Some(c) => c.id,
            None => return ConnectErrorOutcome::Unmatched,
        };

        let has_token = self.conns[&id].token.is_some();
        if !has_token {
            let token = self.mint_token();
            let conn = self.conns.get_mut(&id).expect("conn exists");
            conn.token = Some(token);
            let user = conn.user.clone();
            let kind = conn.kind;
            let reqs = conn.pending_transfer_reqs();

            self.by_token.insert(token, id);
            self.upstream.to_server(ServerMessage::ConnectToPeer {
                token,
                user: user.clone(),
                kind,
                addr: None,
            });
            self.upstream
                .set_timer(TimerKey::PeerConnect(id), CONNECT_TIMEOUT);

            ConnectErrorOutcome::Indirect { user, reqs }
        } else {
            let conn = self.remove(id).expect("conn exists");
            let token = conn.token.expect("indirect attempt has a token");

            warn!(target: "slsk", "can't connect to {}, sending notification via the server",
                  conn.user);
            self.upstream.to_server(ServerMessage::CantConnectToPeer {
                token,
                user: conn.user.clone(),
            });

            let reqs = conn.pending_reqs();
            ConnectErrorOutcome::Gone {
                user: conn.user,
                reqs,
            }
        }
    }

    /// The remote reported that its own dial to us failed too.
    pub fn cant_connect(&mut self, token: Token) -> Option<PeerConn> {
        let id = *self.by_token.get(&token)?;
        let conn = self.remove(id)?;
        warn!(target: "slsk", "can't connect to {} (either way), giving up", conn.user);
        Some(conn)
    }

    /// The 120 s indirect-connect timer fired. Behaves like a final
    /// `CantConnectToPeer`; a stale id (entry already gone) is a no-op.
    pub fn connect_timeout(&mut self, id: ConnId) -> Option<PeerConn> {
        let conn = self.remove(id)?;
        warn!(target: "slsk", "user {} does not respond to connect request, giving up",
              conn.user);
        Some(conn)
    }

    /// Address reply for a user. Handles the port-0 retry dance: replies with
    /// port 0 are re-requested up to [`MAX_ADDR_RETRIES`] times, after which
    /// the zero port is accepted and dialed anyway.
    pub fn address_resolved(&mut self, user: &str, ip: Ipv4Addr, port: u16) -> AddressOutcome {
        let id = match self
            .conns
            .values()
            .find(|c| c.user == user && c.addr.is_none())
        {
            Some(c) => c.id,
            None => return AddressOutcome::NoPending,
        };
        let conn = self.conns.get_mut(&id).expect("conn exists");

        if port != 0 || conn.try_addr == Some(MAX_ADDR_RETRIES) {
            match conn.try_addr {
                Some(tries) if tries == MAX_ADDR_RETRIES => {
                    warn!(target: "slsk",
                          "server reported port 0 for the {}th time for user {}, giving up",
                          tries, user);
                }
                Some(tries) => {
                    debug!(target: "slsk",
                           "server reported non-zero port for user {} after {} retries",
                           user, tries);
                }
                None => {}
            }
            conn.addr = Some((ip, port));
            conn.try_addr = None;
            let reqs = conn.pending_transfer_reqs();

            self.upstream
                .connect(SocketAddr::V4(SocketAddrV4::new(ip, port)));

            AddressOutcome::Dialing {
                user: user.to_owned(),
                reqs,
            }
        } else {
            let tries = conn.try_addr.map_or(1, |t| t + 1);
            conn.try_addr = Some(tries);
            debug!(target: "slsk", "server reported port 0 for user {}, retrying", user);

            AddressOutcome::Retry {
                user: user.to_owned(),
                tries,
            }
        }
    }

    /// Remove the entry attached to a socket that closed.
    pub fn socket_closed(&mut self, socket: SocketId) -> Option<PeerConn> {
        let id = self.by_socket.get(&socket).copied()?;
        self.remove(id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<PeerConn> {
        let conn = self.conns.remove(&id)?;

        if let Some(socket) = conn.socket {
            self.by_socket.remove(&socket);
        }
        if let Some(token) = conn.token {
            self.by_token.remove(&token);
        }
        if let Some(ids) = self.by_user.get_mut(&(conn.user.clone(), conn.kind)) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_user.remove(&(conn.user.clone(), conn.kind));
            }
        }
        self.upstream.cancel_timer(TimerKey::PeerConnect(id));

        Some(conn)
    }

    /// Drop every entry. Called on server disconnect.
    pub fn clear(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.remove(id) {
                if let Some(socket) = conn.socket {
                    self.upstream.close(socket);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn pending_is_empty_when_connected(&self) -> bool {
        self.conns
            .values()
            .all(|c| c.socket.is_none() || c.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Io;
    use slsk_types::Frame;

    fn manager() -> (PeerManager, Outbox) {
        let outbox = Outbox::new();
        outbox.set_server(Some(SocketId(1)));
        let rng = fastrand::Rng::with_seed(7);
        (
            PeerManager::new("me".into(), rng, outbox.clone()),
            outbox,
        )
    }

    fn peer_writes(outbox: &mut Outbox) -> Vec<(SocketId, PeerMessage)> {
        outbox
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(s, Frame::Peer(m)) => Some((s, m)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pending_messages_flush_in_order_on_open() {
        let (mut mgr, mut outbox) = manager();
        let addr = (Ipv4Addr::new(1, 2, 3, 4), 2234);

        mgr.add_request(
            "alice",
            ConnectionKind::Peer,
            Some(addr),
            None,
            vec![
                PeerMessage::GetSharedFileList,
                PeerMessage::UserInfoRequest,
            ],
        );
        outbox.by_ref().count();

        let opened = mgr
            .socket_opened(
                SocketAddr::V4(SocketAddrV4::new(addr.0, addr.1)),
                SocketId(5),
            )
            .unwrap();
        assert_eq!(opened.drained.len(), 2);

        let writes = peer_writes(&mut outbox);
        assert!(matches!(writes[0].1, PeerMessage::Init(_)));
        assert!(matches!(writes[1].1, PeerMessage::GetSharedFileList));
        assert!(matches!(writes[2].1, PeerMessage::UserInfoRequest));
        assert!(mgr.pending_is_empty_when_connected());
    }

    #[test]
    fn pierce_writes_init_and_flushes() {
        let (mut mgr, mut outbox) = manager();

        let id = mgr.add_request(
            "bob",
            ConnectionKind::Peer,
            None,
            Some(Token(99)),
            vec![PeerMessage::GetSharedFileList],
        );
        outbox.by_ref().count();

        let opened = mgr.pierced(Token(99), SocketId(8)).unwrap();
        assert_eq!(opened.id, id);

        let writes = peer_writes(&mut outbox);
        assert!(matches!(writes[0].1, PeerMessage::Init(_)));
        assert!(matches!(writes[1].1, PeerMessage::GetSharedFileList));

        // A second pierce with the same token finds the socket attached.
        assert!(mgr.pierced(Token(99), SocketId(9)).is_none());
    }

    #[test]
    fn direct_failure_converts_to_indirect_then_gives_up() {
        let (mut mgr, mut outbox) = manager();
        let addr = (Ipv4Addr::new(9, 9, 9, 9), 1);
        let sock_addr = SocketAddr::V4(SocketAddrV4::new(addr.0, addr.1));

        mgr.add_request("carol", ConnectionKind::Peer, Some(addr), None, vec![]);
        outbox.by_ref().count();

        match mgr.connect_error(sock_addr) {
            ConnectErrorOutcome::Indirect { user, .. } => assert_eq!(user, "carol"),
            other => panic!("expected indirect, got {:?}", other),
        }
        let sent: Vec<Io> = outbox.by_ref().collect();
        assert!(sent.iter().any(|io| matches!(
            io,
            Io::Write(_, Frame::Server(ServerMessage::ConnectToPeer { .. }))
        )));
        assert!(sent
            .iter()
            .any(|io| matches!(io, Io::SetTimer(TimerKey::PeerConnect(_), _))));

        match mgr.connect_error(sock_addr) {
            ConnectErrorOutcome::Gone { user, .. } => assert_eq!(user, "carol"),
            other => panic!("expected gone, got {:?}", other),
        }
        let sent: Vec<Io> = outbox.by_ref().collect();
        assert!(sent.iter().any(|io| matches!(
            io,
            Io::Write(_, Frame::Server(ServerMessage::CantConnectToPeer { .. }))
        )));
        assert!(mgr.is_empty());
    }

    #[test]
    fn port_zero_is_retried_ten_times_then_accepted() {
        let (mut mgr, mut outbox) = manager();
        let ip = Ipv4Addr::new(4, 4, 4, 4);

        mgr.add_request("dave", ConnectionKind::Peer, None, None, vec![]);
        outbox.by_ref().count();

        for expected in 1..=MAX_ADDR_RETRIES {
            match mgr.address_resolved("dave", ip, 0) {
                AddressOutcome::Retry { tries, .. } => assert_eq!(tries, expected),
                other => panic!("expected retry, got {:?}", other),
            }
        }

        // The 11th port-0 reply is accepted as final and dialed anyway.
        match mgr.address_resolved("dave", ip, 0) {
            AddressOutcome::Dialing { user, .. } => assert_eq!(user, "dave"),
            other => panic!("expected dial, got {:?}", other),
        }
        assert!(outbox.by_ref().any(|io| matches!(io, Io::Connect(a)
            if a == SocketAddr::V4(SocketAddrV4::new(ip, 0)))));

        // Counter cleared: nothing waits on an address anymore.
        assert!(matches!(
            mgr.address_resolved("dave", ip, 0),
            AddressOutcome::NoPending
        ));
    }

    #[test]
    fn removal_clears_all_indexes() {
        let (mut mgr, _outbox) = manager();
        let id = mgr.add_request(
            "erin",
            ConnectionKind::File,
            Some((Ipv4Addr::LOCALHOST, 10)),
            Some(Token(5)),
            vec![],
        );

        let opened = mgr
            .socket_opened(
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10)),
                SocketId(3),
            )
            .unwrap();
        assert_eq!(opened.id, id);

        mgr.socket_closed(SocketId(3)).unwrap();
        assert!(mgr.is_empty());
        assert!(mgr.by_socket(SocketId(3)).is_none());
        assert!(mgr.cant_connect(Token(5)).is_none());
    }
}
