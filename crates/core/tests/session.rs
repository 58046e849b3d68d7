//! End-to-end session tests, driven against the sans-IO state machine with a
//! simulated clock: events in, I/O instructions out, no sockets.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use slsk_core::common::config::CoreConfig;
use slsk_core::common::geoip::NoGeoIp;
use slsk_core::common::plugins::NoPlugins;
use slsk_core::common::shares::MemoryShares;
use slsk_core::fsm::transfermgr::incomplete_name;
use slsk_core::fsm::{Command, Event, Io, StateMachine, TimerKey};
use slsk_core::net::{Disconnect, Link, LocalTime, RefClock, Service, SocketId};
use slsk_types::{
    messages::peer::PeerInit, ConnectionKind, Frame, PeerMessage, ReqId, ServerMessage,
    TransferDirection,
};

const SERVER: SocketId = SocketId(1);

struct Session {
    sm: StateMachine<RefClock>,
    clock: RefClock,
}

impl Session {
    fn start(config: CoreConfig, shares: MemoryShares) -> Self {
        let clock = RefClock::new(LocalTime::from_secs(100_000));
        let mut sm = StateMachine::new(
            Arc::new(config),
            Arc::new(shares),
            Arc::new(NoGeoIp),
            Arc::new(NoPlugins),
            fastrand::Rng::with_seed(99),
            clock.clone(),
        );

        let server_addr: SocketAddr = ([127, 0, 0, 1], 2242).into();
        sm.handle(Event::Command(Command::ConnectServer));
        sm.handle(Event::Connected {
            socket: SERVER,
            addr: server_addr,
            link: Link::Outbound,
        });
        sm.handle(Event::Frame {
            socket: SERVER,
            frame: Frame::Server(ServerMessage::LoginReply {
                success: true,
                reason: None,
                ip: Some(Ipv4Addr::new(9, 9, 9, 9)),
            }),
        });
        sm.by_ref().count();

        Self { sm, clock }
    }

    fn drain(&mut self) -> Vec<Io> {
        self.sm.by_ref().collect()
    }

    fn peer_writes(&mut self) -> Vec<(SocketId, PeerMessage)> {
        self.drain()
            .into_iter()
            .filter_map(|io| match io {
                Io::Write(s, Frame::Peer(m)) => Some((s, m)),
                _ => None,
            })
            .collect()
    }
}

fn test_config(dir: &tempfile::TempDir) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.server.address = ([127, 0, 0, 1], 2242).into();
    config.server.login = "me".into();
    config.server.passw = "pw".into();
    config.server.firewalled = true;
    config.transfers.downloaddir = dir.path().join("downloads");
    config.transfers.incompletedir = Some(dir.path().join("incomplete"));
    config
}

#[test]
fn download_resumes_at_on_disk_length_and_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    // A previous run left 100 bytes of this file behind.
    let incomplete_dir = dir.path().join("incomplete");
    fs::create_dir_all(&incomplete_dir).unwrap();
    let partial = incomplete_name(&incomplete_dir, "music\\song.mp3", "seller");
    fs::write(&partial, vec![0u8; 100]).unwrap();

    let mut session = Session::start(config, MemoryShares::new());

    session.sm.handle(Event::Command(Command::Download {
        user: "seller".into(),
        filename: "music\\song.mp3".into(),
        path: String::new(),
        size: Some(1_000),
        bitrate: None,
        length: None,
    }));
    let out = session.drain();
    assert!(out.iter().any(|io| matches!(
        io,
        Io::Write(_, Frame::Server(ServerMessage::GetPeerAddress { user })) if user == "seller"
    )));

    // Address resolution dials the peer directly.
    let peer_ip = Ipv4Addr::new(5, 6, 7, 8);
    let peer_addr = SocketAddr::V4(SocketAddrV4::new(peer_ip, 2234));
    session.sm.handle(Event::Frame {
        socket: SERVER,
        frame: Frame::Server(ServerMessage::PeerAddress {
            user: "seller".into(),
            ip: peer_ip,
            port: 2234,
        }),
    });
    let out = session.drain();
    assert!(out
        .iter()
        .any(|io| matches!(io, Io::Connect(addr) if *addr == peer_addr)));

    // The peer socket opens; init and the transfer request are flushed.
    let peer_socket = SocketId(7);
    session.sm.handle(Event::Connected {
        socket: peer_socket,
        addr: peer_addr,
        link: Link::Outbound,
    });
    let writes = session.peer_writes();
    assert!(matches!(&writes[0], (s, PeerMessage::Init(init))
        if *s == peer_socket && init.kind == ConnectionKind::Peer));
    let req = match &writes[1] {
        (
            _,
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                req,
                file,
                ..
            },
        ) if file == "music\\song.mp3" => *req,
        other => panic!("expected a transfer request, got {:?}", other),
    };

    // The peer allows the transfer; an 'F' connection goes out.
    session.sm.handle(Event::Frame {
        socket: peer_socket,
        frame: Frame::Peer(PeerMessage::TransferResponse {
            req,
            allowed: true,
            reason: None,
            filesize: Some(1_000),
        }),
    });
    let out = session.drain();
    assert!(out
        .iter()
        .any(|io| matches!(io, Io::Connect(addr) if *addr == peer_addr)));

    let file_socket = SocketId(8);
    session.sm.handle(Event::Connected {
        socket: file_socket,
        addr: peer_addr,
        link: Link::Outbound,
    });
    let out = session.drain();
    assert!(out.iter().any(|io| matches!(
        io,
        Io::Write(s, Frame::Peer(PeerMessage::Init(PeerInit { kind: ConnectionKind::File, .. })))
            if *s == file_socket
    )));
    assert!(out.iter().any(|io| matches!(
        io,
        Io::Write(s, Frame::Peer(PeerMessage::FileTransferInit { req: r }))
            if *s == file_socket && *r == req
    )));

    // The reactor was handed the partial file: the download resumes at the
    // on-disk byte length.
    let (offset, size) = out
        .iter()
        .find_map(|io| match io {
            Io::ReceiveFile { socket, offset, size, .. } if *socket == file_socket => {
                Some((*offset, *size))
            }
            _ => None,
        })
        .expect("file handed to the reactor");
    assert_eq!(offset, 100);
    assert_eq!(size, 1_000);

    // Bytes arrive; completion moves the file into place.
    session.clock.elapse(slsk_core::LocalDuration::from_secs(2));
    session.sm.handle(Event::FileProgress {
        socket: file_socket,
        bytes: 1_000,
    });
    let out = session.drain();
    assert!(out
        .iter()
        .any(|io| matches!(io, Io::Close(s) if *s == file_socket)));

    let target = dir.path().join("downloads").join("song.mp3");
    assert!(target.exists(), "finished download moved into place");
    assert!(!partial.exists(), "incomplete file was renamed away");
}

#[test]
fn remote_download_request_is_served_from_shares() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let real = dir.path().join("album.mp3");
    fs::write(&real, vec![0u8; 4_096]).unwrap();
    let mut shares = MemoryShares::new();
    shares.insert("shared\\album.mp3", real);

    let mut session = Session::start(config, shares);

    // Inbound peer identifies itself and asks for the file.
    let socket = SocketId(4);
    session.sm.handle(Event::Connected {
        socket,
        addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 4, 4), 40000)),
        link: Link::Inbound,
    });
    session.sm.handle(Event::Frame {
        socket,
        frame: Frame::Peer(PeerMessage::Init(PeerInit::new("buyer", ConnectionKind::Peer))),
    });
    session.sm.handle(Event::Frame {
        socket,
        frame: Frame::Peer(PeerMessage::TransferRequest {
            direction: TransferDirection::Download,
            req: ReqId(77),
            file: "shared\\album.mp3".into(),
            size: 0,
        }),
    });

    let out = session.drain();
    let response = out
        .iter()
        .find_map(|io| match io {
            Io::Write(s, Frame::Peer(PeerMessage::TransferResponse { req, allowed, filesize, .. }))
                if *s == socket =>
            {
                Some((*req, *allowed, *filesize))
            }
            _ => None,
        })
        .expect("a transfer response");
    assert_eq!(response, (ReqId(77), true, Some(4_096)));
    assert!(out.iter().any(|io| matches!(
        io,
        Io::SetTimer(TimerKey::TransferRequest(ReqId(77)), d) if d.as_secs() == 30
    )));

    // The peer opens the file connection; the upload is handed to the
    // reactor.
    let file_socket = SocketId(5);
    session.sm.handle(Event::Connected {
        socket: file_socket,
        addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 4, 4), 40001)),
        link: Link::Inbound,
    });
    session.sm.handle(Event::Frame {
        socket: file_socket,
        frame: Frame::Peer(PeerMessage::Init(PeerInit::new("buyer", ConnectionKind::File))),
    });
    session.sm.handle(Event::Frame {
        socket: file_socket,
        frame: Frame::Peer(PeerMessage::FileTransferInit { req: ReqId(77) }),
    });

    let out = session.drain();
    assert!(out
        .iter()
        .any(|io| matches!(io, Io::SendFile { socket, .. } if *socket == file_socket)));
}

#[test]
fn server_loss_parks_transfers_and_schedules_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.queue_file = Some(dir.path().join("downloads.json"));

    let mut session = Session::start(config, MemoryShares::new());

    session.sm.handle(Event::Command(Command::Download {
        user: "seller".into(),
        filename: "music\\song.mp3".into(),
        path: String::new(),
        size: Some(1_000),
        bitrate: None,
        length: None,
    }));
    session.drain();

    session.sm.handle(Event::Disconnected {
        socket: SERVER,
        addr: ([127, 0, 0, 1], 2242).into(),
        reason: Disconnect::PeerClosed,
    });
    let out = session.drain();
    assert!(out.iter().any(|io| matches!(
        io,
        Io::SetTimer(TimerKey::Server, d) if d.as_secs() == 15
    )));

    // The queue was persisted; the interrupted download will be re-requested
    // on the next login.
    let saved = fs::read_to_string(dir.path().join("downloads.json")).unwrap();
    assert!(saved.contains("music\\\\song.mp3"));
}
