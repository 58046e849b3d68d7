//! The `run` action: wire the state machine to the reactor and render core
//! notifications to the log.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use eyre::WrapErr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slsk_core::common::{geoip::NoGeoIp, plugins::NoPlugins, shares::MemoryShares};
use slsk_core::fsm::{Command, Notification, StateMachine};
use slsk_core::net::reactor::Reactor;
use slsk_core::net::{LocalTime, RefClock};
use slsk_types::codec::JsonCodec;

use crate::cli::RunArgs;
use crate::config::{ClientConfig, LoggerConfig};

pub fn run(args: RunArgs) -> eyre::Result<()> {
    let (config, recovered) = ClientConfig::load_or_recover(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.filter())),
        )
        .init();

    if recovered {
        warn!(
            "configuration was corrupt; a fresh default was written to {}",
            args.config.display()
        );
    }
    std::fs::create_dir_all(&config.data_dir)
        .wrap_err("couldn't create the data directory")?;

    let clock = RefClock::new(LocalTime::now());
    let (notif_tx, notif_rx) = flume::unbounded();
    let (cmd_tx, cmd_rx) = flume::unbounded();

    let mut reactor = Reactor::new(JsonCodec, clock.clone(), notif_tx)
        .wrap_err("couldn't initialize the reactor")?;
    let waker = reactor.waker();

    let service = StateMachine::new(
        Arc::new(config.core_config()),
        Arc::new(MemoryShares::new()),
        Arc::new(NoGeoIp),
        Arc::new(NoPlugins),
        fastrand::Rng::new(),
        clock,
    );

    let listen_addr = config.listen_addr();
    let logging = config.logging;
    thread::spawn(move || render_notifications(notif_rx, logging));

    if args.connect {
        cmd_tx.send(Command::ConnectServer).ok();
        waker.wake().ok();
    }

    // The command sender stays alive for the lifetime of the process; the
    // reactor runs until it is dropped.
    let _keepalive = cmd_tx;
    reactor
        .run(Some(listen_addr), service, cmd_rx)
        .wrap_err("reactor terminated")
}

/// Print notifications, and append transfer lines to the transfer log.
fn render_notifications(rx: flume::Receiver<Notification>, logging: LoggerConfig) {
    let transfer_log = logging.transferslogsdir.join("transfers.log");

    while let Ok(notification) = rx.recv() {
        match notification {
            Notification::TransferLog { line } => {
                if !logging.transfers {
                    continue;
                }
                let stamp = chrono::Local::now().format(&logging.log_timestamp);
                let result = std::fs::create_dir_all(&logging.transferslogsdir)
                    .and_then(|_| {
                        OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&transfer_log)
                    })
                    .and_then(|mut f| writeln!(f, "{} {}", stamp, line));
                if let Err(err) = result {
                    warn!("couldn't write transfer log: {}", err);
                }
            }
            Notification::Transfer(snapshot) => {
                info!(
                    "{:?} {} from {}: {} ({}/{} bytes)",
                    snapshot.direction,
                    snapshot.filename,
                    snapshot.user,
                    snapshot.status,
                    snapshot.current_bytes.unwrap_or(0),
                    snapshot.size.unwrap_or(0),
                );
            }
            Notification::Popup { title, text } => info!("{}: {}", title, text),
            other => info!("{:?}", other),
        }
    }
}
