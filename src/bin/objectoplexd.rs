//! Launcher binary: parses bind/peer addresses and the optional
//! auxiliary-stage flags, wires up the canonical middleware chain, and
//! runs a `Broker` until it is asked to stop (§6 Process interface).
//!
//! Grounded in `examples/loyd-elbus/src/server.rs`'s `Opts`/`SimpleLogger`/
//! signal handling/multi-thread runtime bootstrap, translated from
//! elbus's Unix-socket-or-TCP bind surface to a single TCP listener plus
//! a set of peer broker addresses.

use chrono::prelude::*;
use clap::Parser;
use colored::Colorize;
use log::{error, info, trace, Level, LevelFilter};
use std::net::SocketAddr;
use std::sync::atomic;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use objectoplex::broker::Broker;
use objectoplex::middleware::checksum::ChecksumMiddleware;
use objectoplex::middleware::debug_dump::DebugDumpMiddleware;
use objectoplex::middleware::legacy::LegacySubscriptionMiddleware;
use objectoplex::middleware::motd::MotdMiddleware;
use objectoplex::middleware::pingpong::PingPongMiddleware;
use objectoplex::middleware::routing::RoutingMiddleware;
use objectoplex::middleware::statistics::StatisticsMiddleware;
use objectoplex::middleware::{Middleware, MiddlewareChain};

static SERVER_ACTIVE: atomic::AtomicBool = atomic::AtomicBool::new(true);

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let s = format!(
                "{}  {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                record.args()
            );
            println!(
                "{}",
                match record.level() {
                    Level::Trace => s.black().dimmed(),
                    Level::Debug => s.dimmed(),
                    Level::Warn => s.yellow().bold(),
                    Level::Error => s.red(),
                    Level::Info => s.normal(),
                }
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

fn set_verbose_logger(filter: LevelFilter) {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(filter))
        .unwrap();
}

/// `host:port` configured peer brokers to mesh with (§2 step 5, §4.3).
#[derive(Parser)]
#[clap(name = "objectoplexd", about = "ObjectoPlex broker daemon")]
struct Opts {
    #[clap(short = 'B', long = "bind", default_value = "127.0.0.1:7070")]
    bind: SocketAddr,
    #[clap(short = 'p', long = "peer")]
    peers: Vec<String>,
    #[clap(short = 'P', long = "pid-file")]
    pid_file: Option<String>,
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
    #[clap(short = 'w', long = "workers", default_value = "4")]
    workers: usize,
    #[clap(long = "motd")]
    motd: Option<String>,
    #[clap(long = "debug-dump")]
    debug_dump: bool,
}

fn parse_peer(spec: &str) -> Option<(String, u16)> {
    let (host, port) = spec.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_owned(), port))
}

/// Canonical middleware ordering (§4.4): `PingPong -> LegacySubscription
/// -> Statistics -> Checksum -> Routing`, with optional diagnostic
/// stages spliced in ahead of the terminal Routing stage.
fn build_chain(opts: &Opts) -> MiddlewareChain {
    let mut stages: Vec<Box<dyn Middleware>> = vec![
        Box::new(PingPongMiddleware),
        Box::new(LegacySubscriptionMiddleware),
        Box::new(StatisticsMiddleware::default()),
        Box::new(ChecksumMiddleware),
    ];
    if let Some(text) = &opts.motd {
        stages.push(Box::new(MotdMiddleware::new(text.clone())));
    }
    if opts.debug_dump {
        stages.push(Box::new(DebugDumpMiddleware));
    }
    stages.push(Box::new(RoutingMiddleware::new()));
    MiddlewareChain::new(stages)
}

macro_rules! handle_term_signal {
    ($kind:expr) => {
        tokio::spawn(async move {
            loop {
                match signal($kind) {
                    Ok(mut v) => {
                        v.recv().await;
                    }
                    Err(e) => {
                        error!("unable to bind to signal {:?}: {e}", $kind);
                        break;
                    }
                }
                trace!("got termination signal");
                SERVER_ACTIVE.store(false, atomic::Ordering::SeqCst);
            }
        });
    };
}

fn main() {
    let opts = Opts::parse();
    set_verbose_logger(if opts.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });

    info!(
        "starting objectoplex broker, {} workers, bind {}",
        opts.workers, opts.bind
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(opts.workers)
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async move {
        if let Some(pid_file) = &opts.pid_file {
            let pid = std::process::id().to_string();
            tokio::fs::write(pid_file, pid)
                .await
                .expect("unable to write pid file");
            info!("created pid file {pid_file}");
        }

        handle_term_signal!(SignalKind::interrupt());
        handle_term_signal!(SignalKind::terminate());

        let chain = build_chain(&opts);
        let broker = Broker::new(chain);
        broker.start();

        let bound = broker
            .listen(opts.bind)
            .await
            .expect("unable to bind listener");
        info!("objectoplex broker listening on {bound}");

        for peer in &opts.peers {
            match parse_peer(peer) {
                Some((host, port)) => {
                    info!("configured peer {host}:{port}");
                    broker.add_peer(host, port);
                }
                None => error!("ignoring malformed peer address {peer:?}"),
            }
        }

        let sleep_step = Duration::from_millis(100);
        loop {
            if !SERVER_ACTIVE.load(atomic::Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(sleep_step).await;
        }

        info!("terminating");
        broker.shutdown().await;
        if let Some(pid_file) = &opts.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    });
}
