//! `Broker`: accept loop, peer links, unregister worker, periodical
//! timer (§4.3).
//!
//! Grounded in `examples/loyd-elbus/src/broker.rs`'s `BrokerDb`
//! (session table behind an `RwLock`) and `spawn_server!`/`handle_peer`
//! accept-and-split-into-reader/writer shape, translated from elbus's
//! single-bus semantics to `original_source/objectoplex/server.py`'s
//! `ObjectoPlex._linker`/`_client_manager`/`Timer` greenlets (peer
//! dial-and-backoff, single unregister worker, once-a-second
//! periodical tick).

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use log::{error, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;

use crate::middleware::MiddlewareChain;
use crate::object::BusinessObject;
use crate::session::{Role, Session};
use crate::{
    Error, PEER_INACTIVITY_TIMEOUT, PEER_RECONNECT_BACKOFF, QUEUE_IDLE_TIMEOUT,
    READER_POLL_TIMEOUT, TIMER_TICK,
};

#[derive(Debug, Clone)]
struct PeerTarget {
    host: String,
    port: u16,
}

/// Process-global coordinator: the session table and the middleware
/// chain every inbound object, connect, disconnect and tick runs
/// through (§3 `Broker`). Never a process-wide singleton — always an
/// explicit `Arc<Broker>` passed to every task it spawns (§9).
pub struct Broker {
    chain: MiddlewareChain,
    sessions: RwLock<Vec<Arc<Session>>>,
    unregister_tx: async_channel::Sender<Arc<Session>>,
    unregister_rx: async_channel::Receiver<Arc<Session>>,
    peer_tx: async_channel::Sender<PeerTarget>,
    peer_rx: async_channel::Receiver<PeerTarget>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Builds a broker around `chain`. The chain's last stage must be a
    /// `RoutingMiddleware` (§4.4) — not enforced here (the launcher
    /// wires the canonical order), since middleware composition is a
    /// configuration concern, not a runtime invariant the broker itself
    /// can check.
    pub fn new(chain: MiddlewareChain) -> Arc<Self> {
        let (unregister_tx, unregister_rx) = async_channel::unbounded();
        let (peer_tx, peer_rx) = async_channel::unbounded();
        Arc::new(Broker {
            chain,
            sessions: RwLock::new(Vec::new()),
            unregister_tx,
            unregister_rx,
            peer_tx,
            peer_rx,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Starts the cross-cutting tasks: the unregister worker, the
    /// `PeerLinker`, and the once-a-second `Timer` (§2 step 5-6, §4.3).
    /// Idempotent only in the sense that calling it twice spawns a
    /// second set of workers — callers call it exactly once, right
    /// after `new`.
    pub fn start(self: &Arc<Self>) {
        let unregister_broker = self.clone();
        let unregister_rx = self.unregister_rx.clone();
        let unregister_task =
            tokio::spawn(async move { unregister_broker.unregister_worker(unregister_rx).await });

        let linker_broker = self.clone();
        let peer_rx = self.peer_rx.clone();
        let linker_task = tokio::spawn(async move { linker_broker.peer_linker(peer_rx).await });

        let timer_broker = self.clone();
        let timer_task = tokio::spawn(async move { timer_broker.timer().await });

        let mut background = self.background.lock().unwrap();
        background.push(unregister_task);
        background.push(linker_task);
        background.push(timer_task);
    }

    /// Queues `(host, port)` for the `PeerLinker` to dial, for the
    /// initially configured peers and for every peer that later
    /// disconnects (§4.3).
    pub fn add_peer(&self, host: impl Into<String>, port: u16) {
        let target = PeerTarget {
            host: host.into(),
            port,
        };
        if self.peer_tx.try_send(target).is_err() {
            error!("peer queue is closed, dropping configured peer");
        }
    }

    /// Binds `addr` and spawns the accept loop (§4.3 Accept).
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let broker = self.clone();
        let accept_task = tokio::spawn(async move { broker.accept_loop(listener).await });
        self.background.lock().unwrap().push(accept_task);
        Ok(local_addr)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().clone()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("client connected from {addr}");
                    let broker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY for {addr}: {e}");
                        }
                        let session = Session::new(Role::Client, Some(addr));
                        broker.start_session(session, stream).await;
                    });
                }
                Err(e) => error!("accept error: {e}"),
            }
        }
    }

    /// Pops configured/disconnected peer targets and dials them,
    /// waiting up to 30s between pops purely as a liveness poll
    /// (§4.3). On dial failure, backs off 10s and re-enqueues the
    /// target so it is retried indefinitely (§4.3, §7 `PeerDialFailure`).
    async fn peer_linker(self: Arc<Self>, rx: async_channel::Receiver<PeerTarget>) {
        loop {
            let target = match time::timeout(QUEUE_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Ok(target)) => target,
                Ok(Err(_)) => return,
                Err(_) => continue,
            };
            match TcpStream::connect((target.host.as_str(), target.port)).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(
                            "failed to set TCP_NODELAY for peer {}:{}: {e}",
                            target.host, target.port
                        );
                    }
                    let addr = stream.peer_addr().ok();
                    info!("dialed peer {}:{}", target.host, target.port);
                    let session = Session::new_peer(addr, (target.host.clone(), target.port));
                    self.clone().start_session(session, stream).await;
                }
                Err(e) => {
                    warn!(
                        "failed to dial peer {}:{}: {e}, retrying in {:?}",
                        target.host, target.port, PEER_RECONNECT_BACKOFF
                    );
                    time::sleep(PEER_RECONNECT_BACKOFF).await;
                    if self.peer_tx.send(target).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs every middleware's `connect` hook, adds the session to the
    /// live set, and spawns its reader/writer tasks (§4.3 Accept).
    async fn start_session(self: Arc<Self>, session: Arc<Session>, stream: TcpStream) {
        let snapshot = self.snapshot();
        self.chain.connect(&session, &snapshot).await;
        self.sessions.write().unwrap().push(session.clone());

        let (read_half, write_half) = stream.into_split();
        let reader_session = session.clone();
        let reader_broker = self.clone();
        let reader_task =
            tokio::spawn(
                async move { reader_broker.reader_loop(reader_session, read_half).await },
            );

        let writer_session = session.clone();
        let writer_task =
            tokio::spawn(async move { Broker::writer_loop(writer_session, write_half).await });

        session.set_tasks(vec![reader_task, writer_task]);
    }

    /// Owns the socket's read half: decodes frames and hands them to
    /// the broker's intake until the peer hangs up, sends garbage, or
    /// (peers only) goes quiet for 30 minutes (§4.2 Reader loop).
    async fn reader_loop(self: Arc<Self>, session: Arc<Session>, mut read_half: OwnedReadHalf) {
        loop {
            if session.is_closing() {
                break;
            }

            match time::timeout(READER_POLL_TIMEOUT, read_half.readable()).await {
                Err(_elapsed) => {
                    // A peer link is enforced from whichever side the idle
                    // check runs on: the dialing session is role=PeerBroker,
                    // the accepted side is promoted to server=true once the
                    // subscribe handshake completes, and both represent the
                    // same broker-to-broker connection (§4.2, §4.5).
                    if (session.is_peer() || session.is_server())
                        && session.idle_for() >= PEER_INACTIVITY_TIMEOUT
                    {
                        info!("{session} idle for {PEER_INACTIVITY_TIMEOUT:?}, closing");
                        break;
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("{session} socket error while polling for readability: {e}");
                    break;
                }
                Ok(Ok(())) => {}
            }

            match BusinessObject::read_from(&mut read_half).await {
                Ok(obj) => {
                    session.touch();
                    self.intake(obj, &session).await;
                }
                Err(e) => {
                    warn!("{session} decode error, closing: {e}");
                    break;
                }
            }
        }

        if session.close("reader exited") {
            self.unregister(session).await;
        }
    }

    /// Owns the socket's write half: drains the outbound queue,
    /// polling every 30s purely as a liveness hint (§4.2 Writer loop).
    async fn writer_loop(session: Arc<Session>, mut write_half: OwnedWriteHalf) {
        let outbound = session.outbound();
        loop {
            match time::timeout(READER_POLL_TIMEOUT, outbound.recv()).await {
                Ok(Ok(obj)) => {
                    if let Err(e) = obj.write_to(&mut write_half).await {
                        warn!("{session} write error, closing: {e}");
                        break;
                    }
                }
                Ok(Err(_closed)) => break,
                Err(_elapsed) => {
                    if session.is_closing() {
                        break;
                    }
                }
            }
        }
    }

    /// Runs an inbound object through the middleware chain (§4.3
    /// Intake). Never blocks on anything but the chain itself, which by
    /// contract only enqueues onto outbound queues (§5).
    async fn intake(&self, obj: BusinessObject, sender: &Arc<Session>) {
        let snapshot = self.snapshot();
        self.chain.handle(obj, sender, &snapshot).await;
    }

    /// Hands a closing session to the unregister worker exactly once
    /// (whichever of reader/writer/inactivity-check calls `close` first
    /// wins that race; `close` returns `false` to every other caller).
    async fn unregister(&self, session: Arc<Session>) {
        if self.unregister_tx.send(session).await.is_err() {
            error!("unregister queue is closed, session leaked");
        }
    }

    /// The single unregister worker (§4.3): removes the session from
    /// the live set, runs every middleware's `disconnect` hook, kills
    /// its tasks, and — if it was a configured peer — requeues its
    /// target for reconnection.
    async fn unregister_worker(self: Arc<Self>, rx: async_channel::Receiver<Arc<Session>>) {
        while let Ok(session) = rx.recv().await {
            session.mark_closing();
            {
                let mut sessions = self.sessions.write().unwrap();
                sessions.retain(|s| !Arc::ptr_eq(s, &session));
            }

            let snapshot = self.snapshot();
            self.chain.disconnect(&session, &snapshot).await;
            session.abort_tasks();

            if let Some((host, port)) = session.peer_target.clone() {
                info!("peer {host}:{port} disconnected, requeueing for reconnection");
                self.add_peer(host, port);
            }
        }
    }

    /// Runs every middleware's `periodical` hook roughly once a second
    /// (§2 step 6, §4.4).
    async fn timer(self: Arc<Self>) {
        let mut interval = time::interval(TIMER_TICK);
        loop {
            interval.tick().await;
            let snapshot = self.snapshot();
            self.chain.periodical(&snapshot).await;
        }
    }

    /// Kills every live session and stops accepting (§4.3 Shutdown).
    pub async fn shutdown(&self) {
        let sessions = {
            let mut sessions = self.sessions.write().unwrap();
            std::mem::take(&mut *sessions)
        };
        for session in sessions {
            session.mark_closing();
            session.abort_tasks();
        }
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::checksum::ChecksumMiddleware;
    use crate::middleware::routing::RoutingMiddleware;
    use std::time::Duration;

    fn canonical_chain() -> MiddlewareChain {
        MiddlewareChain::new(vec![
            Box::new(ChecksumMiddleware),
            Box::new(RoutingMiddleware::new()),
        ])
    }

    #[tokio::test]
    async fn listen_binds_an_ephemeral_port() {
        let broker = Broker::new(canonical_chain());
        broker.start();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let bound = broker.listen(addr).await.unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn accepted_connection_is_tracked_as_a_session() {
        let broker = Broker::new(canonical_chain());
        broker.start();
        let bound = broker.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let _client = TcpStream::connect(bound).await.unwrap();
        // give the accept task a moment to register the session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.session_count(), 1);
    }
}
