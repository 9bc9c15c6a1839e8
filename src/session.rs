//! One TCP connection's state within the broker (§3, §4.2).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use tokio::task::JoinHandle;

use crate::object::BusinessObject;
use crate::OUTBOUND_QUEUE_SIZE;

/// Whether a session is a plain client or another broker peered in as a
/// server (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    PeerBroker,
}

/// Mutable routing state promoted onto a session the first time it sends
/// a subscription-style message (§3 `Session` lifecycle). Starts
/// zero-valued; in the original Python this was implemented by mutating
/// the client's class (`RoutedSystemClient.promote`) — here every
/// `Session` always carries these fields (§9 design note).
#[derive(Debug, Default)]
pub struct RoutingState {
    pub routing_id: std::sync::RwLock<String>,
    pub extra_routing_ids: std::sync::RwLock<HashSet<String>>,
    pub subscriptions: std::sync::RwLock<Vec<String>>,
    pub echo: AtomicBool,
    pub subscribed: AtomicBool,
    pub subscribed_to: AtomicBool,
    pub server: AtomicBool,
    pub service_name: std::sync::RwLock<Option<String>>,
}

impl RoutingState {
    fn new() -> Self {
        RoutingState {
            echo: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn routing_id(&self) -> String {
        self.routing_id.read().unwrap().clone()
    }

    pub fn set_routing_id(&self, id: String) {
        *self.routing_id.write().unwrap() = id;
    }

    pub fn has_routing_id(&self, id: &str) -> bool {
        *self.routing_id.read().unwrap() == id || self.extra_routing_ids.read().unwrap().contains(id)
    }

    /// `to` may be a single string or an array of strings on the wire
    /// (§4.5 "Route vector and targeted `to`").
    pub fn has_any_routing_id(&self, to: &serde_json::Value) -> bool {
        if let Some(s) = to.as_str() {
            return self.has_routing_id(s);
        }
        if let Some(list) = to.as_array() {
            return list
                .iter()
                .filter_map(|v| v.as_str())
                .any(|id| self.has_routing_id(id));
        }
        false
    }
}

/// A session's outbound queue and identity (§3, §4.2).
pub struct Session {
    pub remote_addr: Option<SocketAddr>,
    pub role: Role,
    pub routing: RoutingState,
    /// `(host, port)` this session was dialed for, if it is an outbound
    /// configured peer link — used to requeue the target on disconnect
    /// (§4.3 unregister).
    pub peer_target: Option<(String, u16)>,
    tx: async_channel::Sender<Arc<BusinessObject>>,
    rx: async_channel::Receiver<Arc<BusinessObject>>,
    closing: AtomicBool,
    /// Guards the "hand off to the unregister queue exactly once"
    /// contract (§4.2 `close`).
    unregister_queued: AtomicBool,
    last_activity: std::sync::Mutex<Instant>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(role: Role, remote_addr: Option<SocketAddr>) -> Arc<Self> {
        Self::with_peer_target(role, remote_addr, None)
    }

    /// Builds a session for an outbound, configured broker-to-broker
    /// link, remembering `target` so the broker can requeue it for
    /// reconnection once the session disconnects (§4.3).
    pub fn new_peer(remote_addr: Option<SocketAddr>, target: (String, u16)) -> Arc<Self> {
        Self::with_peer_target(Role::PeerBroker, remote_addr, Some(target))
    }

    fn with_peer_target(
        role: Role,
        remote_addr: Option<SocketAddr>,
        peer_target: Option<(String, u16)>,
    ) -> Arc<Self> {
        let (tx, rx) = async_channel::bounded(OUTBOUND_QUEUE_SIZE);
        Arc::new(Session {
            remote_addr,
            role,
            routing: RoutingState::new(),
            peer_target,
            tx,
            rx,
            closing: AtomicBool::new(false),
            unregister_queued: AtomicBool::new(false),
            last_activity: std::sync::Mutex::new(Instant::now()),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn is_peer(&self) -> bool {
        matches!(self.role, Role::PeerBroker)
    }

    pub fn is_subscribed(&self) -> bool {
        self.routing.subscribed.load(Ordering::SeqCst)
    }

    pub fn is_server(&self) -> bool {
        self.routing.server.load(Ordering::SeqCst)
    }

    pub fn echo(&self) -> bool {
        self.routing.echo.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Records that a full frame was just received from this session
    /// (§4.2 peer inactivity timeout).
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Marks the session closing and reports whether the caller is the
    /// one that should hand it to the broker's unregister queue — at
    /// most one caller ever gets `true` for a given session (§4.2
    /// `close`).
    pub fn close(&self, reason: &str) -> bool {
        self.mark_closing();
        let should_unregister = !self.unregister_queued.swap(true, Ordering::SeqCst);
        if should_unregister {
            log::info!("closing session {self}: {reason}");
        }
        should_unregister
    }

    /// Stashes the reader/writer task handles so they can be aborted
    /// once this session is unregistered.
    pub fn set_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        *self.tasks.lock().unwrap() = tasks;
    }

    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Enqueues an object for delivery. Never blocks the producer: if the
    /// queue is full, the oldest queued item is dropped and a warning is
    /// logged (§4.2 `send`, §5, P3). Silently drops if the session is
    /// already closing.
    pub fn send(&self, obj: Arc<BusinessObject>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        loop {
            match self.tx.try_send(obj.clone()) {
                Ok(()) => return,
                Err(async_channel::TrySendError::Full(_)) => {
                    if self.rx.try_recv().is_err() {
                        // Someone else drained it between the failed send
                        // and now; retry the send.
                        continue;
                    }
                    warn!(
                        "session {:?} send queue is full, dropped oldest item",
                        self.remote_addr
                    );
                }
                Err(async_channel::TrySendError::Closed(_)) => return,
            }
        }
    }

    /// The receiving half of the outbound queue, used by the writer task.
    pub fn outbound(&self) -> async_channel::Receiver<Arc<BusinessObject>> {
        self.rx.clone()
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote_addr {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "<internal>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_not_subscribed() {
        let session = Session::new(Role::Client, None);
        assert!(!session.is_subscribed());
        assert!(!session.is_server());
    }

    #[test]
    fn send_drops_oldest_when_full() {
        let session = Session::new(Role::Client, None);
        for i in 0..OUTBOUND_QUEUE_SIZE {
            let obj = BusinessObject::new(
                [("seq".to_owned(), serde_json::Value::from(i))]
                    .into_iter()
                    .collect(),
                Vec::new(),
            );
            session.send(Arc::new(obj));
        }
        let overflow = BusinessObject::new(
            [("seq".to_owned(), serde_json::Value::from(9999))]
                .into_iter()
                .collect(),
            Vec::new(),
        );
        session.send(Arc::new(overflow));

        let rx = session.outbound();
        let first = rx.try_recv().unwrap();
        // oldest (seq 0) was dropped; the new first item is seq 1.
        assert_eq!(first.metadata.get("seq").unwrap().as_i64(), Some(1));
        assert_eq!(rx.len(), OUTBOUND_QUEUE_SIZE - 1);
    }

    #[test]
    fn has_any_routing_id_accepts_scalar_or_array() {
        let session = Session::new(Role::Client, None);
        session.routing.set_routing_id("r1".to_owned());
        assert!(session.routing.has_any_routing_id(&serde_json::Value::from("r1")));
        assert!(session
            .routing
            .has_any_routing_id(&serde_json::Value::from(vec!["r2", "r1"])));
        assert!(!session
            .routing
            .has_any_routing_id(&serde_json::Value::from("r2")));
    }
}
