//! Routing middleware (§4.5): the terminal stage of the chain. Grounded
//! almost entirely in `RoutingMiddleware`/`RoutedSystemClient` in
//! `original_source/objectoplex/middleware.py`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use log::{info, warn};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::rule_engine::routing_decision;
use crate::session::Session;
use crate::topology::Topology;
use crate::{Error, ANNOUNCEMENT_INTERVAL};

pub struct RoutingMiddleware {
    routing_id: String,
    last_announcement: Mutex<Instant>,
    topology: Topology,
}

impl Default for RoutingMiddleware {
    fn default() -> Self {
        RoutingMiddleware {
            routing_id: uuid::Uuid::new_v4().to_string(),
            last_announcement: Mutex::new(Instant::now()),
            topology: Topology::new(),
        }
    }
}

fn is_server_subscription(obj: &BusinessObject) -> bool {
    if obj.metadata.get("role").and_then(Value::as_str) != Some("server") {
        return false;
    }
    match obj.metadata.get("route") {
        None => true,
        Some(route) => route.as_array().map(|r| r.len() == 1).unwrap_or(false),
    }
}

impl RoutingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// The observational topology graph fed by this stage's
    /// subscription and announcement handling (§4.7).
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn make_server_subscription(&self) -> BusinessObject {
        BusinessObject::event_only(
            "routing/subscribe",
            vec![
                ("role", Value::String("server".to_owned())),
                ("routing-id", Value::String(self.routing_id.clone())),
                ("receive", Value::String("all".to_owned())),
                ("subscriptions", Value::String("all".to_owned())),
                ("name", Value::String("ObjectoPlex".to_owned())),
            ],
        )
    }

    fn neighbor_announcement(&self, sessions: &[Arc<Session>]) -> BusinessObject {
        let neighbors: Vec<Value> = sessions
            .iter()
            .map(|s| {
                let mut m = Map::new();
                m.insert(
                    "routing-id".to_owned(),
                    Value::String(s.routing.routing_id()),
                );
                Value::Object(m)
            })
            .collect();
        BusinessObject::event_only(
            "routing/announcement/neighbors",
            vec![
                ("node", Value::String(self.routing_id.clone())),
                ("neighbors", Value::Array(neighbors)),
            ],
        )
    }

    /// Feeds a received `routing/announcement/neighbors` object into the
    /// topology tracker (§4.7 (ii)). Announcements we originate never
    /// reach here since `route` already short-circuits on our own id
    /// being in the route vector before this is called for hops other
    /// than our own broadcast.
    fn observe_announcement(&self, obj: &BusinessObject) {
        let Some(node) = obj.metadata.get("node").and_then(Value::as_str) else {
            return;
        };
        let neighbors: Vec<String> = obj
            .metadata
            .get("neighbors")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.get("routing-id").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        self.topology.mark_server(node);
        self.topology.record_announcement(node, &neighbors);
    }

    fn subscribe_to_server(&self, session: &Arc<Session>) {
        if session.routing.subscribed_to.swap(true, Ordering::SeqCst) {
            return;
        }
        session.send(Arc::new(self.make_server_subscription()));
        info!("subscribed to server {session}");
    }

    fn broadcast_notification(&self, notification: BusinessObject, exclude: &Arc<Session>, sessions: &[Arc<Session>]) {
        let notification = Arc::new(notification);
        for other in sessions {
            if !Arc::ptr_eq(other, exclude) {
                other.send(notification.clone());
            }
        }
    }

    fn handle_server_subscription(&self, obj: &BusinessObject, sender: &Arc<Session>, sessions: &[Arc<Session>]) {
        let routing_id = obj
            .metadata
            .get("routing-id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        sender.routing.set_routing_id(routing_id.clone());
        *sender.routing.extra_routing_ids.write().unwrap() =
            obj.routing_ids_field().into_iter().collect();
        *sender.routing.subscriptions.write().unwrap() = obj
            .metadata
            .get("subscriptions")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();
        sender.routing.echo.store(false, Ordering::SeqCst);
        sender.routing.subscribed.store(true, Ordering::SeqCst);
        sender.routing.server.store(true, Ordering::SeqCst);

        self.topology.mark_server(&routing_id);
        self.topology.record_edge(&self.routing_id, &routing_id);
        self.subscribe_to_server(sender);

        let mut reply_meta = Map::new();
        reply_meta.insert(
            "event".to_owned(),
            Value::String("routing/subscribe/reply".to_owned()),
        );
        reply_meta.insert("routing-id".to_owned(), Value::String(routing_id.clone()));
        reply_meta.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
        reply_meta.insert("role".to_owned(), Value::String("server".to_owned()));
        sender.send(Arc::new(BusinessObject::new(reply_meta, Vec::new())));

        let notification = BusinessObject::event_only(
            "routing/subscribe/notification",
            vec![
                ("routing-id", Value::String(routing_id)),
                ("role", Value::String("server".to_owned())),
            ],
        );
        self.broadcast_notification(notification, sender, sessions);

        let announcement = self.neighbor_announcement(sessions);
        self.route(announcement, None, sessions);
        info!("server {sender} subscribed");
    }

    fn handle_client_subscription(&self, obj: &BusinessObject, sender: &Arc<Session>, sessions: &[Arc<Session>]) {
        *sender.routing.extra_routing_ids.write().unwrap() =
            obj.routing_ids_field().into_iter().collect();
        *sender.routing.subscriptions.write().unwrap() = obj
            .metadata
            .get("subscriptions")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();
        // Echo is left at its default (true, set in `RoutingState::new`)
        // for a modern subscription: only a legacy `receive-mode:
        // no_echo` turns it off (§9 Open Question resolution, S1).
        sender.routing.server.store(false, Ordering::SeqCst);
        sender.routing.subscribed.store(true, Ordering::SeqCst);

        // A client's routing-id is assigned by us, once, the first time
        // it is promoted (§3 Session invariants; §4.5 "allocated when
        // the session was promoted").
        let routing_id = sender.routing.routing_id();
        let routing_id = if routing_id.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            sender.routing.set_routing_id(generated.clone());
            generated
        } else {
            routing_id
        };

        self.topology.record_edge(&self.routing_id, &routing_id);

        let mut reply_meta = Map::new();
        reply_meta.insert(
            "event".to_owned(),
            Value::String("routing/subscribe/reply".to_owned()),
        );
        reply_meta.insert("routing-id".to_owned(), Value::String(routing_id.clone()));
        reply_meta.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
        sender.send(Arc::new(BusinessObject::new(reply_meta, Vec::new())));

        let notification = BusinessObject::event_only(
            "routing/subscribe/notification",
            vec![("routing-id", Value::String(routing_id))],
        );
        self.broadcast_notification(notification, sender, sessions);

        let announcement = self.neighbor_announcement(sessions);
        self.route(announcement, None, sessions);
        info!("client {sender} subscribed");
    }

    fn handle_service_registration(&self, obj: &BusinessObject, sender: &Arc<Session>, sessions: &[Arc<Session>]) -> Option<BusinessObject> {
        if !sender.is_subscribed() {
            warn!("dropped services/register from unsubscribed {sender}");
            return None;
        }
        let name = obj.metadata.get("name").and_then(Value::as_str)?.to_owned();
        *sender.routing.service_name.write().unwrap() = Some(name.clone());

        let mut reply_meta = Map::new();
        reply_meta.insert(
            "event".to_owned(),
            Value::String("services/register/reply".to_owned()),
        );
        reply_meta.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
        sender.send(Arc::new(BusinessObject::new(reply_meta, Vec::new())));

        let notification = BusinessObject::event_only(
            "services/register/notify",
            vec![("name", Value::String(name))],
        );
        self.broadcast_notification(notification, sender, sessions);
        None
    }

    /// Picks one session registered under `name` uniformly at random and
    /// delivers `obj` to it only. Returns `true` if a provider was found
    /// (§4.5 service request dispatch).
    fn dispatch_service_request(&self, obj: &BusinessObject, sessions: &[Arc<Session>]) -> bool {
        let Some(name) = obj.metadata.get("name").and_then(Value::as_str) else {
            return false;
        };
        let providers: Vec<&Arc<Session>> = sessions
            .iter()
            .filter(|s| s.routing.service_name.read().unwrap().as_deref() == Some(name))
            .collect();
        match providers.choose(&mut rand::thread_rng()) {
            Some(provider) => {
                provider.send(Arc::new(obj.clone()));
                true
            }
            None => false,
        }
    }

    fn should_deliver(&self, obj: &BusinessObject, sender: Option<&Arc<Session>>, recipient: &Arc<Session>) -> bool {
        if !recipient.is_subscribed() {
            return false;
        }

        let route = obj.route();
        let recipient_id = recipient.routing.routing_id();
        if !recipient_id.is_empty() && route.contains(&recipient_id) && route.len() > 2 {
            return false;
        }

        if let (Some(sender), Some(event)) = (sender, obj.event.as_deref()) {
            if event.starts_with("routing/") && route.contains(&sender.routing.routing_id()) {
                return false;
            }
        }

        if recipient.is_server() {
            return true;
        }

        if obj
            .metadata
            .get("event")
            .and_then(Value::as_str)
            .map(|e| e.starts_with("routing/announcement/"))
            .unwrap_or(false)
        {
            return false;
        }

        if let Some(to) = obj.metadata.get("to") {
            if !recipient.routing.has_any_routing_id(to) {
                return false;
            }
        }

        if let Some(sender) = sender {
            if Arc::ptr_eq(sender, recipient) && !recipient.echo() {
                return false;
            }
        }

        let subscriptions = recipient.routing.subscriptions.read().unwrap();
        routing_decision(obj, &subscriptions)
    }

    fn route(&self, mut obj: BusinessObject, sender: Option<&Arc<Session>>, sessions: &[Arc<Session>]) {
        if let Some(sender) = sender {
            if !sender.is_subscribed() {
                warn!("dropped object from unsubscribed sender {sender}");
                return;
            }
        }

        let mut route = obj.route();
        if route.contains(&self.routing_id) {
            return;
        }
        if route.is_empty() {
            if let Some(sender) = sender {
                route.push(sender.routing.routing_id());
            }
        }
        route.push(self.routing_id.clone());
        obj.set_route(route);

        if obj.event.as_deref() == Some("routing/announcement/neighbors") {
            self.observe_announcement(&obj);
        }

        if obj
            .event
            .as_deref()
            .map(|e| e.starts_with("services/request"))
            .unwrap_or(false)
            && self.dispatch_service_request(&obj, sessions)
        {
            return;
        }

        for recipient in sessions {
            if self.should_deliver(&obj, sender, recipient) {
                recipient.send(Arc::new(obj.clone()));
            }
        }
    }
}

#[async_trait]
impl Middleware for RoutingMiddleware {
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        if obj.event.as_deref() == Some("routing/subscribe") {
            if is_server_subscription(&obj) {
                self.handle_server_subscription(&obj, sender, sessions);
            } else {
                self.handle_client_subscription(&obj, sender, sessions);
            }
            return Ok(None);
        }

        if obj.event.as_deref() == Some("services/register") {
            return Ok(self.handle_service_registration(&obj, sender, sessions));
        }

        self.route(obj, Some(sender), sessions);
        Ok(None)
    }

    async fn connect(&self, session: &Arc<Session>, _sessions: &[Arc<Session>]) {
        if session.is_peer() {
            session.routing.server.store(true, Ordering::SeqCst);
            self.subscribe_to_server(session);
            info!("server {session} connected");
        } else {
            info!("client {session} connected");
        }
    }

    async fn disconnect(&self, session: &Arc<Session>, sessions: &[Arc<Session>]) {
        if session.is_server() {
            info!("server {session} disconnected");
        } else {
            info!("client {session} disconnected");
        }

        if session.is_subscribed() {
            let obj = BusinessObject::event_only(
                "routing/disconnect",
                vec![(
                    "routing-id",
                    Value::String(session.routing.routing_id()),
                )],
            );
            self.route(obj, None, sessions);
        }
    }

    async fn periodical(&self, sessions: &[Arc<Session>]) {
        let mut last = self.last_announcement.lock().unwrap();
        if last.elapsed() >= ANNOUNCEMENT_INTERVAL {
            *last = Instant::now();
            drop(last);
            let announcement = self.neighbor_announcement(sessions);
            self.route(announcement, None, sessions);
        }
    }

    fn name(&self) -> &'static str {
        "routing"
    }
}
