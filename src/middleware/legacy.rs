//! Legacy subscription translation (§4.4), grounded in
//! `LegacySubscriptionMiddleware` in
//! `original_source/objectoplex/middleware.py`.
//!
//! Translates a legacy `routing/subscribe` carrying a `receive-mode`, or
//! a legacy `clients/register`, into the modern subscription form and
//! promotes the sender. Everything else passes through unchanged.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

#[derive(Default)]
pub struct LegacySubscriptionMiddleware;

#[async_trait]
impl Middleware for LegacySubscriptionMiddleware {
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        let is_legacy_subscribe = obj.event.as_deref() == Some("routing/subscribe")
            && (obj.metadata.contains_key("receive-mode") || obj.metadata.contains_key("receive_mode"));

        if is_legacy_subscribe {
            return Ok(self.handle_legacy_subscription(obj, sender, sessions));
        }

        if obj.event.as_deref() == Some("clients/register") {
            return Ok(Some(self.handle_legacy_registration(obj, sender, sessions)));
        }

        Ok(Some(obj))
    }

    fn name(&self) -> &'static str {
        "legacy_subscription"
    }
}

impl LegacySubscriptionMiddleware {
    fn handle_legacy_subscription(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> Option<BusinessObject> {
        for id in obj.routing_ids_field() {
            sender.routing.extra_routing_ids.write().unwrap().insert(id);
        }

        let receive_mode = obj
            .metadata
            .get("receive-mode")
            .or_else(|| obj.metadata.get("receive_mode"))
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_owned();

        sender.routing.echo.store(receive_mode != "no_echo", Ordering::SeqCst);

        let subscriptions = if receive_mode == "events_only" {
            vec!["@*".to_owned()]
        } else {
            vec!["*".to_owned()]
        };
        *sender.routing.subscriptions.write().unwrap() = subscriptions;
        sender.routing.subscribed.store(true, Ordering::SeqCst);

        let types_none = obj
            .metadata
            .get("types")
            .and_then(Value::as_str)
            .map(|t| t == "none")
            .unwrap_or(false);

        if receive_mode != "none" && !types_none {
            let mut metadata = Map::new();
            metadata.insert(
                "event".to_owned(),
                Value::String("routing/subscribe/reply".to_owned()),
            );
            metadata.insert(
                "routing-id".to_owned(),
                Value::String(sender.routing.routing_id()),
            );
            metadata.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
            sender.send(Arc::new(BusinessObject::new(metadata, Vec::new())));
        }

        let mut notify_meta = Map::new();
        notify_meta.insert(
            "event".to_owned(),
            Value::String("routing/subscribe/notification".to_owned()),
        );
        notify_meta.insert(
            "routing-id".to_owned(),
            Value::String(sender.routing.routing_id()),
        );
        let notification = Arc::new(BusinessObject::new(notify_meta, Vec::new()));
        for other in sessions {
            if !Arc::ptr_eq(other, sender) {
                other.send(notification.clone());
            }
        }

        None
    }

    fn handle_legacy_registration(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> BusinessObject {
        for id in obj.routing_ids_field() {
            sender.routing.extra_routing_ids.write().unwrap().insert(id);
        }

        let receive = obj
            .metadata
            .get("receive")
            .and_then(Value::as_str)
            .unwrap_or("all")
            .to_owned();
        sender.routing.subscribed.store(true, Ordering::SeqCst);

        let types_none = obj
            .metadata
            .get("subscriptions")
            .and_then(Value::as_str)
            .map(|t| t == "none")
            .unwrap_or(false);

        if receive != "none" && !types_none {
            let mut metadata = Map::new();
            metadata.insert(
                "event".to_owned(),
                Value::String("clients/register/reply".to_owned()),
            );
            metadata.insert(
                "routing-id".to_owned(),
                Value::String(sender.routing.routing_id()),
            );
            sender.send(Arc::new(BusinessObject::new(metadata, Vec::new())));
        }

        let mut notify_meta = Map::new();
        notify_meta.insert(
            "event".to_owned(),
            Value::String("routing/subscribe/notification".to_owned()),
        );
        notify_meta.insert(
            "routing-id".to_owned(),
            Value::String(sender.routing.routing_id()),
        );
        let notification = Arc::new(BusinessObject::new(notify_meta, Vec::new()));
        for other in sessions {
            if !Arc::ptr_eq(other, sender) {
                other.send(notification.clone());
            }
        }

        let mut request_meta = Map::new();
        request_meta.insert(
            "event".to_owned(),
            Value::String("services/request".to_owned()),
        );
        request_meta.insert("name".to_owned(), Value::String("clients".to_owned()));
        request_meta.insert("request".to_owned(), Value::String("join".to_owned()));
        request_meta.insert(
            "client".to_owned(),
            obj.metadata
                .get("name")
                .cloned()
                .unwrap_or_else(|| Value::String("no-client".to_owned())),
        );
        request_meta.insert(
            "user".to_owned(),
            obj.metadata
                .get("user")
                .cloned()
                .unwrap_or_else(|| Value::String("no-user".to_owned())),
        );
        BusinessObject::new(request_meta, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[tokio::test]
    async fn no_echo_legacy_subscription_sets_echo_false() {
        let mw = LegacySubscriptionMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::event_only(
            "routing/subscribe",
            vec![("receive-mode", Value::from("no_echo")), ("types", Value::from("all"))],
        );
        let out = mw.handle(obj, &sender, &[sender.clone()]).await.unwrap();
        assert!(out.is_none());
        assert!(sender.is_subscribed());
        assert!(!sender.echo());
    }

    #[tokio::test]
    async fn events_only_mode_subscribes_to_event_rule() {
        let mw = LegacySubscriptionMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::event_only(
            "routing/subscribe",
            vec![("receive-mode", Value::from("events_only")), ("types", Value::from("all"))],
        );
        mw.handle(obj, &sender, &[sender.clone()]).await.unwrap();
        assert_eq!(sender.routing.subscriptions.read().unwrap().as_slice(), ["@*"]);
    }

    #[tokio::test]
    async fn non_legacy_subscribe_passes_through() {
        let mw = LegacySubscriptionMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::event_only("routing/subscribe", vec![("subscriptions", Value::from(vec!["*"]))]);
        let out = mw.handle(obj, &sender, &[]).await.unwrap();
        assert!(out.is_some());
    }
}
