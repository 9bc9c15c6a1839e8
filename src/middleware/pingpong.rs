//! PingPong stage (§4.4): replies `pong` to a subscribed sender's `ping`,
//! grounded in `PingPongMiddleware` in
//! `original_source/objectoplex/middleware.py`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

#[derive(Default)]
pub struct PingPongMiddleware;

#[async_trait]
impl Middleware for PingPongMiddleware {
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        _sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        if obj.event.as_deref() == Some("ping") && sender.is_subscribed() {
            let mut metadata = Map::new();
            metadata.insert("event".to_owned(), Value::String("pong".to_owned()));
            metadata.insert(
                "routing-id".to_owned(),
                Value::String(sender.routing.routing_id()),
            );
            metadata.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
            sender.send(Arc::new(BusinessObject::new(metadata, Vec::new())));
            return Ok(None);
        }
        Ok(Some(obj))
    }

    fn name(&self) -> &'static str {
        "pingpong"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[tokio::test]
    async fn ping_is_gated_on_subscribed() {
        let mw = PingPongMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::event_only("ping", vec![("id".into(), Value::from("M1"))]);
        let out = mw.handle(obj, &sender, &[]).await.unwrap();
        assert!(out.is_some());
        assert_eq!(sender.outbound().len(), 0);
    }

    #[tokio::test]
    async fn ping_replies_pong_when_subscribed() {
        let mw = PingPongMiddleware;
        let sender = Session::new(Role::Client, None);
        sender.routing.subscribed.store(true, std::sync::atomic::Ordering::SeqCst);
        sender.routing.set_routing_id("r1".to_owned());
        let obj = BusinessObject::event_only("ping", vec![("id".into(), Value::from("M2"))]);
        let out = mw.handle(obj, &sender, &[]).await.unwrap();
        assert!(out.is_none());
        let rx = sender.outbound();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event.as_deref(), Some("pong"));
        assert_eq!(
            reply.metadata.get("in-reply-to").unwrap().as_str(),
            Some("M2")
        );
    }
}
