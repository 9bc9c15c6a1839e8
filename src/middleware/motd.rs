//! Optional MOTD stage (§4.4): sends a banner to every newly connected
//! session, grounded in `MOTDMiddleware` in
//! `original_source/objectoplex/middleware.py`. Not part of the default
//! chain.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;

pub struct MotdMiddleware {
    payload: Vec<u8>,
}

impl MotdMiddleware {
    pub fn new(text: impl Into<String>) -> Self {
        MotdMiddleware {
            payload: text.into().into_bytes(),
        }
    }
}

#[async_trait]
impl Middleware for MotdMiddleware {
    async fn connect(&self, session: &Arc<Session>, _sessions: &[Arc<Session>]) {
        let mut metadata = Map::new();
        metadata.insert(
            "type".to_owned(),
            Value::String("text/plain; charset=UTF-8".to_owned()),
        );
        metadata.insert("sender".to_owned(), Value::String("objectoplex".to_owned()));
        session.send(Arc::new(BusinessObject::new(metadata, self.payload.clone())));
    }

    fn name(&self) -> &'static str {
        "motd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[tokio::test]
    async fn connect_enqueues_banner() {
        let mw = MotdMiddleware::new("welcome");
        let session = Session::new(Role::Client, None);
        mw.connect(&session, &[]).await;
        let rx = session.outbound();
        let banner = rx.try_recv().unwrap();
        assert_eq!(banner.payload, b"welcome");
    }
}
