//! Optional diagnostic stage (§4.4 expansion), grounded in `StdErrMiddleware`
//! in `original_source/objectoplex/middleware.py`, which dumps every
//! object it sees to stderr. Pure tracing, no routing semantics; never
//! part of the default chain.

use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

#[derive(Default)]
pub struct DebugDumpMiddleware;

#[async_trait]
impl Middleware for DebugDumpMiddleware {
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        _sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        trace!(
            "## from {sender}: id={} event={:?} type={:?} size={}",
            obj.id,
            obj.event,
            obj.content_type.as_ref().map(ToString::to_string),
            obj.size,
        );
        Ok(Some(obj))
    }

    fn name(&self) -> &'static str {
        "debug_dump"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use serde_json::Map;

    #[tokio::test]
    async fn passes_every_object_through_unchanged() {
        let mw = DebugDumpMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::new(Map::new(), b"hi".to_vec());
        let id = obj.id.clone();
        let out = mw.handle(obj, &sender, &[]).await.unwrap().unwrap();
        assert_eq!(out.id, id);
    }
}
