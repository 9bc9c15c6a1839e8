//! Checksum stage (§4.4): adds `sha1` when missing, never overwrites it.

use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

#[derive(Default)]
pub struct ChecksumMiddleware;

#[async_trait]
impl Middleware for ChecksumMiddleware {
    async fn handle(
        &self,
        mut obj: BusinessObject,
        _sender: &Arc<Session>,
        _sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        if obj.size > 0 && !obj.metadata.contains_key("sha1") {
            let mut hasher = Sha1::new();
            hasher.update(&obj.payload);
            let digest = hasher.finalize();
            obj.metadata.insert(
                "sha1".to_owned(),
                serde_json::Value::String(to_hex(&digest)),
            );
        }
        Ok(Some(obj))
    }

    fn name(&self) -> &'static str {
        "checksum"
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use serde_json::{Map, Value};

    #[tokio::test]
    async fn adds_sha1_when_missing() {
        let mw = ChecksumMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::new(Map::new(), b"hello".to_vec());
        let out = mw.handle(obj, &sender, &[]).await.unwrap().unwrap();
        assert!(out.metadata.get("sha1").is_some());
    }

    #[tokio::test]
    async fn never_overwrites_existing_sha1() {
        let mw = ChecksumMiddleware;
        let sender = Session::new(Role::Client, None);
        let mut meta = Map::new();
        meta.insert("sha1".to_owned(), Value::String("deadbeef".to_owned()));
        let obj = BusinessObject::new(meta, b"hello".to_vec());
        let out = mw.handle(obj, &sender, &[]).await.unwrap().unwrap();
        assert_eq!(out.metadata.get("sha1").unwrap().as_str(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn empty_payload_gets_no_sha1() {
        let mw = ChecksumMiddleware;
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::new(Map::new(), Vec::new());
        let out = mw.handle(obj, &sender, &[]).await.unwrap().unwrap();
        assert!(out.metadata.get("sha1").is_none());
    }
}
