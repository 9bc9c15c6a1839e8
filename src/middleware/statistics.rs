//! Statistics stage (§4.4): counters plus a `server/statistics` reply,
//! grounded in `original_source/objectoplex/middleware.py`'s
//! `StatisticsMiddleware`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::middleware::Middleware;
use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

#[derive(Default)]
struct Counters {
    received_objects: AtomicU64,
    bytes_in: AtomicU64,
    clients_connected_total: AtomicU64,
    clients_disconnected_total: AtomicU64,
    objects_by_type: Mutex<HashMap<String, u64>>,
    events_by_type: Mutex<HashMap<String, u64>>,
}

pub struct StatisticsMiddleware {
    counters: Counters,
}

impl Default for StatisticsMiddleware {
    fn default() -> Self {
        StatisticsMiddleware {
            counters: Counters::default(),
        }
    }
}

impl StatisticsMiddleware {
    fn bump_map(map: &Mutex<HashMap<String, u64>>, key: String) {
        *map.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    fn snapshot(&self, sessions: &[Arc<Session>]) -> Value {
        let objects_by_type: Map<String, Value> = self
            .counters
            .objects_by_type
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        let events_by_type: Map<String, Value> = self
            .counters
            .events_by_type
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();

        let mut doc = Map::new();
        doc.insert(
            "received objects".to_owned(),
            Value::from(self.counters.received_objects.load(Ordering::Relaxed)),
        );
        doc.insert(
            "clients connected total".to_owned(),
            Value::from(self.counters.clients_connected_total.load(Ordering::Relaxed)),
        );
        doc.insert(
            "clients disconnected total".to_owned(),
            Value::from(
                self.counters
                    .clients_disconnected_total
                    .load(Ordering::Relaxed),
            ),
        );
        doc.insert("objects by type".to_owned(), Value::Object(objects_by_type));
        doc.insert("events by type".to_owned(), Value::Object(events_by_type));
        doc.insert("client count".to_owned(), Value::from(sessions.len()));
        doc.insert(
            "bytes in".to_owned(),
            Value::from(self.counters.bytes_in.load(Ordering::Relaxed)),
        );
        Value::Object(doc)
    }
}

#[async_trait]
impl Middleware for StatisticsMiddleware {
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        self.counters.received_objects.fetch_add(1, Ordering::Relaxed);

        let type_key = obj
            .content_type
            .as_ref()
            .map(|ct| ct.to_string())
            .unwrap_or_default();
        Self::bump_map(&self.counters.objects_by_type, type_key);

        if let Some(event) = &obj.event {
            Self::bump_map(&self.counters.events_by_type, event.clone());
        }

        if obj.event.as_deref() == Some("server/statistics") {
            let payload = serde_json::to_vec(&self.snapshot(sessions)).unwrap_or_default();
            let mut metadata = Map::new();
            metadata.insert(
                "event".to_owned(),
                Value::String("server/statistics/reply".to_owned()),
            );
            metadata.insert("in-reply-to".to_owned(), Value::String(obj.id.clone()));
            metadata.insert("type".to_owned(), Value::String("text/json".to_owned()));
            let reply = BusinessObject::new(metadata, payload);
            sender.send(Arc::new(reply));
            return Ok(None);
        }

        self.counters
            .bytes_in
            .fetch_add(obj.encode().len() as u64, Ordering::Relaxed);

        Ok(Some(obj))
    }

    async fn connect(&self, _session: &Arc<Session>, _sessions: &[Arc<Session>]) {
        self.counters
            .clients_connected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn disconnect(&self, _session: &Arc<Session>, _sessions: &[Arc<Session>]) {
        self.counters
            .clients_disconnected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "statistics"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[tokio::test]
    async fn statistics_event_replies_and_stops_chain() {
        let mw = StatisticsMiddleware::default();
        let sender = Session::new(Role::Client, None);
        sender.routing.subscribed.store(true, Ordering::SeqCst);
        let obj = BusinessObject::event_only("server/statistics", vec![]);
        let out = mw.handle(obj, &sender, &[sender.clone()]).await.unwrap();
        assert!(out.is_none());
        assert_eq!(sender.outbound().len(), 1);
    }

    #[tokio::test]
    async fn ordinary_object_passes_through_and_counts() {
        let mw = StatisticsMiddleware::default();
        let sender = Session::new(Role::Client, None);
        let obj = BusinessObject::new(Map::new(), b"hi".to_vec());
        let out = mw.handle(obj, &sender, &[]).await.unwrap();
        assert!(out.is_some());
        assert_eq!(mw.counters.received_objects.load(Ordering::Relaxed), 1);
    }
}
