//! The middleware chain (§4.4).
//!
//! Grounded in `original_source/objectoplex/middleware.py`'s `Middleware`
//! base class and `server.py`'s `ObjectoPlex.send`/`handle`/`unregister`
//! loops, which call every stage in order and keep going if a stage
//! fails (§7 `MiddlewareException`). The original catches arbitrary
//! Python exceptions; here the same resilience is modeled with `Result`
//! on the hot `handle` path rather than by catching panics, since a
//! middleware stage that panics is a bug to fix, not a condition to
//! recover from at runtime.

pub mod checksum;
pub mod debug_dump;
pub mod legacy;
pub mod motd;
pub mod pingpong;
pub mod routing;
pub mod statistics;

use std::sync::Arc;

use async_trait::async_trait;
use log::error;

use crate::object::BusinessObject;
use crate::session::Session;
use crate::Error;

/// A stage in the middleware chain. Any hook may be a no-op; the default
/// implementations here are exactly that (§4.4).
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Returns `Ok(Some(obj))` (possibly mutated) to continue the chain,
    /// `Ok(None)` to stop it here ("handled"), or `Err` if this stage
    /// failed to process the object — the chain logs the error and
    /// continues with the object unchanged by this stage (§7), except
    /// when this is the terminal (Routing) stage, whose failure drops
    /// the object (§7 exception).
    async fn handle(
        &self,
        obj: BusinessObject,
        sender: &Arc<Session>,
        sessions: &[Arc<Session>],
    ) -> Result<Option<BusinessObject>, Error> {
        let _ = (sender, sessions);
        Ok(Some(obj))
    }

    async fn connect(&self, session: &Arc<Session>, sessions: &[Arc<Session>]) {
        let _ = (session, sessions);
    }

    async fn disconnect(&self, session: &Arc<Session>, sessions: &[Arc<Session>]) {
        let _ = (session, sessions);
    }

    async fn periodical(&self, sessions: &[Arc<Session>]) {
        let _ = sessions;
    }

    fn name(&self) -> &'static str;
}

/// An ordered sequence of middleware stages, run for every inbound
/// object, connect, disconnect, and once-a-second tick (§2, §4.4). The
/// Routing stage must be last (§4.4): it is the stage that delivers to
/// recipients.
pub struct MiddlewareChain {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(stages: Vec<Box<dyn Middleware>>) -> Self {
        MiddlewareChain { stages }
    }

    pub async fn handle(&self, obj: BusinessObject, sender: &Arc<Session>, sessions: &[Arc<Session>]) {
        let mut current = obj;
        let last = self.stages.len().saturating_sub(1);
        for (i, stage) in self.stages.iter().enumerate() {
            let retry = current.clone();
            match stage.handle(current, sender, sessions).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return,
                Err(e) => {
                    error!("middleware {} failed handling an object: {e}", stage.name());
                    if i == last {
                        return;
                    }
                    current = retry;
                }
            }
        }
    }

    pub async fn connect(&self, session: &Arc<Session>, sessions: &[Arc<Session>]) {
        for stage in &self.stages {
            stage.connect(session, sessions).await;
        }
    }

    pub async fn disconnect(&self, session: &Arc<Session>, sessions: &[Arc<Session>]) {
        for stage in &self.stages {
            stage.disconnect(session, sessions).await;
        }
    }

    pub async fn periodical(&self, sessions: &[Arc<Session>]) {
        for stage in &self.stages {
            stage.periodical(sessions).await;
        }
    }
}
