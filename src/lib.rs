//! ObjectoPlex: an object-oriented message broker.
//!
//! Clients connect over TCP, frame typed [`object::BusinessObject`]s, and
//! subscribe to the subset of traffic they care about. Brokers may be
//! peered with other brokers to form a routed mesh; the [`middleware`]
//! chain is where that routing (and everything else applied to an object
//! in flight) happens.

pub mod broker;
pub mod middleware;
pub mod object;
pub mod rule_engine;
pub mod session;
pub mod topology;

pub use broker::Broker;
pub use object::BusinessObject;
pub use session::Session;

/// Maximum size, in UTF-8 bytes, of the JSON metadata header before the
/// terminating NUL. Exceeding this aborts the frame (§4.1, P2).
pub const MAX_METADATA_BYTES: usize = 2048;

/// Idle timeout while reading a frame: if no byte arrives for this long,
/// the read fails (§4.1).
pub const METADATA_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Hard ceiling on the total time spent decoding a single frame (§4.1).
pub const METADATA_TOTAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Capacity of a session's outbound queue (§4.2, §5, P3).
pub const OUTBOUND_QUEUE_SIZE: usize = 100;

/// How long a peer link may go without an inbound frame before it is
/// closed for inactivity (§4.2).
pub const PEER_INACTIVITY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Backoff between failed peer-link dial attempts (§4.3).
pub const PEER_RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);

/// Idle timeout used by the peer-link and unregister queues while waiting
/// for work (purely a liveness knob, §4.3).
pub const QUEUE_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Idle timeout a reader waits for socket readability before checking
/// whether it should still be running (§4.2).
pub const READER_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Interval at which the broker's `Timer` task invokes every middleware's
/// `periodical` hook (§2, step 6).
pub const TIMER_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Interval at which `RoutingMiddleware` broadcasts a neighbor
/// announcement (§4.5).
pub const ANNOUNCEMENT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Decode,
    Io,
    NotSubscribed,
    Busy,
    Closed,
}

/// The crate-wide error type.
///
/// Decode and socket errors close the offending session only (§7);
/// nothing here is meant to be fatal to the broker as a whole.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid object: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sender not subscribed")]
    NotSubscribed,
    #[error("already registered: {0}")]
    Busy(String),
    #[error("session closed")]
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) => ErrorKind::Decode,
            Error::Io(_) => ErrorKind::Io,
            Error::NotSubscribed => ErrorKind::NotSubscribed,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Closed => ErrorKind::Closed,
        }
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Error::Decode(msg.into())
    }

    pub fn busy<S: Into<String>>(msg: S) -> Self {
        Error::Busy(msg.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::decode("timed out reading object")
    }
}
