//! Connection handles with bounded outbound queues
//!
//! A [`Connection`] is the hub's view of one live client session. The hub
//! enqueues events onto the connection's bounded queue without ever blocking;
//! the transport layer (out of scope here) drains the matching
//! [`EventReceiver`] and writes events to the socket. A consumer that stops
//! draining fills its queue and gets evicted by the owning shard.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{ConnectionId, Event, EventKind, EventScope, UserId};
use crate::{current_timestamp, generate_connection_id};

/// Why a non-blocking enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound queue is at capacity
    Full,
    /// The transport side dropped its receiver
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "full"),
            EnqueueError::Closed => write!(f, "closed"),
        }
    }
}

/// One live client session as seen by the hub
#[derive(Debug)]
pub struct Connection {
    /// Connection ID, unique per session
    id: ConnectionId,
    /// Owning user; empty until the session layer authenticates
    user_id: UserId,
    /// Bounded outbound event queue (hub side)
    send: mpsc::Sender<Arc<Event>>,
    /// Whether the session layer has authenticated this connection
    authenticated: AtomicBool,
    /// Timestamp of the most recent cache invalidation, 0 if never
    last_invalidated: AtomicU64,
    /// Cancelled when the transport should tear the session down
    close_token: CancellationToken,
    /// Connection creation timestamp
    created_at: u64,
}

/// Transport-side half of a connection: drains the outbound queue
pub struct EventReceiver {
    events: mpsc::Receiver<Arc<Event>>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection with an outbound queue of `queue_size` events.
    ///
    /// Returns the hub-side handle and the transport-side receiver.
    pub fn new(user_id: UserId, queue_size: usize) -> (Arc<Connection>, EventReceiver) {
        let (send, recv) = mpsc::channel(queue_size);
        let close_token = CancellationToken::new();

        let connection = Arc::new(Connection {
            id: generate_connection_id(),
            user_id,
            send,
            authenticated: AtomicBool::new(false),
            last_invalidated: AtomicU64::new(0),
            close_token: close_token.clone(),
            created_at: current_timestamp(),
        });

        let receiver = EventReceiver {
            events: recv,
            closed: close_token,
        };

        (connection, receiver)
    }

    /// Connection ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning user ID; empty for unauthenticated sessions
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Connection creation timestamp in milliseconds since UNIX epoch
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Mark this connection as authenticated (session layer calls this)
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Check whether the session layer has authenticated this connection
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue of one event onto the outbound queue
    pub fn try_enqueue(&self, event: Arc<Event>) -> Result<(), EnqueueError> {
        match self.send.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Enqueue the one-time server greeting.
    ///
    /// Called by the registry after a registration is accepted, outside the
    /// shard loop. A full queue drops the greeting rather than feeding back
    /// into the loop.
    pub fn send_hello(&self) {
        let hello = Event::new(EventKind::Hello, EventScope::User(self.user_id.clone()))
            .with_payload(json!({ "connection_id": self.id }));

        if let Err(reason) = self.try_enqueue(Arc::new(hello)) {
            debug!(
                "hello for connection {} dropped, queue {}",
                self.id, reason
            );
        }
    }

    /// Cache-invalidation hook.
    ///
    /// Bumps the last-invalidated marker so the authorization collaborator
    /// knows to discard any per-connection cached membership. Called
    /// synchronously by the owning shard's loop.
    pub fn invalidate_cache(&self) {
        self.last_invalidated
            .store(current_timestamp(), Ordering::SeqCst);
    }

    /// Timestamp of the most recent cache invalidation, 0 if never
    pub fn last_invalidated(&self) -> u64 {
        self.last_invalidated.load(Ordering::SeqCst)
    }

    /// Signal the transport layer to tear this session down
    pub fn close(&self) {
        self.close_token.cancel();
    }

    /// Check whether the transport was told to close
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }
}

impl EventReceiver {
    /// Receive the next event, or `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        if self.closed.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Check whether the hub closed this connection
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
