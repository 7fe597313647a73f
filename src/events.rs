//! Ordered, typed event hooks used to notify outer layers of protocol events.
//!
//! Each hook delivers a context (the session) and a payload to every handler
//! in subscription order. A handler that errors or panics is logged and
//! skipped; delivery continues with the next one.

use crate::Message;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub type HandlerId = u64;

type Handler<C, P> = Arc<dyn Fn(&C, &P) -> anyhow::Result<()> + Send + Sync>;

pub struct EventHook<C, P> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Handler<C, P>)>>,
}

impl<C, P> EventHook<C, P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&C, &P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns false when no handler has that id.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver to every handler subscribed at the time of the call and
    /// return how many completed without error.
    pub fn fire(&self, context: &C, payload: &P) -> usize {
        // Snapshot so handlers may (un)subscribe while being called
        let handlers: Vec<(HandlerId, Handler<C, P>)> = self.handlers.read().clone();
        debug!("Firing {} to {} handler(s)", self.name, handlers.len());

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(context, payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("{} handler {} failed: {:#}", self.name, id, e),
                Err(_) => warn!("{} handler {} panicked", self.name, id),
            }
        }
        delivered
    }
}

/// A datagram that triggered an event.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: SocketAddr,
    pub raw: String,
    pub message: Message,
}

/// An instant message delivered to this extension.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub source: SocketAddr,
    pub raw: String,
    pub body: String,
}

/// High-level status reported to an outer system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Registered,
    Ringing,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Init => "init",
            SessionStatus::Registered => "registered",
            SessionStatus::Ringing => "ringing",
        }
    }
}

/// Receives status changes. Implementations must not block; delivery is
/// best-effort.
pub trait StatePublisher: Send + Sync {
    fn publish(&self, status: SessionStatus);
}

/// The named hooks a session fires, with `C` the session handle.
pub struct SessionEvents<C> {
    pub call_accepted: EventHook<C, Inbound>,
    pub call_rejected: EventHook<C, Inbound>,
    pub call_ended: EventHook<C, Inbound>,
    pub call_error: EventHook<C, Inbound>,
    pub call_ringing: EventHook<C, Inbound>,
    pub call_registered: EventHook<C, Inbound>,
    pub message_sent: EventHook<C, Inbound>,
    pub message_received: EventHook<C, ReceivedMessage>,
}

impl<C> Default for SessionEvents<C> {
    fn default() -> Self {
        Self {
            call_accepted: EventHook::new("call_accepted"),
            call_rejected: EventHook::new("call_rejected"),
            call_ended: EventHook::new("call_ended"),
            call_error: EventHook::new("call_error"),
            call_ringing: EventHook::new("call_ringing"),
            call_registered: EventHook::new("call_registered"),
            message_sent: EventHook::new("message_sent"),
            message_received: EventHook::new("message_received"),
        }
    }
}

impl<C> SessionEvents<C> {
    /// Report `registered` and `ringing` transitions to `publisher`.
    /// A call ending returns the status to `registered`.
    pub fn bind_status(&self, publisher: Arc<dyn StatePublisher>) -> [HandlerId; 3] {
        let on_registered = publisher.clone();
        let on_ringing = publisher.clone();
        let on_ended = publisher;
        [
            self.call_registered.subscribe(move |_, _| {
                on_registered.publish(SessionStatus::Registered);
                Ok(())
            }),
            self.call_ringing.subscribe(move |_, _| {
                on_ringing.publish(SessionStatus::Ringing);
                Ok(())
            }),
            self.call_ended.subscribe(move |_, _| {
                on_ended.publish(SessionStatus::Registered);
                Ok(())
            }),
        ]
    }
}
