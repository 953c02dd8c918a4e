use std::sync::{Arc, RwLock};
use std::time::Duration;

use http::{Method, StatusCode, Uri};

use crate::breaker::BreakerState;

/// Lightweight request identity carried in event payloads. The body is
/// deliberately not included; handlers run synchronously on the request path.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub url: Uri,
}

/// The named event families of the client lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    QueueEnqueued,
    QueueDequeued,
    QueueFull,
    QueueTimeout,
    RequestStart,
    RequestSuccess,
    RequestFailure,
    RequestRejected,
    BreakerState,
}

impl EventKind {
    /// The event's wire name, e.g. `"queue:enqueued"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::QueueEnqueued => "queue:enqueued",
            EventKind::QueueDequeued => "queue:dequeued",
            EventKind::QueueFull => "queue:full",
            EventKind::QueueTimeout => "queue:timeout",
            EventKind::RequestStart => "request:start",
            EventKind::RequestSuccess => "request:success",
            EventKind::RequestFailure => "request:failure",
            EventKind::RequestRejected => "request:rejected",
            EventKind::BreakerState => "breaker:state",
        }
    }
}

/// One lifecycle event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    QueueEnqueued {
        key: String,
        request: RequestSummary,
        request_id: u64,
        queue_depth: usize,
    },
    QueueDequeued {
        key: String,
        request: RequestSummary,
        request_id: u64,
        queue_depth: usize,
    },
    QueueFull {
        key: String,
        request: RequestSummary,
        request_id: u64,
        queue_depth: usize,
    },
    QueueTimeout {
        key: String,
        request: RequestSummary,
        request_id: u64,
        queue_depth: usize,
    },
    RequestStart {
        key: String,
        request: RequestSummary,
        request_id: u64,
    },
    RequestSuccess {
        key: String,
        request: RequestSummary,
        request_id: u64,
        status: StatusCode,
        duration: Duration,
    },
    RequestFailure {
        key: String,
        request: RequestSummary,
        request_id: u64,
        error_name: &'static str,
        duration: Duration,
    },
    RequestRejected {
        key: String,
        request: RequestSummary,
        request_id: u64,
        error: String,
    },
    BreakerState {
        key: String,
        from: BreakerState,
        to: BreakerState,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::QueueEnqueued { .. } => EventKind::QueueEnqueued,
            Event::QueueDequeued { .. } => EventKind::QueueDequeued,
            Event::QueueFull { .. } => EventKind::QueueFull,
            Event::QueueTimeout { .. } => EventKind::QueueTimeout,
            Event::RequestStart { .. } => EventKind::RequestStart,
            Event::RequestSuccess { .. } => EventKind::RequestSuccess,
            Event::RequestFailure { .. } => EventKind::RequestFailure,
            Event::RequestRejected { .. } => EventKind::RequestRejected,
            Event::BreakerState { .. } => EventKind::BreakerState,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous subscription registry for lifecycle events.
///
/// Subscriptions are additive; handlers run synchronously in registration
/// order on the task that emitted the event. Handlers must be fast and must
/// not block.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(Option<EventKind>, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap()
            .push((Some(kind), Arc::new(handler)));
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap()
            .push((None, Arc::new(handler)));
    }

    pub fn emit(&self, event: &Event) {
        // Snapshot matching handlers so a handler can subscribe without
        // deadlocking on the registry lock.
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .filter(|(kind, _)| kind.is_none() || *kind == Some(event.kind()))
            .map(|(_, h)| h.clone())
            .collect();
        for handler in matching {
            handler(event);
        }
    }
}
