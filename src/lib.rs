pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod transport;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use config::{BreakerConfig, ClientConfig};
use error::Error;
use events::{Event, EventBus, EventKind, RequestSummary};
use limiter::{Admission, ConcurrencyLimiter};
use transport::Transport;

type KeyFn = Arc<dyn Fn(&OutboundRequest) -> String + Send + Sync>;

/// One logical outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Uri, body: impl Into<Bytes>) -> Self {
        let mut req = Self::new(Method::POST, url);
        req.body = Some(body.into());
        req
    }

    /// Add a header. Invalid names or values are dropped here rather than
    /// deferred to send time.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// A completed upstream response with the body fully buffered. Header keys
/// are lowercased; repeated headers are joined with `", "`.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Combined point-in-time view of the limiter and all breaker buckets.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub in_flight: usize,
    pub queue_depth: usize,
    pub max_in_flight: usize,
    pub max_queue: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Builder for configuring a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    key_fn: Option<KeyFn>,
    events: EventBus,
}

impl ClientBuilder {
    /// Replace the whole configuration, e.g. one loaded from TOML.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.config.max_in_flight = n;
        self
    }

    pub fn max_queue(mut self, n: usize) -> Self {
        self.config.max_queue = n;
        self
    }

    pub fn enqueue_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.enqueue_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    /// Custom breaker key derivation. Defaults to the URL host, so each
    /// upstream host gets its own circuit.
    pub fn key_fn(
        mut self,
        f: impl Fn(&OutboundRequest) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Subscribe to one lifecycle event kind. Handlers run synchronously on
    /// the request path in registration order.
    pub fn on_event(
        self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Self {
        self.events.subscribe(kind, handler);
        self
    }

    /// Subscribe to every lifecycle event.
    pub fn on_any_event(self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.events.subscribe_all(handler);
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<Client, error::ConfigError> {
        self.config.validate()?;
        let limiter = ConcurrencyLimiter::new(
            self.config.max_in_flight,
            self.config.max_queue,
            self.config.enqueue_timeout,
        );
        let breaker = CircuitBreaker::new(self.config.breaker.clone());
        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                limiter,
                breaker,
                transport: Transport::new(),
                events: self.events,
                key_fn: self.key_fn.unwrap_or_else(|| Arc::new(host_key)),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }
}

fn host_key(req: &OutboundRequest) -> String {
    req.url.host().unwrap_or("unknown").to_string()
}

/// Outbound HTTP client that guards every call with four coupled
/// protections: a cap on concurrent in-flight requests, a bounded FIFO wait
/// queue with an admission timeout, a hard per-request deadline, and a
/// per-upstream circuit breaker fed by a rolling outcome window.
///
/// Each logical request is admitted (or rejected locally), executed at most
/// once, classified, and fed back into the shared protection state. There
/// are no retries and no fallbacks; every failure surfaces to the caller.
///
/// Cheaply cloneable via an internal `Arc`; clones share all state.
///
/// # Examples
///
/// ```rust,no_run
/// use breakwater::{Client, OutboundRequest};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder().max_in_flight(16).build()?;
/// let resp = client
///     .request(OutboundRequest::get("https://api.example.com/health".parse()?))
///     .await?;
/// assert_eq!(resp.status, 200);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    limiter: ConcurrencyLimiter,
    breaker: CircuitBreaker,
    transport: Transport,
    events: EventBus,
    key_fn: KeyFn,
    next_request_id: AtomicU64,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::default(),
            key_fn: None,
            events: EventBus::new(),
        }
    }

    /// Subscribe to one lifecycle event kind after construction.
    pub fn on_event(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.inner.events.subscribe(kind, handler);
    }

    /// Subscribe to every lifecycle event after construction.
    pub fn on_any_event(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.inner.events.subscribe_all(handler);
    }

    /// Issue one logical request: breaker admission, limiter admission, one
    /// outbound exchange under the request deadline, outcome classification.
    ///
    /// Admission rejections (`CircuitOpen`, `QueueFull`, `QueueTimeout`)
    /// perform no I/O and are never reported to the breaker; feeding local
    /// overload back into upstream health would self-reinforce during load
    /// shedding.
    pub async fn request(&self, request: OutboundRequest) -> Result<OutboundResponse, Error> {
        let inner = &self.inner;

        if request.url.host().is_none() {
            return Err(Error::InvalidUrl {
                url: request.url.to_string(),
            });
        }

        let key = (inner.key_fn)(&request);
        let request_id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let summary = request.summary();

        let decision = inner.breaker.allow(&key, Instant::now());
        if let Some(change) = decision.changed {
            inner.events.emit(&Event::BreakerState {
                key: key.clone(),
                from: change.from,
                to: change.to,
            });
        }
        if !decision.allowed {
            let err = Error::CircuitOpen {
                key: key.clone(),
                retry_after: decision.retry_after.unwrap_or_default(),
            };
            inner.events.emit(&Event::RequestRejected {
                key,
                request: summary,
                request_id,
                error: err.to_string(),
            });
            return Err(err);
        }
        // An allowed half-open check reserved a probe slot that must be
        // returned if the limiter rejects before any I/O happens.
        let probe_reserved = decision.state == BreakerState::HalfOpen;

        let permit = match inner.limiter.admit() {
            Admission::Granted(permit) => permit,
            Admission::Rejected { max_queue } => {
                inner.events.emit(&Event::QueueFull {
                    key: key.clone(),
                    request: summary.clone(),
                    request_id,
                    queue_depth: inner.limiter.snapshot().queue_depth,
                });
                return Err(self.reject_after_admission(
                    probe_reserved,
                    key,
                    summary,
                    request_id,
                    Error::QueueFull { max_queue },
                ));
            }
            Admission::Queued {
                queue_depth,
                handle,
            } => {
                inner.events.emit(&Event::QueueEnqueued {
                    key: key.clone(),
                    request: summary.clone(),
                    request_id,
                    queue_depth,
                });
                match handle.wait().await {
                    Ok(permit) => {
                        inner.events.emit(&Event::QueueDequeued {
                            key: key.clone(),
                            request: summary.clone(),
                            request_id,
                            queue_depth: inner.limiter.snapshot().queue_depth,
                        });
                        permit
                    }
                    Err(err) => {
                        inner.events.emit(&Event::QueueTimeout {
                            key: key.clone(),
                            request: summary.clone(),
                            request_id,
                            queue_depth: inner.limiter.snapshot().queue_depth,
                        });
                        return Err(self.reject_after_admission(
                            probe_reserved,
                            key,
                            summary,
                            request_id,
                            err,
                        ));
                    }
                }
            }
        };

        let start = Instant::now();
        inner.events.emit(&Event::RequestStart {
            key: key.clone(),
            request: summary.clone(),
            request_id,
        });

        let result = inner
            .transport
            .send(&request, inner.config.request_timeout)
            .await;
        let duration = start.elapsed();

        let change = match &result {
            Ok(resp) => {
                // A 5xx is a completed exchange, so it stays a
                // request:success event, but it signals upstream failure to
                // the breaker.
                let change = if resp.status.is_server_error() {
                    inner.breaker.on_failure(&key, Instant::now())
                } else {
                    inner.breaker.on_success(&key)
                };
                inner.events.emit(&Event::RequestSuccess {
                    key: key.clone(),
                    request: summary,
                    request_id,
                    status: resp.status,
                    duration,
                });
                change
            }
            Err(err) => {
                let change = inner.breaker.on_failure(&key, Instant::now());
                inner.events.emit(&Event::RequestFailure {
                    key: key.clone(),
                    request: summary,
                    request_id,
                    error_name: err.name(),
                    duration,
                });
                change
            }
        };

        drop(permit);

        if let Some(change) = change {
            inner.events.emit(&Event::BreakerState {
                key,
                from: change.from,
                to: change.to,
            });
        }

        result
    }

    /// Limiter rejection after breaker admission: return the reserved probe
    /// slot, emit `request:rejected`, surface the error. The breaker's
    /// outcome window is never touched on this path.
    fn reject_after_admission(
        &self,
        probe_reserved: bool,
        key: String,
        summary: RequestSummary,
        request_id: u64,
        err: Error,
    ) -> Error {
        if probe_reserved {
            self.inner.breaker.cancel_probe(&key);
        }
        self.inner.events.emit(&Event::RequestRejected {
            key,
            request: summary,
            request_id,
            error: err.to_string(),
        });
        err
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let limiter = self.inner.limiter.snapshot();
        ClientSnapshot {
            in_flight: limiter.in_flight,
            queue_depth: limiter.queue_depth,
            max_in_flight: limiter.max_in_flight,
            max_queue: limiter.max_queue,
            breakers: self.inner.breaker.snapshot(),
        }
    }
}
