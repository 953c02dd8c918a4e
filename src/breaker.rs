use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::window::RollingWindow;

/// Public view of a circuit's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition performed by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct AllowDecision {
    pub allowed: bool,
    pub state: BreakerState,
    /// Set when denied: how long until the next probe becomes possible.
    /// Zero when denied only because all probe slots are taken.
    pub retry_after: Option<Duration>,
    /// A transition performed during this check (open to half-open).
    pub changed: Option<StateChange>,
}

enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen {
        in_flight: usize,
        successes: usize,
    },
}

impl State {
    fn public(&self) -> BreakerState {
        match self {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

struct Bucket {
    state: State,
    window: RollingWindow,
}

/// Per-key entry in a breaker snapshot.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub window_count: usize,
    pub window_failures: usize,
    pub opened_at: Option<Instant>,
}

/// Per-upstream circuit breaker driven by a rolling outcome window.
///
/// Each key gets its own state machine; buckets are created lazily on first
/// reference and live for the breaker's lifetime. The open-to-half-open
/// transition is triggered lazily by the first `allow` call after the
/// cooldown, never by a timer, so idle keys cost nothing.
///
/// `allow` reserves a probe slot when it admits in half-open; the caller
/// must follow every allowed check with exactly one `on_success`,
/// `on_failure`, or `cancel_probe`. The clock is injected (`now`) so tests
/// can drive transitions deterministically.
pub struct CircuitBreaker {
    buckets: Mutex<HashMap<String, Bucket>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Advisory admission check for `key`.
    pub fn allow(&self, key: &str, now: Instant) -> AllowDecision {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_entry(&mut buckets, key);

        match bucket.state {
            State::Closed => AllowDecision {
                allowed: true,
                state: BreakerState::Closed,
                retry_after: None,
                changed: None,
            },
            State::Open { opened_at } => {
                let elapsed = now.duration_since(opened_at);
                if elapsed < self.config.cooldown {
                    return AllowDecision {
                        allowed: false,
                        state: BreakerState::Open,
                        retry_after: Some(self.config.cooldown - elapsed),
                        changed: None,
                    };
                }
                // Cooldown elapsed: move to half-open and admit this call
                // as the first probe.
                bucket.state = State::HalfOpen {
                    in_flight: 1,
                    successes: 0,
                };
                tracing::debug!(key, "breaker open -> half_open");
                AllowDecision {
                    allowed: true,
                    state: BreakerState::HalfOpen,
                    retry_after: None,
                    changed: Some(StateChange {
                        from: BreakerState::Open,
                        to: BreakerState::HalfOpen,
                    }),
                }
            }
            State::HalfOpen {
                ref mut in_flight, ..
            } => {
                if *in_flight >= self.config.half_open_probe_count {
                    return AllowDecision {
                        allowed: false,
                        state: BreakerState::HalfOpen,
                        retry_after: Some(Duration::ZERO),
                        changed: None,
                    };
                }
                *in_flight += 1;
                AllowDecision {
                    allowed: true,
                    state: BreakerState::HalfOpen,
                    retry_after: None,
                    changed: None,
                }
            }
        }
    }

    /// Record a successful outcome for an admitted request.
    pub fn on_success(&self, key: &str) -> Option<StateChange> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_entry(&mut buckets, key);

        match bucket.state {
            State::Closed => {
                bucket.window.push(false);
                None
            }
            State::Open { .. } => None,
            State::HalfOpen {
                ref mut in_flight,
                ref mut successes,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.half_open_probe_count {
                    // Enough probes came back healthy. Dropping the window
                    // here keeps stale pre-outage failures from reopening
                    // the circuit immediately.
                    bucket.state = State::Closed;
                    bucket.window.reset();
                    tracing::debug!(key, "breaker half_open -> closed");
                    return Some(StateChange {
                        from: BreakerState::HalfOpen,
                        to: BreakerState::Closed,
                    });
                }
                None
            }
        }
    }

    /// Record a failed outcome for an admitted request.
    pub fn on_failure(&self, key: &str, now: Instant) -> Option<StateChange> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = self.bucket_entry(&mut buckets, key);

        match bucket.state {
            State::Closed => {
                bucket.window.push(true);
                if bucket.window.count() >= self.config.min_requests
                    && bucket.window.failure_rate() >= self.config.failure_threshold
                {
                    bucket.state = State::Open { opened_at: now };
                    tracing::debug!(
                        key,
                        failure_rate = bucket.window.failure_rate(),
                        "breaker closed -> open"
                    );
                    return Some(StateChange {
                        from: BreakerState::Closed,
                        to: BreakerState::Open,
                    });
                }
                None
            }
            State::Open { .. } => None,
            State::HalfOpen { .. } => {
                // One failed probe reopens immediately. The window keeps its
                // failure memory for after the circuit re-closes.
                bucket.state = State::Open { opened_at: now };
                tracing::debug!(key, "breaker half_open -> open");
                Some(StateChange {
                    from: BreakerState::HalfOpen,
                    to: BreakerState::Open,
                })
            }
        }
    }

    /// Release a probe slot reserved by `allow` without recording an
    /// outcome. Used when an admitted half-open probe is rejected by the
    /// limiter before any I/O happens. No-op outside half-open.
    pub fn cancel_probe(&self, key: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(key)
            && let State::HalfOpen {
                ref mut in_flight, ..
            } = bucket.state
        {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    /// Current state for `key`. Unknown keys report closed without creating
    /// a bucket.
    pub fn state(&self, key: &str) -> BreakerState {
        self.buckets
            .lock()
            .unwrap()
            .get(key)
            .map(|b| b.state.public())
            .unwrap_or(BreakerState::Closed)
    }

    /// Per-key snapshot, sorted by key for stable output.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let buckets = self.buckets.lock().unwrap();
        let mut entries: Vec<BreakerSnapshot> = buckets
            .iter()
            .map(|(key, bucket)| BreakerSnapshot {
                key: key.clone(),
                state: bucket.state.public(),
                window_count: bucket.window.count(),
                window_failures: bucket.window.failures(),
                opened_at: match bucket.state {
                    State::Open { opened_at } => Some(opened_at),
                    _ => None,
                },
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn bucket_entry<'a>(
        &self,
        buckets: &'a mut HashMap<String, Bucket>,
        key: &str,
    ) -> &'a mut Bucket {
        buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            state: State::Closed,
            window: RollingWindow::new(self.config.window_size),
        })
    }
}
