use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;

/// Bounded-queue permit semaphore with fair FIFO hand-off.
///
/// Up to `max_in_flight` permits exist. When all are taken, callers queue in
/// FIFO order (bounded by `max_queue`, each with an `enqueue_timeout`). A
/// released permit is handed directly to the head waiter instead of passing
/// through a free pool, so a freed slot can never be stolen by a latecomer
/// and admission among waiters is strictly in enqueue order.
///
/// Admission rejections (`QueueFull`, `QueueTimeout`) happen before any
/// outbound I/O; they are local load-shedding, not upstream health signals.
///
/// Cheaply cloneable; clones share one permit pool.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

/// Point-in-time view of the limiter counters.
#[derive(Debug, Clone, Copy)]
pub struct LimiterSnapshot {
    pub in_flight: usize,
    pub queue_depth: usize,
    pub max_in_flight: usize,
    pub max_queue: usize,
}

/// Outcome of the synchronous admission step.
pub enum Admission {
    /// A permit was free; no scheduling happened.
    Granted(Permit),
    /// The wait queue is full (or queueing is disabled).
    Rejected { max_queue: usize },
    /// Enqueued behind `queue_depth - 1` earlier waiters.
    Queued {
        queue_depth: usize,
        handle: WaitHandle,
    },
}

struct LimiterInner {
    state: Mutex<LimiterState>,
    max_in_flight: usize,
    max_queue: usize,
    enqueue_timeout: Duration,
}

struct LimiterState {
    in_flight: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
    timer: Option<tokio::task::AbortHandle>,
}

impl ConcurrencyLimiter {
    pub fn new(max_in_flight: usize, max_queue: usize, enqueue_timeout: Duration) -> Self {
        assert!(max_in_flight > 0, "max_in_flight must be greater than 0");
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    in_flight: 0,
                    queue: VecDeque::new(),
                    next_waiter_id: 0,
                }),
                max_in_flight,
                max_queue,
                enqueue_timeout,
            }),
        }
    }

    /// Acquire a permit, waiting in the queue if necessary.
    pub async fn acquire(&self) -> Result<Permit, Error> {
        match self.admit() {
            Admission::Granted(permit) => Ok(permit),
            Admission::Rejected { max_queue } => Err(Error::QueueFull { max_queue }),
            Admission::Queued { handle, .. } => handle.wait().await,
        }
    }

    /// The synchronous admission step: grant, reject, or enqueue. Exposed
    /// separately from [`acquire`](Self::acquire) so the request pipeline
    /// can observe queueing and emit the matching lifecycle events.
    pub fn admit(&self) -> Admission {
        let mut state = self.inner.state.lock().unwrap();

        if state.in_flight < self.inner.max_in_flight {
            state.in_flight += 1;
            return Admission::Granted(Permit {
                inner: self.inner.clone(),
            });
        }

        if state.queue.len() >= self.inner.max_queue {
            return Admission::Rejected {
                max_queue: self.inner.max_queue,
            };
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter {
            id,
            tx,
            timer: None,
        });

        let timer_inner = self.inner.clone();
        let timeout = self.inner.enqueue_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_inner.expire(id);
        });
        // Still under the lock, so the back of the queue is our waiter and
        // the timer cannot have fired yet.
        state.queue.back_mut().unwrap().timer = Some(timer.abort_handle());

        let queue_depth = state.queue.len();
        tracing::debug!(waiter_id = id, queue_depth, "limiter queue wait");
        Admission::Queued {
            queue_depth,
            handle: WaitHandle {
                id,
                rx,
                inner: self.inner.clone(),
                done: false,
            },
        }
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.inner.state.lock().unwrap();
        LimiterSnapshot {
            in_flight: state.in_flight,
            queue_depth: state.queue.len(),
            max_in_flight: self.inner.max_in_flight,
            max_queue: self.inner.max_queue,
        }
    }
}

impl LimiterInner {
    /// Return one permit: hand it to the head waiter if any, else free it.
    /// `in_flight` is unchanged on hand-off; the permit is transferred.
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(waiter) = state.queue.pop_front() {
            if let Some(timer) = waiter.timer {
                timer.abort();
            }
            // A queued waiter removes itself under the lock when cancelled,
            // so this send only fails if its handle was leaked.
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        assert!(state.in_flight > 0, "permit released with none in flight");
        state.in_flight -= 1;
    }

    /// Enqueue-timeout path: remove the waiter if it is still queued. The
    /// dropped sender signals `QueueTimeout` to the waiting side. No permit
    /// is produced or consumed.
    fn expire(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
            let depth = state.queue.len() - 1;
            state.queue.remove(pos);
            tracing::debug!(waiter_id = id, queue_depth = depth, "limiter queue timeout");
        }
    }

    /// Cancellation path: remove the waiter if still queued. Returns false
    /// when the waiter already left the queue (handed a permit or timed out).
    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
            let waiter = state.queue.remove(pos).unwrap();
            if let Some(timer) = waiter.timer {
                timer.abort();
            }
            true
        } else {
            false
        }
    }
}

/// One in-flight slot. Dropping the permit releases it: handed to the head
/// waiter if the queue is non-empty, freed otherwise.
pub struct Permit {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A pending queue slot returned by [`ConcurrencyLimiter::admit`].
pub struct WaitHandle {
    id: u64,
    rx: oneshot::Receiver<()>,
    inner: Arc<LimiterInner>,
    done: bool,
}

impl WaitHandle {
    /// Wait for the permit hand-off or the enqueue timeout.
    pub async fn wait(mut self) -> Result<Permit, Error> {
        let result = (&mut self.rx).await;
        self.done = true;
        match result {
            Ok(()) => Ok(Permit {
                inner: self.inner.clone(),
            }),
            Err(_) => Err(Error::QueueTimeout {
                waited: self.inner.enqueue_timeout,
            }),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Dropped while queued. If we are still in the queue, leave without
        // a permit. If not, a hand-off may have raced the cancellation and
        // parked a permit in the channel; claim it and release it so it is
        // not lost.
        if self.inner.remove_waiter(self.id) {
            return;
        }
        if self.rx.try_recv().is_ok() {
            self.inner.release();
        }
    }
}
