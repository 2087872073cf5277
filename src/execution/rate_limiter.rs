//! Per-exchange request throttling.
//!
//! Three caps hold at every instant: requests started in the last second,
//! requests started in the last minute, and requests in flight. Callers over
//! the caps wait in a FIFO queue drained by one background task; waiting is
//! never an error.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::config::{RateLimitConfig, RateLimitTable};

const DRAIN_POLL: Duration = Duration::from_millis(100);
const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

struct LimiterState {
    queue: VecDeque<oneshot::Sender<Permit>>,
    last_second: VecDeque<Instant>,
    last_minute: VecDeque<Instant>,
    active: u32,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while matches!(self.last_second.front(), Some(t) if now.duration_since(*t) >= SECOND) {
            self.last_second.pop_front();
        }
        while matches!(self.last_minute.front(), Some(t) if now.duration_since(*t) >= MINUTE) {
            self.last_minute.pop_front();
        }
    }

    /// Count one admission if every cap currently has room
    fn try_admit(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.prune(now);
        if self.active >= config.max_concurrent
            || self.last_second.len() >= config.per_second as usize
            || self.last_minute.len() >= config.per_minute as usize
        {
            return false;
        }
        self.active += 1;
        self.last_second.push_back(now);
        self.last_minute.push_back(now);
        true
    }
}

struct Shared {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit queued callers from the head while the caps allow
    fn drain(self: &Arc<Self>) {
        let mut undelivered = Vec::new();
        {
            let mut state = self.state();
            let now = Instant::now();
            while let Some(head) = state.queue.front() {
                if head.is_closed() {
                    state.queue.pop_front();
                    continue;
                }
                if !state.try_admit(&self.config, now) {
                    break;
                }
                if let Some(waiter) = state.queue.pop_front() {
                    if let Err(permit) = waiter.send(Permit { shared: self.clone() }) {
                        undelivered.push(permit);
                    }
                }
            }
        }
        // Released outside the lock
        drop(undelivered);
    }
}

/// One admitted request; frees its concurrency slot when dropped
struct Permit {
    shared: Arc<Shared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state();
            state.active = state.active.saturating_sub(1);
        }
        self.shared.notify.notify_one();
    }
}

/// Point-in-time view of the limiter's windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub active: u32,
    pub last_second: usize,
    pub last_minute: usize,
    pub queued: usize,
}

pub struct RateLimiter {
    exchange: String,
    shared: Arc<Shared>,
    drain_task: JoinHandle<()>,
}

impl RateLimiter {
    /// Create a limiter and start its drain task (requires a Tokio runtime)
    pub fn new(exchange: &str, config: RateLimitConfig) -> Self {
        let shared = Arc::new(Shared {
            config: RateLimitConfig {
                per_second: config.per_second.max(1),
                per_minute: config.per_minute.max(1),
                max_concurrent: config.max_concurrent.max(1),
            },
            state: Mutex::new(LimiterState {
                queue: VecDeque::new(),
                last_second: VecDeque::new(),
                last_minute: VecDeque::new(),
                active: 0,
            }),
            notify: Notify::new(),
        });

        let drain_shared = shared.clone();
        let drain_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = drain_shared.notify.notified() => {}
                    _ = sleep(DRAIN_POLL) => {}
                }
                drain_shared.drain();
            }
        });

        tracing::debug!(
            exchange,
            per_second = config.per_second,
            per_minute = config.per_minute,
            max_concurrent = config.max_concurrent,
            "Rate limiter ready"
        );

        Self {
            exchange: exchange.to_string(),
            shared,
            drain_task,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn config(&self) -> RateLimitConfig {
        self.shared.config
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut state = self.shared.state();
        state.prune(Instant::now());
        LimiterSnapshot {
            active: state.active,
            last_second: state.last_second.len(),
            last_minute: state.last_minute.len(),
            queued: state.queue.len(),
        }
    }

    /// Run `f` once all three caps admit it
    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }

    async fn acquire(&self) -> Permit {
        let waiter = {
            let mut state = self.shared.state();
            // Jumping the queue is only allowed when nobody is waiting
            if state.queue.is_empty() && state.try_admit(&self.shared.config, Instant::now()) {
                return Permit {
                    shared: self.shared.clone(),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        match waiter.await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(exchange = %self.exchange, "Rate limiter drain stopped, polling for admission");
                loop {
                    sleep(DRAIN_POLL).await;
                    let admitted = self
                        .shared
                        .state()
                        .try_admit(&self.shared.config, Instant::now());
                    if admitted {
                        return Permit {
                            shared: self.shared.clone(),
                        };
                    }
                }
            }
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

/// One limiter per exchange, created on first use from the rate-limit table
pub struct RateLimiterRegistry {
    table: RateLimitTable,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(table: RateLimitTable) -> Self {
        Self {
            table,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_exchange(&self, exchange: &str) -> Arc<RateLimiter> {
        let name = exchange.to_lowercase();
        let mut limiters = self.limiters.lock().unwrap_or_else(|p| p.into_inner());
        limiters
            .entry(name.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(&name, self.table.for_exchange(&name))))
            .clone()
    }
}
