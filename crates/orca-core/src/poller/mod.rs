//! Poller: exponential-backoff fallback sync used when the webhook tunnel
//! is down.
//!
//! A self-rescheduling timer rather than a fixed interval: each tick decides
//! its own next delay based on the tunnel's connectivity and, on failure,
//! the consecutive-failure count.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const BASE_DELAY: Duration = Duration::from_secs(30);
const MAX_DELAY: Duration = Duration::from_secs(5 * 60);
const CIRCUIT_OPEN_THRESHOLD: u32 = 10;
const AUTH_ERROR_MARKERS: [&str; 3] = ["authentication failed", "http 401", "http 403"];

/// Whatever the poller needs from the rest of the supervisor: a way to read
/// tunnel connectivity and a way to run a full tracker sync.
#[async_trait]
pub trait PollAction: Send + Sync {
    async fn full_sync(&self) -> anyhow::Result<()>;
    fn tunnel_is_up(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorKind {
    Permanent,
    Transient,
}

/// Classify a sync failure by its message. Matching is case-insensitive
/// substring search against a small, fixed marker list (§4.D).
pub fn classify_error(message: &str) -> PollErrorKind {
    let lower = message.to_lowercase();
    if AUTH_ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
        PollErrorKind::Permanent
    } else {
        PollErrorKind::Transient
    }
}

/// `delay = min(base * 2^(n-1), max)` for `n >= 1`; `n == 0` has no backoff
/// (a poller with zero consecutive failures ticks at `base`).
pub fn base_delay_ms(consecutive_failures: u32, base_ms: u64, max_ms: u64) -> u64 {
    if consecutive_failures == 0 {
        return base_ms;
    }
    let shift = consecutive_failures.saturating_sub(1).min(32);
    let scaled = base_ms.saturating_mul(1u64 << shift);
    scaled.min(max_ms)
}

/// Apply +/-20% uniform jitter to a millisecond delay.
fn with_jitter(ms: u64, rng: &mut impl Rng) -> u64 {
    let factor = rng.random_range(0.8..1.2);
    ((ms as f64) * factor).round() as u64
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerHealth {
    pub failures: u32,
    pub current_interval_ms: u64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub circuit_open: bool,
    pub halted: bool,
}

#[derive(Debug, Default)]
struct PollerState {
    failures: u32,
    last_error: Option<String>,
    last_error_kind: Option<PollErrorKind>,
    last_success_at: Option<DateTime<Utc>>,
    circuit_open: bool,
    halted: bool,
}

pub struct Poller {
    action: std::sync::Arc<dyn PollAction>,
    base: Duration,
    max: Duration,
    state: Mutex<PollerState>,
    ticking: AtomicBool,
}

impl Poller {
    pub fn new(action: std::sync::Arc<dyn PollAction>) -> Self {
        Self {
            action,
            base: BASE_DELAY,
            max: MAX_DELAY,
            state: Mutex::new(PollerState::default()),
            ticking: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> PollerHealth {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let interval = with_jitter(base_delay_ms(state.failures, self.base.as_millis() as u64, self.max.as_millis() as u64), &mut rand::rng());
        PollerHealth {
            failures: state.failures,
            current_interval_ms: interval,
            last_error: state.last_error.clone(),
            last_error_kind: state.last_error_kind.map(|k| match k {
                PollErrorKind::Permanent => "permanent".to_string(),
                PollErrorKind::Transient => "transient".to_string(),
            }),
            last_success_at: state.last_success_at,
            circuit_open: state.circuit_open,
            halted: state.halted,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).halted
    }

    /// Clear `halted`, allowing the poll loop to resume.
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.halted = false;
        state.failures = 0;
        state.circuit_open = false;
    }

    /// Run one tick, returning the delay before the next one. An
    /// already-in-progress tick causes a concurrent call to return
    /// immediately with the current interval (overlap guard).
    pub async fn tick(&self, now: DateTime<Utc>) -> Duration {
        if self.ticking.swap(true, Ordering::SeqCst) {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            return self.base.max(Duration::from_millis(base_delay_ms(state.failures, self.base.as_millis() as u64, self.max.as_millis() as u64)));
        }

        let delay = self.do_tick(now).await;
        self.ticking.store(false, Ordering::SeqCst);
        delay
    }

    async fn do_tick(&self, now: DateTime<Utc>) -> Duration {
        if self.action.tunnel_is_up() {
            tracing::debug!("tunnel up, poller skipping sync and resetting backoff");
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.failures = 0;
            state.last_success_at = Some(now);
            state.last_error = None;
            state.circuit_open = false;
            return self.base;
        }

        match self.action.full_sync().await {
            Ok(()) => {
                tracing::info!("fallback full sync succeeded, resetting backoff");
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.failures = 0;
                state.last_success_at = Some(now);
                state.last_error = None;
                state.circuit_open = false;
                self.base
            }
            Err(e) => {
                let message = e.to_string();
                let kind = classify_error(&message);
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.last_error = Some(message.clone());
                state.last_error_kind = Some(kind);

                match kind {
                    PollErrorKind::Permanent => {
                        state.halted = true;
                        tracing::error!(error = %message, "poller halted on permanent auth error");
                        self.max
                    }
                    PollErrorKind::Transient => {
                        state.failures += 1;
                        if state.failures >= CIRCUIT_OPEN_THRESHOLD && !state.circuit_open {
                            state.circuit_open = true;
                            tracing::error!(failures = state.failures, "poller circuit open after repeated transient failures");
                        }
                        let failures = state.failures;
                        drop(state);
                        tracing::warn!(error = %message, failures, "transient poll failure, backing off");
                        let ms = with_jitter(
                            base_delay_ms(failures, self.base.as_millis() as u64, self.max.as_millis() as u64),
                            &mut rand::rng(),
                        );
                        Duration::from_millis(ms)
                    }
                }
            }
        }
    }

    /// Drive the self-rescheduling timer until cancelled or halted.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if self.is_halted() {
                tracing::info!("poller halted, stopping run loop until restarted");
                return;
            }

            let delay = self.tick(Utc::now()).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("poller cancelled");
                    return;
                }
            }
        }
    }
}
