use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{metrics, Error, ErrorKind, Result};

/// Circuit state for a protected downstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all calls pass through.
    Closed = 0,
    /// Limited probe calls allowed after the recovery timeout elapsed.
    HalfOpen = 1,
    /// All calls rejected until the recovery timeout elapses.
    Open = 2,
}

impl CircuitState {
    /// Numeric value for Prometheus gauge (0=closed, 1=half-open, 2=open).
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probes are admitted.
    pub recovery_timeout: Duration,
    /// Probe successes required to close again.
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_calls: u32,
    /// Error kinds that pass through without counting as failures.
    pub excluded: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 1,
            excluded: vec![ErrorKind::Client],
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// Circuit breaker wrapping calls to one named downstream service.
///
/// Transitions: Closed → Open (after `failure_threshold` consecutive counted
/// failures) → `HalfOpen` (first call after `recovery_timeout`, computed from
/// the open timestamp, never by a background timer) → Closed (after
/// `success_threshold` probe successes) or back to Open (on a failed probe).
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

struct Admission {
    probe: bool,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state for metrics reporting.
    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().state
    }

    /// Run `op` under the breaker, counting its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_at(Utc::now(), op).await
    }

    /// Same as [`call`](Self::call) with an explicit clock reading.
    pub async fn call_at<T, F, Fut>(&self, now: DateTime<Utc>, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit(now)?;
        let result = op().await;

        match &result {
            Ok(_) => self.on_success(&admission),
            Err(e) if self.config.excluded.contains(&e.kind()) => self.on_excluded(&admission),
            Err(_) => self.on_failure(&admission, now),
        }

        result
    }

    fn admit(&self, now: DateTime<Utc>) -> Result<Admission> {
        let mut s = self.state.lock().unwrap();
        match s.state {
            CircuitState::Closed => Ok(Admission { probe: false }),
            CircuitState::Open => {
                let opened_at = s.opened_at.unwrap_or(now);
                let elapsed = now.signed_duration_since(opened_at).to_std().unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.half_open_successes = 0;
                    s.half_open_in_flight = 1;
                    debug!("Circuit '{}' half-open, admitting probe", self.name);
                    self.publish(s.state);
                    Ok(Admission { probe: true })
                } else {
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: self.config.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_in_flight < self.config.half_open_max_calls {
                    s.half_open_in_flight += 1;
                    Ok(Admission { probe: true })
                } else {
                    // Probe budget spent; excess callers are rejected just
                    // like when the circuit is open.
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn on_success(&self, admission: &Admission) {
        let mut s = self.state.lock().unwrap();
        if admission.probe {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
            // A stale probe result cannot close a circuit that was reopened
            // by another probe in the meantime.
            if s.state == CircuitState::HalfOpen {
                s.half_open_successes += 1;
                if s.half_open_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.failure_count = 0;
                    s.half_open_successes = 0;
                    s.half_open_in_flight = 0;
                    s.opened_at = None;
                    info!("Circuit '{}' closed after successful probes", self.name);
                }
            }
        } else if s.state == CircuitState::Closed {
            s.failure_count = 0;
        }
        self.publish(s.state);
    }

    fn on_failure(&self, admission: &Admission, now: DateTime<Utc>) {
        let mut s = self.state.lock().unwrap();
        if admission.probe {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
            if s.state == CircuitState::HalfOpen {
                s.state = CircuitState::Open;
                s.opened_at = Some(now);
                s.half_open_successes = 0;
                s.half_open_in_flight = 0;
                warn!("Circuit '{}' reopened by failed probe", self.name);
            }
        } else if s.state == CircuitState::Closed {
            s.failure_count += 1;
            if s.failure_count >= self.config.failure_threshold {
                s.state = CircuitState::Open;
                s.opened_at = Some(now);
                warn!(
                    "Circuit '{}' opened after {} consecutive failures",
                    self.name, s.failure_count
                );
            }
        }
        self.publish(s.state);
    }

    fn on_excluded(&self, admission: &Admission) {
        // Excluded errors release their probe slot without judging the
        // backend either way.
        if admission.probe {
            let mut s = self.state.lock().unwrap();
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }
    }

    fn publish(&self, state: CircuitState) {
        metrics::CIRCUIT_STATE
            .with_label_values(&[&self.name])
            .set(i64::from(state.as_u8()));
    }
}

/// Process-wide collection of breakers keyed by service name. Two lookups
/// with the same name always yield the same instance.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().values().cloned().collect()
    }
}
