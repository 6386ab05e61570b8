//! Per-destination circuit breaker.
//!
//! ```text
//! Closed --N consecutive failures--> Open --reset_timeout--> HalfOpen
//! HalfOpen --M successes--> Closed
//! HalfOpen --failure--> Open
//! ```
//!
//! Each URL has its own circuit. While a circuit is open, calls to that URL are
//! suppressed without any network I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit again.
    pub success_threshold: u32,
    /// How long a circuit stays open before a probe is let through.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.consecutive_successes = 0;
        self.opened_at = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    circuits: Arc<Mutex<HashMap<String, Circuit>>>,
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Whether a call to `url` may proceed. An open circuit whose reset timeout
    /// has elapsed moves to half-open and lets the call through as a probe.
    pub fn allow(&self, url: &str) -> bool {
        let Ok(mut circuits) = self.circuits.lock() else {
            return true;
        };
        let circuit = circuits.entry(url.to_string()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.consecutive_successes = 0;
                    warn!(url, from = "open", to = "half-open", "circuit probing destination");
                }
                elapsed
            }
        }
    }

    pub fn record_success(&self, url: &str) {
        let Ok(mut circuits) = self.circuits.lock() else {
            return;
        };
        let circuit = circuits.entry(url.to_string()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= self.config.success_threshold {
                    *circuit = Circuit::new();
                    warn!(url, from = "half-open", to = "closed", "circuit recovered");
                }
            }
            CircuitState::Closed | CircuitState::Open => circuit.consecutive_failures = 0,
        }
    }

    pub fn record_failure(&self, url: &str) {
        let Ok(mut circuits) = self.circuits.lock() else {
            return;
        };
        let circuit = circuits.entry(url.to_string()).or_insert_with(Circuit::new);
        circuit.consecutive_failures += 1;

        match circuit.state {
            CircuitState::Closed if circuit.consecutive_failures >= self.config.failure_threshold => {
                circuit.open();
                warn!(
                    url,
                    failures = circuit.consecutive_failures,
                    from = "closed",
                    to = "open",
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                circuit.open();
                warn!(url, from = "half-open", to = "open", "probe failed; circuit reopened");
            }
            _ => {}
        }
    }

    pub fn state(&self, url: &str) -> CircuitState {
        self.circuits
            .lock()
            .ok()
            .and_then(|c| c.get(url).map(|c| c.state))
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://hooks.example.com/a";

    fn breaker(reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..2 {
            assert!(cb.allow(URL));
            cb.record_failure(URL);
        }
        assert_eq!(cb.state(URL), CircuitState::Closed);

        cb.record_failure(URL);
        assert_eq!(cb.state(URL), CircuitState::Open);
        assert!(!cb.allow(URL));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(Duration::from_secs(60));
        cb.record_failure(URL);
        cb.record_failure(URL);
        cb.record_success(URL);
        cb.record_failure(URL);
        assert_eq!(cb.state(URL), CircuitState::Closed);
    }

    #[test]
    fn circuits_are_independent_per_url() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..3 {
            cb.record_failure(URL);
        }
        assert!(!cb.allow(URL));
        assert!(cb.allow("https://hooks.example.com/b"));
    }

    #[test]
    fn half_open_probe_closes_or_reopens() {
        let cb = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            cb.record_failure(URL);
        }
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow(URL));
        assert_eq!(cb.state(URL), CircuitState::HalfOpen);
        cb.record_failure(URL);
        assert_eq!(cb.state(URL), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow(URL));
        cb.record_success(URL);
        assert_eq!(cb.state(URL), CircuitState::Closed);
    }
}
