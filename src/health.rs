//! Bounded liveness polling.
//!
//! A [HealthGate] polls a [LivenessProbe] a fixed number of times with a fixed
//! interval between attempts, optionally capped by an overall deadline. It reports
//! either `Healthy` or `Exhausted` together with the most recent failure reasons.

use crate::utils::is_absolute_http_url;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Default per-request timeout for [HttpProbe].
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single probe attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProbeFailure {
    /// Endpoint answered with a non-success status.
    Status(u16),
    Connection(String),
    Timeout,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Status(code) => write!(f, "HTTP {}", code),
            ProbeFailure::Connection(msg) => write!(f, "connection failed: {}", msg),
            ProbeFailure::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for ProbeFailure {}

/// A single readiness check against some target.
#[allow(async_fn_in_trait)]
pub trait LivenessProbe {
    fn target(&self) -> &str;
    async fn probe(&self) -> Result<(), ProbeFailure>;
}

/// `GET <endpoint>`; any 2xx counts as ready.
pub struct HttpProbe {
    endpoint: String,
    client: reqwest_middleware::ClientWithMiddleware,
}

impl HttpProbe {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProbeFailure> {
        Self::with_timeout(endpoint, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ProbeFailure> {
        let endpoint = endpoint.into();
        if !is_absolute_http_url(&endpoint) {
            return Err(ProbeFailure::Connection(format!(
                "'{}' is not an absolute http(s) URL",
                endpoint
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeFailure::Connection(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim().to_string(),
            client: reqwest_middleware::ClientBuilder::new(client).build(),
        })
    }
}

fn map_reqwest_error(e: &reqwest::Error) -> ProbeFailure {
    if e.is_timeout() {
        ProbeFailure::Timeout
    } else {
        ProbeFailure::Connection(e.to_string())
    }
}

impl LivenessProbe for HttpProbe {
    fn target(&self) -> &str {
        &self.endpoint
    }

    async fn probe(&self) -> Result<(), ProbeFailure> {
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| match e {
                reqwest_middleware::Error::Reqwest(ref inner) => map_reqwest_error(inner),
                reqwest_middleware::Error::Middleware(other) => ProbeFailure::Connection(other.to_string()),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProbeFailure::Status(resp.status().as_u16()))
        }
    }
}

/// Result of a [HealthGate::wait].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum HealthOutcome {
    Healthy {
        attempts: u32,
        elapsed_ms: u128,
    },
    Exhausted {
        attempts: u32,
        deadline_exceeded: bool,
        /// Oldest first.
        recent_failures: Vec<String>,
    },
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            HealthOutcome::Healthy { attempts, .. } | HealthOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthGate {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Wall-clock bound on the whole wait, separate from the per-request timeout.
    pub deadline: Option<Duration>,
    /// How many failure reasons to keep for the report.
    pub keep_failures: usize,
}

impl Default for HealthGate {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(10),
            deadline: None,
            keep_failures: 5,
        }
    }
}

impl HealthGate {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Poll `probe` until it succeeds, attempts run out, or the deadline passes.
    pub async fn wait<P: LivenessProbe>(&self, probe: &P) -> HealthOutcome {
        let started = Instant::now();
        let deadline = self.deadline.map(|d| started + d);
        let mut failures: VecDeque<String> = VecDeque::with_capacity(self.keep_failures);
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            let result = match deadline {
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, probe.probe()).await {
                        Ok(r) => r,
                        Err(_) => {
                            log::warn!("Health check of {} hit the deadline on attempt {}", probe.target(), attempts);
                            self.record(&mut failures, format!("attempt {}: deadline exceeded", attempts));
                            return self.exhausted(attempts, true, failures);
                        }
                    }
                }
                None => probe.probe().await,
            };

            match result {
                Ok(()) => {
                    log::info!(
                        "Health check {}/{}: {} is healthy",
                        attempts,
                        self.max_attempts,
                        probe.target()
                    );
                    return HealthOutcome::Healthy {
                        attempts,
                        elapsed_ms: started.elapsed().as_millis(),
                    };
                }
                Err(failure) => {
                    log::info!(
                        "Health check {}/{}: {} not ready ({})",
                        attempts,
                        self.max_attempts,
                        probe.target(),
                        failure
                    );
                    self.record(&mut failures, format!("attempt {}: {}", attempts, failure));
                }
            }

            if attempts >= self.max_attempts {
                break;
            }
            if let Some(at) = deadline {
                if Instant::now() + self.interval >= at {
                    return self.exhausted(attempts, true, failures);
                }
            }
            tokio::time::sleep(self.interval).await;
        }

        self.exhausted(attempts, false, failures)
    }

    /// Keep the last `keep_failures` reasons, oldest first.
    fn record(&self, failures: &mut VecDeque<String>, reason: String) {
        if self.keep_failures == 0 {
            return;
        }
        if failures.len() == self.keep_failures {
            failures.pop_front();
        }
        failures.push_back(reason);
    }

    fn exhausted(&self, attempts: u32, deadline_exceeded: bool, failures: VecDeque<String>) -> HealthOutcome {
        log::warn!(
            "Health gate exhausted after {} attempt(s){}",
            attempts,
            if deadline_exceeded { " (deadline exceeded)" } else { "" }
        );
        HealthOutcome::Exhausted {
            attempts,
            deadline_exceeded,
            recent_failures: failures.into_iter().collect(),
        }
    }
}

/// Poll `endpoint` up to `max_attempts` times, `interval` apart. True once it answers 2xx.
pub async fn wait_until_healthy(endpoint: &str, max_attempts: u32, interval: Duration) -> bool {
    let probe = match HttpProbe::new(endpoint) {
        Ok(p) => p,
        Err(e) => {
            log::error!("Cannot build health probe for {}: {}", endpoint, e);
            return false;
        }
    };
    HealthGate::new(max_attempts, interval).wait(&probe).await.is_healthy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until `ready_after` attempts have been made.
    struct ScriptedProbe {
        calls: AtomicU32,
        ready_after: Option<u32>,
        delay: Duration,
        /// First attempt that sleeps for `delay`.
        delay_from: u32,
    }

    impl ScriptedProbe {
        fn never_ready() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_after: None,
                delay: Duration::ZERO,
                delay_from: 1,
            }
        }

        fn ready_on(attempt: u32) -> Self {
            Self {
                ready_after: Some(attempt),
                ..Self::never_ready()
            }
        }
    }

    impl LivenessProbe for ScriptedProbe {
        fn target(&self) -> &str {
            "scripted"
        }

        async fn probe(&self) -> Result<(), ProbeFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() && n >= self.delay_from {
                tokio::time::sleep(self.delay).await;
            }
            match self.ready_after {
                Some(k) if n >= k => Ok(()),
                _ => Err(ProbeFailure::Status(503)),
            }
        }
    }

    #[tokio::test]
    async fn test_never_ready_makes_exactly_max_attempts() {
        let probe = ScriptedProbe::never_ready();
        let outcome = HealthGate::new(3, Duration::ZERO).wait(&probe).await;
        assert!(!outcome.is_healthy());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_healthy_on_second_attempt() {
        let probe = ScriptedProbe::ready_on(2);
        let outcome = HealthGate::new(5, Duration::ZERO).wait(&probe).await;
        assert!(outcome.is_healthy());
        assert_eq!(outcome.attempts(), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_is_exhausted() {
        let probe = ScriptedProbe::ready_on(1);
        let outcome = HealthGate::new(0, Duration::ZERO).wait(&probe).await;
        assert_eq!(outcome.attempts(), 0);
        assert!(!outcome.is_healthy());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keeps_only_recent_failures() {
        let probe = ScriptedProbe::never_ready();
        let gate = HealthGate {
            keep_failures: 2,
            ..HealthGate::new(4, Duration::ZERO)
        };
        match gate.wait(&probe).await {
            HealthOutcome::Exhausted { recent_failures, deadline_exceeded, .. } => {
                assert!(!deadline_exceeded);
                assert_eq!(recent_failures, vec!["attempt 3: HTTP 503", "attempt 4: HTTP 503"]);
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_loop_short() {
        let probe = ScriptedProbe::never_ready();
        let gate = HealthGate::new(100, Duration::from_secs(10)).with_deadline(Duration::from_secs(25));
        match gate.wait(&probe).await {
            HealthOutcome::Exhausted { attempts, deadline_exceeded, .. } => {
                assert!(deadline_exceeded);
                assert!(attempts < 100);
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_hanging_probe() {
        let probe = ScriptedProbe {
            delay: Duration::from_secs(3600),
            ..ScriptedProbe::ready_on(1)
        };
        let gate = HealthGate::new(3, Duration::ZERO).with_deadline(Duration::from_secs(5));
        let outcome = gate.wait(&probe).await;
        assert_eq!(
            outcome,
            HealthOutcome::Exhausted {
                attempts: 1,
                deadline_exceeded: true,
                recent_failures: vec!["attempt 1: deadline exceeded".to_string()],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reason_follows_earlier_failures() {
        // Attempts 1 and 2 fail fast, attempt 3 hangs past the deadline.
        let probe = ScriptedProbe {
            delay: Duration::from_secs(3600),
            delay_from: 3,
            ..ScriptedProbe::ready_on(10)
        };
        let gate = HealthGate {
            keep_failures: 2,
            ..HealthGate::new(5, Duration::from_secs(1)).with_deadline(Duration::from_secs(30))
        };
        match gate.wait(&probe).await {
            HealthOutcome::Exhausted {
                attempts,
                deadline_exceeded,
                recent_failures,
            } => {
                assert_eq!(attempts, 3);
                assert!(deadline_exceeded);
                assert_eq!(recent_failures.len(), 2);
                assert!(recent_failures[0].starts_with("attempt 2: "), "{:?}", recent_failures);
                assert_eq!(recent_failures[1], "attempt 3: deadline exceeded");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_not_ready() {
        // Port 9 (discard) on localhost is closed in test environments.
        assert!(!wait_until_healthy("http://127.0.0.1:9/health", 2, Duration::ZERO).await);
    }

    #[test]
    fn test_probe_requires_absolute_url() {
        assert!(HttpProbe::new("localhost:8000/health").is_err());
        assert!(HttpProbe::new(" http://localhost:8000/health ").is_ok());
    }
}
