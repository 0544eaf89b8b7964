//! Health gate: the readiness contract the backend must honor after handoff
//!
//! The orchestrator does not gate on health itself once it has handed off;
//! an external supervisor polls `/health`. This module holds that contract,
//! an HTTP probe for it (used by `stagehand probe` and by tests), and a
//! tracker that models how the supervisor turns probe results into a status.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Readiness contract for the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub path: String,
    /// Time between probes
    pub interval: Duration,
    /// A probe that takes longer than this counts as a failure
    pub timeout: Duration,
    /// Consecutive failures before the instance is unhealthy
    pub retries: u32,
    /// Grace window after start during which failures do not count
    pub start_period: Duration,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            retries: 3,
            start_period: Duration::from_secs(40),
        }
    }
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("invalid health check request: {0}")]
    Request(String),

    #[error("health endpoint unreachable: {0}")]
    Unreachable(#[from] hyper_util::client::legacy::Error),

    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("health endpoint returned status {0}")]
    Status(u16),

    /// `await_ready` gave up once the start period elapsed
    #[error("backend not ready after {waited:?}: {last}")]
    NotReady { waited: Duration, last: String },
}

/// Host to dial when probing a server bound to `host`.
///
/// Wildcard bind addresses are not connectable, so they map to loopback.
pub fn connect_host(host: &str) -> String {
    match host {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{}]", h),
        h => h.to_string(),
    }
}

/// HTTP prober for the health endpoint
pub struct HealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    spec: HealthCheckSpec,
}

impl HealthProbe {
    pub fn new(spec: HealthCheckSpec) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(spec.timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .build(connector);

        Self { client, spec }
    }

    pub fn spec(&self) -> &HealthCheckSpec {
        &self.spec
    }

    /// Issue one `GET` against the health path and return the status code on 2xx
    pub async fn check(&self, host: &str, port: u16) -> Result<u16, HealthError> {
        let uri = format!("http://{}:{}{}", connect_host(host), port, self.spec.path);
        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header("User-Agent", concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| HealthError::Request(e.to_string()))?;

        let response = tokio::time::timeout(self.spec.timeout, self.client.request(req))
            .await
            .map_err(|_| HealthError::Timeout(self.spec.timeout))??;

        let status = response.status();
        debug!(uri, status = status.as_u16(), "Health check response");
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(HealthError::Status(status.as_u16()))
        }
    }

    pub async fn is_healthy(&self, host: &str, port: u16) -> bool {
        self.check(host, port).await.is_ok()
    }

    /// Poll until the endpoint answers 2xx or the start period runs out
    pub async fn await_ready(
        &self,
        host: &str,
        port: u16,
        poll_interval: Duration,
    ) -> Result<u16, HealthError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match self.check(host, port).await {
                Ok(status) => {
                    info!(
                        port,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Backend is ready"
                    );
                    return Ok(status);
                }
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if elapsed >= self.spec.start_period {
                warn!(port, attempts, error = %err, "Backend did not become ready");
                return Err(HealthError::NotReady {
                    waited: elapsed,
                    last: err.to_string(),
                });
            }

            debug!(port, attempts, error = %err, "Backend not ready yet");
            let remaining = self.spec.start_period - elapsed;
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }
}

/// Status reported by the external supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Folds probe results into a status the way container supervisors do
#[derive(Debug, Clone)]
pub struct HealthTracker {
    retries: u32,
    start_period: Duration,
    status: HealthStatus,
    consecutive_failures: u32,
    in_start_period: bool,
}

impl HealthTracker {
    pub fn new(spec: &HealthCheckSpec) -> Self {
        Self {
            retries: spec.retries.max(1),
            start_period: spec.start_period,
            status: HealthStatus::Starting,
            consecutive_failures: 0,
            in_start_period: true,
        }
    }

    /// Record one probe result taken `elapsed` after the backend started
    pub fn record(&mut self, elapsed: Duration, success: bool) -> HealthStatus {
        if success {
            self.consecutive_failures = 0;
            self.in_start_period = false;
            self.status = HealthStatus::Healthy;
            return self.status;
        }

        // Failures inside the grace window are not counted
        if self.in_start_period && elapsed < self.start_period {
            return self.status;
        }
        self.in_start_period = false;

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.retries {
            self.status = HealthStatus::Unhealthy;
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
