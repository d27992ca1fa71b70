//! Liveness probe for the service endpoints.
//!
//! Every endpoint is checked concurrently. Each check retries transient
//! failures (missing socket, refused or slow connect, a service dying
//! mid-exchange) with exponential backoff, bounded both by an attempt count
//! and by a time budget. The per-endpoint budget is capped by the overall
//! one, so a hung service can never hold up the report.

use crate::identity::ServiceId;
use crate::protocol::{self, Request, Response};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::LinesCodecError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final outcome of probing one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessResult {
    Reachable,
    TimedOut,
    ConnectionRefused,
    ProtocolError,
}

impl fmt::Display for LivenessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LivenessResult::Reachable => "reachable",
            LivenessResult::TimedOut => "timed-out",
            LivenessResult::ConnectionRefused => "connection-refused",
            LivenessResult::ProtocolError => "protocol-error",
        };
        f.write_str(name)
    }
}

/// Exponential retry delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Endpoints to check, in report order
    pub targets: Vec<(ServiceId, PathBuf)>,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub endpoint_budget: Duration,
    pub overall_budget: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            connect_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_millis(500),
            max_attempts: 10,
            backoff: Backoff {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(800),
            },
            endpoint_budget: Duration::from_secs(3),
            overall_budget: Duration::from_secs(5),
        }
    }
}

/// Why a single attempt failed
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("connection refused: {0}")]
    ConnectionRefused(std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connection closed before acknowledgement")]
    ClosedEarly,

    #[error("no acknowledgement in time")]
    ResponseTimeout,

    #[error("bad acknowledgement: {0}")]
    Protocol(String),
}

impl AttemptError {
    /// Whether another attempt may succeed
    pub fn retryable(&self) -> bool {
        !matches!(self, AttemptError::Protocol(_))
    }

    pub fn liveness(&self) -> LivenessResult {
        match self {
            AttemptError::ConnectionRefused(_) => LivenessResult::ConnectionRefused,
            AttemptError::ConnectTimeout => LivenessResult::TimedOut,
            AttemptError::ClosedEarly
            | AttemptError::ResponseTimeout
            | AttemptError::Protocol(_) => LivenessResult::ProtocolError,
        }
    }
}

/// Outcome for one endpoint
#[derive(Debug, Clone)]
pub struct EndpointReport {
    pub id: ServiceId,
    pub path: PathBuf,
    pub result: LivenessResult,
    pub attempts: u32,
    pub elapsed: Duration,
    pub detail: Option<String>,
}

/// Aggregate outcome of one probe run
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub endpoints: Vec<EndpointReport>,
}

impl ProbeReport {
    pub fn all_reachable(&self) -> bool {
        self.endpoints
            .iter()
            .all(|e| e.result == LivenessResult::Reachable)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EndpointReport> {
        self.endpoints
            .iter()
            .filter(|e| e.result != LivenessResult::Reachable)
    }

    pub fn result_for(&self, id: ServiceId) -> Option<LivenessResult> {
        self.endpoints.iter().find(|e| e.id == id).map(|e| e.result)
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "probe {} at {} took {:?}",
            self.run_id,
            self.started_at.to_rfc3339(),
            self.elapsed
        )?;
        for e in &self.endpoints {
            write!(
                f,
                "  {:<9} {:<18} attempts={} elapsed={:?}",
                e.id.to_string(),
                e.result.to_string(),
                e.attempts,
                e.elapsed
            )?;
            if let Some(detail) = &e.detail {
                write!(f, " ({detail})")?;
            }
            writeln!(f)?;
        }
        let failed = self.failures().count();
        if failed == 0 {
            write!(f, "all {} endpoints reachable", self.endpoints.len())
        } else {
            write!(f, "{} of {} endpoints failed", failed, self.endpoints.len())
        }
    }
}

pub struct Probe {
    config: ProbeConfig,
}

impl Probe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Checks every target concurrently and aggregates the results
    pub async fn run(&self) -> ProbeReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let overall_deadline = deadline_after(start, self.config.overall_budget);

        info!("Probe {} checking {} endpoints", run_id, self.config.targets.len());

        let checks = self
            .config
            .targets
            .iter()
            .map(|(id, path)| probe_endpoint(*id, path.clone(), &self.config, overall_deadline));
        let endpoints = futures::future::join_all(checks).await;

        ProbeReport {
            run_id,
            started_at,
            elapsed: start.elapsed(),
            endpoints,
        }
    }
}

/// Retries after a connected service stayed silent. One covers a service
/// that is still starting behind an activated socket; more would let a hung
/// service eat the whole budget.
const MAX_SILENT_RETRIES: u32 = 1;

/// `start + budget`, saturating instead of overflowing on absurd budgets
fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64))
}

async fn probe_endpoint(
    id: ServiceId,
    path: PathBuf,
    config: &ProbeConfig,
    overall_deadline: Instant,
) -> EndpointReport {
    let start = Instant::now();
    let deadline = deadline_after(start, config.endpoint_budget).min(overall_deadline);
    let mut attempts = 0;
    let mut silent_replies = 0;
    let mut last_error: Option<AttemptError> = None;
    let mut cut_short = false;

    while attempts < config.max_attempts {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        attempts += 1;

        match timeout(deadline - now, attempt(id, &path, config)).await {
            Ok(Ok(())) => {
                debug!("{} reachable after {} attempts", id, attempts);
                return EndpointReport {
                    id,
                    path,
                    result: LivenessResult::Reachable,
                    attempts,
                    elapsed: start.elapsed(),
                    detail: None,
                };
            }
            Ok(Err(e)) => {
                debug!("{} attempt {} failed: {}", id, attempts, e);
                if matches!(e, AttemptError::ResponseTimeout) {
                    silent_replies += 1;
                }
                let retryable = e.retryable() && silent_replies <= MAX_SILENT_RETRIES;
                last_error = Some(e);
                if !retryable {
                    break;
                }
            }
            Err(_) => {
                cut_short = true;
                break;
            }
        }

        if attempts >= config.max_attempts {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(config.backoff.delay(attempts).min(remaining)).await;
    }

    let (result, detail) = match (&last_error, cut_short) {
        (Some(e), _) => (e.liveness(), e.to_string()),
        (None, true) => (LivenessResult::TimedOut, "budget exhausted".to_string()),
        (None, false) => (LivenessResult::TimedOut, "no attempt fit the budget".to_string()),
    };
    warn!("{} {} after {} attempts: {}", id, result, attempts, detail);

    EndpointReport {
        id,
        path,
        result,
        attempts,
        elapsed: start.elapsed(),
        detail: Some(detail),
    }
}

/// One connect + query + acknowledgement exchange
async fn attempt(id: ServiceId, path: &Path, config: &ProbeConfig) -> Result<(), AttemptError> {
    let stream = match timeout(config.connect_timeout, UnixStream::connect(path)).await {
        Err(_) => return Err(AttemptError::ConnectTimeout),
        Ok(Err(e)) => return Err(AttemptError::ConnectionRefused(e)),
        Ok(Ok(stream)) => stream,
    };
    let mut framed = protocol::framed(stream);

    let nonce = Uuid::new_v4().simple().to_string();
    match timeout(config.response_timeout, framed.send(Request::ping(&nonce).to_string())).await {
        Err(_) => return Err(AttemptError::ResponseTimeout),
        Ok(Err(_)) => return Err(AttemptError::ClosedEarly),
        Ok(Ok(())) => {}
    }

    let line = match timeout(config.response_timeout, framed.next()).await {
        Err(_) => return Err(AttemptError::ResponseTimeout),
        Ok(None) | Ok(Some(Err(LinesCodecError::Io(_)))) => return Err(AttemptError::ClosedEarly),
        Ok(Some(Err(e))) => return Err(AttemptError::Protocol(e.to_string())),
        Ok(Some(Ok(line))) => line,
    };

    match Response::parse(&line) {
        Ok(Response::Pong { service, nonce: echoed }) if service == id && echoed == nonce => Ok(()),
        Ok(Response::Pong { service, .. }) if service != id => Err(AttemptError::Protocol(format!(
            "answered as {service}"
        ))),
        Ok(Response::Pong { .. }) => Err(AttemptError::Protocol("nonce mismatch".to_string())),
        Ok(Response::Error { reason }) => Err(AttemptError::Protocol(format!("service error: {reason}"))),
        Err(e) => Err(AttemptError::Protocol(e.to_string())),
    }
}
