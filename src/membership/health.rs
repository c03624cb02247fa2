//! Service health checks, run on the node hosting the allocation.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command as ProcessCommand;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::grpc::Proposer;
use crate::model::{CheckKind, CheckSpec, CheckStatus};
use crate::state::{now_ms, Command};

/// Result of a single probe, before hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Pass,
    Warn,
    Fail,
}

/// Hysteresis on top of raw probe results: a check only turns critical after
/// `failures_before_critical` consecutive failures and only turns passing
/// after `successes_before_passing` consecutive passes.
#[derive(Debug, Clone)]
pub struct CheckTracker {
    status: CheckStatus,
    successes: u32,
    failures: u32,
    successes_before_passing: u32,
    failures_before_critical: u32,
}

impl CheckTracker {
    pub fn new(spec: &CheckSpec) -> Self {
        Self {
            status: spec.initial_status,
            successes: 0,
            failures: 0,
            successes_before_passing: spec.successes_before_passing.max(1),
            failures_before_critical: spec.failures_before_critical.max(1),
        }
    }

    pub fn status(&self) -> CheckStatus {
        self.status
    }

    /// Record a probe result; returns the new status when it changed.
    pub fn record(&mut self, result: ProbeResult) -> Option<CheckStatus> {
        let next = match result {
            ProbeResult::Pass => {
                self.failures = 0;
                self.successes = self.successes.saturating_add(1);
                (self.successes >= self.successes_before_passing).then_some(CheckStatus::Passing)
            }
            ProbeResult::Fail => {
                self.successes = 0;
                self.failures = self.failures.saturating_add(1);
                (self.failures >= self.failures_before_critical).then_some(CheckStatus::Critical)
            }
            ProbeResult::Warn => {
                self.successes = 0;
                self.failures = 0;
                Some(CheckStatus::Warning)
            }
        };
        match next {
            Some(status) if status != self.status => {
                self.status = status;
                Some(status)
            }
            _ => None,
        }
    }
}

/// Run one probe against `address:port`.
pub async fn probe(
    kind: &CheckKind,
    address: &str,
    port: u16,
    limit: Duration,
) -> (ProbeResult, String) {
    match kind {
        CheckKind::Http { path } => probe_http(address, port, path, limit).await,
        CheckKind::Tcp => match timeout(limit, TcpStream::connect((address, port))).await {
            Ok(Ok(_)) => (ProbeResult::Pass, format!("connected to {}:{}", address, port)),
            Ok(Err(e)) => (ProbeResult::Fail, e.to_string()),
            Err(_) => (ProbeResult::Fail, "connect timed out".to_string()),
        },
        CheckKind::Script { command, args } => probe_script(command, args, limit).await,
    }
}

async fn probe_http(address: &str, port: u16, path: &str, limit: Duration) -> (ProbeResult, String) {
    let url = format!("http://{}:{}{}", address, port, path);
    let client = match reqwest::Client::builder().timeout(limit).build() {
        Ok(client) => client,
        Err(e) => return (ProbeResult::Fail, e.to_string()),
    };
    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let result = if status.is_success() {
                ProbeResult::Pass
            } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                ProbeResult::Warn
            } else {
                ProbeResult::Fail
            };
            (result, format!("GET {}: {}", url, status))
        }
        Err(e) => (ProbeResult::Fail, format!("GET {}: {}", url, e)),
    }
}

async fn probe_script(command: &str, args: &[String], limit: Duration) -> (ProbeResult, String) {
    let child = ProcessCommand::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return (ProbeResult::Fail, format!("failed to run {}: {}", command, e)),
    };

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            let result = match output.status.code() {
                Some(0) => ProbeResult::Pass,
                Some(1) => ProbeResult::Warn,
                _ => ProbeResult::Fail,
            };
            (result, text)
        }
        Ok(Err(e)) => (ProbeResult::Fail, e.to_string()),
        Err(_) => (ProbeResult::Fail, "script timed out".to_string()),
    }
}

/// Probe a check every `interval` and propose each status transition.
pub async fn run_check(
    check_id: String,
    spec: CheckSpec,
    address: String,
    port: u16,
    proposer: Arc<Proposer>,
    request_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut tracker = CheckTracker::new(&spec);
    let mut ticker = tokio::time::interval(spec.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (result, output) = probe(&spec.kind, &address, port, spec.timeout).await;
        tracing::trace!(check_id = %check_id, ?result, "Health check probe");
        let Some(status) = tracker.record(result) else {
            continue;
        };

        tracing::info!(check_id = %check_id, %status, output = %output, "Check status changed");
        let command = Command::UpdateCheck {
            check_id: check_id.clone(),
            status,
            output,
            at_ms: now_ms(),
        };
        if let Err(e) = proposer
            .propose_with_retry(None, command, request_timeout)
            .await
        {
            tracing::warn!(check_id = %check_id, error = %e, "Failed to report check status");
        }
    }
}
