//! Tunnel Health Monitoring
//!
//! Periodic probes of the backend's tunnel state. Results only feed the
//! health snapshot and logs; the session state is never changed from here.

use serde::Serialize;
use tracing::{info, warn};

/// Health of the active tunnel
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    checks: u64,
    failures: u64,
    consecutive_failures: u32,
    last_check_epoch_millis: Option<u64>,
    warned: bool,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            checks: 0,
            failures: 0,
            consecutive_failures: 0,
            last_check_epoch_millis: None,
            warned: false,
        }
    }

    /// Record a probe that found the tunnel up
    pub fn record_success(&mut self, at_epoch_millis: u64) {
        if self.warned {
            info!("Tunnel health recovered after {} failed checks", self.consecutive_failures);
        }
        self.checks += 1;
        self.consecutive_failures = 0;
        self.warned = false;
        self.last_check_epoch_millis = Some(at_epoch_millis);
    }

    /// Record a failed probe. Returns true the first time the streak reaches the threshold.
    pub fn record_failure(&mut self, at_epoch_millis: u64) -> bool {
        self.checks += 1;
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check_epoch_millis = Some(at_epoch_millis);

        if !self.warned && self.consecutive_failures >= self.threshold {
            self.warned = true;
            warn!(
                "Tunnel health degraded: {} consecutive failed checks",
                self.consecutive_failures
            );
            return true;
        }
        false
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < self.threshold
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.is_healthy(),
            checks: self.checks,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            last_check_epoch_millis: self.last_check_epoch_millis,
        }
    }
}

/// Serializable view of [`HealthTracker`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub checks: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_check_epoch_millis: Option<u64>,
}
