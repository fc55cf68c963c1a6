//! Supervisor Settings
//!
//! Tunables for retry timing, health checks and bandwidth estimation.
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [supervisor]
//! session_name = "splitvpn"
//! self_identifier = "dev.splitvpn.app"
//! retry_backoff_ms = 2000
//! on_retry_exhausted = "fail"   # or "degraded"
//!
//! [bandwidth]
//! fallback_fraction = 0.1
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when the tunnel still is not up after the retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryExhaustedPolicy {
    /// Release the interface and report failure
    #[default]
    #[serde(rename = "fail")]
    FailAndRelease,
    /// Keep the interface up without encryption and report connected
    #[serde(rename = "degraded")]
    KeepDegraded,
}

/// Connection supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Session/tunnel name given to the host and backend
    pub session_name: String,
    /// Identifier of the manager app, never routed through the tunnel
    pub self_identifier: String,
    /// Wait before the single retry (ms)
    pub retry_backoff_ms: u64,
    /// Upper bound for one backend call (ms)
    pub backend_timeout_ms: u64,
    /// Delay before the first health check (ms)
    pub health_grace_ms: u64,
    /// Interval between health checks (ms)
    pub health_interval_ms: u64,
    /// Consecutive failed checks before health is reported degraded
    pub health_failure_threshold: u32,
    /// Policy once the backend retry is exhausted
    pub on_retry_exhausted: RetryExhaustedPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            session_name: "splitvpn".to_string(),
            self_identifier: "dev.splitvpn.app".to_string(),
            retry_backoff_ms: 2000,
            backend_timeout_ms: 5000,
            health_grace_ms: 3000,
            health_interval_ms: 10_000,
            health_failure_threshold: 3,
            on_retry_exhausted: RetryExhaustedPolicy::FailAndRelease,
        }
    }
}

impl SupervisorSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_millis(self.health_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Bandwidth estimation policy used when per-process counters are unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthPolicy {
    /// Share of the system-wide counters attributed to the tunnel
    pub fallback_fraction: f64,
    /// Ceiling for the estimated sent bytes
    pub sent_cap_bytes: u64,
    /// Ceiling for the estimated received bytes
    pub received_cap_bytes: u64,
}

impl Default for BandwidthPolicy {
    fn default() -> Self {
        Self {
            fallback_fraction: 0.1,
            sent_cap_bytes: 512 * 1024 * 1024,
            received_cap_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub supervisor: SupervisorSettings,
    pub bandwidth: BandwidthPolicy,
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        let s = &self.supervisor;
        if s.session_name.trim().is_empty() {
            return Err(SettingsError::Invalid("session_name must not be empty".into()));
        }
        if s.self_identifier.trim().is_empty() {
            return Err(SettingsError::Invalid("self_identifier must not be empty".into()));
        }
        if s.backend_timeout_ms == 0 || s.health_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "backend_timeout_ms and health_interval_ms must be positive".into(),
            ));
        }
        if s.health_failure_threshold == 0 {
            return Err(SettingsError::Invalid("health_failure_threshold must be at least 1".into()));
        }

        let fraction = self.bandwidth.fallback_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SettingsError::Invalid(format!(
                "fallback_fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        Ok(())
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.supervisor.retry_backoff(), Duration::from_secs(2));
        assert_eq!(settings.supervisor.on_retry_exhausted, RetryExhaustedPolicy::FailAndRelease);
    }

    #[test]
    fn test_partial_override() {
        let settings = Settings::from_toml(
            r#"
            [supervisor]
            self_identifier = "com.example.vpn"
            on_retry_exhausted = "degraded"

            [bandwidth]
            fallback_fraction = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(settings.supervisor.self_identifier, "com.example.vpn");
        assert_eq!(settings.supervisor.on_retry_exhausted, RetryExhaustedPolicy::KeepDegraded);
        assert_eq!(settings.supervisor.session_name, "splitvpn");
        assert_eq!(settings.bandwidth.fallback_fraction, 0.25);
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = Settings::default();
        let parsed = Settings::from_toml(&settings.to_toml()).unwrap();

        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Settings::from_toml("[bandwidth]\nfallback_fraction = 1.5"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml("[supervisor]\nhealth_interval_ms = 0"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml("[supervisor]\non_retry_exhausted = \"maybe\""),
            Err(SettingsError::Parse(_))
        ));
    }
}
