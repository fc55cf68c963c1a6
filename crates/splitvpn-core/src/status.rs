//! Status Reporting
//!
//! Snapshot of the session for the caller: a connected/disconnected flag,
//! the detailed lifecycle state, and an approximate traffic count.
//!
//! Bandwidth is best-effort. Per-process counters are preferred; when the
//! platform does not expose them a fixed share of the system-wide counters
//! is reported instead, capped so a busy host cannot inflate the figure.

use crate::health::HealthSnapshot;
use crate::settings::BandwidthPolicy;
use crate::supervisor::{CallerError, SessionState};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::Networks;
use tracing::warn;

/// Sentinel returned by counters the platform does not support
pub const UNSUPPORTED: i64 = -1;

/// Protocol reported while connected
pub const PROTOCOL: &str = "WireGuard";

/// Raw byte counters as read from the platform (may be negative)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCounters {
    pub sent: i64,
    pub received: i64,
}

/// Source of traffic counters
pub trait TrafficCounters: Send + Sync {
    /// Bytes sent/received by this process, or [`UNSUPPORTED`]
    fn process_counters(&self) -> RawCounters;

    /// Bytes sent/received by the whole system, `None` if unavailable
    fn system_counters(&self) -> Option<RawCounters>;
}

/// Counters backed by `sysinfo`
///
/// Per-process network accounting is not available through `sysinfo`, so
/// [`TrafficCounters::process_counters`] always reports [`UNSUPPORTED`].
pub struct SysinfoCounters {
    networks: Mutex<Networks>,
}

impl SysinfoCounters {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficCounters for SysinfoCounters {
    fn process_counters(&self) -> RawCounters {
        RawCounters {
            sent: UNSUPPORTED,
            received: UNSUPPORTED,
        }
    }

    fn system_counters(&self) -> Option<RawCounters> {
        let mut networks = self.networks.lock().unwrap_or_else(PoisonError::into_inner);
        networks.refresh(true);
        if networks.list().is_empty() {
            return None;
        }

        let (sent, received) = networks.list().values().fold((0u64, 0u64), |(tx, rx), data| {
            (
                tx.saturating_add(data.total_transmitted()),
                rx.saturating_add(data.total_received()),
            )
        });

        Some(RawCounters {
            sent: i64::try_from(sent).unwrap_or(i64::MAX),
            received: i64::try_from(received).unwrap_or(i64::MAX),
        })
    }
}

/// Where a bandwidth figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterSource {
    PerProcess,
    Estimated,
    Unavailable,
}

/// Bandwidth figures, regenerated on every query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sampled_at_epoch_millis: u64,
    pub source: CounterSource,
}

impl BandwidthSample {
    /// Zero sample for when no counters could be read
    pub fn unavailable(sampled_at_epoch_millis: u64) -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            sampled_at_epoch_millis,
            source: CounterSource::Unavailable,
        }
    }
}

/// Coarse state reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedState {
    Connected,
    Disconnected,
}

impl From<SessionState> for ReportedState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connected => ReportedState::Connected,
            _ => ReportedState::Disconnected,
        }
    }
}

/// Status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: ReportedState,
    pub session: SessionState,
    pub bandwidth: BandwidthSample,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since_epoch_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<CallerError>,
}

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn scale(value: i64, fraction: f64, cap: u64) -> u64 {
    let scaled = (clamp(value) as f64 * fraction) as u64;
    scaled.min(cap)
}

/// Computes bandwidth samples from a counter source
pub struct StatusReporter<'a> {
    counters: &'a dyn TrafficCounters,
    policy: &'a BandwidthPolicy,
}

impl<'a> StatusReporter<'a> {
    pub fn new(counters: &'a dyn TrafficCounters, policy: &'a BandwidthPolicy) -> Self {
        Self { counters, policy }
    }

    /// Current bandwidth sample; never negative
    pub fn sample(&self) -> BandwidthSample {
        let sampled_at_epoch_millis = epoch_millis();

        let process = self.counters.process_counters();
        if process.sent >= 0 && process.received >= 0 {
            return BandwidthSample {
                bytes_sent: clamp(process.sent),
                bytes_received: clamp(process.received),
                sampled_at_epoch_millis,
                source: CounterSource::PerProcess,
            };
        }

        match self.counters.system_counters() {
            Some(system) => BandwidthSample {
                bytes_sent: scale(system.sent, self.policy.fallback_fraction, self.policy.sent_cap_bytes),
                bytes_received: scale(
                    system.received,
                    self.policy.fallback_fraction,
                    self.policy.received_cap_bytes,
                ),
                sampled_at_epoch_millis,
                source: CounterSource::Estimated,
            },
            None => BandwidthSample::unavailable(sampled_at_epoch_millis),
        }
    }
}

/// Take a sample on the blocking pool
///
/// Counter sources may refresh platform tables synchronously.
pub(crate) async fn sample_blocking(counters: Arc<dyn TrafficCounters>, policy: BandwidthPolicy) -> BandwidthSample {
    let task = tokio::task::spawn_blocking(move || StatusReporter::new(counters.as_ref(), &policy).sample());
    match task.await {
        Ok(sample) => sample,
        Err(e) => {
            warn!("Bandwidth sampling failed: {}", e);
            BandwidthSample::unavailable(epoch_millis())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCounters;

    #[test]
    fn test_per_process_counters_preferred() {
        let counters = SimulatedCounters {
            process: RawCounters { sent: 1000, received: 5000 },
            system: Some(RawCounters { sent: 1, received: 1 }),
        };
        let policy = BandwidthPolicy::default();

        let sample = StatusReporter::new(&counters, &policy).sample();

        assert_eq!(sample.bytes_sent, 1000);
        assert_eq!(sample.bytes_received, 5000);
        assert_eq!(sample.source, CounterSource::PerProcess);
    }

    #[test]
    fn test_one_negative_process_counter_falls_back() {
        let counters = SimulatedCounters {
            process: RawCounters { sent: 10, received: UNSUPPORTED },
            system: Some(RawCounters { sent: 1000, received: 2000 }),
        };
        let policy = BandwidthPolicy::default();

        let sample = StatusReporter::new(&counters, &policy).sample();

        assert_eq!(sample.source, CounterSource::Estimated);
        assert_eq!(sample.bytes_sent, 100);
        assert_eq!(sample.bytes_received, 200);
    }

    #[test]
    fn test_negative_system_counters_clamped() {
        let counters = SimulatedCounters::system_only(-5, -1);
        let policy = BandwidthPolicy::default();

        let sample = StatusReporter::new(&counters, &policy).sample();

        assert_eq!(sample.bytes_sent, 0);
        assert_eq!(sample.bytes_received, 0);
        assert_eq!(sample.source, CounterSource::Estimated);
    }

    #[test]
    fn test_estimate_capped() {
        let counters = SimulatedCounters::system_only(i64::MAX, i64::MAX);
        let policy = BandwidthPolicy::default();

        let sample = StatusReporter::new(&counters, &policy).sample();

        assert_eq!(sample.bytes_sent, policy.sent_cap_bytes);
        assert_eq!(sample.bytes_received, policy.received_cap_bytes);
    }

    #[test]
    fn test_unavailable_counters() {
        let counters = SimulatedCounters::unavailable();
        let policy = BandwidthPolicy::default();

        let sample = StatusReporter::new(&counters, &policy).sample();

        assert_eq!((sample.bytes_sent, sample.bytes_received), (0, 0));
        assert_eq!(sample.source, CounterSource::Unavailable);
    }

    struct ThreadRecorder {
        seen: Mutex<Option<std::thread::ThreadId>>,
    }

    impl TrafficCounters for ThreadRecorder {
        fn process_counters(&self) -> RawCounters {
            *self.seen.lock().unwrap() = Some(std::thread::current().id());
            RawCounters { sent: 7, received: 9 }
        }

        fn system_counters(&self) -> Option<RawCounters> {
            None
        }
    }

    struct Broken;

    impl TrafficCounters for Broken {
        fn process_counters(&self) -> RawCounters {
            panic!("counter table unreadable");
        }

        fn system_counters(&self) -> Option<RawCounters> {
            None
        }
    }

    #[tokio::test]
    async fn test_sampling_runs_on_blocking_pool() {
        let counters = Arc::new(ThreadRecorder { seen: Mutex::new(None) });

        let sample = sample_blocking(counters.clone(), BandwidthPolicy::default()).await;

        assert_eq!((sample.bytes_sent, sample.bytes_received), (7, 9));
        let seen = counters.seen.lock().unwrap().expect("counters were read");
        assert_ne!(seen, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_failed_sampling_reports_unavailable() {
        let sample = sample_blocking(Arc::new(Broken), BandwidthPolicy::default()).await;

        assert_eq!(sample.source, CounterSource::Unavailable);
        assert_eq!((sample.bytes_sent, sample.bytes_received), (0, 0));
    }

    #[test]
    fn test_reported_state() {
        assert_eq!(ReportedState::from(SessionState::Connected), ReportedState::Connected);
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Disconnecting,
            SessionState::Failed,
        ] {
            assert_eq!(ReportedState::from(state), ReportedState::Disconnected);
        }
        assert_eq!(serde_json::to_string(&ReportedState::Connected).unwrap(), "\"connected\"");
    }
}
