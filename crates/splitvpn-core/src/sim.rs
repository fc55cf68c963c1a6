//! In-Process Simulation
//!
//! Host, backend and counter implementations that run entirely in memory.
//! Failures and delays are scriptable, which makes them suitable both for
//! tests and for dry-running a session from the CLI.

use crate::backend::{BackendError, CryptoBackend, TunnelRequest, TunnelState};
use crate::interface::{InterfaceError, InterfaceHandle, InterfaceRequest, RawDescriptor, VirtualInterfaceHost};
use crate::status::{RawCounters, TrafficCounters, UNSUPPORTED};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Decrement a counter unless it is already zero. Returns whether it was positive.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Simulated virtual-interface host
#[derive(Debug)]
pub struct SimulatedHost {
    next_fd: AtomicI32,
    live: Arc<AtomicUsize>,
    establish_calls: AtomicUsize,
    refuse_next: AtomicUsize,
    permission: AtomicBool,
    last_request: Mutex<Option<InterfaceRequest>>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            next_fd: AtomicI32::new(100),
            live: Arc::new(AtomicUsize::new(0)),
            establish_calls: AtomicUsize::new(0),
            refuse_next: AtomicUsize::new(0),
            permission: AtomicBool::new(true),
            last_request: Mutex::new(None),
        }
    }

    /// Refuse the next `n` establish calls
    pub fn fail_next_establish(&self, n: usize) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    /// Interfaces established and not yet released
    pub fn live_interfaces(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    /// Most recent request seen by `establish`
    pub fn last_request(&self) -> Option<InterfaceRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VirtualInterfaceHost for SimulatedHost {
    async fn request_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    async fn establish(&self, request: &InterfaceRequest) -> Option<Box<dyn InterfaceHandle>> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Some(request.clone());

        if take_one(&self.refuse_next) {
            return None;
        }

        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated interface fd {} up", fd);
        Some(Box::new(SimulatedHandle {
            fd,
            live: self.live.clone(),
            released: false,
        }))
    }
}

/// Interface handle issued by [`SimulatedHost`]
#[derive(Debug)]
pub struct SimulatedHandle {
    fd: RawDescriptor,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl SimulatedHandle {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!("Simulated interface fd {} released", self.fd);
        }
    }
}

impl InterfaceHandle for SimulatedHandle {
    fn descriptor(&self) -> RawDescriptor {
        self.fd
    }

    fn close(mut self: Box<Self>) -> Result<(), InterfaceError> {
        self.release();
        Ok(())
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Simulated crypto backend
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<TunnelState>,
    stay_down_next: AtomicUsize,
    error_next: AtomicUsize,
    panic_next: AtomicUsize,
    failing_probes: AtomicBool,
    up_delay_ms: AtomicU64,
    state_delay_ms: AtomicU64,
    up_calls: AtomicUsize,
    down_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    state_queries_completed: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TunnelState::Down),
            stay_down_next: AtomicUsize::new(0),
            error_next: AtomicUsize::new(0),
            panic_next: AtomicUsize::new(0),
            failing_probes: AtomicBool::new(false),
            up_delay_ms: AtomicU64::new(0),
            state_delay_ms: AtomicU64::new(0),
            up_calls: AtomicUsize::new(0),
            down_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            state_queries_completed: AtomicUsize::new(0),
        }
    }

    /// Next `n` up requests leave the tunnel down
    pub fn stay_down_next(&self, n: usize) {
        self.stay_down_next.store(n, Ordering::SeqCst);
    }

    /// Next `n` up requests fail with a call error
    pub fn error_next(&self, n: usize) {
        self.error_next.store(n, Ordering::SeqCst);
    }

    /// Next `n` up requests panic
    pub fn panic_next(&self, n: usize) {
        self.panic_next.store(n, Ordering::SeqCst);
    }

    /// Make health probes fail until reset
    pub fn set_failing_probes(&self, failing: bool) {
        self.failing_probes.store(failing, Ordering::SeqCst);
    }

    /// Delay applied to every up request
    pub fn set_up_delay(&self, delay: Duration) {
        self.up_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Delay applied to every state query
    pub fn set_state_delay(&self, delay: Duration) {
        self.state_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    pub fn up_calls(&self) -> usize {
        self.up_calls.load(Ordering::SeqCst)
    }

    pub fn down_calls(&self) -> usize {
        self.down_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// State queries that ran to completion
    pub fn state_queries_completed(&self) -> usize {
        self.state_queries_completed.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> TunnelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: TunnelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CryptoBackend for SimulatedBackend {
    async fn set_state(&self, request: TunnelRequest<'_>) -> Result<TunnelState, BackendError> {
        match request.desired {
            TunnelState::Down => {
                self.down_calls.fetch_add(1, Ordering::SeqCst);
                self.set(TunnelState::Down);
                Ok(TunnelState::Down)
            }
            TunnelState::Up => {
                self.up_calls.fetch_add(1, Ordering::SeqCst);

                let delay = self.up_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }

                if take_one(&self.panic_next) {
                    panic!("simulated backend panic");
                }
                if take_one(&self.error_next) {
                    return Err(BackendError::Call("simulated failure".into()));
                }
                if request.descriptor.is_none() || request.config.is_none() {
                    return Err(BackendError::Call("missing descriptor or config".into()));
                }
                if take_one(&self.stay_down_next) {
                    return Ok(TunnelState::Down);
                }

                self.set(TunnelState::Up);
                Ok(TunnelState::Up)
            }
        }
    }

    async fn state(&self, _name: &str) -> Result<TunnelState, BackendError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.state_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state_queries_completed.fetch_add(1, Ordering::SeqCst);

        if self.failing_probes.load(Ordering::SeqCst) {
            return Err(BackendError::Call("probe failed".into()));
        }
        Ok(self.current_state())
    }
}

/// Fixed traffic counters
#[derive(Debug, Clone, Copy)]
pub struct SimulatedCounters {
    pub process: RawCounters,
    pub system: Option<RawCounters>,
}

impl SimulatedCounters {
    /// Per-process counters available
    pub fn per_process(sent: i64, received: i64) -> Self {
        Self {
            process: RawCounters { sent, received },
            system: None,
        }
    }

    /// Only system-wide counters available
    pub fn system_only(sent: i64, received: i64) -> Self {
        Self {
            process: RawCounters {
                sent: UNSUPPORTED,
                received: UNSUPPORTED,
            },
            system: Some(RawCounters { sent, received }),
        }
    }

    /// Nothing available
    pub fn unavailable() -> Self {
        Self {
            process: RawCounters {
                sent: UNSUPPORTED,
                received: UNSUPPORTED,
            },
            system: None,
        }
    }
}

impl TrafficCounters for SimulatedCounters {
    fn process_counters(&self) -> RawCounters {
        self.process
    }

    fn system_counters(&self) -> Option<RawCounters> {
        self.system
    }
}
