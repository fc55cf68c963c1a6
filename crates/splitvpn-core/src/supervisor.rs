//! Tunnel Supervisor
//!
//! Owns the single tunnel session and drives it through its lifecycle:
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──up──▶ Connected ──disconnect──▶ Disconnecting ──▶ Idle
//!                         │                                                            ▲
//!                         └──error──▶ Failed ──disconnect──────────────────────────────┘
//!                                       └──connect──▶ Connecting
//! ```
//!
//! A connect attempt runs on its own task and holds the operation gate
//! until it settles. A second connect while the gate is held is rejected;
//! disconnect cancels the attempt and waits for the gate. The session lock
//! is only held for state transitions, never across host or backend calls.

use crate::backend::{BackendError, BackendLifecycle, CryptoBackend, TunnelRequest, TunnelState};
use crate::catalog::{selectable_apps, AppCatalog, AppInfo, StaticCatalog};
use crate::config::{self, ParseError, TunnelConfig};
use crate::health::HealthTracker;
use crate::interface::{InterfaceError, InterfaceHandle, InterfaceProvisioner, VirtualInterfaceHost};
use crate::routing::{self, AppDomainMap, AppSelection, RoutingDecision};
use crate::settings::{RetryExhaustedPolicy, Settings, SettingsError};
use crate::status::{epoch_millis, sample_blocking, Status, SysinfoCounters, TrafficCounters, PROTOCOL};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Lifecycle state of the tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl SessionState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnecting)
                | (Disconnecting, Idle)
                | (Failed, Idle)
                | (Failed, Connecting)
        )
    }

    /// A new connect may start from this state
    pub fn accepts_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supervisor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] ParseError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("A tunnel session is already active")]
    AlreadyActive,

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connect attempt cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// Stable code for callers across the bridge
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Parse(ParseError::Malformed(_)) => "PARSE_MALFORMED",
            SupervisorError::Parse(ParseError::MissingField(_)) => "MISSING_FIELD",
            SupervisorError::Parse(ParseError::InvalidKey { .. }) => "INVALID_KEY",
            SupervisorError::Parse(ParseError::InvalidEndpoint(_)) => "INVALID_ENDPOINT",
            SupervisorError::Parse(ParseError::InvalidField { .. }) => "INVALID_FIELD",
            SupervisorError::Interface(_) => "INTERFACE_ERROR",
            SupervisorError::Backend(_) => "BACKEND_ERROR",
            SupervisorError::AlreadyActive => "ALREADY_ACTIVE",
            SupervisorError::Timeout(_) => "TIMEOUT",
            SupervisorError::Cancelled => "CANCELLED",
            SupervisorError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error as surfaced to the calling application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerError {
    pub code: String,
    pub message: String,
}

impl From<&SupervisorError> for CallerError {
    fn from(err: &SupervisorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<SupervisorError> for CallerError {
    fn from(err: SupervisorError) -> Self {
        Self::from(&err)
    }
}

/// The one tunnel session
///
/// `interface` is only populated while Connected or Disconnecting; during
/// Connecting the handle belongs to the attempt.
struct TunnelSession {
    state: SessionState,
    epoch: u64,
    interface: Option<Box<dyn InterfaceHandle>>,
    config: Option<TunnelConfig>,
    selection: AppSelection,
    decision: Option<RoutingDecision>,
    retry_count: u32,
    backend_active: bool,
    health: HealthTracker,
    health_task: Option<JoinHandle<()>>,
    last_error: Option<SupervisorError>,
    connected_at: Option<u64>,
}

impl TunnelSession {
    fn new(epoch: u64, selection: AppSelection, health_threshold: u32) -> Self {
        Self {
            state: SessionState::Connecting,
            epoch,
            interface: None,
            config: None,
            selection,
            decision: None,
            retry_count: 0,
            backend_active: false,
            health: HealthTracker::new(health_threshold),
            health_task: None,
            last_error: None,
            connected_at: None,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {} -> {}", self.state, next);
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    fn stop_health(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.stop_health();
    }
}

/// Result of a successful attempt, handed over to the session
struct Established {
    handle: Box<dyn InterfaceHandle>,
    config: TunnelConfig,
    decision: RoutingDecision,
    backend_active: bool,
}

struct Shared {
    session: Mutex<Option<TunnelSession>>,
    gate: Arc<Mutex<()>>,
    cancel: watch::Sender<u64>,
    events: watch::Sender<SessionState>,
    epochs: AtomicU64,
    provisioner: InterfaceProvisioner,
    backend: BackendLifecycle,
    counters: Arc<dyn TrafficCounters>,
    catalog: Arc<dyn AppCatalog>,
    settings: Settings,
}

impl Shared {
    fn publish(&self, state: SessionState) {
        self.events.send_replace(state);
    }

    fn is_cancelled(&self, generation: u64) -> bool {
        *self.cancel.borrow() != generation
    }

    async fn note_retry(&self, epoch: u64) {
        if let Some(session) = self.session.lock().await.as_mut() {
            if session.epoch == epoch {
                session.retry_count += 1;
            }
        }
    }

    /// Release what a cancelled attempt had already brought up
    async fn abandon(&self, established: Established) {
        let name = &self.settings.supervisor.session_name;
        if established.backend_active {
            if let Some(backend) = self.backend.current() {
                self.bring_down(backend.as_ref(), name).await;
            }
        }
        release(established.handle);
    }

    async fn bring_down(&self, backend: &dyn CryptoBackend, name: &str) {
        let timeout = self.settings.supervisor.backend_timeout();
        match tokio::time::timeout(timeout, backend.set_state(TunnelRequest::down(name))).await {
            Ok(Ok(_)) => debug!("Tunnel '{}' down", name),
            Ok(Err(e)) => warn!("Failed to bring tunnel down: {}", e),
            Err(_) => warn!("Timed out bringing tunnel down"),
        }
    }

    /// Store the outcome of an attempt in the session
    async fn finish(
        self: &Arc<Self>,
        epoch: u64,
        generation: u64,
        result: Result<Established, SupervisorError>,
    ) -> Result<(), SupervisorError> {
        let result = match result {
            Ok(established) if self.is_cancelled(generation) => {
                info!("Connect cancelled after the tunnel came up, releasing");
                self.abandon(established).await;
                Err(SupervisorError::Cancelled)
            }
            other => other,
        };

        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut().filter(|s| s.epoch == epoch) else {
            if let Ok(established) = result {
                release(established.handle);
            }
            return Err(SupervisorError::Internal("session replaced during connect".into()));
        };

        match result {
            Ok(established) => {
                let routed = match &established.decision {
                    RoutingDecision::AllowAll => "all apps".to_string(),
                    decision => format!("{} apps", decision.allowed_count()),
                };
                info!("Connected to {} ({})", established.config.peer_endpoint(), routed);
                session.interface = Some(established.handle);
                session.config = Some(established.config);
                session.decision = Some(established.decision);
                session.backend_active = established.backend_active;
                session.connected_at = Some(epoch_millis());
                session.last_error = None;
                session.transition(SessionState::Connected);
                session.health_task = Some(spawn_health(self, epoch));
                self.publish(SessionState::Connected);
                Ok(())
            }
            Err(err) => {
                warn!("Connect failed: {}", err);
                session.last_error = Some(err.clone());
                session.transition(SessionState::Failed);
                self.publish(SessionState::Failed);
                Err(err)
            }
        }
    }
}

fn release(handle: Box<dyn InterfaceHandle>) {
    let fd = handle.descriptor();
    match handle.close() {
        Ok(()) => debug!("Interface fd {} closed", fd),
        Err(e) => warn!("Failed to close interface fd {}: {}", fd, e),
    }
}

/// One connect attempt
struct Attempt {
    shared: Arc<Shared>,
    epoch: u64,
    generation: u64,
    cancel: watch::Receiver<u64>,
}

impl Attempt {
    fn check_cancelled(&self) -> Result<(), SupervisorError> {
        if self.shared.is_cancelled(self.generation) {
            return Err(SupervisorError::Cancelled);
        }
        Ok(())
    }

    /// Wait the retry backoff, cut short by cancellation
    async fn backoff(&self) -> Result<(), SupervisorError> {
        self.shared.note_retry(self.epoch).await;
        let delay = self.shared.settings.supervisor.retry_backoff();
        let generation = self.generation;
        let mut cancel = self.cancel.clone();

        tokio::select! {
            _ = tokio::time::sleep(delay) => self.check_cancelled(),
            _ = cancel.wait_for(|g| *g != generation) => Err(SupervisorError::Cancelled),
        }
    }

    async fn try_up(
        &self,
        backend: &dyn CryptoBackend,
        handle: &dyn InterfaceHandle,
        config: &TunnelConfig,
    ) -> Result<(), SupervisorError> {
        let name = &self.shared.settings.supervisor.session_name;
        let timeout = self.shared.settings.supervisor.backend_timeout();
        let request = TunnelRequest::up(name, handle.descriptor(), config);

        match tokio::time::timeout(timeout, backend.set_state(request)).await {
            Ok(Ok(state)) if state.is_up() => Ok(()),
            Ok(Ok(state)) => Err(BackendError::NotUp(state).into()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SupervisorError::Timeout(timeout)),
        }
    }

    async fn provision(
        &self,
        config: &TunnelConfig,
        decision: &RoutingDecision,
    ) -> Result<Box<dyn InterfaceHandle>, SupervisorError> {
        match self.shared.provisioner.provision(config, decision).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("Interface setup failed ({}), retrying once", e);
                self.backoff().await?;
                Ok(self.shared.provisioner.provision(config, decision).await?)
            }
        }
    }

    async fn run(
        self,
        raw_config: Zeroizing<String>,
        selection: AppSelection,
    ) -> Result<Established, SupervisorError> {
        self.check_cancelled()?;
        let config = config::parse(&raw_config)?;
        drop(raw_config);

        let decision = routing::derive(&selection, &self.shared.settings.supervisor.self_identifier);
        info!(
            "Connecting to {} ({} selected apps)",
            config.peer_endpoint(),
            selection.len()
        );

        let handle = self.provision(&config, &decision).await?;
        if let Err(e) = self.check_cancelled() {
            release(handle);
            return Err(e);
        }

        let backend = match self.shared.backend.get_or_init() {
            Ok(backend) => backend,
            Err(e) => {
                release(handle);
                return Err(e.into());
            }
        };

        let mut backend_active = true;
        if let Err(first) = self.try_up(backend.as_ref(), handle.as_ref(), &config).await {
            warn!("Tunnel did not come up ({}), retrying once", first);
            if let Err(e) = self.backoff().await {
                release(handle);
                return Err(e);
            }

            if let Err(second) = self.try_up(backend.as_ref(), handle.as_ref(), &config).await {
                match self.shared.settings.supervisor.on_retry_exhausted {
                    RetryExhaustedPolicy::FailAndRelease => {
                        error!("Tunnel failed after retry: {}", second);
                        release(handle);
                        return Err(second);
                    }
                    RetryExhaustedPolicy::KeepDegraded => {
                        warn!("Tunnel failed after retry ({}), keeping interface without encryption", second);
                        backend_active = false;
                    }
                }
            }
        }

        Ok(Established {
            handle,
            config,
            decision,
            backend_active,
        })
    }
}

fn spawn_health(shared: &Arc<Shared>, epoch: u64) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let grace = shared.settings.supervisor.health_grace();
    let interval = shared.settings.supervisor.health_interval();
    let timeout = shared.settings.supervisor.backend_timeout();
    let name = shared.settings.supervisor.session_name.clone();

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            let Some(shared) = weak.upgrade() else { break };
            let Some(backend) = shared.backend.current() else { break };

            let healthy = matches!(
                tokio::time::timeout(timeout, backend.state(&name)).await,
                Ok(Ok(TunnelState::Up))
            );

            let mut guard = shared.session.lock().await;
            match guard.as_mut() {
                Some(session) if session.epoch == epoch && session.state == SessionState::Connected => {
                    let now = epoch_millis();
                    if healthy {
                        session.health.record_success(now);
                    } else {
                        debug!("Health check failed for tunnel '{}'", name);
                        session.health.record_failure(now);
                    }
                }
                _ => break,
            }
        }
    })
}

/// Builder for [`TunnelSupervisor`]
pub struct SupervisorBuilder {
    host: Arc<dyn VirtualInterfaceHost>,
    backend: BackendLifecycle,
    counters: Option<Arc<dyn TrafficCounters>>,
    catalog: Option<Arc<dyn AppCatalog>>,
    domains: Option<AppDomainMap>,
    settings: Settings,
}

impl SupervisorBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn counters(mut self, counters: Arc<dyn TrafficCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn AppCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// App to domain mapping for hosts without per-app filtering
    pub fn domain_map(mut self, domains: AppDomainMap) -> Self {
        self.domains = Some(domains);
        self
    }

    pub fn build(self) -> Result<TunnelSupervisor, SettingsError> {
        self.settings.validate()?;

        let supervisor = &self.settings.supervisor;
        let mut provisioner = InterfaceProvisioner::new(
            self.host,
            supervisor.session_name.clone(),
            supervisor.self_identifier.clone(),
        );
        if let Some(domains) = self.domains {
            provisioner = provisioner.with_domain_map(domains);
        }
        let (cancel, _) = watch::channel(0);
        let (events, _) = watch::channel(SessionState::Idle);

        Ok(TunnelSupervisor {
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                gate: Arc::new(Mutex::new(())),
                cancel,
                events,
                epochs: AtomicU64::new(0),
                provisioner,
                backend: self.backend,
                counters: self
                    .counters
                    .unwrap_or_else(|| Arc::new(SysinfoCounters::new()) as Arc<dyn TrafficCounters>),
                catalog: self
                    .catalog
                    .unwrap_or_else(|| Arc::new(StaticCatalog::popular()) as Arc<dyn AppCatalog>),
                settings: self.settings,
            }),
        })
    }
}

/// Per-app tunnel supervisor
///
/// Cheap to clone; clones share the same session. The host process is
/// expected to build exactly one.
#[derive(Clone)]
pub struct TunnelSupervisor {
    shared: Arc<Shared>,
}

impl TunnelSupervisor {
    pub fn builder(host: Arc<dyn VirtualInterfaceHost>, backend: BackendLifecycle) -> SupervisorBuilder {
        SupervisorBuilder {
            host,
            backend,
            counters: None,
            catalog: None,
            domains: None,
            settings: Settings::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Ask the host for permission to create VPN interfaces
    pub async fn request_permission(&self) -> bool {
        self.shared.provisioner.request_permission().await
    }

    /// Bring the tunnel up for the selected apps
    ///
    /// Rejected with [`SupervisorError::AlreadyActive`] while another connect
    /// or a disconnect is in progress, or while a session is up.
    pub async fn connect(&self, raw_config: &str, selection: AppSelection) -> Result<(), SupervisorError> {
        let gate = self
            .shared
            .gate
            .clone()
            .try_lock_owned()
            .map_err(|_| SupervisorError::AlreadyActive)?;

        let generation = *self.shared.cancel.borrow();
        let epoch = {
            let mut guard = self.shared.session.lock().await;
            let current = guard.as_ref().map_or(SessionState::Idle, |s| s.state);
            if !current.accepts_connect() {
                return Err(SupervisorError::AlreadyActive);
            }

            let epoch = self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;
            // Replacing a failed session drops it (and its health task) here
            *guard = Some(TunnelSession::new(
                epoch,
                selection.clone(),
                self.shared.settings.supervisor.health_failure_threshold,
            ));
            self.shared.publish(SessionState::Connecting);
            epoch
        };

        let attempt = Attempt {
            shared: self.shared.clone(),
            epoch,
            generation,
            cancel: self.shared.cancel.subscribe(),
        };
        let raw_config = Zeroizing::new(raw_config.to_string());
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            let _gate = gate;
            let result = match tokio::spawn(attempt.run(raw_config, selection)).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Connect attempt aborted: {}", e);
                    Err(SupervisorError::Internal(e.to_string()))
                }
            };
            shared.finish(epoch, generation, result).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(SupervisorError::Internal(e.to_string())),
        }
    }

    /// Tear the session down. Idempotent and never fails.
    pub async fn disconnect(&self) {
        self.shared.cancel.send_modify(|g| *g = g.wrapping_add(1));
        let _gate = self.shared.gate.lock().await;

        let teardown = {
            let mut guard = self.shared.session.lock().await;
            let Some(session) = guard.as_mut() else {
                debug!("Disconnect requested while idle");
                return;
            };

            session.stop_health();
            if session.state == SessionState::Connected {
                session.transition(SessionState::Disconnecting);
                self.shared.publish(SessionState::Disconnecting);
                Some((
                    session.interface.take(),
                    session.config.take(),
                    session.backend_active,
                ))
            } else {
                debug!("Clearing {} session", session.state);
                if let Some(handle) = session.interface.take() {
                    release(handle);
                }
                None
            }
        };

        if let Some((interface, config, backend_active)) = teardown {
            info!("Disconnecting tunnel");
            if backend_active {
                if let Some(backend) = self.shared.backend.current() {
                    self.shared
                        .bring_down(backend.as_ref(), &self.shared.settings.supervisor.session_name)
                        .await;
                }
            }
            if let Some(handle) = interface {
                release(handle);
            }
            drop(config);
        }

        self.shared.backend.teardown();

        let mut guard = self.shared.session.lock().await;
        if let Some(session) = guard.as_mut() {
            session.transition(SessionState::Idle);
        }
        *guard = None;
        self.shared.publish(SessionState::Idle);
        info!("Tunnel disconnected");
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    /// Watch lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.events.subscribe()
    }

    /// Status snapshot for the caller
    pub async fn status(&self) -> Status {
        let (session, server, connected_since, health, last_error) = {
            let guard = self.shared.session.lock().await;
            match guard.as_ref() {
                None => (SessionState::Idle, None, None, None, None),
                Some(s) => {
                    let connected = s.state == SessionState::Connected;
                    (
                        s.state,
                        s.config
                            .as_ref()
                            .filter(|_| connected)
                            .map(|c| c.peer_endpoint().to_string()),
                        s.connected_at.filter(|_| connected),
                        connected.then(|| s.health.snapshot()),
                        s.last_error.as_ref().map(CallerError::from),
                    )
                }
            }
        };

        let bandwidth = sample_blocking(self.shared.counters.clone(), self.shared.settings.bandwidth.clone()).await;
        let connected = session == SessionState::Connected;

        Status {
            state: session.into(),
            session,
            bandwidth,
            server,
            protocol: connected.then_some(PROTOCOL),
            connected_since_epoch_millis: connected_since,
            health,
            last_error,
        }
    }

    /// Applications the user may route through the tunnel
    ///
    /// Falls back to the popular-apps list when the catalog cannot enumerate.
    pub fn installed_apps(&self) -> Vec<AppInfo> {
        let apps = match self.shared.catalog.installed_apps() {
            Ok(apps) => apps,
            Err(e) => {
                warn!("App enumeration failed ({}), using popular apps", e);
                StaticCatalog::popular().installed_apps().unwrap_or_default()
            }
        };
        selectable_apps(apps, &self.shared.settings.supervisor.self_identifier)
    }

    /// Selection the current session was started with
    pub async fn selection(&self) -> Option<AppSelection> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.selection.clone())
    }

    /// Routing decision of the connected session
    pub async fn decision(&self) -> Option<RoutingDecision> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.decision.clone())
    }

    /// Retries used by the current session's connect attempt
    pub async fn retry_count(&self) -> u32 {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogError;
    use crate::keys::KeyPair;
    use crate::sim::{SimulatedBackend, SimulatedCounters, SimulatedHost};
    use crate::status::ReportedState;

    const SELF_ID: &str = "dev.splitvpn.app";

    struct Harness {
        host: Arc<SimulatedHost>,
        backend: Arc<SimulatedBackend>,
        supervisor: TunnelSupervisor,
    }

    fn harness_with(settings: Settings) -> Harness {
        let host = Arc::new(SimulatedHost::new());
        let backend = Arc::new(SimulatedBackend::new());
        let supervisor = TunnelSupervisor::builder(host.clone(), BackendLifecycle::shared(backend.clone()))
            .settings(settings)
            .counters(Arc::new(SimulatedCounters::per_process(1000, 5000)))
            .build()
            .unwrap();
        Harness {
            host,
            backend,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(Settings::default())
    }

    fn blob() -> String {
        serde_json::json!({
            "privateKey": KeyPair::generate().private.to_base64().as_str(),
            "publicKey": KeyPair::generate().public.to_base64(),
            "serverEndpoint": "1.2.3.4:51820",
        })
        .to_string()
    }

    fn apps(ids: &[&str]) -> AppSelection {
        ids.iter().copied().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_selected_apps() {
        let h = harness();

        h.supervisor.connect(&blob(), apps(&["com.app.a", "com.app.b"])).await.unwrap();

        assert_eq!(h.supervisor.state().await, SessionState::Connected);
        assert_eq!(h.host.live_interfaces(), 1);
        assert_eq!(h.backend.up_calls(), 1);

        let request = h.host.last_request().unwrap();
        assert_eq!(request.allowed_apps(), ["com.app.a".to_string(), "com.app.b".to_string()]);
        assert_eq!(request.disallowed_apps(), [SELF_ID.to_string()]);

        let status = h.supervisor.status().await;
        assert_eq!(status.state, ReportedState::Connected);
        assert_eq!(status.server.as_deref(), Some("1.2.3.4:51820"));
        assert_eq!(status.protocol, Some("WireGuard"));
        assert!(status.connected_since_epoch_millis.is_some());
        assert_eq!(status.bandwidth.bytes_sent, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_domains_reach_host() {
        let host = Arc::new(SimulatedHost::new());
        let backend = Arc::new(SimulatedBackend::new());
        let supervisor = TunnelSupervisor::builder(host.clone(), BackendLifecycle::shared(backend))
            .counters(Arc::new(SimulatedCounters::unavailable()))
            .domain_map(AppDomainMap::default().with_app("com.app.a", ["a.example", "cdn.a.example"]))
            .build()
            .unwrap();

        supervisor.connect(&blob(), apps(&["com.app.a"])).await.unwrap();

        let request = host.last_request().unwrap();
        assert_eq!(request.split_domains(), ["a.example".to_string(), "cdn.a.example".to_string()]);

        supervisor.disconnect().await;
        supervisor.connect(&blob(), AppSelection::all()).await.unwrap();
        assert!(host.last_request().unwrap().split_domains().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_apps() {
        let h = harness();

        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        assert!(h.host.last_request().unwrap().is_unrestricted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_field_fails_without_side_effects() {
        let h = harness();
        let raw = serde_json::json!({
            "privateKey": KeyPair::generate().private.to_base64().as_str(),
            "serverEndpoint": "1.2.3.4:51820",
        })
        .to_string();

        let err = h.supervisor.connect(&raw, AppSelection::all()).await.unwrap_err();

        assert_eq!(err, SupervisorError::Parse(ParseError::MissingField("publicKey")));
        assert_eq!(err.code(), "MISSING_FIELD");
        assert_eq!(h.supervisor.state().await, SessionState::Failed);
        assert_eq!(h.host.establish_calls(), 0);
        assert_eq!(h.backend.up_calls(), 0);

        let status = h.supervisor.status().await;
        assert_eq!(status.state, ReportedState::Disconnected);
        assert_eq!(status.last_error.unwrap().code, "MISSING_FIELD");

        h.supervisor.disconnect().await;
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_retry_succeeds() {
        let h = harness();
        h.backend.stay_down_next(1);

        let started = tokio::time::Instant::now();
        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(h.backend.up_calls(), 2);
        assert_eq!(h.supervisor.retry_count().await, 1);
        assert_eq!(h.supervisor.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_retry_succeeds() {
        let h = harness();
        h.host.fail_next_establish(1);

        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        assert_eq!(h.host.establish_calls(), 2);
        assert_eq!(h.host.live_interfaces(), 1);
        assert_eq!(h.supervisor.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_refused_twice() {
        let h = harness();
        h.host.fail_next_establish(2);

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();

        assert_eq!(err, SupervisorError::Interface(InterfaceError::Refused));
        assert_eq!(err.code(), "INTERFACE_ERROR");
        assert_eq!(h.host.live_interfaces(), 0);
        assert_eq!(h.backend.up_calls(), 0);
        assert_eq!(h.supervisor.state().await, SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_retry_exhausted_releases_interface() {
        let h = harness();
        h.backend.stay_down_next(2);

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();

        assert_eq!(err, SupervisorError::Backend(BackendError::NotUp(TunnelState::Down)));
        assert_eq!(h.backend.up_calls(), 2);
        assert_eq!(h.host.live_interfaces(), 0);
        assert_eq!(h.supervisor.state().await, SessionState::Failed);
        assert_eq!(h.supervisor.status().await.state, ReportedState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_retry_exhausted_keep_degraded() {
        let mut settings = Settings::default();
        settings.supervisor.on_retry_exhausted = RetryExhaustedPolicy::KeepDegraded;
        let h = harness_with(settings);
        h.backend.stay_down_next(2);

        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        assert_eq!(h.supervisor.state().await, SessionState::Connected);
        assert_eq!(h.host.live_interfaces(), 1);

        h.supervisor.disconnect().await;
        assert_eq!(h.backend.down_calls(), 0);
        assert_eq!(h.host.live_interfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout() {
        let h = harness();
        h.backend.set_up_delay(Duration::from_secs(10));

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();

        assert_eq!(err, SupervisorError::Timeout(Duration::from_millis(5000)));
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(h.backend.up_calls(), 2);
        assert_eq!(h.host.live_interfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_idempotent() {
        let h = harness();

        h.supervisor.disconnect().await;
        assert_eq!(h.supervisor.state().await, SessionState::Idle);

        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();
        h.supervisor.disconnect().await;
        h.supervisor.disconnect().await;

        assert_eq!(h.supervisor.state().await, SessionState::Idle);
        assert_eq!(h.host.live_interfaces(), 0);
        assert_eq!(h.backend.down_calls(), 1);
        assert!(h.supervisor.shared.backend.current().is_none());
        assert_eq!(h.supervisor.status().await.state, ReportedState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_rejected() {
        let h = harness();
        h.backend.set_up_delay(Duration::from_secs(1));

        let supervisor = h.supervisor.clone();
        let raw = blob();
        let first = tokio::spawn(async move { supervisor.connect(&raw, AppSelection::all()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = h.supervisor.connect(&blob(), AppSelection::all()).await;
        assert_eq!(second, Err(SupervisorError::AlreadyActive));

        first.await.unwrap().unwrap();
        assert_eq!(h.host.establish_calls(), 1);
        assert_eq!(h.supervisor.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_rejected() {
        let h = harness();
        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();

        assert_eq!(err.code(), "ALREADY_ACTIVE");
        assert_eq!(h.host.live_interfaces(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_backoff() {
        let h = harness();
        h.backend.stay_down_next(1);

        let supervisor = h.supervisor.clone();
        let raw = blob();
        let attempt = tokio::spawn(async move { supervisor.connect(&raw, AppSelection::all()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        h.supervisor.disconnect().await;

        assert!(started.elapsed() < Duration::from_millis(2000));
        assert_eq!(attempt.await.unwrap(), Err(SupervisorError::Cancelled));
        assert_eq!(h.backend.up_calls(), 1);
        assert_eq!(h.host.live_interfaces(), 0);
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_waits_for_slow_up_then_tears_down() {
        let h = harness();
        h.backend.set_up_delay(Duration::from_secs(1));

        let supervisor = h.supervisor.clone();
        let raw = blob();
        let attempt = tokio::spawn(async move { supervisor.connect(&raw, AppSelection::all()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.backend.up_calls(), 1);

        let started = tokio::time::Instant::now();
        h.supervisor.disconnect().await;

        // disconnect only returns once the up call has settled
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(attempt.await.unwrap(), Err(SupervisorError::Cancelled));
        assert_eq!(h.backend.down_calls(), 1);
        assert_eq!(h.backend.current_state(), TunnelState::Down);
        assert_eq!(h.host.live_interfaces(), 0);
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_panic_ends_failed() {
        let h = harness();
        h.backend.panic_next(1);

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();

        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(h.supervisor.state().await, SessionState::Failed);
        assert_eq!(h.host.live_interfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_strand_session() {
        let h = harness();
        h.backend.set_up_delay(Duration::from_secs(1));

        let supervisor = h.supervisor.clone();
        let raw = blob();
        let caller = tokio::spawn(async move { supervisor.connect(&raw, AppSelection::all()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.supervisor.state().await, SessionState::Connected);

        h.supervisor.disconnect().await;
        assert_eq!(h.host.live_interfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_failure() {
        let h = harness();
        h.backend.error_next(2);

        let err = h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_ERROR");

        h.supervisor.connect(&blob(), apps(&["com.app.a"])).await.unwrap();
        assert_eq!(h.supervisor.state().await, SessionState::Connected);
        assert_eq!(h.supervisor.selection().await, Some(apps(&["com.app.a"])));
        assert!(h.supervisor.status().await.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_degrades_without_state_change() {
        let h = harness();
        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let health = h.supervisor.status().await.health.unwrap();
        assert!(health.healthy);
        assert_eq!(health.checks, 1);

        h.backend.set_failing_probes(true);
        tokio::time::sleep(Duration::from_secs(30)).await;

        let status = h.supervisor.status().await;
        assert_eq!(status.state, ReportedState::Connected);
        let health = status.health.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_task_stops_on_disconnect() {
        let h = harness();
        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        let probes = h.backend.probe_calls();

        h.supervisor.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.backend.probe_calls(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_pending_health_check() {
        let h = harness();
        h.backend.set_state_delay(Duration::from_secs(2));
        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();

        // first check starts at 3s and would return at 5s
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.backend.probe_calls(), 1);
        assert_eq!(h.backend.state_queries_completed(), 0);

        h.supervisor.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.backend.state_queries_completed(), 0);
        assert_eq!(h.backend.probe_calls(), 1);
        assert_eq!(h.supervisor.state().await, SessionState::Idle);
        assert!(h.supervisor.status().await.health.is_none());
        assert_eq!(h.host.live_interfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_events() {
        let h = harness();
        let mut events = h.supervisor.subscribe();
        assert_eq!(*events.borrow(), SessionState::Idle);

        h.supervisor.connect(&blob(), AppSelection::all()).await.unwrap();
        assert!(events.has_changed().unwrap());
        assert_eq!(*events.borrow_and_update(), SessionState::Connected);

        h.supervisor.disconnect().await;
        assert_eq!(*events.borrow_and_update(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_permission_and_apps() {
        struct Broken;
        impl AppCatalog for Broken {
            fn installed_apps(&self) -> Result<Vec<AppInfo>, CatalogError> {
                Err(CatalogError::Unavailable("denied".into()))
            }
        }

        let host = Arc::new(SimulatedHost::new());
        host.set_permission(false);
        let supervisor = TunnelSupervisor::builder(
            host,
            BackendLifecycle::shared(Arc::new(SimulatedBackend::new())),
        )
        .catalog(Arc::new(Broken))
        .build()
        .unwrap();

        assert!(!supervisor.request_permission().await);
        let apps = supervisor.installed_apps();
        assert!(!apps.is_empty());
        assert!(apps.iter().all(|a| a.package_name != SELF_ID));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.bandwidth.fallback_fraction = 0.0;

        let result = TunnelSupervisor::builder(
            Arc::new(SimulatedHost::new()),
            BackendLifecycle::shared(Arc::new(SimulatedBackend::new())),
        )
        .settings(settings)
        .build();

        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;

        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Connecting));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Idle));
    }

    #[test]
    fn test_caller_error_serialization() {
        let err = CallerError::from(SupervisorError::Cancelled);
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["code"], "CANCELLED");
        assert_eq!(json["message"], "Connect attempt cancelled");
    }
}
