//! Crypto Backend Seam
//!
//! The WireGuard engine (handshake, packet crypto) lives outside this crate.
//! The supervisor drives it through [`CryptoBackend`] with a declarative
//! up/down request and reads back the resulting state.

use crate::config::TunnelConfig;
use crate::interface::RawDescriptor;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Tunnel state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Up,
    Down,
}

impl TunnelState {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelState::Up)
    }
}

/// Request passed to [`CryptoBackend::set_state`]
#[derive(Debug, Clone, Copy)]
pub struct TunnelRequest<'a> {
    /// Tunnel name (the session name)
    pub name: &'a str,
    /// Interface descriptor; `None` when bringing the tunnel down
    pub descriptor: Option<RawDescriptor>,
    /// Desired state
    pub desired: TunnelState,
    /// Configuration; `None` when bringing the tunnel down
    pub config: Option<&'a TunnelConfig>,
}

impl<'a> TunnelRequest<'a> {
    pub fn up(name: &'a str, descriptor: RawDescriptor, config: &'a TunnelConfig) -> Self {
        Self {
            name,
            descriptor: Some(descriptor),
            desired: TunnelState::Up,
            config: Some(config),
        }
    }

    pub fn down(name: &'a str) -> Self {
        Self {
            name,
            descriptor: None,
            desired: TunnelState::Down,
            config: None,
        }
    }
}

/// External tunnel engine
#[async_trait]
pub trait CryptoBackend: Send + Sync {
    /// Drive the tunnel towards `request.desired`, returning the resulting state
    async fn set_state(&self, request: TunnelRequest<'_>) -> Result<TunnelState, BackendError>;

    /// Current state of the named tunnel
    async fn state(&self, name: &str) -> Result<TunnelState, BackendError>;
}

/// Factory used to create the backend on first use
pub type BackendFactory = Box<dyn Fn() -> Result<Arc<dyn CryptoBackend>, BackendError> + Send + Sync>;

/// Process-wide backend instance with an explicit lifecycle
///
/// Created on first use by a connect attempt, torn down on disconnect.
pub struct BackendLifecycle {
    factory: BackendFactory,
    instance: Mutex<Option<Arc<dyn CryptoBackend>>>,
}

impl BackendLifecycle {
    pub fn new(factory: BackendFactory) -> Self {
        Self {
            factory,
            instance: Mutex::new(None),
        }
    }

    /// Lifecycle around an already-built backend
    pub fn shared(backend: Arc<dyn CryptoBackend>) -> Self {
        Self::new(Box::new(move || Ok(backend.clone())))
    }

    /// Get the live instance, creating it if needed
    pub fn get_or_init(&self) -> Result<Arc<dyn CryptoBackend>, BackendError> {
        let mut instance = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(backend) = instance.as_ref() {
            return Ok(backend.clone());
        }

        debug!("Initializing crypto backend");
        let backend = (self.factory)()?;
        *instance = Some(backend.clone());
        Ok(backend)
    }

    /// Live instance, if any
    pub fn current(&self) -> Option<Arc<dyn CryptoBackend>> {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the live instance. Returns whether one existed.
    pub fn teardown(&self) -> bool {
        let released = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if released {
            debug!("Crypto backend released");
        }
        released
    }
}

/// Backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend initialization failed: {0}")]
    Init(String),

    #[error("Tunnel did not come up (state: {0:?})")]
    NotUp(TunnelState),

    #[error("Backend call failed: {0}")]
    Call(String),
}
