//! splitvpn - Per-App VPN Tunnel Lifecycle Manager
//!
//! Turns a serialized WireGuard configuration and a list of selected apps
//! into a live virtual interface with per-app routing, supervises it, and
//! tears it down cleanly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Controlling App                          │
//! │        connect / disconnect / status / requestPermission      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TunnelSupervisor                          │
//! │                                                               │
//! │  ┌────────────┐   ┌───────────────┐   ┌────────────────────┐  │
//! │  │  config::  │──▶│  routing::    │──▶│ InterfaceProvisioner│ │
//! │  │  parse     │   │  derive       │   │  (allow/deny apps) │  │
//! │  └────────────┘   └───────────────┘   └─────────┬──────────┘  │
//! │                                                 │ fd          │
//! │  ┌────────────┐   ┌───────────────┐   ┌─────────▼──────────┐  │
//! │  │  Status    │◀──│ Health loop   │◀──│  CryptoBackend     │  │
//! │  │  Reporter  │   │               │   │  (set_state Up)    │  │
//! │  └────────────┘   └───────────────┘   └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                        │
//!          ▼                                        ▼ UDP
//!   TrafficCounters                          WireGuard Peer
//! ```
//!
//! # Host Boundary
//!
//! The OS interface primitive and the tunnel engine are supplied by the
//! platform adapter through [`VirtualInterfaceHost`] and [`CryptoBackend`].
//! The [`sim`] module provides in-memory versions of both.
//!
//! # Security
//!
//! - Private keys are never logged or printed by `Debug`
//! - Transient secret strings are zeroized on drop
//! - The manager app itself is never routed through its own tunnel

mod backend;
mod catalog;
mod config;
mod health;
mod interface;
mod keys;
mod routing;
mod settings;
mod status;
mod supervisor;

pub mod sim;

pub use backend::{BackendError, BackendFactory, BackendLifecycle, CryptoBackend, TunnelRequest, TunnelState};
pub use catalog::{selectable_apps, AppCatalog, AppInfo, CatalogError, StaticCatalog};
pub use config::{
    parse, Cidr, Endpoint, ParseError, TunnelConfig, DEFAULT_ADDRESS, DEFAULT_ALLOWED_IPS,
    DEFAULT_DNS, DEFAULT_KEEPALIVE_SECS, DEFAULT_MTU,
};
pub use health::{HealthSnapshot, HealthTracker};
pub use interface::{
    InterfaceError, InterfaceHandle, InterfaceProvisioner, InterfaceRequest, RawDescriptor,
    VirtualInterfaceHost,
};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use routing::{derive as derive_routing, AppDomainMap, AppSelection, RoutingDecision};
pub use settings::{BandwidthPolicy, RetryExhaustedPolicy, Settings, SettingsError, SupervisorSettings};
pub use status::{
    BandwidthSample, CounterSource, RawCounters, ReportedState, Status, StatusReporter,
    SysinfoCounters, TrafficCounters, PROTOCOL, UNSUPPORTED,
};
pub use supervisor::{CallerError, SessionState, SupervisorBuilder, SupervisorError, TunnelSupervisor};
