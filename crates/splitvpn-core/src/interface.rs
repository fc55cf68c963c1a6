//! Virtual Interface Provisioning
//!
//! The host OS owns the tun-like interface. This module builds the request
//! the host needs (address, DNS, MTU, routes, per-app allow/deny lists) and
//! hands it to a [`VirtualInterfaceHost`] implementation supplied by the
//! platform adapter.
//!
//! Requests also carry the split domains for the allow list. Hosts that
//! cannot filter by app route those domains instead.

use crate::config::{Cidr, TunnelConfig};
use crate::routing::{AppDomainMap, RoutingDecision};
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raw descriptor of an established interface, handed to the tunnel engine
pub type RawDescriptor = i32;

/// Request to establish the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    session: String,
    addresses: Vec<Cidr>,
    dns_servers: Vec<IpAddr>,
    mtu: u16,
    routes: Vec<Cidr>,
    allowed_apps: Vec<String>,
    disallowed_apps: Vec<String>,
    split_domains: Vec<String>,
}

impl InterfaceRequest {
    /// Start a request for the named session
    pub fn builder(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            addresses: Vec::new(),
            dns_servers: Vec::new(),
            mtu: crate::config::DEFAULT_MTU,
            routes: Vec::new(),
            allowed_apps: Vec::new(),
            disallowed_apps: Vec::new(),
            split_domains: Vec::new(),
        }
    }

    pub fn address(mut self, cidr: Cidr) -> Self {
        self.addresses.push(cidr);
        self
    }

    pub fn dns_server(mut self, ip: IpAddr) -> Self {
        self.dns_servers.push(ip);
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn route(mut self, cidr: Cidr) -> Self {
        self.routes.push(cidr);
        self
    }

    pub fn allowed_app(mut self, id: impl Into<String>) -> Self {
        self.allowed_apps.push(id.into());
        self
    }

    pub fn disallowed_app(mut self, id: impl Into<String>) -> Self {
        self.disallowed_apps.push(id.into());
        self
    }

    pub fn split_domain(mut self, domain: impl Into<String>) -> Self {
        self.split_domains.push(domain.into());
        self
    }

    /// Apply a routing decision
    ///
    /// `AllowAll` adds no app restriction. `AllowList` allows each listed app
    /// and explicitly disallows the manager itself.
    pub fn apply_routing(mut self, decision: &RoutingDecision, self_identifier: &str) -> Self {
        match decision {
            RoutingDecision::AllowAll => {
                debug!("Routing all traffic, no app restrictions");
            }
            RoutingDecision::AllowList(ids) => {
                self.allowed_apps.extend(ids.iter().cloned());
                self = self.disallowed_app(self_identifier);
            }
        }
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn addresses(&self) -> &[Cidr] {
        &self.addresses
    }

    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    pub fn mtu_value(&self) -> u16 {
        self.mtu
    }

    pub fn routes(&self) -> &[Cidr] {
        &self.routes
    }

    pub fn allowed_apps(&self) -> &[String] {
        &self.allowed_apps
    }

    pub fn disallowed_apps(&self) -> &[String] {
        &self.disallowed_apps
    }

    /// Domains to route when the host cannot filter by app
    pub fn split_domains(&self) -> &[String] {
        &self.split_domains
    }

    /// True when no per-app restriction applies
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_apps.is_empty() && self.disallowed_apps.is_empty()
    }
}

/// Live virtual interface owned by the tunnel session
///
/// Implementations must release the OS resource on drop as well, so a handle
/// lost to a panic or an aborted task never leaks.
pub trait InterfaceHandle: Send + Sync + fmt::Debug {
    /// Raw descriptor usable by the tunnel engine
    fn descriptor(&self) -> RawDescriptor;

    /// Release the interface
    fn close(self: Box<Self>) -> Result<(), InterfaceError>;
}

/// Host capability that creates virtual interfaces
#[async_trait]
pub trait VirtualInterfaceHost: Send + Sync {
    /// Ask the user/OS for permission to create VPN interfaces
    async fn request_permission(&self) -> bool {
        true
    }

    /// Establish the interface; `None` if the OS refused
    async fn establish(&self, request: &InterfaceRequest) -> Option<Box<dyn InterfaceHandle>>;
}

/// Builds interface requests from a tunnel config and establishes them
#[derive(Clone)]
pub struct InterfaceProvisioner {
    host: Arc<dyn VirtualInterfaceHost>,
    session_name: String,
    self_identifier: String,
    domains: AppDomainMap,
}

impl InterfaceProvisioner {
    pub fn new(
        host: Arc<dyn VirtualInterfaceHost>,
        session_name: impl Into<String>,
        self_identifier: impl Into<String>,
    ) -> Self {
        Self {
            host,
            session_name: session_name.into(),
            self_identifier: self_identifier.into(),
            domains: AppDomainMap::builtin(),
        }
    }

    /// Replace the app to domain mapping used for split domains
    pub fn with_domain_map(mut self, domains: AppDomainMap) -> Self {
        self.domains = domains;
        self
    }

    /// Build the request for a config and routing decision
    pub fn request_for(&self, config: &TunnelConfig, decision: &RoutingDecision) -> InterfaceRequest {
        let mut request = InterfaceRequest::builder(self.session_name.as_str())
            .address(config.local_address())
            .mtu(config.mtu());

        for ip in config.dns() {
            request = request.dns_server(*ip);
        }
        for cidr in config.allowed_ips() {
            request = request.route(*cidr);
        }

        for domain in self.domains.split_domains(decision) {
            request = request.split_domain(domain);
        }

        request.apply_routing(decision, &self.self_identifier)
    }

    /// Establish the interface
    pub async fn provision(
        &self,
        config: &TunnelConfig,
        decision: &RoutingDecision,
    ) -> Result<Box<dyn InterfaceHandle>, InterfaceError> {
        let request = self.request_for(config, decision);

        match self.host.establish(&request).await {
            Some(handle) => {
                info!(
                    "Interface established (fd {}, {} routes, {} allowed apps, {} split domains)",
                    handle.descriptor(),
                    request.routes().len(),
                    request.allowed_apps().len(),
                    request.split_domains().len()
                );
                Ok(handle)
            }
            None => {
                warn!("Host refused to establish interface '{}'", request.session());
                Err(InterfaceError::Refused)
            }
        }
    }

    pub async fn request_permission(&self) -> bool {
        self.host.request_permission().await
    }
}

/// Interface errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("OS refused to establish the virtual interface")]
    Refused,

    #[error("Failed to release interface: {0}")]
    Release(String),
}
