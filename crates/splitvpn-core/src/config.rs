//! Tunnel Configuration
//!
//! Turns the serialized configuration blob handed over by the caller into a
//! validated [`TunnelConfig`].
//!
//! # Wire Format
//!
//! A JSON object. Required: `privateKey`, `publicKey` (peer), `serverEndpoint`
//! (`host:port`). Optional: `address`, `allowedIPs`, `dns`,
//! `persistentKeepalive`, `mtu`. Unknown fields are ignored.
//!
//! ```json
//! {
//!   "privateKey": "<base64>",
//!   "publicKey": "<base64>",
//!   "serverEndpoint": "vpn.example.net:51820",
//!   "allowedIPs": ["0.0.0.0/0", "::/0"],
//!   "dns": ["1.1.1.1", "8.8.8.8"]
//! }
//! ```

use crate::keys::{KeyError, PrivateKey, PublicKey};
use serde_json::{Map, Value};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use zeroize::Zeroizing;

/// Default client address inside the tunnel
pub const DEFAULT_ADDRESS: Cidr = Cidr {
    addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
    prefix: 24,
};

/// Default resolvers pushed to the interface
pub const DEFAULT_DNS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google
];

/// Route everything, IPv4 and IPv6
pub const DEFAULT_ALLOWED_IPS: [Cidr; 2] = [
    Cidr {
        addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        prefix: 0,
    },
    Cidr {
        addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        prefix: 0,
    },
];

/// Default persistent keepalive (seconds)
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

/// Standard WireGuard MTU
pub const DEFAULT_MTU: u16 = 1420;

const MIN_MTU: u16 = 576;
const MAX_MTU: u16 = 9000;

/// Wire names of the required fields, in the order they are checked
pub const REQUIRED_FIELDS: [&str; 3] = ["privateKey", "publicKey", "serverEndpoint"];

/// Network prefix (address + prefix length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Create a prefix, rejecting lengths wider than the address family
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// `0.0.0.0/0` or `::/0`
    pub fn is_default_route(&self) -> bool {
        self.prefix == 0
    }
}

impl FromStr for Cidr {
    type Err = String;

    /// Parse CIDR notation (e.g., "10.0.0.2/24"). A bare address is a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = ip
            .parse()
            .map_err(|_| format!("'{}' is not an IP address", ip))?;

        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| format!("'{}' is not a prefix length", p))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };

        Self::new(addr, prefix).ok_or_else(|| format!("prefix /{} too long for {}", prefix, addr))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Peer endpoint (`host:port`)
///
/// The host is either an IP address or a DNS name; resolution is left to the
/// tunnel engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl FromStr for Endpoint {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s.rsplit_once(':').ok_or(())?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            // Bracketed IPv6 literal
            let inner = inner.strip_suffix(']').ok_or(())?;
            inner.parse::<Ipv6Addr>().map_err(|_| ())?;
            inner
        } else if host.contains(':') {
            return Err(());
        } else if host.parse::<Ipv4Addr>().is_ok() || is_dns_name(host) {
            host
        } else {
            return Err(());
        };

        let port: u16 = port.parse().map_err(|_| ())?;
        if port == 0 {
            return Err(());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn is_dns_name(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    // An all-numeric top label is a malformed IPv4 address, not a name
    let top = host.rsplit('.').next().unwrap_or(host);
    if top.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Validated tunnel configuration (interface + single peer)
///
/// Immutable once built. The private key is wiped when the config is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    private_key: PrivateKey,
    local_address: Cidr,
    peer_public_key: PublicKey,
    peer_endpoint: Endpoint,
    allowed_ips: Vec<Cidr>,
    dns: Vec<IpAddr>,
    persistent_keepalive_secs: u16,
    mtu: u16,
}

impl TunnelConfig {
    /// Create a configuration with the standard defaults for optional fields
    pub fn new(private_key: PrivateKey, peer_public_key: PublicKey, peer_endpoint: Endpoint) -> Self {
        Self {
            private_key,
            local_address: DEFAULT_ADDRESS,
            peer_public_key,
            peer_endpoint,
            allowed_ips: DEFAULT_ALLOWED_IPS.to_vec(),
            dns: DEFAULT_DNS.to_vec(),
            persistent_keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn local_address(&self) -> Cidr {
        self.local_address
    }

    pub fn peer_public_key(&self) -> &PublicKey {
        &self.peer_public_key
    }

    pub fn peer_endpoint(&self) -> &Endpoint {
        &self.peer_endpoint
    }

    pub fn allowed_ips(&self) -> &[Cidr] {
        &self.allowed_ips
    }

    pub fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    pub fn persistent_keepalive_secs(&self) -> u16 {
        self.persistent_keepalive_secs
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Serialize back to the wire blob accepted by [`parse`]
    pub fn to_blob(&self) -> Zeroizing<String> {
        let blob = serde_json::json!({
            "privateKey": self.private_key.to_base64().as_str(),
            "publicKey": self.peer_public_key.to_base64(),
            "serverEndpoint": self.peer_endpoint.to_string(),
            "address": self.local_address.to_string(),
            "allowedIPs": self.allowed_ips.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "dns": self.dns.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "persistentKeepalive": self.persistent_keepalive_secs,
            "mtu": self.mtu,
        });
        Zeroizing::new(blob.to_string())
    }

    /// Render as a wg-quick configuration file
    pub fn to_wg_quick(&self) -> Zeroizing<String> {
        let join = |items: Vec<String>| items.join(", ");

        let mut out = String::with_capacity(384);
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.private_key.to_base64().as_str()));
        out.push_str(&format!("Address = {}\n", self.local_address));
        if !self.dns.is_empty() {
            out.push_str(&format!(
                "DNS = {}\n",
                join(self.dns.iter().map(ToString::to_string).collect())
            ));
        }
        out.push_str(&format!("MTU = {}\n", self.mtu));
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.peer_public_key));
        out.push_str(&format!("Endpoint = {}\n", self.peer_endpoint));
        out.push_str(&format!(
            "AllowedIPs = {}\n",
            join(self.allowed_ips.iter().map(ToString::to_string).collect())
        ));
        if self.persistent_keepalive_secs > 0 {
            out.push_str(&format!("PersistentKeepalive = {}\n", self.persistent_keepalive_secs));
        }
        Zeroizing::new(out)
    }
}

/// Parse a serialized configuration blob
///
/// Pure: no logging, no I/O.
pub fn parse(raw: &str) -> Result<TunnelConfig, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(ParseError::Malformed("expected a JSON object".into()));
    };

    // Check presence of every required field before decoding any of them
    for name in REQUIRED_FIELDS {
        match fields.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Err(ParseError::MissingField(name));
            }
            Some(_) => {
                return Err(ParseError::InvalidField {
                    field: name,
                    reason: "expected a string".into(),
                });
            }
        }
    }

    let private_key = {
        let raw_key = Zeroizing::new(take_string(&mut fields, "privateKey"));
        PrivateKey::from_base64(&raw_key).map_err(|source| ParseError::InvalidKey {
            field: "privateKey",
            source,
        })?
    };

    let peer_public_key = PublicKey::from_base64(&take_string(&mut fields, "publicKey"))
        .map_err(|source| ParseError::InvalidKey {
            field: "publicKey",
            source,
        })?;

    let endpoint_str = take_string(&mut fields, "serverEndpoint");
    let peer_endpoint: Endpoint = endpoint_str
        .parse()
        .map_err(|_| ParseError::InvalidEndpoint(endpoint_str.clone()))?;

    let mut config = TunnelConfig::new(private_key, peer_public_key, peer_endpoint);

    if let Some(address) = optional(&fields, "address") {
        let s = address.as_str().ok_or_else(|| invalid("address", "expected a string"))?;
        config.local_address = s.parse().map_err(|reason| invalid("address", reason))?;
    }

    if let Some(list) = optional(&fields, "allowedIPs") {
        let cidrs = string_list(list, "allowedIPs")?
            .iter()
            .map(|s| s.parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| invalid("allowedIPs", reason))?;
        if cidrs.is_empty() {
            return Err(invalid("allowedIPs", "at least one prefix is required"));
        }
        config.allowed_ips = cidrs;
    }

    if let Some(list) = optional(&fields, "dns") {
        config.dns = string_list(list, "dns")?
            .iter()
            .map(|s| s.parse::<IpAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid("dns", e.to_string()))?;
    }

    if let Some(value) = optional(&fields, "persistentKeepalive") {
        config.persistent_keepalive_secs = integer(value, "persistentKeepalive")?;
    }

    if let Some(value) = optional(&fields, "mtu") {
        let mtu = integer(value, "mtu")?;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(invalid("mtu", format!("must be between {} and {}", MIN_MTU, MAX_MTU)));
        }
        config.mtu = mtu;
    }

    Ok(config)
}

fn take_string(fields: &mut Map<String, Value>, name: &str) -> String {
    match fields.remove(name) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn optional<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields.get(name).filter(|v| !v.is_null())
}

/// Accepts a JSON array of strings or a single comma-separated string
fn string_list(value: &Value, field: &'static str) -> Result<Vec<String>, ParseError> {
    match value {
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| invalid(field, "expected a list of strings"))
            })
            .collect(),
        _ => Err(invalid(field, "expected a list of strings")),
    }
}

/// Accepts a JSON number or a numeric string
fn integer(value: &Value, field: &'static str) -> Result<u16, ParseError> {
    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    n.and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| invalid(field, "expected an integer between 0 and 65535"))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidField {
        field,
        reason: reason.into(),
    }
}

/// Configuration parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed configuration: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid key in {field}: {source}")]
    InvalidKey {
        field: &'static str,
        source: KeyError,
    },

    #[error("Invalid endpoint '{0}' (expected host:port)")]
    InvalidEndpoint(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
