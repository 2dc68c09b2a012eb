//! Declarative route and service configuration.
//!
//! These types are shared between the config document, the control API and
//! the runtime: a [`ServiceConfig`] names an ordered list of [`RouteConfig`]s,
//! each binding one public ingress to a machine inside the tailnet.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Tcp,
    Udp,
    Http,
    Https,
}

impl RouteType {
    pub const fn is_http(self) -> bool {
        matches!(self, RouteType::Http | RouteType::Https)
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteType::Tcp => "tcp",
            RouteType::Udp => "udp",
            RouteType::Http => "http",
            RouteType::Https => "https",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RouteType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(RouteType::Tcp),
            "udp" => Ok(RouteType::Udp),
            "http" => Ok(RouteType::Http),
            "https" => Ok(RouteType::Https),
            other => Err(RouterError::unsupported(format!(
                "no handler for type `{}` (expected one of: tcp, udp, http, https)",
                other
            ))),
        }
    }
}

/// Forwarding target inside the tailnet.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default, rename = "node", skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub strip_path: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHeaders {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Upstream request deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preserve_host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_headers: Option<ProxyHeaders>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ProxyRule>,
}

fn default_timeout() -> u64 {
    30
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            timeout_seconds: default_timeout(),
            preserve_host: false,
            custom_headers: None,
            rules: Vec::new(),
        }
    }
}

/// One ingress -> target mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(rename = "type")]
    pub kind: RouteType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub private: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bot_protect: bool,
    /// Public virtual host, required for http/https routes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Public ingress port, required for tcp/udp routes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    pub machine: Machine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_settings: Option<ProxySettings>,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl RouteConfig {
    /// Human-readable ingress identity, used in logs and metric labels.
    pub fn entrypoint(&self) -> String {
        if self.kind.is_http() {
            self.domain.clone()
        } else {
            self.port.to_string()
        }
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.machine.address.is_empty() {
            return Err(RouterError::bad_request("missing `machine.address`"));
        }
        validate_hostname(&self.machine.address)
            .map_err(|e| RouterError::bad_request(format!("invalid `machine.address`: {}", e)))?;
        if self.machine.port == 0 {
            return Err(RouterError::bad_request("missing `machine.port`"));
        }
        match self.kind {
            RouteType::Http | RouteType::Https => {
                if self.domain.is_empty() {
                    return Err(RouterError::bad_request("missing `domain`"));
                }
                validate_domain(&self.domain)
                    .map_err(|e| RouterError::bad_request(format!("invalid `domain`: {}", e)))?;
            }
            RouteType::Tcp | RouteType::Udp => {
                if self.port == 0 {
                    return Err(RouterError::bad_request("missing `port`"));
                }
            }
        }
        Ok(())
    }
}

/// A named group of routes, enabled or disabled as a unit.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.name.trim().is_empty() {
            return Err(RouterError::bad_request("service name must not be empty"));
        }
        for route in &self.routes {
            route.validate().map_err(|e| {
                RouterError::bad_request(format!("invalid config for service `{}`: {}", self.name, e.message()))
            })?;
        }
        Ok(())
    }
}

/// Equality key used by the diff engine.
///
/// Deliberately narrower than the full struct: mutable http knobs (timeout,
/// headers, rules) update in place without tearing down the route.
pub fn route_match(a: &RouteConfig, b: &RouteConfig) -> bool {
    if a.kind != b.kind {
        return false;
    }
    if a.machine.address != b.machine.address || a.machine.port != b.machine.port {
        return false;
    }
    match a.kind {
        RouteType::Http | RouteType::Https => a.domain == b.domain,
        RouteType::Tcp | RouteType::Udp => a.port == b.port,
    }
}

/// Canonical url-safe form of a service name: lowercase alphanumerics with
/// runs of anything else collapsed to single hyphens.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

const MAX_LABEL_LEN: usize = 63;

fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("empty label".to_string());
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!("label `{}` exceeds {} characters", label, MAX_LABEL_LEN));
    }
    let bytes = label.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(format!("label `{}` must not start or end with a hyphen", label));
    }
    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(format!("label `{}` contains invalid characters", label));
    }
    Ok(())
}

/// A hostname: dot-separated labels, or a literal IP address.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.len() > 255 {
        return Err("hostname must not exceed 255 characters".to_string());
    }
    if hostname.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    for label in hostname.split('.') {
        validate_label(label)?;
    }
    Ok(())
}

/// A public domain: like a hostname but requiring an alphabetic top-level
/// label. `localhost` is allowed for local setups.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.len() > 253 {
        return Err("domain must not exceed 253 characters".to_string());
    }
    if domain == "localhost" {
        return Ok(());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(format!("`{}` is not a fully qualified domain", domain));
    }
    for label in &labels {
        validate_label(label)?;
    }
    let tld = labels[labels.len() - 1];
    if tld.len() < 2 || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("`{}` has an invalid top-level label", domain));
    }
    Ok(())
}
