//! Port-mapping rule data structures
//!
//! A [`PortMappingRule`] is one row of the user's rule list: a label, a port,
//! a transport protocol and a desired-state flag. Rows are allowed to be
//! incomplete while the user is editing them; an incomplete row has no
//! [`MappingKey`] and is left out of saving and reconciliation.
//!
//! # Example
//!
//! ```
//! use upnp_manager::core::mapping::{PortMappingRule, Protocol};
//!
//! let rule = PortMappingRule::new("web", 8080, Protocol::Tcp, true);
//! let key = rule.mapping_key().expect("well-formed");
//! assert_eq!(key.to_string(), "8080/TCP");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of rules accepted from a rule file
///
/// Limit prevents memory exhaustion from malformed files.
pub const MAX_RULES: usize = 1000;

/// Transport protocol of a port mapping
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "TCP")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "UDP")]
    Udp,
}

impl Protocol {
    /// Returns the protocol name as written in rule files and status text
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Which gateway operation a request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum MappingAction {
    #[strum(serialize = "create")]
    Create,
    #[strum(serialize = "delete")]
    Delete,
}

/// Identity of a mapping on the gateway.
///
/// External and internal port are always identical, so the pair
/// `(port, protocol)` names a mapping completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl MappingKey {
    pub const fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

/// One row of the rule list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortMappingRule {
    /// User-facing label, sent to the gateway as the mapping description
    pub name: String,
    /// Port number; `None` when the row has no valid port yet
    pub port: Option<u16>,
    /// Transport protocol; `None` when the row has none selected yet
    pub protocol: Option<Protocol>,
    /// Desired state: mapping should exist when true, be absent when false
    pub active: bool,
}

impl PortMappingRule {
    /// Creates a complete rule. A port of 0 is stored as missing.
    pub fn new(name: impl Into<String>, port: u16, protocol: Protocol, active: bool) -> Self {
        Self {
            name: name.into(),
            port: (port != 0).then_some(port),
            protocol: Some(protocol),
            active,
        }
    }

    /// Returns the gateway identity of this rule, or `None` for incomplete rows.
    pub fn mapping_key(&self) -> Option<MappingKey> {
        match (self.port, self.protocol) {
            (Some(port), Some(protocol)) if port != 0 => Some(MappingKey::new(port, protocol)),
            _ => None,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.mapping_key().is_some()
    }
}

impl fmt::Display for PortMappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.active { "active" } else { "inactive" };
        match self.mapping_key() {
            Some(key) => write!(f, "{key} \"{}\" ({state})", self.name),
            None => write!(f, "<incomplete> \"{}\" ({state})", self.name),
        }
    }
}
