//! Operator configuration for the DHCP service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::options::DhcpOption;
use crate::{DhcpError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    /// Master switch for the whole service.
    #[serde(default)]
    pub enabled: bool,

    /// TLD the DNS subsystem appends to lease hostnames; carried through,
    /// not interpreted here.
    #[serde(default)]
    pub local_domain: String,

    /// Persistent lease database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Deadline for the address availability probe, in milliseconds.
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_ms: u64,

    /// Served interfaces, keyed by interface name.
    #[serde(default)]
    pub interfaces: HashMap<String, InterfaceConfig>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub v4: V4InterfaceConfig,
    #[serde(default)]
    pub v6: V6InterfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4InterfaceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub mask: String,
    #[serde(default)]
    pub range_start: String,
    #[serde(default)]
    pub range_end: String,
    /// Seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: u64,
    #[serde(default)]
    pub options: Vec<OptionConfig>,
}

impl Default for V4InterfaceConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// DHCPv6 interface settings. Leasing for this family is handled by the v6
/// subsystem; the fields only ride along in the config document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct V6InterfaceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub range_start: String,
}

/// One operator-supplied DHCP option. At most one value form is set; an
/// entry with none of them suppresses the code in responses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptionConfig {
    pub code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

impl OptionConfig {
    /// Resolves the configured value to option bytes; empty means "suppress
    /// from responses".
    pub fn to_option(&self) -> Result<DhcpOption> {
        let data = if let Some(ip) = &self.ip {
            let addr: std::net::Ipv4Addr = ip.parse().map_err(|_| {
                DhcpError::Config(format!("option {}: invalid address {ip:?}", self.code))
            })?;
            addr.octets().to_vec()
        } else if let Some(text) = &self.text {
            text.as_bytes().to_vec()
        } else if let Some(hex) = &self.hex {
            decode_hex(hex).ok_or_else(|| {
                DhcpError::Config(format!("option {}: invalid hex {hex:?}", self.code))
            })?
        } else {
            Vec::new()
        };
        Ok(DhcpOption::new(self.code, data))
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn default_db_path() -> String {
    "/var/lib/homestead/dhcp-leases.json".to_string()
}

fn default_icmp_timeout() -> u64 {
    1000
}

fn default_lease_ttl() -> u64 {
    86_400
}
