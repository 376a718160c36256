//! Data plane tunables and the service file format.
//!
//! ```toml
//! [tunables]
//! conn_tab_bits = 16
//! expire_nodest_conn = true
//!
//! [tunables.timeouts]
//! tcp_established = 600
//!
//! [[services]]
//! protocol = "tcp"
//! vaddr = "10.0.0.1:80"
//! forward = "fullnat"
//! local_addrs = ["10.1.0.1"]
//!
//! [[services.destinations]]
//! addr = "10.0.0.11"
//! port = 8080
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use flowgate_packet::IpProto;
use serde::Deserialize;

use crate::directory::{
    DestinationConfig, ForwardMethod, ServiceConfig, ServiceFlags, ServiceKey,
};
use crate::error::{DirectoryError, InitError};
use crate::proto::{Timeouts, MAX_TIMEOUT_SECS};
use crate::sync::SyncThreshold;

/// Default connection table size, as a power of two.
pub const DEFAULT_CONN_TAB_BITS: u32 = 20;

const CONN_TAB_BITS_RANGE: std::ops::RangeInclusive<u32> = 8..=24;

/// Process-wide data plane parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Connection table has `1 << conn_tab_bits` buckets.
    pub conn_tab_bits: u32,
    /// Upper bound on tracked connections.
    pub max_connections: usize,
    /// Expire a connection as soon as a packet finds its destination
    /// unavailable, instead of letting it time out.
    pub expire_nodest_conn: bool,
    /// Service ports whose virtual address also carries unrelated traffic.
    /// Unschedulable packets to other ports of such a service are accepted.
    pub passthrough_ports: Vec<u16>,
    pub sync_threshold: SyncThreshold,
    pub timeouts: Timeouts,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            conn_tab_bits: DEFAULT_CONN_TAB_BITS,
            max_connections: 2_000_000,
            expire_nodest_conn: false,
            passthrough_ports: vec![21],
            sync_threshold: SyncThreshold::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<(), InitError> {
        if !CONN_TAB_BITS_RANGE.contains(&self.conn_tab_bits) {
            return Err(InitError::InvalidTunable {
                name: "conn_tab_bits",
                reason: format!(
                    "{} is outside {}..={}",
                    self.conn_tab_bits,
                    CONN_TAB_BITS_RANGE.start(),
                    CONN_TAB_BITS_RANGE.end()
                ),
            });
        }
        if self.max_connections == 0 {
            return Err(InitError::InvalidTunable {
                name: "max_connections",
                reason: "must be positive".to_string(),
            });
        }
        if self.sync_threshold.period > 0 && self.sync_threshold.start >= self.sync_threshold.period
        {
            return Err(InitError::InvalidTunable {
                name: "sync_threshold",
                reason: format!(
                    "start {} must be below period {}",
                    self.sync_threshold.start, self.sync_threshold.period
                ),
            });
        }
        if let Some((field, secs)) = self
            .timeouts
            .entries()
            .into_iter()
            .find(|(_, secs)| *secs > MAX_TIMEOUT_SECS)
        {
            return Err(InitError::InvalidTunable {
                name: "timeouts",
                reason: format!("{field} = {secs}s exceeds {MAX_TIMEOUT_SECS}s"),
            });
        }
        Ok(())
    }

    pub fn is_passthrough_port(&self, port: u16) -> bool {
        self.passthrough_ports.contains(&port)
    }
}

/// Contents of a service file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceFile {
    pub tunables: Tunables,
    pub services: Vec<ServiceEntry>,
}

impl ServiceFile {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// One `[[services]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Virtual address and port. Mutually exclusive with `fwmark`.
    #[serde(default)]
    pub vaddr: Option<SocketAddrV4>,
    #[serde(default)]
    pub fwmark: Option<u32>,
    /// Service port for fwmark services.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub forward: ForwardMethod,
    #[serde(default)]
    pub one_packet: bool,
    #[serde(default)]
    pub local_addrs: Vec<Ipv4Addr>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_scheduler() -> String {
    "rr".to_string()
}

impl ServiceEntry {
    pub fn to_config(&self) -> Result<ServiceConfig, DirectoryError> {
        let protocol = IpProto::from_str(&self.protocol)
            .map_err(|e| DirectoryError::InvalidService(e.to_string()))?;

        let mut config = match (self.vaddr, self.fwmark) {
            (Some(vaddr), None) => ServiceConfig::new(ServiceKey::Addr {
                protocol,
                addr: *vaddr.ip(),
                port: vaddr.port(),
            }),
            (None, Some(mark)) if mark != 0 => ServiceConfig::fwmark(mark, protocol, self.port),
            (None, Some(_)) => {
                return Err(DirectoryError::InvalidService(
                    "fwmark must be non-zero".to_string(),
                ))
            }
            _ => {
                return Err(DirectoryError::InvalidService(
                    "exactly one of vaddr or fwmark is required".to_string(),
                ))
            }
        };

        config = config
            .with_scheduler(&self.scheduler)
            .with_forward(self.forward)
            .with_local_addrs(self.local_addrs.clone());
        if self.one_packet {
            config = config.with_flags(ServiceFlags::ONE_PACKET);
        }
        config.validate()?;
        Ok(config)
    }
}
