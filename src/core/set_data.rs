//! Semantic set members
//!
//! [`SetData`] is what callers think in: an address, an address range, a
//! CIDR prefix, a port or a port range. The interval module turns these into
//! kernel elements and back.
//!
//! Parsing accepts the same textual forms the list files use:
//!
//! - `"192.0.2.1"`, `"2001:db8::1"`
//! - `"10.0.0.0/8"` (host bits are cleared)
//! - `"10.0.0.1-10.0.0.3"`
//! - `"80"`, `"9000-9005"`

use crate::core::error::{Error, Result};
use crate::core::expr::AddrFamily;
use crate::core::objects::Counter;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetData {
    Address(IpAddr),
    /// Inclusive on both ends
    AddressRange { start: IpAddr, end: IpAddr },
    Prefix(IpNetwork),
    Port(u16),
    /// Inclusive on both ends
    PortRange { start: u16, end: u16 },
}

/// Set data as read back from the kernel, with the interval's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountedSetData {
    pub data: SetData,
    pub counter: Option<Counter>,
}

fn parse_ip(field: &str, s: &str) -> Result<IpAddr> {
    s.trim()
        .parse::<IpAddr>()
        .map_err(|e| Error::validation(field, format!("'{s}': {e}")))
}

fn parse_port_number(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|e| Error::validation("port", format!("'{s}': {e}")))
}

/// Prefix with host bits cleared, so equal networks compare equal
fn normalize_prefix(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

impl SetData {
    /// Parses a single address, `a-b` range or CIDR prefix
    pub fn parse_address(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('/') {
            let net = s
                .parse::<IpNetwork>()
                .map_err(|e| Error::validation("prefix", format!("'{s}': {e}")))?;
            return Ok(SetData::Prefix(normalize_prefix(net)));
        }
        if let Some((start, end)) = s.split_once('-') {
            return Ok(SetData::AddressRange {
                start: parse_ip("address range", start)?,
                end: parse_ip("address range", end)?,
            });
        }
        Ok(SetData::Address(parse_ip("address", s)?))
    }

    /// Parses a single port or `a-b` port range
    pub fn parse_port(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            return Ok(SetData::PortRange {
                start: parse_port_number(start)?,
                end: parse_port_number(end)?,
            });
        }
        Ok(SetData::Port(parse_port_number(s)?))
    }

    pub fn is_port(&self) -> bool {
        matches!(self, SetData::Port(_) | SetData::PortRange { .. })
    }

    /// Address family of address data, `None` for ports.
    ///
    /// A range whose ends disagree reports the family of its start; such a
    /// range fails [`SetData::validate`].
    pub fn family(&self) -> Option<AddrFamily> {
        match self {
            SetData::Address(ip) | SetData::AddressRange { start: ip, .. } => {
                Some(AddrFamily::of(ip))
            }
            SetData::Prefix(net) => Some(AddrFamily::of(&net.ip())),
            SetData::Port(_) | SetData::PortRange { .. } => None,
        }
    }

    /// Checks the value constraints that don't depend on the target set
    pub fn validate(&self) -> Result<()> {
        match self {
            SetData::Address(ip) => validate_address("address", ip),
            SetData::AddressRange { start, end } => {
                validate_address("address range", start)?;
                validate_address("address range", end)?;
                match (start, end) {
                    (IpAddr::V4(s), IpAddr::V4(e)) if s <= e => Ok(()),
                    (IpAddr::V6(s), IpAddr::V6(e)) if s <= e => Ok(()),
                    (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => Err(
                        Error::validation("address range", format!("{self}: start is after end")),
                    ),
                    _ => Err(Error::validation(
                        "address range",
                        format!("{self}: mixed address families"),
                    )),
                }
            }
            SetData::Prefix(net) => validate_address("prefix", &net.ip()),
            SetData::Port(port) => validate_port(*port),
            SetData::PortRange { start, end } => {
                validate_port(*start)?;
                validate_port(*end)?;
                if start > end {
                    return Err(Error::validation(
                        "port range",
                        format!("{self}: start is after end"),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_address(field: &str, ip: &IpAddr) -> Result<()> {
    if ip.is_unspecified() {
        Err(Error::validation(field, format!("{ip} is the unspecified address")))
    } else {
        Ok(())
    }
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        Err(Error::validation("port", "Port must be between 1 and 65535"))
    } else {
        Ok(())
    }
}

impl fmt::Display for SetData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetData::Address(ip) => write!(f, "{ip}"),
            SetData::AddressRange { start, end } => write!(f, "{start}-{end}"),
            SetData::Prefix(net) => write!(f, "{net}"),
            SetData::Port(port) => write!(f, "{port}"),
            SetData::PortRange { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl From<IpAddr> for SetData {
    fn from(ip: IpAddr) -> Self {
        SetData::Address(ip)
    }
}

impl From<IpNetwork> for SetData {
    fn from(net: IpNetwork) -> Self {
        SetData::Prefix(normalize_prefix(net))
    }
}

impl From<SetData> for CountedSetData {
    fn from(data: SetData) -> Self {
        CountedSetData {
            data,
            counter: None,
        }
    }
}

/// Parses a list of address strings; stops at the first invalid entry
pub fn address_strings_to_set_data<S: AsRef<str>>(strings: &[S]) -> Result<Vec<SetData>> {
    strings
        .iter()
        .map(|s| SetData::parse_address(s.as_ref()))
        .collect()
}

/// Parses a list of port strings; stops at the first invalid entry
pub fn port_strings_to_set_data<S: AsRef<str>>(strings: &[S]) -> Result<Vec<SetData>> {
    strings
        .iter()
        .map(|s| SetData::parse_port(s.as_ref()))
        .collect()
}

pub fn ips_to_set_data(ips: &[IpAddr]) -> Vec<SetData> {
    ips.iter().copied().map(SetData::from).collect()
}

pub fn networks_to_set_data(nets: &[IpNetwork]) -> Vec<SetData> {
    nets.iter().copied().map(SetData::from).collect()
}
