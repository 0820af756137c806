//! Kernel object descriptors
//!
//! Plain data describing the nftables objects this crate manipulates: tables,
//! chains, sets, set elements and rules. None of these types talk to the
//! kernel themselves; a [`Conn`](crate::core::conn::Conn) takes them as
//! arguments and returns them from listings.

use crate::core::expr::Expr;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address family of an nftables table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum TableFamily {
    /// Dual-stack table, matches both IPv4 and IPv6 traffic
    #[default]
    #[strum(serialize = "inet")]
    Inet,
    #[strum(serialize = "ip")]
    Ip,
    #[strum(serialize = "ip6")]
    Ip6,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Table {
    pub family: TableFamily,
    pub name: String,
}

impl Table {
    pub fn new(family: TableFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }

    /// Shorthand for the common dual-stack table
    pub fn inet(name: impl Into<String>) -> Self {
        Self::new(TableFamily::Inet, name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// Netfilter hook a base chain is attached to
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
pub enum ChainHook {
    #[strum(serialize = "prerouting")]
    Prerouting,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "postrouting")]
    Postrouting,
}

/// Base chain attachment; regular chains have none
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainBase {
    pub hook: ChainHook,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chain {
    pub table: Table,
    pub name: String,
    pub base: Option<ChainBase>,
}

impl Chain {
    /// A regular (jump target) chain
    pub fn new(table: Table, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
            base: None,
        }
    }

    /// A filter base chain at the default filter priority
    pub fn filter(table: Table, name: impl Into<String>, hook: ChainHook) -> Self {
        Self {
            table,
            name: name.into(),
            base: Some(ChainBase { hook, priority: 0 }),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table.name, self.name)
    }
}

/// Key type of a kernel set.
///
/// Only the address and service types can be interval-managed; the others
/// exist so that foreign sets can be described and rejected explicitly.
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
pub enum SetKeyType {
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
    #[strum(serialize = "ipv6_addr")]
    Ipv6Addr,
    /// Transport layer port
    #[strum(serialize = "inet_service")]
    InetService,
    #[strum(serialize = "ether_addr")]
    EtherAddr,
    #[strum(serialize = "mark")]
    Mark,
    #[strum(serialize = "ifname")]
    IfName,
}

impl SetKeyType {
    /// Width of a key in bytes
    pub const fn key_len(self) -> usize {
        match self {
            SetKeyType::Ipv4Addr | SetKeyType::Mark => 4,
            SetKeyType::Ipv6Addr | SetKeyType::IfName => 16,
            SetKeyType::InetService => 2,
            SetKeyType::EtherAddr => 6,
        }
    }

    /// Whether sets of this type can be managed as interval sets
    pub const fn is_supported(self) -> bool {
        matches!(
            self,
            SetKeyType::Ipv4Addr | SetKeyType::Ipv6Addr | SetKeyType::InetService
        )
    }

    pub const fn is_address(self) -> bool {
        matches!(self, SetKeyType::Ipv4Addr | SetKeyType::Ipv6Addr)
    }
}

/// Identity and flags of a kernel set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetSpec {
    pub table: Table,
    pub name: String,
    pub key_type: SetKeyType,
    pub interval: bool,
    pub counter: bool,
}

impl SetSpec {
    /// An interval set with per-element counters
    pub fn interval(table: Table, name: impl Into<String>, key_type: SetKeyType) -> Self {
        Self {
            table,
            name: name.into(),
            key_type,
            interval: true,
            counter: true,
        }
    }
}

impl fmt::Display for SetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table.name, self.name)
    }
}

/// Byte and packet counts observed by the kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
    pub bytes: u64,
    pub packets: u64,
}

/// A single element of a kernel set.
///
/// Interval sets store each interval as two elements: the start key, and the
/// first key past the interval flagged with `interval_end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetElement {
    pub key: Vec<u8>,
    pub interval_end: bool,
    pub counter: Option<Counter>,
}

impl SetElement {
    pub fn start(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: false,
            counter: None,
        }
    }

    pub fn end(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: true,
            counter: None,
        }
    }
}

/// A rule as stored in (or queued for) the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    /// Kernel-assigned handle; `None` until the rule has been committed and listed
    pub handle: Option<u64>,
    pub exprs: Vec<Expr>,
    /// Free-form annotation, used to carry the caller's rule identity
    pub user_data: Vec<u8>,
}
