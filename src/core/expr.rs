//! Rule expression vocabulary
//!
//! A rule is an ordered list of [`Expr`] evaluated left to right by the
//! kernel, short-circuiting on the first comparison that fails. Loads
//! ([`Expr::Meta`], [`Expr::Payload`], [`Expr::Ct`]) place a value in the
//! working register, [`Expr::Bitwise`] masks it, and [`Expr::Cmp`] or
//! [`Expr::Lookup`] test it.
//!
//! The `compare_*` helpers return the load/test pairs the rule builder
//! composes into complete rules.

use crate::core::error::BuildError;
use crate::core::objects::{Counter, SetKeyType, SetSpec};
use std::net::IpAddr;

/// Transport header offset of the source port
pub const SRC_PORT_OFFSET: u32 = 0;
/// Transport header offset of the destination port
pub const DST_PORT_OFFSET: u32 = 2;
pub const PORT_LEN: u32 = 2;

pub const IPV4_SRC_OFFSET: u32 = 12;
pub const IPV4_DST_OFFSET: u32 = 16;
pub const IPV4_ADDR_LEN: u32 = 4;

pub const IPV6_SRC_OFFSET: u32 = 8;
pub const IPV6_DST_OFFSET: u32 = 24;
pub const IPV6_ADDR_LEN: u32 = 16;

/// Packet metadata keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum MetaKey {
    /// Netfilter protocol family (ipv4 / ipv6)
    #[strum(serialize = "nfproto")]
    Nfproto,
    /// Layer 4 protocol number
    #[strum(serialize = "l4proto")]
    L4proto,
    #[strum(serialize = "iifname")]
    Iifname,
    #[strum(serialize = "oifname")]
    Oifname,
}

/// Header a payload load is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadBase {
    Network,
    Transport,
}

/// Connection tracking keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtKey {
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Neq,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString,
)]
pub enum Verdict {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// Netfilter protocol family, as compared against `meta nfproto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum AddrFamily {
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl AddrFamily {
    /// `NFPROTO_*` value
    pub const fn nfproto(self) -> u8 {
        match self {
            AddrFamily::Ipv4 => 2,
            AddrFamily::Ipv6 => 10,
        }
    }

    pub const fn from_nfproto(value: u8) -> Option<Self> {
        match value {
            2 => Some(AddrFamily::Ipv4),
            10 => Some(AddrFamily::Ipv6),
            _ => None,
        }
    }

    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddrFamily::Ipv4,
            IpAddr::V6(_) => AddrFamily::Ipv6,
        }
    }

    /// Family of an address-keyed set, `None` for other key types
    pub const fn of_key_type(key_type: SetKeyType) -> Option<Self> {
        match key_type {
            SetKeyType::Ipv4Addr => Some(AddrFamily::Ipv4),
            SetKeyType::Ipv6Addr => Some(AddrFamily::Ipv6),
            _ => None,
        }
    }
}

/// Transport protocol, as compared against `meta l4proto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum TransportProto {
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "ipv6-icmp")]
    Icmpv6,
}

impl TransportProto {
    /// `IPPROTO_*` value
    pub const fn number(self) -> u8 {
        match self {
            TransportProto::Icmp => 1,
            TransportProto::Tcp => 6,
            TransportProto::Udp => 17,
            TransportProto::Icmpv6 => 58,
        }
    }

    pub const fn from_number(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransportProto::Icmp),
            6 => Some(TransportProto::Tcp),
            17 => Some(TransportProto::Udp),
            58 => Some(TransportProto::Icmpv6),
            _ => None,
        }
    }
}

/// Connection tracking state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtState(pub u32);

impl CtState {
    pub const INVALID: CtState = CtState(1);
    pub const ESTABLISHED: CtState = CtState(2);
    pub const RELATED: CtState = CtState(4);
    pub const NEW: CtState = CtState(8);
    pub const UNTRACKED: CtState = CtState(64);

    const NAMES: [(CtState, &'static str); 5] = [
        (CtState::INVALID, "invalid"),
        (CtState::ESTABLISHED, "established"),
        (CtState::RELATED, "related"),
        (CtState::NEW, "new"),
        (CtState::UNTRACKED, "untracked"),
    ];

    pub const fn contains(self, other: CtState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the set bits, in kernel bit order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(state, _)| self.contains(*state))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(state, _)| *state)
    }
}

impl std::ops::BitOr for CtState {
    type Output = CtState;

    fn bitor(self, rhs: Self) -> Self::Output {
        CtState(self.0 | rhs.0)
    }
}

/// One kernel expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Meta { key: MetaKey },
    /// Load `len` bytes at `offset` from the given header
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    Ct { key: CtKey },
    Bitwise { mask: Vec<u8> },
    Cmp { op: CmpOp, data: Vec<u8> },
    Lookup { set: String },
    Counter(Counter),
    Verdict(Verdict),
}

pub fn meta(key: MetaKey) -> Expr {
    Expr::Meta { key }
}

pub fn equals(data: Vec<u8>) -> Expr {
    Expr::Cmp {
        op: CmpOp::Eq,
        data,
    }
}

pub fn counter() -> Expr {
    Expr::Counter(Counter::default())
}

pub fn accept() -> Expr {
    Expr::Verdict(Verdict::Accept)
}

pub fn drop() -> Expr {
    Expr::Verdict(Verdict::Drop)
}

fn source_address_payload(family: AddrFamily) -> Expr {
    match family {
        AddrFamily::Ipv4 => Expr::Payload {
            base: PayloadBase::Network,
            offset: IPV4_SRC_OFFSET,
            len: IPV4_ADDR_LEN,
        },
        AddrFamily::Ipv6 => Expr::Payload {
            base: PayloadBase::Network,
            offset: IPV6_SRC_OFFSET,
            len: IPV6_ADDR_LEN,
        },
    }
}

fn destination_address_payload(family: AddrFamily) -> Expr {
    match family {
        AddrFamily::Ipv4 => Expr::Payload {
            base: PayloadBase::Network,
            offset: IPV4_DST_OFFSET,
            len: IPV4_ADDR_LEN,
        },
        AddrFamily::Ipv6 => Expr::Payload {
            base: PayloadBase::Network,
            offset: IPV6_DST_OFFSET,
            len: IPV6_ADDR_LEN,
        },
    }
}

fn port_payload(offset: u32) -> Expr {
    Expr::Payload {
        base: PayloadBase::Transport,
        offset,
        len: PORT_LEN,
    }
}

fn address_bytes(ip: &IpAddr) -> Result<Vec<u8>, BuildError> {
    if ip.is_unspecified() {
        return Err(BuildError::InvalidMatch(format!(
            "unspecified address {ip} can't be matched"
        )));
    }
    Ok(match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    })
}

fn port_bytes(port: u16) -> Result<Vec<u8>, BuildError> {
    if port == 0 {
        return Err(BuildError::InvalidMatch(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(port.to_be_bytes().to_vec())
}

fn address_set_family(set: &SetSpec) -> Result<AddrFamily, BuildError> {
    AddrFamily::of_key_type(set.key_type).ok_or_else(|| {
        BuildError::InvalidMatch(format!(
            "set {} has key type {}, not an address type",
            set.name, set.key_type
        ))
    })
}

fn check_port_set(set: &SetSpec) -> Result<(), BuildError> {
    if set.key_type == SetKeyType::InetService {
        Ok(())
    } else {
        Err(BuildError::InvalidMatch(format!(
            "set {} has key type {}, not a port type",
            set.name, set.key_type
        )))
    }
}

/// `meta nfproto == family`
pub fn compare_protocol_family(family: AddrFamily) -> Vec<Expr> {
    vec![meta(MetaKey::Nfproto), equals(vec![family.nfproto()])]
}

/// `meta l4proto == proto`
pub fn compare_transport_protocol(proto: TransportProto) -> Vec<Expr> {
    vec![meta(MetaKey::L4proto), equals(vec![proto.number()])]
}

pub fn compare_source_address(ip: &IpAddr) -> Result<Vec<Expr>, BuildError> {
    let data = address_bytes(ip)?;
    Ok(vec![source_address_payload(AddrFamily::of(ip)), equals(data)])
}

pub fn compare_destination_address(ip: &IpAddr) -> Result<Vec<Expr>, BuildError> {
    let data = address_bytes(ip)?;
    Ok(vec![
        destination_address_payload(AddrFamily::of(ip)),
        equals(data),
    ])
}

pub fn compare_source_port(port: u16) -> Result<Vec<Expr>, BuildError> {
    Ok(vec![port_payload(SRC_PORT_OFFSET), equals(port_bytes(port)?)])
}

pub fn compare_destination_port(port: u16) -> Result<Vec<Expr>, BuildError> {
    Ok(vec![port_payload(DST_PORT_OFFSET), equals(port_bytes(port)?)])
}

pub fn compare_source_address_set(set: &SetSpec) -> Result<Vec<Expr>, BuildError> {
    let family = address_set_family(set)?;
    Ok(vec![
        source_address_payload(family),
        Expr::Lookup {
            set: set.name.clone(),
        },
    ])
}

pub fn compare_destination_address_set(set: &SetSpec) -> Result<Vec<Expr>, BuildError> {
    let family = address_set_family(set)?;
    Ok(vec![
        destination_address_payload(family),
        Expr::Lookup {
            set: set.name.clone(),
        },
    ])
}

pub fn compare_source_port_set(set: &SetSpec) -> Result<Vec<Expr>, BuildError> {
    check_port_set(set)?;
    Ok(vec![
        port_payload(SRC_PORT_OFFSET),
        Expr::Lookup {
            set: set.name.clone(),
        },
    ])
}

pub fn compare_destination_port_set(set: &SetSpec) -> Result<Vec<Expr>, BuildError> {
    check_port_set(set)?;
    Ok(vec![
        port_payload(DST_PORT_OFFSET),
        Expr::Lookup {
            set: set.name.clone(),
        },
    ])
}

/// `ct state & states != 0`
pub fn compare_ct_state(states: CtState) -> Vec<Expr> {
    vec![
        Expr::Ct { key: CtKey::State },
        Expr::Bitwise {
            mask: states.0.to_ne_bytes().to_vec(),
        },
        Expr::Cmp {
            op: CmpOp::Neq,
            data: vec![0; 4],
        },
    ]
}
