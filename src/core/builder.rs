//! Rule assembly
//!
//! [`build`] interprets a list of [`BuildOp`] commands into a complete
//! expression list:
//!
//! ```text
//! [family compare] [transport compare] [matches, in order] [verdict]
//! ```
//!
//! The family and the transport protocol may each be set once. Address
//! matches and address-set lookups carry their own family, which must agree
//! with the explicit family whichever was given first.
//!
//! # Example
//!
//! ```
//! use nftsync::core::builder::RuleBuilder;
//! use nftsync::core::expr::{AddrFamily, TransportProto, Verdict};
//!
//! let exprs = RuleBuilder::new()
//!     .family(AddrFamily::Ipv4)
//!     .transport(TransportProto::Tcp)
//!     .destination_port(22)
//!     .counter()
//!     .build(Verdict::Drop)
//!     .unwrap();
//! assert_eq!(exprs.len(), 8);
//! ```

use crate::core::error::BuildError;
use crate::core::expr::{
    self, AddrFamily, CtState, Expr, TransportProto, Verdict, compare_ct_state,
    compare_destination_address, compare_destination_address_set, compare_destination_port,
    compare_destination_port_set, compare_protocol_family, compare_source_address,
    compare_source_address_set, compare_source_port, compare_source_port_set,
    compare_transport_protocol,
};
use crate::core::objects::SetSpec;
use std::net::IpAddr;

/// One match clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    SourceAddress(IpAddr),
    DestinationAddress(IpAddr),
    SourceAddressSet(SetSpec),
    DestinationAddressSet(SetSpec),
    SourcePort(u16),
    DestinationPort(u16),
    SourcePortSet(SetSpec),
    DestinationPortSet(SetSpec),
    ConnectionTrackingState(CtState),
    /// Packet/byte counter at this position
    Counter,
    /// Pre-assembled expressions, inserted verbatim
    Raw(Vec<Expr>),
}

impl Match {
    /// Family implied by the match, if any
    fn family(&self) -> Result<Option<AddrFamily>, BuildError> {
        Ok(match self {
            Match::SourceAddress(ip) | Match::DestinationAddress(ip) => Some(AddrFamily::of(ip)),
            Match::SourceAddressSet(set) | Match::DestinationAddressSet(set) => {
                Some(AddrFamily::of_key_type(set.key_type).ok_or_else(|| {
                    BuildError::InvalidMatch(format!(
                        "set {} has key type {}, not an address type",
                        set.name, set.key_type
                    ))
                })?)
            }
            _ => None,
        })
    }

    fn exprs(&self) -> Result<Vec<Expr>, BuildError> {
        match self {
            Match::SourceAddress(ip) => compare_source_address(ip),
            Match::DestinationAddress(ip) => compare_destination_address(ip),
            Match::SourceAddressSet(set) => compare_source_address_set(set),
            Match::DestinationAddressSet(set) => compare_destination_address_set(set),
            Match::SourcePort(port) => compare_source_port(*port),
            Match::DestinationPort(port) => compare_destination_port(*port),
            Match::SourcePortSet(set) => compare_source_port_set(set),
            Match::DestinationPortSet(set) => compare_destination_port_set(set),
            Match::ConnectionTrackingState(states) => Ok(compare_ct_state(*states)),
            Match::Counter => Ok(vec![expr::counter()]),
            Match::Raw(exprs) => Ok(exprs.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOp {
    SetFamily(AddrFamily),
    SetTransport(TransportProto),
    AddMatch(Match),
}

fn conflict(rule: AddrFamily, matched: AddrFamily) -> Result<(), BuildError> {
    if rule == matched {
        Ok(())
    } else {
        Err(BuildError::FamilyConflict {
            rule: rule.to_string(),
            matched: matched.to_string(),
        })
    }
}

/// Assembles a rule's expressions from `ops`, ending with `verdict`
pub fn build(verdict: Verdict, ops: &[BuildOp]) -> Result<Vec<Expr>, BuildError> {
    let mut family: Option<AddrFamily> = None;
    let mut transport: Option<TransportProto> = None;
    let mut match_families: Vec<AddrFamily> = Vec::new();
    let mut matches: Vec<Expr> = Vec::new();

    for op in ops {
        match op {
            BuildOp::SetFamily(f) => {
                if family.is_some() {
                    return Err(BuildError::FamilyAlreadySet);
                }
                for matched in &match_families {
                    conflict(*f, *matched)?;
                }
                family = Some(*f);
            }
            BuildOp::SetTransport(t) => {
                if transport.is_some() {
                    return Err(BuildError::TransportAlreadySet);
                }
                transport = Some(*t);
            }
            BuildOp::AddMatch(m) => {
                if let Some(matched) = m.family()? {
                    if let Some(f) = family {
                        conflict(f, matched)?;
                    }
                    match_families.push(matched);
                }
                matches.extend(m.exprs()?);
            }
        }
    }

    let mut exprs = Vec::with_capacity(matches.len() + 5);
    if let Some(f) = family {
        exprs.extend(compare_protocol_family(f));
    }
    if let Some(t) = transport {
        exprs.extend(compare_transport_protocol(t));
    }
    exprs.extend(matches);
    exprs.push(Expr::Verdict(verdict));
    Ok(exprs)
}

/// Fluent front end recording [`BuildOp`]s
#[derive(Debug, Clone, Default)]
pub struct RuleBuilder {
    ops: Vec<BuildOp>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(mut self, family: AddrFamily) -> Self {
        self.ops.push(BuildOp::SetFamily(family));
        self
    }

    pub fn transport(mut self, proto: TransportProto) -> Self {
        self.ops.push(BuildOp::SetTransport(proto));
        self
    }

    pub fn matching(mut self, m: Match) -> Self {
        self.ops.push(BuildOp::AddMatch(m));
        self
    }

    pub fn source_address(self, ip: IpAddr) -> Self {
        self.matching(Match::SourceAddress(ip))
    }

    pub fn destination_address(self, ip: IpAddr) -> Self {
        self.matching(Match::DestinationAddress(ip))
    }

    pub fn source_address_set(self, set: &SetSpec) -> Self {
        self.matching(Match::SourceAddressSet(set.clone()))
    }

    pub fn destination_address_set(self, set: &SetSpec) -> Self {
        self.matching(Match::DestinationAddressSet(set.clone()))
    }

    pub fn source_port(self, port: u16) -> Self {
        self.matching(Match::SourcePort(port))
    }

    pub fn destination_port(self, port: u16) -> Self {
        self.matching(Match::DestinationPort(port))
    }

    pub fn source_port_set(self, set: &SetSpec) -> Self {
        self.matching(Match::SourcePortSet(set.clone()))
    }

    pub fn destination_port_set(self, set: &SetSpec) -> Self {
        self.matching(Match::DestinationPortSet(set.clone()))
    }

    pub fn ct_state(self, states: CtState) -> Self {
        self.matching(Match::ConnectionTrackingState(states))
    }

    pub fn counter(self) -> Self {
        self.matching(Match::Counter)
    }

    pub fn ops(&self) -> &[BuildOp] {
        &self.ops
    }

    pub fn build(&self, verdict: Verdict) -> Result<Vec<Expr>, BuildError> {
        build(verdict, &self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::{CmpOp, MetaKey};
    use crate::core::objects::{SetKeyType, Table};

    fn v4_set() -> SetSpec {
        SetSpec::interval(Table::inet("t"), "blocked_v4", SetKeyType::Ipv4Addr)
    }

    fn v6_set() -> SetSpec {
        SetSpec::interval(Table::inet("t"), "blocked_v6", SetKeyType::Ipv6Addr)
    }

    #[test]
    fn test_output_order() {
        let exprs = build(
            Verdict::Drop,
            &[
                BuildOp::AddMatch(Match::Counter),
                BuildOp::SetTransport(TransportProto::Udp),
                BuildOp::SetFamily(AddrFamily::Ipv6),
            ],
        )
        .unwrap();
        assert_eq!(
            exprs,
            vec![
                Expr::Meta {
                    key: MetaKey::Nfproto
                },
                Expr::Cmp {
                    op: CmpOp::Eq,
                    data: vec![10]
                },
                Expr::Meta {
                    key: MetaKey::L4proto
                },
                Expr::Cmp {
                    op: CmpOp::Eq,
                    data: vec![17]
                },
                expr::counter(),
                Expr::Verdict(Verdict::Drop),
            ]
        );
    }

    #[test]
    fn test_family_set_twice() {
        let err = RuleBuilder::new()
            .family(AddrFamily::Ipv4)
            .family(AddrFamily::Ipv4)
            .build(Verdict::Accept)
            .unwrap_err();
        assert_eq!(err, BuildError::FamilyAlreadySet);
        assert_eq!(err.to_string(), "family already set");
    }

    #[test]
    fn test_transport_set_twice() {
        let err = RuleBuilder::new()
            .transport(TransportProto::Tcp)
            .transport(TransportProto::Udp)
            .build(Verdict::Accept)
            .unwrap_err();
        assert_eq!(err, BuildError::TransportAlreadySet);
    }

    #[test]
    fn test_family_conflict_either_order() {
        let after = RuleBuilder::new()
            .family(AddrFamily::Ipv4)
            .source_address_set(&v6_set())
            .build(Verdict::Drop);
        assert!(matches!(after, Err(BuildError::FamilyConflict { .. })));

        let before = RuleBuilder::new()
            .destination_address("2001:db8::1".parse().unwrap())
            .family(AddrFamily::Ipv4)
            .build(Verdict::Drop);
        assert!(matches!(before, Err(BuildError::FamilyConflict { .. })));

        let agreeing = RuleBuilder::new()
            .source_address_set(&v4_set())
            .family(AddrFamily::Ipv4)
            .build(Verdict::Drop);
        assert!(agreeing.is_ok());
    }

    #[test]
    fn test_invalid_match_values() {
        let cases = [
            RuleBuilder::new().source_address("0.0.0.0".parse().unwrap()),
            RuleBuilder::new().destination_port(0),
            RuleBuilder::new().source_port_set(&v4_set()),
            RuleBuilder::new().destination_address_set(&SetSpec::interval(
                Table::inet("t"),
                "ports",
                SetKeyType::InetService,
            )),
        ];
        for builder in cases {
            assert!(matches!(
                builder.build(Verdict::Drop),
                Err(BuildError::InvalidMatch(_))
            ));
        }
    }

    #[test]
    fn test_matches_keep_call_order() {
        let exprs = RuleBuilder::new()
            .destination_port(443)
            .ct_state(CtState::NEW)
            .counter()
            .build(Verdict::Accept)
            .unwrap();
        assert!(matches!(exprs[0], Expr::Payload { offset: 2, .. }));
        assert!(matches!(exprs[2], Expr::Ct { .. }));
        assert_eq!(exprs[5], expr::counter());
        assert_eq!(exprs.last(), Some(&expr::accept()));
    }

    #[test]
    fn test_fluent_records_ops() {
        let builder = RuleBuilder::new()
            .family(AddrFamily::Ipv4)
            .matching(Match::Raw(vec![expr::counter()]));
        assert_eq!(builder.ops().len(), 2);
        assert_eq!(
            builder.build(Verdict::Drop).unwrap(),
            build(Verdict::Drop, builder.ops()).unwrap()
        );
    }
}
