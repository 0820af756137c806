//! Interval element generation and parse-back
//!
//! Every managed set is an interval set, so every [`SetData`] becomes a
//! half-open `[start, end)` pair of kernel elements: the start key, and the
//! first key past the interval flagged `interval_end`. Keys are big-endian.
//!
//! An interval whose last key is the top of the key space has no `end` key;
//! it is emitted as a lone start element, which is also how the kernel
//! reports it.
//!
//! Parse-back is canonical: one key becomes a single value, an aligned
//! power-of-two block of addresses becomes a prefix, anything else a range.

use crate::core::error::{Error, Result};
use crate::core::expr::AddrFamily;
use crate::core::objects::{SetElement, SetKeyType};
use crate::core::set_data::{CountedSetData, SetData};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Documentation values used to seed a freshly created set
pub const INIT_IPV4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
pub const INIT_IPV6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0x85a3, 1, 1, 0x8a2e, 0x370, 0x7334);
pub const INIT_PORT: u16 = 1;

fn key_bits(key_type: SetKeyType) -> u32 {
    (key_type.key_len() * 8) as u32
}

/// Largest key of the type's key space
pub fn key_space_max(key_type: SetKeyType) -> u128 {
    let bits = key_bits(key_type);
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

fn ip_to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

pub(crate) fn encode_key(key_type: SetKeyType, value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[bytes.len() - key_type.key_len()..].to_vec()
}

pub(crate) fn decode_key(key_type: SetKeyType, key: &[u8]) -> Result<u128> {
    if key.len() != key_type.key_len() {
        return Err(Error::Internal(format!(
            "{key_type} key has {} bytes, expected {}",
            key.len(),
            key_type.key_len()
        )));
    }
    Ok(key.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

/// Seed element set used by the create-then-clear initialization
pub fn init_data(key_type: SetKeyType) -> Result<SetData> {
    match key_type {
        SetKeyType::Ipv4Addr => Ok(SetData::Address(IpAddr::V4(INIT_IPV4))),
        SetKeyType::Ipv6Addr => Ok(SetData::Address(IpAddr::V6(INIT_IPV6))),
        SetKeyType::InetService => Ok(SetData::Port(INIT_PORT)),
        other => Err(Error::UnsupportedKeyType(other)),
    }
}

fn check_fits(key_type: SetKeyType, data: &SetData) -> Result<()> {
    let fits = match key_type {
        SetKeyType::InetService => data.is_port(),
        _ => data.family().is_some() && data.family() == AddrFamily::of_key_type(key_type),
    };
    if fits {
        Ok(())
    } else {
        Err(Error::FamilyMismatch {
            data: data.to_string(),
            key_type,
        })
    }
}

/// Inclusive `(first, last)` key bounds of validated data
fn bounds(key_type: SetKeyType, data: &SetData) -> Result<(u128, u128)> {
    if !key_type.is_supported() {
        return Err(Error::UnsupportedKeyType(key_type));
    }
    check_fits(key_type, data)?;
    data.validate()?;

    Ok(match data {
        SetData::Address(ip) => (ip_to_u128(ip), ip_to_u128(ip)),
        SetData::AddressRange { start, end } => (ip_to_u128(start), ip_to_u128(end)),
        SetData::Prefix(net) => {
            let host_bits = key_bits(key_type) - u32::from(net.prefix());
            let host_mask = if host_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let first = ip_to_u128(&net.ip()) & !host_mask;
            (first, first | host_mask)
        }
        SetData::Port(port) => (u128::from(*port), u128::from(*port)),
        SetData::PortRange { start, end } => (u128::from(*start), u128::from(*end)),
    })
}

/// Generates the kernel elements for a list of set data.
///
/// Validates everything before returning; on error nothing is produced.
pub fn generate_elements(key_type: SetKeyType, list: &[SetData]) -> Result<Vec<SetElement>> {
    let max = key_space_max(key_type);
    let mut elements = Vec::with_capacity(list.len() * 2);
    for data in list {
        let (first, last) = bounds(key_type, data)?;
        elements.push(SetElement::start(encode_key(key_type, first)));
        if last < max {
            elements.push(SetElement::end(encode_key(key_type, last + 1)));
        }
    }
    Ok(elements)
}

pub(crate) fn value_to_ip(key_type: SetKeyType, value: u128) -> IpAddr {
    if key_type == SetKeyType::Ipv4Addr {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

fn canonical(key_type: SetKeyType, first: u128, last: u128) -> Result<SetData> {
    if key_type == SetKeyType::InetService {
        let (start, end) = (first as u16, last as u16);
        return Ok(if start == end {
            SetData::Port(start)
        } else {
            SetData::PortRange { start, end }
        });
    }

    if first == last {
        return Ok(SetData::Address(value_to_ip(key_type, first)));
    }

    let span = last - first;
    let is_block = span & span.wrapping_add(1) == 0 && first & span == 0;
    if is_block {
        let prefix = (key_bits(key_type) - span.count_ones()) as u8;
        let net = IpNetwork::new(value_to_ip(key_type, first), prefix)
            .map_err(|e| Error::Internal(format!("prefix from interval: {e}")))?;
        return Ok(SetData::Prefix(net));
    }

    Ok(SetData::AddressRange {
        start: value_to_ip(key_type, first),
        end: value_to_ip(key_type, last),
    })
}

/// Reconstructs set data from kernel interval elements.
///
/// Elements may arrive in any order. Counters are taken from each interval's
/// start element. End elements with no preceding start are skipped.
pub fn parse_elements(key_type: SetKeyType, elements: &[SetElement]) -> Result<Vec<CountedSetData>> {
    if !key_type.is_supported() {
        return Err(Error::UnsupportedKeyType(key_type));
    }

    let mut keyed = elements
        .iter()
        .map(|e| decode_key(key_type, &e.key).map(|k| (k, e)))
        .collect::<Result<Vec<_>>>()?;
    // An end and a start sharing a key belong to adjacent intervals; the end goes first.
    keyed.sort_by_key(|(k, e)| (*k, !e.interval_end));

    let max = key_space_max(key_type);
    let mut out = Vec::with_capacity(keyed.len() / 2 + 1);
    let mut iter = keyed.into_iter().peekable();
    while let Some((key, element)) = iter.next() {
        if element.interval_end {
            continue;
        }
        let last = match iter.peek() {
            Some((end, e)) if e.interval_end => {
                let end = *end;
                iter.next();
                if end <= key {
                    return Err(Error::Internal(format!(
                        "empty interval at {key:#x} in {key_type} set"
                    )));
                }
                end - 1
            }
            None => max,
            Some(_) => {
                return Err(Error::Internal(format!(
                    "unterminated interval at {key:#x} in {key_type} set"
                )));
            }
        };
        out.push(CountedSetData {
            data: canonical(key_type, key, last)?,
            counter: element.counter,
        });
    }
    Ok(out)
}

/// Rewrites set data into the form the kernel would report it in.
///
/// Ranges that are exact CIDR blocks become prefixes, one-key prefixes and
/// ranges become single values.
pub fn canonicalize(key_type: SetKeyType, list: &[SetData]) -> Result<Vec<SetData>> {
    list.iter()
        .map(|data| {
            let (first, last) = bounds(key_type, data)?;
            canonical(key_type, first, last)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::objects::Counter;
    use proptest::prelude::*;

    fn addr(s: &str) -> SetData {
        SetData::parse_address(s).unwrap()
    }

    fn data_only(parsed: Vec<CountedSetData>) -> Vec<SetData> {
        parsed.into_iter().map(|c| c.data).collect()
    }

    #[test]
    fn test_ipv4_range_elements() {
        let elems = generate_elements(SetKeyType::Ipv4Addr, &[addr("10.0.0.1-10.0.0.3")]).unwrap();
        assert_eq!(
            elems,
            vec![
                SetElement::start(vec![10, 0, 0, 1]),
                SetElement::end(vec![10, 0, 0, 4]),
            ]
        );
    }

    #[test]
    fn test_port_elements() {
        let data = crate::core::set_data::port_strings_to_set_data(&["8080", "9000-9005"]).unwrap();
        let elems = generate_elements(SetKeyType::InetService, &data).unwrap();
        assert_eq!(
            elems,
            vec![
                SetElement::start(8080u16.to_be_bytes().to_vec()),
                SetElement::end(8081u16.to_be_bytes().to_vec()),
                SetElement::start(9000u16.to_be_bytes().to_vec()),
                SetElement::end(9006u16.to_be_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn test_prefix_elements() {
        let elems = generate_elements(SetKeyType::Ipv4Addr, &[addr("192.168.0.0/16")]).unwrap();
        assert_eq!(elems[0].key, vec![192, 168, 0, 0]);
        assert_eq!(elems[1].key, vec![192, 169, 0, 0]);
    }

    #[test]
    fn test_top_of_key_space_has_no_end() {
        let elems = generate_elements(SetKeyType::InetService, &[SetData::Port(65535)]).unwrap();
        assert_eq!(elems, vec![SetElement::start(vec![0xff, 0xff])]);

        let parsed = parse_elements(SetKeyType::InetService, &elems).unwrap();
        assert_eq!(data_only(parsed), vec![SetData::Port(65535)]);

        let elems = generate_elements(SetKeyType::Ipv6Addr, &[addr("ffff::/16")]).unwrap();
        assert_eq!(elems.len(), 1);
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let err = generate_elements(SetKeyType::Ipv4Addr, &[addr("2001:db8::1")]).unwrap_err();
        assert!(matches!(err, Error::FamilyMismatch { .. }));
        let err = generate_elements(SetKeyType::InetService, &[addr("10.0.0.1")]).unwrap_err();
        assert!(matches!(err, Error::FamilyMismatch { .. }));
        let err = generate_elements(SetKeyType::Ipv6Addr, &[SetData::Port(22)]).unwrap_err();
        assert!(matches!(err, Error::FamilyMismatch { .. }));
    }

    #[test]
    fn test_invalid_data_rejected() {
        assert!(generate_elements(SetKeyType::Ipv4Addr, &[addr("0.0.0.0")]).is_err());
        assert!(generate_elements(SetKeyType::InetService, &[SetData::Port(0)]).is_err());
        assert!(
            generate_elements(SetKeyType::Mark, &[SetData::Port(1)])
                .is_err_and(|e| matches!(e, Error::UnsupportedKeyType(SetKeyType::Mark)))
        );
    }

    #[test]
    fn test_parse_back_is_canonical() {
        let elems = generate_elements(
            SetKeyType::Ipv4Addr,
            &[addr("10.0.0.0-10.0.0.255"), addr("10.0.1.5/32"), addr("10.0.2.1-10.0.2.3")],
        )
        .unwrap();
        let parsed = data_only(parse_elements(SetKeyType::Ipv4Addr, &elems).unwrap());
        assert_eq!(
            parsed,
            vec![addr("10.0.0.0/24"), addr("10.0.1.5"), addr("10.0.2.1-10.0.2.3")]
        );
    }

    #[test]
    fn test_parse_adjacent_intervals_any_order() {
        let mut elems = generate_elements(SetKeyType::InetService, &[
            SetData::PortRange { start: 10, end: 19 },
            SetData::PortRange { start: 20, end: 29 },
        ])
        .unwrap();
        elems.reverse();
        let parsed = data_only(parse_elements(SetKeyType::InetService, &elems).unwrap());
        assert_eq!(
            parsed,
            vec![
                SetData::PortRange { start: 10, end: 19 },
                SetData::PortRange { start: 20, end: 29 },
            ]
        );
    }

    #[test]
    fn test_parse_skips_leading_end_and_keeps_counters() {
        let mut start = SetElement::start(vec![10, 0, 0, 1]);
        start.counter = Some(Counter {
            bytes: 120,
            packets: 2,
        });
        let elems = vec![
            SetElement::end(vec![0, 0, 0, 0]),
            start,
            SetElement::end(vec![10, 0, 0, 2]),
        ];
        let parsed = parse_elements(SetKeyType::Ipv4Addr, &elems).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, addr("10.0.0.1"));
        assert_eq!(parsed[0].counter.unwrap().packets, 2);
    }

    #[test]
    fn test_parse_rejects_bad_key_width() {
        let elems = vec![SetElement::start(vec![1, 2, 3])];
        assert!(parse_elements(SetKeyType::Ipv4Addr, &elems).is_err());
    }

    #[test]
    fn test_canonicalize() {
        let out = canonicalize(SetKeyType::Ipv6Addr, &[addr("2001:db8::-2001:db8::ffff")]).unwrap();
        assert_eq!(out, vec![addr("2001:db8::/112")]);
        let out = canonicalize(SetKeyType::InetService, &[SetData::PortRange { start: 5, end: 5 }])
            .unwrap();
        assert_eq!(out, vec![SetData::Port(5)]);
    }

    #[test]
    fn test_init_data() {
        assert_eq!(
            init_data(SetKeyType::Ipv6Addr).unwrap(),
            addr("2001:db8:85a3:1:1:8a2e:370:7334")
        );
        assert!(init_data(SetKeyType::EtherAddr).is_err());
    }

    fn covered(key_type: SetKeyType, list: &[SetData]) -> Vec<(u128, u128)> {
        let mut spans: Vec<_> = list.iter().map(|d| bounds(key_type, d).unwrap()).collect();
        spans.sort_unstable();
        spans
    }

    proptest! {
        #[test]
        fn prop_ipv4_round_trip_preserves_coverage(
            starts in proptest::collection::btree_set(1u32..u32::MAX - 1024, 1..8),
            lens in proptest::collection::vec(0u32..512, 8),
        ) {
            // Space intervals far enough apart that they never touch
            let list: Vec<SetData> = starts
                .iter()
                .map(|s| s & !0x7ff)
                .filter(|s| *s != 0)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .zip(lens.iter())
                .map(|(s, l)| SetData::AddressRange {
                    start: IpAddr::V4(Ipv4Addr::from(s)),
                    end: IpAddr::V4(Ipv4Addr::from(s + l)),
                })
                .collect();
            let elems = generate_elements(SetKeyType::Ipv4Addr, &list).unwrap();
            let parsed = data_only(parse_elements(SetKeyType::Ipv4Addr, &elems).unwrap());
            prop_assert_eq!(covered(SetKeyType::Ipv4Addr, &parsed), covered(SetKeyType::Ipv4Addr, &list));
            prop_assert_eq!(canonicalize(SetKeyType::Ipv4Addr, &list).unwrap(), parsed);
        }

        #[test]
        fn prop_port_singles_round_trip(ports in proptest::collection::btree_set(1u16..=u16::MAX, 1..32)) {
            // Step by two so singles never merge into ranges
            let list: Vec<SetData> = ports
                .iter()
                .map(|p| p | 1)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .map(SetData::Port)
                .collect();
            let elems = generate_elements(SetKeyType::InetService, &list).unwrap();
            let parsed = data_only(parse_elements(SetKeyType::InetService, &elems).unwrap());
            prop_assert_eq!(parsed, list);
        }
    }
}
