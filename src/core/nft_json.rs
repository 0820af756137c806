//! `nft` JSON connection
//!
//! [`NftConn`] queues libnftables JSON commands and commits them with a single
//! `nft --json -f -` invocation, which nft applies as one transaction.
//! Listings go through `nft --json list set` and
//! `nft --json --handle list chain`.
//!
//! Rule identities travel hex-encoded in the rule comment. Expression lists
//! are translated to and from JSON `match` statements; statements this crate
//! never emits are skipped when listing foreign rules.

use crate::core::conn::Conn;
use crate::core::error::{Error, Result};
use crate::core::expr::{
    AddrFamily, CmpOp, CtKey, CtState, DST_PORT_OFFSET, Expr, IPV4_ADDR_LEN, IPV4_DST_OFFSET,
    IPV4_SRC_OFFSET, IPV6_ADDR_LEN, IPV6_DST_OFFSET, IPV6_SRC_OFFSET, MetaKey, PORT_LEN,
    PayloadBase, SRC_PORT_OFFSET, TransportProto, Verdict,
};
use crate::core::interval::{decode_key, encode_key, key_space_max, value_to_ip};
use crate::core::objects::{Chain, Counter, Rule, SetElement, SetKeyType, SetSpec, Table};
use crate::elevation;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

const JSON_SCHEMA_VERSION: u64 = 1;

/// Longest rule comment nft accepts
const MAX_COMMENT_LEN: usize = 128;

/// Interface names are compared as fixed `IFNAMSIZ` buffers
const IFNAMSIZ: usize = 16;

/// Connection driving the `nft` binary
#[derive(Debug)]
pub struct NftConn {
    program: Vec<String>,
    elevate: bool,
    pending: Vec<Value>,
}

impl NftConn {
    /// Connects through the configured nft command, elevating when needed.
    ///
    /// Fails if the command cannot be run at all.
    pub async fn connect() -> Result<Self> {
        let conn = Self {
            program: elevation::nft_program(),
            elevate: true,
            pending: Vec::new(),
        };
        let version = conn.output(false, &["--version"], None).await?;
        info!(
            "Using {}",
            String::from_utf8_lossy(&version).trim()
        );
        Ok(conn)
    }

    /// Runs exactly `program` (plus nft arguments), never elevating
    pub fn with_command(program: Vec<String>) -> Self {
        Self {
            program,
            elevate: false,
            pending: Vec::new(),
        }
    }

    /// Another connection running the same command, with its own empty queue
    pub fn fork(&self) -> Self {
        Self {
            program: self.program.clone(),
            elevate: self.elevate,
            pending: Vec::new(),
        }
    }

    fn command(&self, elevate: bool, args: &[&str]) -> Result<tokio::process::Command> {
        if elevate && self.elevate {
            Ok(elevation::build_elevated_command(&self.program, args)?)
        } else {
            Ok(elevation::direct_command(&self.program, args))
        }
    }

    /// Runs nft and returns its stdout
    async fn output(&self, elevate: bool, args: &[&str], input: Option<String>) -> Result<Vec<u8>> {
        let program = self.program.first().map_or("nft", String::as_str);
        let mut child = self
            .command(elevate, args)?
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {program}: {e}");
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::nftables(format!("{program}: command not found"))
                } else {
                    Error::Io(e)
                }
            })?;

        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), input) {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = stderr
                .lines()
                .find(|l| l.starts_with("Error"))
                .or_else(|| stderr.lines().next())
                .unwrap_or("nft failed")
                .to_string();
            Err(Error::Nftables {
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    async fn list(&self, args: &[&str]) -> Result<Value> {
        let stdout = self.output(true, args, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    /// The queued commands wrapped as one JSON batch
    fn batch(commands: Vec<Value>) -> Value {
        let mut items = Vec::with_capacity(commands.len() + 1);
        items.push(json!({ "metainfo": { "json_schema_version": JSON_SCHEMA_VERSION } }));
        items.extend(commands);
        json!({ "nftables": items })
    }
}

fn table_json(table: &Table) -> Value {
    json!({ "family": table.family.as_ref(), "name": table.name })
}

fn set_ref(set: &SetSpec) -> Value {
    json!({
        "family": set.table.family.as_ref(),
        "table": set.table.name,
        "name": set.name,
    })
}

fn chain_json(chain: &Chain) -> Value {
    let mut obj = json!({
        "family": chain.table.family.as_ref(),
        "table": chain.table.name,
        "name": chain.name,
    });
    if let Some(base) = &chain.base {
        obj["type"] = json!("filter");
        obj["hook"] = json!(base.hook.as_ref());
        obj["prio"] = json!(base.priority);
        obj["policy"] = json!("accept");
    }
    obj
}

fn set_json(set: &SetSpec) -> Value {
    let mut obj = set_ref(set);
    obj["type"] = json!(set.key_type.as_ref());
    if set.interval {
        obj["flags"] = json!(["interval"]);
    }
    if set.counter {
        obj["stmt"] = json!([{ "counter": null }]);
    }
    obj
}

fn key_json(key_type: SetKeyType, value: u128) -> Value {
    match key_type {
        SetKeyType::InetService => json!(value as u16),
        _ => json!(value_to_ip(key_type, value).to_string()),
    }
}

/// Renders interval element pairs as single values and ranges
fn elements_json(set: &SetSpec, elements: &[SetElement]) -> Result<Vec<Value>> {
    let key_type = set.key_type;
    let max = key_space_max(key_type);
    let mut out = Vec::with_capacity(elements.len() / 2 + 1);
    let mut iter = elements.iter().peekable();

    while let Some(start) = iter.next() {
        if start.interval_end {
            return Err(Error::Internal(format!(
                "interval end without start in elements for set {set}"
            )));
        }
        let first = decode_key(key_type, &start.key)?;
        let last = match iter.next_if(|e| e.interval_end) {
            Some(end) => decode_key(key_type, &end.key)?
                .checked_sub(1)
                .ok_or_else(|| Error::Internal(format!("empty interval in set {set}")))?,
            None => max,
        };
        out.push(if first == last {
            key_json(key_type, first)
        } else {
            json!({ "range": [key_json(key_type, first), key_json(key_type, last)] })
        });
    }
    Ok(out)
}

fn element_command(verb: &str, set: &SetSpec, elements: &[SetElement]) -> Result<Value> {
    let mut obj = set_ref(set);
    obj["elem"] = Value::Array(elements_json(set, elements)?);
    Ok(json!({ verb: { "element": obj } }))
}

fn parse_scalar(key_type: SetKeyType, value: &Value) -> Result<u128> {
    let invalid = || Error::nftables(format!("unexpected {key_type} value in listing: {value}"));
    match key_type {
        SetKeyType::InetService => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .filter(|p| *p <= u64::from(u16::MAX))
            .map(u128::from)
            .ok_or_else(invalid),
        SetKeyType::Ipv4Addr => value
            .as_str()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .map(|ip| u128::from(u32::from(ip)))
            .ok_or_else(invalid),
        SetKeyType::Ipv6Addr => value
            .as_str()
            .and_then(|s| s.parse::<Ipv6Addr>().ok())
            .map(u128::from)
            .ok_or_else(invalid),
        other => Err(Error::UnsupportedKeyType(other)),
    }
}

fn parse_counter(value: &Value) -> Counter {
    Counter {
        bytes: value.get("bytes").and_then(Value::as_u64).unwrap_or(0),
        packets: value.get("packets").and_then(Value::as_u64).unwrap_or(0),
    }
}

/// Inclusive bounds and counter of one listed element
fn parse_elem(key_type: SetKeyType, value: &Value) -> Result<(u128, u128, Option<Counter>)> {
    if let Some(elem) = value.get("elem") {
        let val = elem
            .get("val")
            .ok_or_else(|| Error::nftables(format!("element without value: {value}")))?;
        let (first, last, _) = parse_elem(key_type, val)?;
        return Ok((first, last, elem.get("counter").map(parse_counter)));
    }
    if let Some(prefix) = value.get("prefix") {
        let first = parse_scalar(key_type, &prefix["addr"])?;
        let len = prefix["len"]
            .as_u64()
            .ok_or_else(|| Error::nftables(format!("prefix without length: {value}")))?;
        let bits = (key_type.key_len() * 8) as u64;
        if len > bits {
            return Err(Error::nftables(format!("prefix length {len} too long for {key_type}")));
        }
        let host_bits = bits - len;
        let host_mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        return Ok((first & !host_mask, first | host_mask, None));
    }
    if let Some(range) = value.get("range").and_then(Value::as_array)
        && let [first, last] = range.as_slice()
    {
        return Ok((parse_scalar(key_type, first)?, parse_scalar(key_type, last)?, None));
    }
    let single = parse_scalar(key_type, value)?;
    Ok((single, single, None))
}

/// Kernel elements of the first set in a `list set` response
fn parse_set_listing(set: &SetSpec, listing: &Value) -> Result<Vec<SetElement>> {
    let key_type = set.key_type;
    let max = key_space_max(key_type);
    let found = listing["nftables"]
        .as_array()
        .and_then(|items| items.iter().find_map(|i| i.get("set")))
        .ok_or_else(|| Error::NotFound(format!("set {set}")))?;

    let Some(elems) = found.get("elem").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(elems.len() * 2);
    for elem in elems {
        let (first, last, counter) = parse_elem(key_type, elem)?;
        let mut start = SetElement::start(encode_key(key_type, first));
        if set.counter {
            start.counter = Some(counter.unwrap_or_default());
        }
        out.push(start);
        if last < max {
            out.push(SetElement::end(encode_key(key_type, last + 1)));
        }
    }
    Ok(out)
}

/// Left-hand side of a match, as loaded by the preceding expressions
#[derive(Debug, Clone, PartialEq, Eq)]
enum Load {
    Meta(MetaKey),
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    CtState {
        mask: Option<Vec<u8>>,
    },
}

fn named_field(base: PayloadBase, offset: u32, len: u32) -> Option<(&'static str, &'static str)> {
    match (base, offset, len) {
        (PayloadBase::Network, IPV4_SRC_OFFSET, IPV4_ADDR_LEN) => Some(("ip", "saddr")),
        (PayloadBase::Network, IPV4_DST_OFFSET, IPV4_ADDR_LEN) => Some(("ip", "daddr")),
        (PayloadBase::Network, IPV6_SRC_OFFSET, IPV6_ADDR_LEN) => Some(("ip6", "saddr")),
        (PayloadBase::Network, IPV6_DST_OFFSET, IPV6_ADDR_LEN) => Some(("ip6", "daddr")),
        (PayloadBase::Transport, SRC_PORT_OFFSET, PORT_LEN) => Some(("th", "sport")),
        (PayloadBase::Transport, DST_PORT_OFFSET, PORT_LEN) => Some(("th", "dport")),
        _ => None,
    }
}

fn field_payload(protocol: &str, field: &str) -> Option<Load> {
    let (base, offset, len) = match (protocol, field) {
        ("ip", "saddr") => (PayloadBase::Network, IPV4_SRC_OFFSET, IPV4_ADDR_LEN),
        ("ip", "daddr") => (PayloadBase::Network, IPV4_DST_OFFSET, IPV4_ADDR_LEN),
        ("ip6", "saddr") => (PayloadBase::Network, IPV6_SRC_OFFSET, IPV6_ADDR_LEN),
        ("ip6", "daddr") => (PayloadBase::Network, IPV6_DST_OFFSET, IPV6_ADDR_LEN),
        ("th" | "tcp" | "udp", "sport") => (PayloadBase::Transport, SRC_PORT_OFFSET, PORT_LEN),
        ("th" | "tcp" | "udp", "dport") => (PayloadBase::Transport, DST_PORT_OFFSET, PORT_LEN),
        _ => return None,
    };
    Some(Load::Payload { base, offset, len })
}

fn load_json(load: &Load) -> Value {
    match load {
        Load::Meta(key) => json!({ "meta": { "key": key.to_string() } }),
        Load::Payload { base, offset, len } => match named_field(*base, *offset, *len) {
            Some((protocol, field)) => json!({ "payload": { "protocol": protocol, "field": field } }),
            None => json!({
                "payload": {
                    "base": if *base == PayloadBase::Network { "nh" } else { "th" },
                    "offset": offset * 8,
                    "len": len * 8,
                }
            }),
        },
        Load::CtState { .. } => json!({ "ct": { "key": "state" } }),
    }
}

fn ct_state_bits(data: &[u8]) -> Option<CtState> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(CtState(u32::from_ne_bytes(bytes)))
}

fn ct_names_json(states: CtState) -> Value {
    match states.names().as_slice() {
        [single] => json!(single),
        names => json!(names),
    }
}

fn trim_ifname(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Right-hand side of a comparison against `load`
fn value_json(load: &Load, data: &[u8]) -> Result<Value> {
    let unsupported = || Error::Internal(format!("cannot render {data:?} compared against {load:?}"));
    match load {
        Load::Meta(MetaKey::Nfproto) => {
            let raw = *data.first().ok_or_else(unsupported)?;
            Ok(AddrFamily::from_nfproto(raw).map_or_else(|| json!(raw), |f| json!(f.to_string())))
        }
        Load::Meta(MetaKey::L4proto) => {
            let raw = *data.first().ok_or_else(unsupported)?;
            Ok(TransportProto::from_number(raw).map_or_else(|| json!(raw), |p| json!(p.to_string())))
        }
        Load::Meta(MetaKey::Iifname | MetaKey::Oifname) => Ok(json!(trim_ifname(data))),
        Load::Payload { .. } => match data.len() {
            2 => Ok(json!(u16::from_be_bytes([data[0], data[1]]))),
            4 => {
                let octets: [u8; 4] = data.try_into().map_err(|_| unsupported())?;
                Ok(json!(Ipv4Addr::from(octets).to_string()))
            }
            16 => {
                let octets: [u8; 16] = data.try_into().map_err(|_| unsupported())?;
                Ok(json!(Ipv6Addr::from(octets).to_string()))
            }
            _ => Err(unsupported()),
        },
        Load::CtState { .. } => Ok(ct_names_json(ct_state_bits(data).ok_or_else(unsupported)?)),
    }
}

fn match_json(op: &str, left: Value, right: Value) -> Value {
    json!({ "match": { "op": op, "left": left, "right": right } })
}

fn verdict_json(verdict: Verdict) -> Value {
    let mut obj = Map::new();
    obj.insert(verdict.to_string(), Value::Null);
    Value::Object(obj)
}

/// Translates an expression list into JSON statements
fn exprs_to_json(exprs: &[Expr]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut load: Option<Load> = None;
    let dangling = |what: &str| Error::Internal(format!("{what} without a preceding load"));

    for expr in exprs {
        match expr {
            Expr::Meta { key } => load = Some(Load::Meta(*key)),
            Expr::Payload { base, offset, len } => {
                load = Some(Load::Payload {
                    base: *base,
                    offset: *offset,
                    len: *len,
                });
            }
            Expr::Ct { key: CtKey::State } => load = Some(Load::CtState { mask: None }),
            Expr::Bitwise { mask } => match &mut load {
                Some(Load::CtState { mask: m }) => *m = Some(mask.clone()),
                _ => return Err(Error::Internal("bitwise outside a ct state match".to_string())),
            },
            Expr::Cmp { op, data } => {
                let left = load.take().ok_or_else(|| dangling("comparison"))?;
                let stmt = match (&left, op) {
                    (Load::CtState { mask: Some(mask) }, CmpOp::Neq) if data.iter().all(|b| *b == 0) => {
                        let states = ct_state_bits(mask)
                            .ok_or_else(|| Error::Internal("ct state mask is not 32 bits".to_string()))?;
                        match_json("in", load_json(&left), ct_names_json(states))
                    }
                    (_, CmpOp::Eq) => match_json("==", load_json(&left), value_json(&left, data)?),
                    (_, CmpOp::Neq) => match_json("!=", load_json(&left), value_json(&left, data)?),
                };
                out.push(stmt);
            }
            Expr::Lookup { set } => {
                let left = load.take().ok_or_else(|| dangling("set lookup"))?;
                out.push(match_json("==", load_json(&left), json!(format!("@{set}"))));
            }
            Expr::Counter(c) => {
                out.push(json!({ "counter": { "packets": c.packets, "bytes": c.bytes } }));
            }
            Expr::Verdict(v) => out.push(verdict_json(*v)),
        }
    }
    Ok(out)
}

fn parse_load(left: &Value) -> Option<Load> {
    if let Some(meta) = left.get("meta") {
        return meta["key"].as_str()?.parse().ok().map(Load::Meta);
    }
    if let Some(payload) = left.get("payload") {
        if let (Some(protocol), Some(field)) = (payload["protocol"].as_str(), payload["field"].as_str()) {
            return field_payload(protocol, field);
        }
        let base = match payload["base"].as_str()? {
            "nh" => PayloadBase::Network,
            "th" => PayloadBase::Transport,
            _ => return None,
        };
        let offset = u32::try_from(payload["offset"].as_u64()?).ok()?;
        let len = u32::try_from(payload["len"].as_u64()?).ok()?;
        if offset % 8 != 0 || len % 8 != 0 {
            return None;
        }
        return Some(Load::Payload {
            base,
            offset: offset / 8,
            len: len / 8,
        });
    }
    if left.get("ct")?.get("key")?.as_str()? == "state" {
        return Some(Load::CtState { mask: None });
    }
    None
}

fn parse_ct_states(right: &Value) -> Option<CtState> {
    let names: Vec<&str> = match right {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().map(Value::as_str).collect::<Option<_>>()?,
        _ => return None,
    };
    names
        .into_iter()
        .map(CtState::from_name)
        .try_fold(CtState(0), |acc, s| s.map(|s| acc | s))
}

fn parse_data(load: &Load, right: &Value) -> Option<Vec<u8>> {
    match load {
        Load::Meta(MetaKey::Nfproto) => match right {
            Value::String(s) => s.parse::<AddrFamily>().ok().map(|f| vec![f.nfproto()]),
            _ => u8::try_from(right.as_u64()?).ok().map(|n| vec![n]),
        },
        Load::Meta(MetaKey::L4proto) => match right {
            Value::String(s) => s.parse::<TransportProto>().ok().map(|p| vec![p.number()]),
            _ => u8::try_from(right.as_u64()?).ok().map(|n| vec![n]),
        },
        Load::Meta(MetaKey::Iifname | MetaKey::Oifname) => {
            let mut name = right.as_str()?.as_bytes().to_vec();
            if name.len() >= IFNAMSIZ {
                return None;
            }
            name.resize(IFNAMSIZ, 0);
            Some(name)
        }
        Load::Payload { len, .. } => match (len, right) {
            (2, _) => u16::try_from(right.as_u64()?).ok().map(|p| p.to_be_bytes().to_vec()),
            (4 | 16, Value::String(s)) => match s.parse::<IpAddr>().ok()? {
                IpAddr::V4(ip) if *len == 4 => Some(ip.octets().to_vec()),
                IpAddr::V6(ip) if *len == 16 => Some(ip.octets().to_vec()),
                _ => None,
            },
            _ => None,
        },
        Load::CtState { .. } => None,
    }
}

fn load_expr(load: &Load) -> Expr {
    match load {
        Load::Meta(key) => Expr::Meta { key: *key },
        Load::Payload { base, offset, len } => Expr::Payload {
            base: *base,
            offset: *offset,
            len: *len,
        },
        Load::CtState { .. } => Expr::Ct { key: CtKey::State },
    }
}

fn parse_match(m: &Value) -> Option<Vec<Expr>> {
    let load = parse_load(&m["left"])?;
    let right = &m["right"];
    let op = m["op"].as_str().unwrap_or("==");

    if let Load::CtState { .. } = load {
        let states = parse_ct_states(right)?;
        return Some(vec![
            load_expr(&load),
            Expr::Bitwise {
                mask: states.0.to_ne_bytes().to_vec(),
            },
            Expr::Cmp {
                op: CmpOp::Neq,
                data: vec![0; 4],
            },
        ]);
    }

    if let Some(set) = right.as_str().and_then(|s| s.strip_prefix('@')) {
        return Some(vec![
            load_expr(&load),
            Expr::Lookup {
                set: set.to_string(),
            },
        ]);
    }

    let op = match op {
        "==" | "in" => CmpOp::Eq,
        "!=" => CmpOp::Neq,
        _ => return None,
    };
    let data = parse_data(&load, right)?;
    Some(vec![load_expr(&load), Expr::Cmp { op, data }])
}

/// Translates JSON statements back into expressions, skipping unknown ones
fn json_to_exprs(stmts: &[Value]) -> Vec<Expr> {
    let mut exprs = Vec::new();
    for stmt in stmts {
        let parsed = if let Some(m) = stmt.get("match") {
            parse_match(m)
        } else if let Some(c) = stmt.get("counter") {
            Some(vec![Expr::Counter(parse_counter(c))])
        } else if stmt.get("accept").is_some() {
            Some(vec![Expr::Verdict(Verdict::Accept)])
        } else if stmt.get("drop").is_some() {
            Some(vec![Expr::Verdict(Verdict::Drop)])
        } else {
            None
        };
        match parsed {
            Some(parsed) => exprs.extend(parsed),
            None => debug!("Skipping untranslatable statement {stmt}"),
        }
    }
    exprs
}

fn rule_json(rule: &Rule) -> Result<Value> {
    let mut obj = json!({
        "family": rule.table.family.as_ref(),
        "table": rule.table.name,
        "chain": rule.chain,
        "expr": exprs_to_json(&rule.exprs)?,
    });
    if !rule.user_data.is_empty() {
        let comment = hex::encode(&rule.user_data);
        if comment.len() > MAX_COMMENT_LEN {
            return Err(Error::validation(
                "rule id",
                format!("{} bytes is longer than {} bytes", rule.user_data.len(), MAX_COMMENT_LEN / 2),
            ));
        }
        obj["comment"] = json!(comment);
    }
    Ok(obj)
}

/// Rules of a `list chain` response
fn parse_chain_listing(table: &Table, chain: &str, listing: &Value) -> Result<Vec<Rule>> {
    let items = listing["nftables"]
        .as_array()
        .ok_or_else(|| Error::nftables("chain listing without nftables array"))?;

    Ok(items
        .iter()
        .filter_map(|item| item.get("rule"))
        .map(|rule| {
            let user_data = rule["comment"]
                .as_str()
                .map(|c| hex::decode(c).unwrap_or_else(|_| c.as_bytes().to_vec()))
                .unwrap_or_default();
            let exprs = rule["expr"]
                .as_array()
                .map(|stmts| json_to_exprs(stmts))
                .unwrap_or_default();
            Rule {
                table: table.clone(),
                chain: chain.to_string(),
                handle: rule["handle"].as_u64(),
                exprs,
                user_data,
            }
        })
        .collect())
}

#[async_trait]
impl Conn for NftConn {
    fn add_table(&mut self, table: &Table) {
        self.pending.push(json!({ "add": { "table": table_json(table) } }));
    }

    fn add_chain(&mut self, chain: &Chain) {
        self.pending.push(json!({ "add": { "chain": chain_json(chain) } }));
    }

    fn add_set(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        let add = json!({ "add": { "set": set_json(set) } });
        let elements = if elements.is_empty() {
            None
        } else {
            Some(element_command("add", set, elements)?)
        };
        self.pending.push(add);
        self.pending.extend(elements);
        Ok(())
    }

    fn set_add_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        let command = element_command("add", set, elements)?;
        self.pending.push(command);
        Ok(())
    }

    fn set_delete_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        let command = element_command("delete", set, elements)?;
        self.pending.push(command);
        Ok(())
    }

    fn clear_set(&mut self, set: &SetSpec) {
        self.pending.push(json!({ "flush": { "set": set_ref(set) } }));
    }

    async fn get_set_elements(&mut self, set: &SetSpec) -> Result<Vec<SetElement>> {
        let family = set.table.family.as_ref();
        let listing = self
            .list(&["--json", "list", "set", family, &set.table.name, &set.name])
            .await?;
        parse_set_listing(set, &listing)
    }

    fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        let obj = rule_json(rule)?;
        self.pending.push(json!({ "add": { "rule": obj } }));
        Ok(())
    }

    fn del_rule(&mut self, rule: &Rule) -> Result<()> {
        let handle = rule
            .handle
            .ok_or_else(|| Error::validation("rule handle", "only listed rules can be deleted"))?;
        self.pending.push(json!({
            "delete": {
                "rule": {
                    "family": rule.table.family.as_ref(),
                    "table": rule.table.name,
                    "chain": rule.chain,
                    "handle": handle,
                }
            }
        }));
        Ok(())
    }

    async fn get_rules(&mut self, table: &Table, chain: &str) -> Result<Vec<Rule>> {
        let family = table.family.as_ref();
        let listing = self
            .list(&["--json", "--handle", "list", "chain", family, &table.name, chain])
            .await?;
        parse_chain_listing(table, chain, &listing)
    }

    async fn commit(&mut self) -> Result<()> {
        let commands = std::mem::take(&mut self.pending);
        if commands.is_empty() {
            return Ok(());
        }
        let count = commands.len();
        let batch = serde_json::to_string(&Self::batch(commands))?;

        match self.output(true, &["--json", "-f", "-"], Some(batch)).await {
            Ok(_) => {
                debug!("Committed {count} nft commands");
                Ok(())
            }
            Err(e) => {
                error!("nft batch of {count} commands failed: {e}");
                Err(e)
            }
        }
    }

    fn discard(&mut self) {
        self.pending.clear();
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::RuleBuilder;
    use crate::core::expr::{self, TransportProto};
    use crate::core::interval::generate_elements;
    use crate::core::objects::ChainHook;
    use crate::core::set_data::{address_strings_to_set_data, port_strings_to_set_data};
    use crate::core::test_helpers::MockNft;

    fn v4_set() -> SetSpec {
        SetSpec::interval(Table::inet("nftsync"), "blocked_v4", SetKeyType::Ipv4Addr)
    }

    fn port_set() -> SetSpec {
        SetSpec::interval(Table::inet("nftsync"), "ports", SetKeyType::InetService)
    }

    #[test]
    fn test_set_and_element_commands() {
        let mut conn = NftConn::with_command(vec!["nft".to_string()]);
        let set = v4_set();
        let data = address_strings_to_set_data(&["10.0.0.1", "10.0.0.0/8"]).unwrap();
        let elements = generate_elements(set.key_type, &data).unwrap();

        conn.add_set(&set, &elements).unwrap();
        conn.clear_set(&set);
        assert_eq!(conn.pending(), 3);

        assert_eq!(
            conn.pending[0],
            json!({ "add": { "set": {
                "family": "inet", "table": "nftsync", "name": "blocked_v4",
                "type": "ipv4_addr", "flags": ["interval"], "stmt": [{ "counter": null }],
            }}})
        );
        assert_eq!(
            conn.pending[1]["add"]["element"]["elem"],
            json!(["10.0.0.1", { "range": ["10.0.0.0", "10.255.255.255"] }])
        );
        assert_eq!(
            conn.pending[2],
            json!({ "flush": { "set": { "family": "inet", "table": "nftsync", "name": "blocked_v4" } } })
        );

        conn.discard();
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn test_open_ended_interval_renders_to_key_space_top() {
        let set = port_set();
        let data = port_strings_to_set_data(&["65000-65535", "22"]).unwrap();
        let elements = generate_elements(set.key_type, &data).unwrap();
        assert_eq!(
            elements_json(&set, &elements).unwrap(),
            vec![json!({ "range": [65000, 65535] }), json!(22)]
        );
    }

    #[test]
    fn test_base_chain_command() {
        let mut conn = NftConn::with_command(vec!["nft".to_string()]);
        conn.add_table(&Table::inet("nftsync"));
        conn.add_chain(&Chain::filter(Table::inet("nftsync"), "input", ChainHook::Input));
        assert_eq!(
            conn.pending[1]["add"]["chain"],
            json!({
                "family": "inet", "table": "nftsync", "name": "input",
                "type": "filter", "hook": "input", "prio": 0, "policy": "accept",
            })
        );
    }

    #[test]
    fn test_set_listing_forms() {
        let listing = json!({ "nftables": [
            { "metainfo": { "json_schema_version": 1 } },
            { "set": {
                "family": "inet", "name": "blocked_v4", "table": "nftsync",
                "type": "ipv4_addr", "flags": ["interval"],
                "elem": [
                    "192.0.2.7",
                    { "prefix": { "addr": "10.0.0.0", "len": 8 } },
                    { "range": ["198.51.100.1", "198.51.100.9"] },
                    { "elem": { "val": "203.0.113.5", "counter": { "packets": 3, "bytes": 180 } } },
                ],
            }},
        ]});

        let elements = parse_set_listing(&v4_set(), &listing).unwrap();
        assert_eq!(elements.len(), 8);
        assert_eq!(elements[0].key, vec![192, 0, 2, 7]);
        assert_eq!(elements[1], SetElement::end(vec![192, 0, 2, 8]));
        assert_eq!(elements[3].key, vec![11, 0, 0, 0]);
        assert_eq!(elements[5].key, vec![198, 51, 100, 10]);
        assert_eq!(
            elements[6].counter,
            Some(Counter {
                bytes: 180,
                packets: 3
            })
        );
        assert_eq!(elements[0].counter, Some(Counter::default()));
    }

    #[test]
    fn test_empty_set_listing() {
        let listing = json!({ "nftables": [{ "set": { "name": "ports", "type": "inet_service" } }] });
        assert!(parse_set_listing(&port_set(), &listing).unwrap().is_empty());
        let missing = parse_set_listing(&port_set(), &json!({ "nftables": [] }));
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_builder_output_survives_json() {
        let set = v4_set();
        let exprs = RuleBuilder::new()
            .family(AddrFamily::Ipv4)
            .transport(TransportProto::Tcp)
            .source_address_set(&set)
            .destination_port(22)
            .ct_state(CtState::NEW | CtState::ESTABLISHED)
            .counter()
            .build(Verdict::Drop)
            .unwrap();

        let stmts = exprs_to_json(&exprs).unwrap();
        assert_eq!(
            stmts[0],
            json!({ "match": { "op": "==", "left": { "meta": { "key": "nfproto" } }, "right": "ipv4" } })
        );
        assert_eq!(stmts[2]["match"]["right"], json!("@blocked_v4"));
        assert_eq!(
            stmts[3]["match"]["left"],
            json!({ "payload": { "protocol": "th", "field": "dport" } })
        );
        assert_eq!(stmts[4]["match"]["op"], json!("in"));
        assert_eq!(stmts[4]["match"]["right"], json!(["established", "new"]));
        assert_eq!(stmts.last(), Some(&json!({ "drop": null })));

        assert_eq!(json_to_exprs(&stmts), exprs);
    }

    #[test]
    fn test_foreign_statements_skipped() {
        let stmts = vec![
            json!({ "match": { "op": "==", "left": { "payload": { "protocol": "ip", "field": "saddr" } },
                               "right": { "prefix": { "addr": "10.0.0.0", "len": 8 } } } }),
            json!({ "log": { "prefix": "dropped: " } }),
            json!({ "match": { "op": "!=", "left": { "meta": { "key": "iifname" } }, "right": "lo" } }),
            json!({ "accept": null }),
        ];
        let exprs = json_to_exprs(&stmts);
        assert_eq!(exprs.len(), 3);
        assert_eq!(exprs[0], expr::meta(MetaKey::Iifname));
        assert!(matches!(&exprs[1], Expr::Cmp { op: CmpOp::Neq, data } if data.len() == IFNAMSIZ && data[0] == b'l'));
        assert_eq!(exprs[2], expr::accept());
    }

    #[test]
    fn test_chain_listing() {
        let table = Table::inet("nftsync");
        let listing = json!({ "nftables": [
            { "metainfo": { "json_schema_version": 1 } },
            { "chain": { "family": "inet", "table": "nftsync", "name": "input", "handle": 1 } },
            { "rule": { "family": "inet", "table": "nftsync", "chain": "input", "handle": 4,
                        "comment": "dead",
                        "expr": [ { "counter": { "packets": 2, "bytes": 120 } }, { "drop": null } ] } },
            { "rule": { "family": "inet", "table": "nftsync", "chain": "input", "handle": 5,
                        "expr": [ { "accept": null } ] } },
        ]});

        let rules = parse_chain_listing(&table, "input", &listing).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].handle, Some(4));
        assert_eq!(rules[0].user_data, vec![0xde, 0xad]);
        assert_eq!(
            rules[0].exprs[0],
            Expr::Counter(Counter {
                bytes: 120,
                packets: 2
            })
        );
        assert!(rules[1].user_data.is_empty());
    }

    #[test]
    fn test_rule_commands() {
        let mut conn = NftConn::with_command(vec!["nft".to_string()]);
        let mut rule = Rule {
            table: Table::inet("nftsync"),
            chain: "input".to_string(),
            handle: None,
            exprs: vec![expr::drop()],
            user_data: vec![0xca, 0xfe],
        };
        conn.add_rule(&rule).unwrap();
        assert_eq!(conn.pending[0]["add"]["rule"]["comment"], json!("cafe"));

        assert!(conn.del_rule(&rule).is_err());
        rule.handle = Some(9);
        conn.del_rule(&rule).unwrap();
        assert_eq!(conn.pending[1]["delete"]["rule"]["handle"], json!(9));

        rule.user_data = vec![1; 65];
        assert!(matches!(conn.add_rule(&rule), Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn test_commit_sends_one_batch() {
        let mock = MockNft::new();
        let mut conn = mock.conn();
        let set = port_set();

        conn.commit().await.unwrap();
        assert!(mock.calls().is_empty());

        conn.add_table(&set.table);
        conn.add_set(&set, &[]).unwrap();
        conn.commit().await.unwrap();
        assert_eq!(conn.pending(), 0);

        let batches = mock.batches();
        assert_eq!(batches.len(), 1);
        let items = batches[0]["nftables"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["metainfo"]["json_schema_version"], json!(1));
        assert_eq!(items[2]["add"]["set"]["type"], json!("inet_service"));
        assert_eq!(mock.calls(), vec!["--json -f -"]);
    }

    #[tokio::test]
    async fn test_commit_failure_reports_stderr() {
        let mock = MockNft::new();
        mock.fail_with("Error: Could not process rule: Operation not permitted\n");
        let mut conn = mock.conn();
        conn.add_table(&Table::inet("nftsync"));

        let err = conn.commit().await.unwrap_err();
        assert_eq!(conn.pending(), 0);
        match err {
            Error::Nftables {
                message, exit_code, ..
            } => {
                assert_eq!(message, "Error: Could not process rule: Operation not permitted");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listings_through_command() {
        let mock = MockNft::new();
        mock.serve_set(
            "ports",
            &json!({ "nftables": [{ "set": { "name": "ports", "elem": [22, { "range": [8000, 8080] }] } }] }),
        );
        let mut conn = mock.conn();

        let elements = conn.get_set_elements(&port_set()).await.unwrap();
        assert_eq!(elements.len(), 4);
        assert_eq!(elements[3], SetElement::end(vec![0x1f, 0x91]));
        assert_eq!(mock.calls(), vec!["--json list set inet nftsync ports"]);

        let missing = conn.get_rules(&Table::inet("nftsync"), "input").await;
        assert!(matches!(missing, Err(Error::Nftables { .. })));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let conn = NftConn::with_command(vec!["/nonexistent/nft".to_string()]);
        let err = conn.output(false, &["--version"], None).await.unwrap_err();
        assert!(err.to_string().contains("command not found"));
    }
}
