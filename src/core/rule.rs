//! Identity-tracked rules in one (table, chain)
//!
//! Every managed rule carries a caller-chosen [`RuleId`] in the kernel rule's
//! annotation. Identity is the only thing compared: two rules with the same
//! id are the same rule, whatever their expressions.

use crate::core::conn::Conn;
use crate::core::delta::delta_by;
use crate::core::error::{Error, Result};
use crate::core::expr::{AddrFamily, Expr, MetaKey, Verdict};
use crate::core::objects::{Counter, Rule, Table};
use crate::core::set::UpdateSummary;
use std::fmt;

/// Opaque rule identity, rendered as hex
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(Vec<u8>);

impl RuleId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|e| Error::validation("rule id", format!("'{s}': {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleId({self})")
    }
}

impl From<Vec<u8>> for RuleId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RuleId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A desired rule: identity plus match expressions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleData {
    pub id: RuleId,
    pub exprs: Vec<Expr>,
}

impl RuleData {
    pub fn new(id: impl Into<RuleId>, exprs: Vec<Expr>) -> Self {
        Self {
            id: id.into(),
            exprs,
        }
    }

    /// Counter of the first counter expression, if the rule has one
    pub fn counters(&self) -> Option<Counter> {
        self.exprs.iter().find_map(|e| match e {
            Expr::Counter(c) => Some(*c),
            _ => None,
        })
    }
}

/// Per-rule usage, classified from the rule's expressions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUsageCounter {
    pub id: RuleId,
    /// Family from the `meta nfproto` comparison, if the rule has one
    pub protocol: Option<AddrFamily>,
    pub verdict: Verdict,
    pub bytes: u64,
    pub packets: u64,
}

impl RuleUsageCounter {
    fn classify(rule: &Rule) -> Self {
        let mut protocol = None;
        let mut verdict = Verdict::Accept;
        let mut counter = Counter::default();
        let mut after_nfproto = false;

        for expr in &rule.exprs {
            match expr {
                Expr::Meta { key } => after_nfproto = *key == MetaKey::Nfproto,
                Expr::Cmp { data, .. } if after_nfproto => {
                    protocol = data.first().copied().and_then(AddrFamily::from_nfproto);
                    after_nfproto = false;
                }
                Expr::Counter(c) => counter = *c,
                Expr::Verdict(v) => verdict = *v,
                _ => after_nfproto = false,
            }
        }

        Self {
            id: RuleId::new(rule.user_data.clone()),
            protocol,
            verdict,
            bytes: counter.bytes,
            packets: counter.packets,
        }
    }
}

/// The (table, chain) a set of managed rules lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTarget {
    table: Table,
    chain: String,
}

impl RuleTarget {
    pub fn new(table: Table, chain: impl Into<String>) -> Self {
        Self {
            table,
            chain: chain.into(),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn to_rule(&self, data: &RuleData) -> Rule {
        Rule {
            table: self.table.clone(),
            chain: self.chain.clone(),
            handle: None,
            exprs: data.exprs.clone(),
            user_data: data.id.as_bytes().to_vec(),
        }
    }

    async fn find(&self, conn: &mut dyn Conn, id: &RuleId) -> Result<Option<Rule>> {
        Ok(self
            .get(conn)
            .await?
            .into_iter()
            .find(|r| r.user_data == id.as_bytes()))
    }

    /// Queues the rule unless one with its id is already committed.
    ///
    /// Returns whether anything was queued.
    pub async fn add(&self, conn: &mut dyn Conn, rule: &RuleData) -> Result<bool> {
        if self.find(conn, &rule.id).await?.is_some() {
            return Ok(false);
        }
        conn.add_rule(&self.to_rule(rule))?;
        Ok(true)
    }

    /// Queues deletion of the committed rule with this id, if there is one
    pub async fn delete(&self, conn: &mut dyn Conn, rule: &RuleData) -> Result<bool> {
        match self.find(conn, &rule.id).await? {
            Some(existing) => {
                conn.del_rule(&existing)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn exists(&self, conn: &mut dyn Conn, rule: &RuleData) -> Result<bool> {
        Ok(self.find(conn, &rule.id).await?.is_some())
    }

    /// Queues the deletions and additions that make the chain's managed
    /// rules match `desired` by id. Deletions are queued first.
    ///
    /// Rules without an id are not managed and are left in place.
    pub async fn update(&self, conn: &mut dyn Conn, desired: &[RuleData]) -> Result<UpdateSummary> {
        let mut current = self.get(conn).await?;
        current.retain(|r| !r.user_data.is_empty());
        let delta = delta_by(
            &current,
            desired,
            |r: &Rule| r.user_data.clone(),
            |d: &RuleData| d.id.as_bytes().to_vec(),
        );

        for rule in &delta.remove {
            conn.del_rule(rule)?;
        }
        for rule in &delta.add {
            conn.add_rule(&self.to_rule(rule))?;
        }

        Ok(UpdateSummary {
            modified: !delta.is_empty(),
            added: delta.add.len(),
            removed: delta.remove.len(),
        })
    }

    /// Committed rules of the chain
    pub async fn get(&self, conn: &mut dyn Conn) -> Result<Vec<Rule>> {
        conn.get_rules(&self.table, &self.chain).await
    }

    pub async fn get_rule_usage_counters(
        &self,
        conn: &mut dyn Conn,
    ) -> Result<Vec<RuleUsageCounter>> {
        Ok(self
            .get(conn)
            .await?
            .iter()
            .map(RuleUsageCounter::classify)
            .collect())
    }
}
