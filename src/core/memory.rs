//! In-process kernel model
//!
//! [`MemoryConn`] implements [`Conn`] against an in-memory table/chain/set
//! store that behaves like nf_tables where it matters for reconciliation:
//!
//! - mutations are queued and applied in order on commit
//! - a failing commit leaves the kernel untouched, unless a partial failure
//!   was injected with [`MemoryConn::fail_next_commit`]
//! - interval elements may not overlap; deleting a missing element or rule fails
//! - rules get kernel handles on commit
//! - sets and rules keep byte/packet counters, bumped by `record_*_traffic`
//!
//! Several connections can share one kernel through [`MemoryConn::connect`],
//! the way separate netlink sockets see the same ruleset.

use crate::core::conn::Conn;
use crate::core::error::{Error, Result};
use crate::core::expr::Expr;
use crate::core::objects::{Chain, Counter, Rule, SetElement, SetSpec, Table};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Failure injected into the next commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFailure {
    /// Nothing is applied
    Atomic,
    /// The first `n` queued operations are applied, the rest are lost
    Partial(usize),
}

#[derive(Debug, Clone)]
enum Op {
    AddTable(Table),
    AddChain(Chain),
    AddSet(SetSpec, Vec<SetElement>),
    AddElements(SetSpec, Vec<SetElement>),
    DeleteElements(SetSpec, Vec<SetElement>),
    ClearSet(SetSpec),
    AddRule(Rule),
    DelRule(Table, String, u64),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::AddTable(t) => write!(f, "add table {t}"),
            Op::AddChain(c) => write!(f, "add chain {c}"),
            Op::AddSet(s, e) => write!(f, "add set {s} ({} elements)", e.len()),
            Op::AddElements(s, e) => write!(f, "add element {s} ({} elements)", e.len()),
            Op::DeleteElements(s, e) => write!(f, "delete element {s} ({} elements)", e.len()),
            Op::ClearSet(s) => write!(f, "flush set {s}"),
            Op::AddRule(r) => write!(f, "add rule {}/{}", r.table.name, r.chain),
            Op::DelRule(t, c, h) => write!(f, "delete rule {}/{c} handle {h}", t.name),
        }
    }
}

/// Half-open interval; `end == None` reaches the top of the key space
#[derive(Debug, Clone)]
struct Interval {
    end: Option<Vec<u8>>,
    counter: Counter,
}

#[derive(Debug, Clone)]
struct KernelSet {
    spec: SetSpec,
    intervals: BTreeMap<Vec<u8>, Interval>,
}

#[derive(Debug, Clone, Default)]
struct KernelTable {
    chains: BTreeMap<String, Vec<Rule>>,
    sets: BTreeMap<String, KernelSet>,
}

#[derive(Debug, Clone, Default)]
struct Kernel {
    tables: HashMap<Table, KernelTable>,
    next_handle: u64,
    journal: Vec<String>,
    commits: usize,
    fail_next: Option<CommitFailure>,
}

fn overlaps(a_start: &[u8], a_end: Option<&[u8]>, b_start: &[u8], b_end: Option<&[u8]>) -> bool {
    let a_before_b_end = b_end.is_none_or(|e| a_start < e);
    let b_before_a_end = a_end.is_none_or(|e| b_start < e);
    a_before_b_end && b_before_a_end
}

/// Pairs start elements with the end element that follows them
fn pair_elements(set: &SetSpec, elements: &[SetElement]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
    let mut out = Vec::new();
    let mut iter = elements.iter().peekable();
    while let Some(element) = iter.next() {
        if element.key.len() != set.key_type.key_len() {
            return Err(Error::nftables(format!(
                "Error: element key length {} does not match {} in set {set}",
                element.key.len(),
                set.key_type
            )));
        }
        if element.interval_end {
            return Err(Error::nftables(format!(
                "Error: interval end without start in set {set}"
            )));
        }
        let end = iter
            .next_if(|next| next.interval_end)
            .map(|next| next.key.clone());
        if let Some(end) = &end
            && end <= &element.key
        {
            return Err(Error::nftables(format!("Error: empty interval in set {set}")));
        }
        out.push((element.key.clone(), end));
    }
    Ok(out)
}

impl Kernel {
    fn table_mut(&mut self, table: &Table) -> Result<&mut KernelTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::nftables(format!("Error: No such file or directory; table {table} does not exist")))
    }

    fn set_mut(&mut self, spec: &SetSpec) -> Result<&mut KernelSet> {
        self.table_mut(&spec.table)?
            .sets
            .get_mut(&spec.name)
            .ok_or_else(|| Error::nftables(format!("Error: No such file or directory; set {spec} does not exist")))
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::AddTable(table) => {
                self.tables.entry(table.clone()).or_default();
            }
            Op::AddChain(chain) => {
                self.table_mut(&chain.table)?
                    .chains
                    .entry(chain.name.clone())
                    .or_default();
            }
            Op::AddSet(spec, elements) => {
                if !spec.interval {
                    return Err(Error::validation(
                        "set",
                        "the in-memory kernel only models interval sets",
                    ));
                }
                let table = self.table_mut(&spec.table)?;
                if let Some(existing) = table.sets.get(&spec.name)
                    && existing.spec.key_type != spec.key_type
                {
                    return Err(Error::nftables(format!(
                        "Error: set {spec} already exists with key type {}",
                        existing.spec.key_type
                    )));
                }
                table
                    .sets
                    .entry(spec.name.clone())
                    .or_insert_with(|| KernelSet {
                        spec: spec.clone(),
                        intervals: BTreeMap::new(),
                    });
                self.add_elements(spec, elements)?;
            }
            Op::AddElements(spec, elements) => self.add_elements(spec, elements)?,
            Op::DeleteElements(spec, elements) => {
                let pairs = pair_elements(spec, elements)?;
                let set = self.set_mut(spec)?;
                for (start, end) in pairs {
                    match set.intervals.get(&start) {
                        Some(existing) if existing.end == end => {
                            set.intervals.remove(&start);
                        }
                        _ => {
                            return Err(Error::nftables(format!(
                                "Error: Could not process rule: No such file or directory; element not in set {spec}"
                            )));
                        }
                    }
                }
            }
            Op::ClearSet(spec) => self.set_mut(spec)?.intervals.clear(),
            Op::AddRule(rule) => {
                let lookups: Vec<&str> = rule
                    .exprs
                    .iter()
                    .filter_map(|e| match e {
                        Expr::Lookup { set } => Some(set.as_str()),
                        _ => None,
                    })
                    .collect();
                let handle = self.next_handle + 1;
                let table = self.table_mut(&rule.table)?;
                if let Some(missing) = lookups.iter().find(|s| !table.sets.contains_key(**s)) {
                    return Err(Error::nftables(format!(
                        "Error: No such file or directory; set {missing} does not exist"
                    )));
                }
                let rules = table.chains.get_mut(&rule.chain).ok_or_else(|| {
                    Error::nftables(format!(
                        "Error: No such file or directory; chain {}/{} does not exist",
                        rule.table.name, rule.chain
                    ))
                })?;
                let mut stored = rule.clone();
                stored.handle = Some(handle);
                rules.push(stored);
                self.next_handle = handle;
            }
            Op::DelRule(table, chain, handle) => {
                let rules = self
                    .table_mut(table)?
                    .chains
                    .get_mut(chain)
                    .ok_or_else(|| Error::nftables(format!("Error: chain {chain} does not exist")))?;
                let before = rules.len();
                rules.retain(|r| r.handle != Some(*handle));
                if rules.len() == before {
                    return Err(Error::nftables(format!(
                        "Error: Could not process rule: No such file or directory; handle {handle}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn add_elements(&mut self, spec: &SetSpec, elements: &[SetElement]) -> Result<()> {
        let pairs = pair_elements(spec, elements)?;
        let set = self.set_mut(spec)?;
        for (start, end) in pairs {
            if let Some(existing) = set.intervals.get(&start)
                && existing.end == end
            {
                continue;
            }
            let clash = set
                .intervals
                .iter()
                .any(|(s, i)| overlaps(&start, end.as_deref(), s, i.end.as_deref()));
            if clash {
                return Err(Error::nftables(format!(
                    "Error: Could not process rule: File exists; interval overlaps with an existing one in set {spec}"
                )));
            }
            set.intervals.insert(
                start,
                Interval {
                    end,
                    counter: Counter::default(),
                },
            );
        }
        Ok(())
    }
}

/// In-memory [`Conn`]
#[derive(Debug, Default)]
pub struct MemoryConn {
    kernel: Arc<Mutex<Kernel>>,
    pending: Vec<Op>,
}

impl MemoryConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens another connection to the same kernel, with its own queue
    pub fn connect(&self) -> Self {
        Self {
            kernel: Arc::clone(&self.kernel),
            pending: Vec::new(),
        }
    }

    fn kernel(&self) -> Result<MutexGuard<'_, Kernel>> {
        self.kernel
            .lock()
            .map_err(|_| Error::Internal("memory kernel lock poisoned".to_string()))
    }

    /// Makes the next commit fail; the injection is consumed by that commit
    pub fn fail_next_commit(&self, failure: CommitFailure) -> Result<()> {
        self.kernel()?.fail_next = Some(failure);
        Ok(())
    }

    /// Descriptions of every applied operation and commit outcome
    pub fn journal(&self) -> Result<Vec<String>> {
        Ok(self.kernel()?.journal.clone())
    }

    /// Number of commits attempted, successful or not
    pub fn commit_count(&self) -> Result<usize> {
        Ok(self.kernel()?.commits)
    }

    /// Counts traffic against the interval of `set` containing `key`.
    ///
    /// Returns whether an interval matched.
    pub fn record_set_traffic(&self, set: &SetSpec, key: &[u8], bytes: u64) -> Result<bool> {
        let mut kernel = self.kernel()?;
        let set = kernel.set_mut(set)?;
        let hit = set
            .intervals
            .range_mut(..=key.to_vec())
            .next_back()
            .filter(|(_, i)| i.end.as_deref().is_none_or(|e| key < e));
        Ok(match hit {
            Some((_, interval)) => {
                interval.counter.bytes += bytes;
                interval.counter.packets += 1;
                true
            }
            None => false,
        })
    }

    /// Counts traffic against the first counter expression of the rule
    /// whose annotation equals `user_data`
    pub fn record_rule_traffic(
        &self,
        table: &Table,
        chain: &str,
        user_data: &[u8],
        bytes: u64,
    ) -> Result<bool> {
        let mut kernel = self.kernel()?;
        let Some(rules) = kernel.table_mut(table)?.chains.get_mut(chain) else {
            return Ok(false);
        };
        let counter = rules
            .iter_mut()
            .filter(|r| r.user_data == user_data)
            .flat_map(|r| r.exprs.iter_mut())
            .find_map(|e| match e {
                Expr::Counter(c) => Some(c),
                _ => None,
            });
        Ok(match counter {
            Some(c) => {
                c.bytes += bytes;
                c.packets += 1;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl Conn for MemoryConn {
    fn add_table(&mut self, table: &Table) {
        self.pending.push(Op::AddTable(table.clone()));
    }

    fn add_chain(&mut self, chain: &Chain) {
        self.pending.push(Op::AddChain(chain.clone()));
    }

    fn add_set(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        self.pending.push(Op::AddSet(set.clone(), elements.to_vec()));
        Ok(())
    }

    fn set_add_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        self.pending
            .push(Op::AddElements(set.clone(), elements.to_vec()));
        Ok(())
    }

    fn set_delete_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()> {
        self.pending
            .push(Op::DeleteElements(set.clone(), elements.to_vec()));
        Ok(())
    }

    fn clear_set(&mut self, set: &SetSpec) {
        self.pending.push(Op::ClearSet(set.clone()));
    }

    async fn get_set_elements(&mut self, set: &SetSpec) -> Result<Vec<SetElement>> {
        let mut kernel = self.kernel()?;
        let stored = kernel.set_mut(set).map_err(|_| Error::NotFound(format!("set {set}")))?;
        let with_counter = stored.spec.counter;
        let mut out = Vec::with_capacity(stored.intervals.len() * 2);
        for (start, interval) in &stored.intervals {
            let mut element = SetElement::start(start.clone());
            if with_counter {
                element.counter = Some(interval.counter);
            }
            out.push(element);
            if let Some(end) = &interval.end {
                out.push(SetElement::end(end.clone()));
            }
        }
        Ok(out)
    }

    fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        self.pending.push(Op::AddRule(rule.clone()));
        Ok(())
    }

    fn del_rule(&mut self, rule: &Rule) -> Result<()> {
        let handle = rule.handle.ok_or_else(|| {
            Error::validation("rule", "a rule can only be deleted by its kernel handle")
        })?;
        self.pending
            .push(Op::DelRule(rule.table.clone(), rule.chain.clone(), handle));
        Ok(())
    }

    async fn get_rules(&mut self, table: &Table, chain: &str) -> Result<Vec<Rule>> {
        let mut kernel = self.kernel()?;
        let stored = kernel
            .table_mut(table)
            .map_err(|_| Error::NotFound(format!("table {table}")))?;
        stored
            .chains
            .get(chain)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("chain {}/{chain}", table.name)))
    }

    async fn commit(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.pending);
        let mut kernel = self.kernel()?;
        kernel.commits += 1;

        match kernel.fail_next.take() {
            Some(CommitFailure::Atomic) => {
                kernel.journal.push("commit failed (injected)".to_string());
                return Err(Error::nftables("Error: injected commit failure"));
            }
            Some(CommitFailure::Partial(applied)) => {
                for op in ops.iter().take(applied) {
                    kernel.apply(op)?;
                    kernel.journal.push(op.to_string());
                }
                kernel.journal.push(format!(
                    "commit failed (injected) after {} of {} operations",
                    applied.min(ops.len()),
                    ops.len()
                ));
                return Err(Error::nftables("Error: injected partial commit failure"));
            }
            None => {}
        }

        let mut staged = Kernel {
            journal: Vec::new(),
            ..kernel.clone()
        };
        for op in &ops {
            if let Err(err) = staged.apply(op) {
                kernel.journal.push(format!("commit failed at: {op}"));
                return Err(err);
            }
        }

        let mut journal = std::mem::take(&mut kernel.journal);
        journal.extend(ops.iter().map(ToString::to_string));
        journal.push("commit".to_string());
        staged.journal = journal;
        staged.commits = kernel.commits;
        *kernel = staged;
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}
