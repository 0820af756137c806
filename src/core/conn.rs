//! Kernel connection abstraction
//!
//! Every mutation on a [`Conn`] is queued and only takes effect on
//! [`Conn::commit`]. Listings always reflect committed kernel state, never the
//! pending queue. [`Conn::discard`] drops whatever is queued.
//!
//! Implementations:
//!
//! - [`NftConn`](crate::core::nft_json::NftConn): drives the `nft` binary in JSON mode
//! - [`MemoryConn`](crate::core::memory::MemoryConn): in-process kernel model

use crate::core::error::Result;
use crate::core::objects::{Chain, Rule, SetElement, SetSpec, Table};
use async_trait::async_trait;

#[async_trait]
pub trait Conn: Send {
    fn add_table(&mut self, table: &Table);

    fn add_chain(&mut self, chain: &Chain);

    /// Queues creation of a set, populated with `elements`
    fn add_set(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()>;

    fn set_add_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()>;

    fn set_delete_elements(&mut self, set: &SetSpec, elements: &[SetElement]) -> Result<()>;

    /// Queues removal of every element of the set
    fn clear_set(&mut self, set: &SetSpec);

    /// Committed elements of the set, with counters when the set keeps them
    async fn get_set_elements(&mut self, set: &SetSpec) -> Result<Vec<SetElement>>;

    fn add_rule(&mut self, rule: &Rule) -> Result<()>;

    /// Queues deletion of a listed rule; the rule must carry its handle
    fn del_rule(&mut self, rule: &Rule) -> Result<()>;

    /// Committed rules of a chain, in chain order, with handles
    async fn get_rules(&mut self, table: &Table, chain: &str) -> Result<Vec<Rule>>;

    /// Applies everything queued since the last commit or discard.
    ///
    /// The queue is empty afterwards whether or not the commit succeeded.
    async fn commit(&mut self) -> Result<()>;

    fn discard(&mut self);

    /// Number of queued operations
    fn pending(&self) -> usize;
}
