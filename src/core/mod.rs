//! Core set and rule reconciliation
//!
//! - [`objects`]: tables, chains, sets, elements and rules as the kernel sees them
//! - [`set_data`]: addresses, prefixes, ranges and ports a set should hold
//! - [`interval`]: conversion between set data and interval elements
//! - [`delta`]: add/remove computation between two memberships
//! - [`expr`] and [`builder`]: rule expressions and the fluent rule builder
//! - [`conn`]: the queued, commit-based kernel connection
//! - [`nft_json`]: [`Conn`](conn::Conn) over `nft --json`
//! - [`memory`]: in-process kernel model
//! - [`set`] and [`rule`]: the reconciled objects
//! - [`manager`]: periodic reconciliation loops
//! - [`error`]: error types

pub mod builder;
pub mod conn;
pub mod delta;
pub mod error;
pub mod expr;
pub mod interval;
pub mod manager;
pub mod memory;
pub mod nft_json;
pub mod objects;
pub mod rule;
pub mod set;
pub mod set_data;

#[cfg(test)]
pub mod test_helpers;
