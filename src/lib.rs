//! nftsync - declarative nftables sets and rules
//!
//! Keeps interval sets of addresses, prefixes, ranges and ports, and the
//! rules that reference them, converged to a desired state that is
//! re-evaluated on a fixed interval.
//!
//! # Architecture
//!
//! - [`core`] - Set and rule reconciliation, kernel connections, managers
//! - [`source`] - Desired state read from list files
//! - [`blocklist`] - The input blocklist: sets, drop rules and their managers
//! - [`config`] - Configuration file
//! - [`elevation`] - Running `nft` with privileges
//! - [`telemetry`] - Logging and metrics

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod blocklist;
pub mod config;
pub mod core;
pub mod elevation;
pub mod source;
pub mod telemetry;

// Re-export commonly used types
pub use core::builder::RuleBuilder;
pub use core::conn::Conn;
pub use core::error::{Error, Result};
pub use core::expr::{AddrFamily, TransportProto, Verdict};
pub use core::manager::{Manager, ManagerState, RuleManager, SetManager, TickOutcome};
pub use core::memory::MemoryConn;
pub use core::nft_json::NftConn;
pub use core::objects::{Chain, ChainHook, SetKeyType, Table};
pub use core::rule::{RuleData, RuleId, RuleTarget};
pub use core::set::{MembershipMode, Set, UpdateSummary};
pub use core::set_data::SetData;
