//! Input blocklist
//!
//! An inet table with an input filter chain, an IPv4 and an IPv6 address set,
//! a port set, and one counted drop rule per family matching TCP traffic from
//! a listed address to a listed port.

use crate::config::AppConfig;
use crate::core::builder::RuleBuilder;
use crate::core::conn::Conn;
use crate::core::error::{Error, Result};
use crate::core::expr::{AddrFamily, TransportProto, Verdict};
use crate::core::manager::{Manager, RuleManager, SetManager};
use crate::core::objects::{Chain, ChainHook, SetKeyType, SetSpec, Table};
use crate::core::rule::{RuleData, RuleTarget};
use crate::core::set::{MembershipMode, Set};
use crate::source::ListSource;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

pub const IPV4_RULE_ID: [u8; 4] = [0xd, 0xe, 0xa, 0xd];
pub const IPV6_RULE_ID: [u8; 4] = [0xc, 0xa, 0xf, 0xe];

#[derive(Debug, Clone)]
pub struct Blocklist {
    table: Table,
    chain: String,
    ipv4_set: String,
    ipv6_set: String,
    port_set: String,
    addresses: ListSource,
    ports: ListSource,
    mode: MembershipMode,
    interval: Duration,
    clear_on_error: bool,
}

impl Blocklist {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            table: Table::inet(&config.table),
            chain: config.chain.clone(),
            ipv4_set: config.ipv4_set.clone(),
            ipv6_set: config.ipv6_set.clone(),
            port_set: config.port_set.clone(),
            addresses: ListSource::new(&config.address_list),
            ports: ListSource::new(&config.port_list),
            mode: config.membership_mode,
            interval: config.refresh_interval(),
            clear_on_error: config.clear_on_error,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn chain(&self) -> Chain {
        Chain::filter(self.table.clone(), &self.chain, ChainHook::Input)
    }

    pub fn rule_target(&self) -> RuleTarget {
        RuleTarget::new(self.table.clone(), &self.chain)
    }

    fn set_names(&self) -> [(&str, SetKeyType); 3] {
        [
            (self.ipv4_set.as_str(), SetKeyType::Ipv4Addr),
            (self.ipv6_set.as_str(), SetKeyType::Ipv6Addr),
            (self.port_set.as_str(), SetKeyType::InetService),
        ]
    }

    /// List file feeding a set of `key_type`
    pub fn source(&self, key_type: SetKeyType) -> &ListSource {
        match key_type {
            SetKeyType::InetService => &self.ports,
            _ => &self.addresses,
        }
    }

    fn spec(&self, name: &str, key_type: SetKeyType) -> SetSpec {
        SetSpec::interval(self.table.clone(), name, key_type)
    }

    /// The two drop rules, IPv4 first
    pub fn rules(&self) -> Result<Vec<RuleData>> {
        let ports = self.spec(&self.port_set, SetKeyType::InetService);
        let families = [
            (IPV4_RULE_ID, AddrFamily::Ipv4, self.spec(&self.ipv4_set, SetKeyType::Ipv4Addr)),
            (IPV6_RULE_ID, AddrFamily::Ipv6, self.spec(&self.ipv6_set, SetKeyType::Ipv6Addr)),
        ];

        families
            .into_iter()
            .map(|(id, family, addresses)| {
                let exprs = RuleBuilder::new()
                    .family(family)
                    .transport(TransportProto::Tcp)
                    .source_address_set(&addresses)
                    .destination_port_set(&ports)
                    .counter()
                    .build(Verdict::Drop)?;
                Ok(RuleData::new(id.to_vec(), exprs))
            })
            .collect()
    }

    /// Creates every object, fills the sets from the list files, adds the
    /// rules and commits.
    ///
    /// Existing sets are emptied and refilled; rules already present by id
    /// are left alone.
    pub async fn install(&self, conn: &mut dyn Conn) -> Result<Vec<Set>> {
        conn.add_table(&self.table);
        conn.add_chain(&self.chain());

        let mut sets = Vec::with_capacity(3);
        for (name, key_type) in self.set_names() {
            let set = Set::create(conn, &self.table, name, key_type)
                .await?
                .with_membership_mode(self.mode);
            sets.push(set);
        }

        for set in &mut sets {
            let data = self.source(set.key_type()).set_data(set.key_type())?;
            set.clear_and_add_elements(conn, &data)?;
            info!("{}: {} entries", set.spec(), data.len());
        }

        let target = self.rule_target();
        for rule in self.rules()? {
            target.add(conn, &rule).await?;
        }
        conn.commit().await?;
        Ok(sets)
    }

    /// The three sets, assumed to exist already
    pub fn attach_sets(&self) -> Result<Vec<Set>> {
        self.set_names()
            .into_iter()
            .map(|(name, key_type)| {
                Ok(Set::attach(&self.table, name, key_type)?.with_membership_mode(self.mode))
            })
            .collect()
    }

    /// One manager per set, re-reading its list file every tick, plus one
    /// for the rules. `connect` is called once per manager.
    pub fn managers<C, F>(&self, sets: Vec<Set>, mut connect: F) -> Result<Managers<C>>
    where
        C: Conn,
        F: FnMut() -> C,
    {
        let sets = sets
            .into_iter()
            .map(|set| {
                let key_type = set.key_type();
                let source = self.source(key_type).clone();
                Manager::new(
                    set,
                    connect(),
                    move || source.set_data(key_type).map_err(Into::into),
                    self.interval,
                )
                .clear_on_error(self.clear_on_error)
            })
            .collect();

        let rules = self.rules()?;
        let rules = Manager::new(
            self.rule_target(),
            connect(),
            move || Ok(rules.clone()),
            self.interval,
        );

        Ok(Managers { sets, rules })
    }
}

/// The running side of a [`Blocklist`]
#[derive(Debug)]
pub struct Managers<C: Conn> {
    pub sets: Vec<SetManager<C>>,
    pub rules: RuleManager<C>,
}

impl<C: Conn + 'static> Managers<C> {
    /// Runs every manager on its own task until shutdown or a signal
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let handles: Vec<_> = self
            .sets
            .into_iter()
            .map(|m| m.spawn(shutdown.clone()))
            .collect();
        let rules = self.rules.spawn(shutdown);

        let mut sets = Vec::with_capacity(handles.len());
        for handle in handles {
            sets.push(handle.await.map_err(join_error)?);
        }
        let rules = rules.await.map_err(join_error)?;
        Ok(Self { sets, rules })
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("manager task failed: {e}"))
}
