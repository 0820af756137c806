//! Managed interval sets
//!
//! A [`Set`] owns one kernel interval set and converges its membership to a
//! list of [`SetData`]. Element generation and validation happen before any
//! operation is queued, so invalid input never reaches the kernel.
//!
//! Nothing here commits except [`Set::create`]; callers (or the manager)
//! commit the queued batch.

use crate::core::conn::Conn;
use crate::core::delta::delta;
use crate::core::error::{Error, Result};
use crate::core::interval::{canonicalize, generate_elements, init_data, parse_elements};
use crate::core::objects::{SetKeyType, SetSpec, Table};
use crate::core::set_data::{CountedSetData, SetData};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where [`Set::update_elements`] takes current membership from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MembershipMode {
    /// List the kernel set on every update
    #[default]
    Refetch,
    /// Trust the membership recorded by the previous update
    Cached,
}

/// What an update queued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub modified: bool,
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct Set {
    spec: SetSpec,
    mode: MembershipMode,
    cache: Option<Vec<SetData>>,
}

impl Set {
    /// Creates the kernel set and leaves it empty.
    ///
    /// The set is created holding one documentation-range placeholder, which
    /// is then cleared. Both steps are committed. Creating a set that
    /// already exists with the same key type leaves it empty as well.
    pub async fn create(
        conn: &mut dyn Conn,
        table: &Table,
        name: &str,
        key_type: SetKeyType,
    ) -> Result<Self> {
        let set = Self::attach(table, name, key_type)?;
        let seed = generate_elements(key_type, &[init_data(key_type)?])?;

        // An existing set may already hold an interval covering the seed
        conn.add_set(&set.spec, &[])?;
        conn.clear_set(&set.spec);
        conn.set_add_elements(&set.spec, &seed)?;
        conn.commit().await?;
        conn.clear_set(&set.spec);
        conn.commit().await?;

        debug!("Created {key_type} set {}", set.spec);
        Ok(set)
    }

    /// Wraps a set that already exists in the kernel; nothing is queued
    pub fn attach(table: &Table, name: &str, key_type: SetKeyType) -> Result<Self> {
        if !key_type.is_supported() {
            return Err(Error::UnsupportedKeyType(key_type));
        }
        Ok(Self {
            spec: SetSpec::interval(table.clone(), name, key_type),
            mode: MembershipMode::default(),
            cache: None,
        })
    }

    pub fn with_membership_mode(mut self, mode: MembershipMode) -> Self {
        self.mode = mode;
        self.cache = None;
        self
    }

    pub fn spec(&self) -> &SetSpec {
        &self.spec
    }

    pub fn key_type(&self) -> SetKeyType {
        self.spec.key_type
    }

    pub fn membership_mode(&self) -> MembershipMode {
        self.mode
    }

    /// Forgets cached membership; the next cached-mode update replaces the set
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    fn remember(&mut self, desired: Vec<SetData>) {
        if self.mode == MembershipMode::Cached {
            self.cache = Some(desired);
        }
    }

    /// Queues a clear of the set followed by one batch add of `desired`
    pub fn clear_and_add_elements(
        &mut self,
        conn: &mut dyn Conn,
        desired: &[SetData],
    ) -> Result<()> {
        let canonical = canonicalize(self.spec.key_type, desired)?;
        let elements = generate_elements(self.spec.key_type, &canonical)?;

        conn.clear_set(&self.spec);
        if !elements.is_empty() {
            conn.set_add_elements(&self.spec, &elements)?;
        }
        self.remember(canonical);
        Ok(())
    }

    /// Queues the removals and additions that turn current membership into
    /// `desired`. Removals are queued first.
    pub async fn update_elements(
        &mut self,
        conn: &mut dyn Conn,
        desired: &[SetData],
    ) -> Result<UpdateSummary> {
        let key_type = self.spec.key_type;
        let desired = canonicalize(key_type, desired)?;

        let current = match self.mode {
            MembershipMode::Refetch => self.get_set_elements(conn).await?,
            MembershipMode::Cached => match &self.cache {
                Some(cached) => cached.clone(),
                None => {
                    let added = delta(&[], &desired).add.len();
                    self.clear_and_add_elements(conn, &desired)?;
                    return Ok(UpdateSummary {
                        modified: true,
                        added,
                        removed: 0,
                    });
                }
            },
        };

        let delta = delta(&current, &desired);
        if delta.is_empty() {
            return Ok(UpdateSummary::default());
        }

        let remove = generate_elements(key_type, &delta.remove)?;
        let add = generate_elements(key_type, &delta.add)?;
        if !remove.is_empty() {
            conn.set_delete_elements(&self.spec, &remove)?;
        }
        if !add.is_empty() {
            conn.set_add_elements(&self.spec, &add)?;
        }
        debug!(
            "Queued {} additions and {} removals for set {}",
            delta.add.len(),
            delta.remove.len(),
            self.spec
        );

        self.remember(desired);
        Ok(UpdateSummary {
            modified: true,
            added: delta.add.len(),
            removed: delta.remove.len(),
        })
    }

    /// Committed membership of the kernel set
    pub async fn get_set_elements(&self, conn: &mut dyn Conn) -> Result<Vec<SetData>> {
        Ok(self
            .get_counted_set_data(conn)
            .await?
            .into_iter()
            .map(|c| c.data)
            .collect())
    }

    /// Committed membership with the counters of each interval
    pub async fn get_counted_set_data(&self, conn: &mut dyn Conn) -> Result<Vec<CountedSetData>> {
        let elements = conn.get_set_elements(&self.spec).await?;
        parse_elements(self.spec.key_type, &elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryConn;
    use crate::core::set_data::{address_strings_to_set_data, port_strings_to_set_data};

    async fn new_set(conn: &mut MemoryConn, key_type: SetKeyType) -> Set {
        let table = Table::inet("nftsync");
        conn.add_table(&table);
        conn.commit().await.unwrap();
        Set::create(conn, &table, "s", key_type).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_leaves_set_empty() {
        let mut conn = MemoryConn::new();
        let set = new_set(&mut conn, SetKeyType::Ipv6Addr).await;
        assert!(set.get_set_elements(&mut conn).await.unwrap().is_empty());
        let journal = conn.journal().unwrap();
        assert!(journal.iter().any(|e| e.starts_with("add element") && e.contains("2 elements")));
        assert!(journal.iter().any(|e| e.starts_with("flush set")));
    }

    #[tokio::test]
    async fn test_create_over_range_covering_seed() {
        let mut conn = MemoryConn::new();
        let table = Table::inet("nftsync");
        conn.add_table(&table);
        conn.commit().await.unwrap();

        for (name, key_type, data) in [
            ("v4", SetKeyType::Ipv4Addr, address_strings_to_set_data(&["192.0.2.0/24"])),
            ("v6", SetKeyType::Ipv6Addr, address_strings_to_set_data(&["2001:db8::/32"])),
            ("ports", SetKeyType::InetService, port_strings_to_set_data(&["1-1024"])),
        ] {
            let mut set = Set::create(&mut conn, &table, name, key_type).await.unwrap();
            set.clear_and_add_elements(&mut conn, &data.unwrap()).unwrap();
            conn.commit().await.unwrap();
            assert_eq!(set.get_set_elements(&mut conn).await.unwrap().len(), 1);

            let again = Set::create(&mut conn, &table, name, key_type).await.unwrap();
            assert!(again.get_set_elements(&mut conn).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_create_rejects_unsupported_key_type() {
        let mut conn = MemoryConn::new();
        let err = Set::create(&mut conn, &Table::inet("t"), "m", SetKeyType::Mark)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType(SetKeyType::Mark)));
        assert_eq!(conn.commit_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_converges_and_reports_counts() {
        let mut conn = MemoryConn::new();
        let mut set = new_set(&mut conn, SetKeyType::InetService).await;

        let desired = port_strings_to_set_data(&["8080", "9000-9005"]).unwrap();
        let summary = set.update_elements(&mut conn, &desired).await.unwrap();
        assert_eq!(
            summary,
            UpdateSummary {
                modified: true,
                added: 2,
                removed: 0
            }
        );
        conn.commit().await.unwrap();
        assert_eq!(set.get_set_elements(&mut conn).await.unwrap(), desired);

        let summary = set.update_elements(&mut conn, &desired).await.unwrap();
        assert!(!summary.modified);
        assert_eq!(conn.pending(), 0);

        let next = port_strings_to_set_data(&["8080", "9000-9010"]).unwrap();
        let summary = set.update_elements(&mut conn, &next).await.unwrap();
        assert_eq!((summary.added, summary.removed), (1, 1));
        conn.commit().await.unwrap();
        assert_eq!(set.get_set_elements(&mut conn).await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_prefix_expressed_as_range_causes_no_churn() {
        let mut conn = MemoryConn::new();
        let mut set = new_set(&mut conn, SetKeyType::Ipv4Addr).await;

        let desired = address_strings_to_set_data(&["10.0.0.0-10.0.0.255"]).unwrap();
        set.update_elements(&mut conn, &desired).await.unwrap();
        conn.commit().await.unwrap();

        let summary = set.update_elements(&mut conn, &desired).await.unwrap();
        assert!(!summary.modified);
    }

    #[tokio::test]
    async fn test_invalid_data_queues_nothing() {
        let mut conn = MemoryConn::new();
        let mut set = new_set(&mut conn, SetKeyType::Ipv4Addr).await;

        let desired = address_strings_to_set_data(&["10.0.0.1", "2001:db8::1"]).unwrap();
        let err = set.update_elements(&mut conn, &desired).await.unwrap_err();
        assert!(matches!(err, Error::FamilyMismatch { .. }));
        assert_eq!(conn.pending(), 0);
        assert!(set.clear_and_add_elements(&mut conn, &desired).is_err());
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_cached_mode_replaces_then_diffs() {
        let mut conn = MemoryConn::new();
        let mut set = new_set(&mut conn, SetKeyType::Ipv4Addr)
            .await
            .with_membership_mode(MembershipMode::Cached);

        let first = address_strings_to_set_data(&["192.0.2.10", "198.51.100.0/24"]).unwrap();
        let summary = set.update_elements(&mut conn, &first).await.unwrap();
        assert_eq!(summary.added, 2);
        // flush + add, no listing-based diff
        assert_eq!(conn.pending(), 2);
        conn.commit().await.unwrap();

        let second = address_strings_to_set_data(&["198.51.100.0/24"]).unwrap();
        let summary = set.update_elements(&mut conn, &second).await.unwrap();
        assert_eq!((summary.added, summary.removed), (0, 1));
        conn.commit().await.unwrap();
        assert_eq!(set.get_set_elements(&mut conn).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_counters_come_from_interval_start() {
        let mut conn = MemoryConn::new();
        let mut set = new_set(&mut conn, SetKeyType::Ipv4Addr).await;
        let desired = address_strings_to_set_data(&["10.0.0.1-10.0.0.3"]).unwrap();
        set.clear_and_add_elements(&mut conn, &desired).unwrap();
        conn.commit().await.unwrap();

        conn.record_set_traffic(set.spec(), &[10, 0, 0, 2], 100).unwrap();
        let counted = set.get_counted_set_data(&mut conn).await.unwrap();
        assert_eq!(counted[0].data, desired[0]);
        assert_eq!(counted[0].counter.unwrap().bytes, 100);
    }
}
