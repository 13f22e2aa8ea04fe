//! StateStore — redb-backed state persistence for zonegrid.
//!
//! Provides typed operations over instance records and IP leases. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(IP_LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, index = record.index, az = ?record.az, "instance stored");
        Ok(())
    }

    /// Get an instance by deployment, group and id.
    pub fn get_instance(
        &self,
        deployment: &str,
        instance_group: &str,
        id: &str,
    ) -> StateResult<Option<InstanceRecord>> {
        let key = instance_key(deployment, instance_group, id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List the instances recorded for one group of a deployment, ordered by
    /// index.
    pub fn list_instances(
        &self,
        deployment: &str,
        instance_group: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        let prefix = format!("{deployment}:{instance_group}:");
        let mut results = self.scan_instances(&prefix)?;
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// List every instance recorded for a deployment.
    pub fn list_instances_for_deployment(
        &self,
        deployment: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        self.scan_instances(&format!("{deployment}:"))
    }

    fn scan_instances(&self, prefix: &str) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: InstanceRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, record: &InstanceRecord) -> StateResult<bool> {
        let key = record.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "instance deleted");
        Ok(existed)
    }

    // ── IP leases ──────────────────────────────────────────────────

    /// Commit a lease if the address is free or already held by the same
    /// instance. A re-commit by the holder overwrites kind and network.
    ///
    /// Fails with [`StateError::LeaseConflict`] when another instance holds
    /// the address; the table is left untouched in that case.
    pub fn commit_lease(&self, lease: &IpLease) -> StateResult<()> {
        let key = lease.table_key();
        let value = serde_json::to_vec(lease).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IP_LEASES).map_err(map_err!(Table))?;
            let held: Option<IpLease> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(held) = held {
                if !held.is_held_by(&lease.deployment, &lease.instance_id) {
                    return Err(StateError::LeaseConflict {
                        address: key,
                        holder_instance: held.instance_name,
                        holder_deployment: held.deployment,
                    });
                }
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(address = %key, network = %lease.network, instance = %lease.instance_name, "lease committed");
        Ok(())
    }

    /// Remove the lease on `address` if `deployment`/`instance_id` holds it.
    /// Returns true if a lease was removed.
    pub fn release_lease(
        &self,
        address: IpAddr,
        deployment: &str,
        instance_id: &str,
    ) -> StateResult<bool> {
        let key = address.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(IP_LEASES).map_err(map_err!(Table))?;
            let owned = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let held: IpLease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    held.is_held_by(deployment, instance_id)
                }
                None => false,
            };
            released = owned && table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(address = %key, released, "lease release");
        Ok(released)
    }

    /// Get the lease on an address, if any.
    pub fn get_lease(&self, address: IpAddr) -> StateResult<Option<IpLease>> {
        let key = address.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IP_LEASES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let lease: IpLease =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lease))
            }
            None => Ok(None),
        }
    }

    /// List all leases.
    pub fn list_leases(&self) -> StateResult<Vec<IpLease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IP_LEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lease: IpLease =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(lease);
        }
        Ok(results)
    }

    /// List the leases held by one instance.
    pub fn list_leases_for_instance(
        &self,
        deployment: &str,
        instance_id: &str,
    ) -> StateResult<Vec<IpLease>> {
        Ok(self
            .list_leases()?
            .into_iter()
            .filter(|l| l.is_held_by(deployment, instance_id))
            .collect())
    }
}
