//! Domain types for the zonegrid state store.
//!
//! These types represent committed state: the instances a deployment has
//! actually created and the IP addresses leased to them. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Name of a deployment. Deployments are the unit of reconciliation.
pub type DeploymentName = String;

/// Stable identifier of an instance, unique across deployments.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// A persistent disk attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentDisk {
    pub disk_cid: String,
    pub size_mb: u64,
    /// Only active disks pin an instance to its AZ during placement.
    pub active: bool,
}

/// An address an instance holds on one network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpAddressRecord {
    pub network: String,
    pub address: IpAddr,
}

/// Committed state of one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub deployment: DeploymentName,
    /// Group the instance was created for. May differ from the group that
    /// currently plans it when instance groups are renamed or merged.
    pub instance_group: String,
    pub index: u32,
    pub az: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressRecord>,
    #[serde(default)]
    pub persistent_disks: Vec<PersistentDisk>,
    /// Operator-set flag: the planner must neither move nor delete this
    /// instance.
    #[serde(default)]
    pub ignore: bool,
    /// Unix timestamp (seconds) of the last committed change.
    #[serde(default)]
    pub updated_at: u64,
}

impl InstanceRecord {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.instance_group, &self.id)
    }

    /// Human-readable `group/index` name used in messages.
    pub fn name(&self) -> String {
        format!("{}/{}", self.instance_group, self.index)
    }

    pub fn has_active_disk(&self) -> bool {
        self.persistent_disks.iter().any(|d| d.active)
    }

    /// Address held on `network`, if any.
    pub fn address_on(&self, network: &str) -> Option<IpAddr> {
        self.ip_addresses
            .iter()
            .find(|r| r.network == network)
            .map(|r| r.address)
    }

    pub fn holds(&self, address: IpAddr) -> bool {
        self.ip_addresses.iter().any(|r| r.address == address)
    }

    /// Sorted names of the networks this instance holds addresses on.
    pub fn network_names(&self) -> BTreeSet<String> {
        self.ip_addresses.iter().map(|r| r.network.clone()).collect()
    }
}

/// Composite key `{deployment}:{instance_group}:{instance_id}`.
pub fn instance_key(deployment: &str, instance_group: &str, id: &str) -> String {
    format!("{deployment}:{instance_group}:{id}")
}

// ── IP lease ──────────────────────────────────────────────────────

/// How an address came to be held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationKind {
    /// Declared explicitly by the instance group.
    Static,
    /// Allocated from a subnet's dynamic pool.
    Dynamic,
}

/// A committed claim on one IP address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpLease {
    pub address: IpAddr,
    pub network: String,
    pub deployment: DeploymentName,
    pub instance_id: InstanceId,
    /// `group/index` of the holder at commit time, for messages.
    pub instance_name: String,
    pub kind: ReservationKind,
    /// Unix timestamp (seconds) of the commit.
    pub committed_at: u64,
}

impl IpLease {
    /// Build the key for the leases table.
    pub fn table_key(&self) -> String {
        self.address.to_string()
    }

    pub fn is_held_by(&self, deployment: &str, instance_id: &str) -> bool {
        self.deployment == deployment && self.instance_id == instance_id
    }
}
