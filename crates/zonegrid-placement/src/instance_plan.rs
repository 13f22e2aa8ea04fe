//! Planning output: what happens to each instance of an instance group.

use std::net::IpAddr;

use serde::Serialize;
use zonegrid_state::{InstanceRecord, IpAddressRecord, ReservationKind};

use crate::reservation::NetworkReservation;

/// An abstract slot of an instance group. Slots are interchangeable except
/// that the ordinal ties a slot to the N-th static IP of each static network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredInstance {
    pub instance_group: String,
    /// Set when the slot is pinned to an AZ before placement.
    pub az: Option<String>,
    pub ordinal: u32,
}

impl DesiredInstance {
    /// `count` unpinned slots for `group`.
    pub fn slots(group: &str, count: u32) -> Vec<Self> {
        (0..count)
            .map(|ordinal| Self {
                instance_group: group.to_string(),
                az: None,
                ordinal,
            })
            .collect()
    }
}

/// The address an instance will hold on one declared network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkPlan {
    pub network: String,
    pub reservation: NetworkReservation,
    pub default_route: bool,
}

impl NetworkPlan {
    pub fn address(&self) -> IpAddr {
        self.reservation.address
    }

    pub fn kind(&self) -> ReservationKind {
        self.reservation.kind
    }
}

/// A slot with no existing instance behind it.
#[derive(Debug, Clone, Serialize)]
pub struct NewInstance {
    pub desired: DesiredInstance,
    pub deployment: String,
    /// Identifier the instance record will carry once created.
    pub instance_id: String,
    pub az: Option<String>,
    pub index: u32,
    pub network_plans: Vec<NetworkPlan>,
}

/// A slot filled by an instance that already exists.
#[derive(Debug, Clone, Serialize)]
pub struct ExistingInstance {
    pub desired: DesiredInstance,
    pub az: Option<String>,
    pub index: u32,
    pub network_plans: Vec<NetworkPlan>,
    pub existing: InstanceRecord,
    /// Addresses the instance holds today and gives up under this plan.
    pub released: Vec<IpAddressRecord>,
}

impl ExistingInstance {
    pub fn changes_az(&self) -> bool {
        self.az != self.existing.az
    }

    pub fn changes_addresses(&self) -> bool {
        !self.released.is_empty()
            || self
                .network_plans
                .iter()
                .any(|p| !self.existing.holds(p.address()))
    }
}

/// An existing instance with no slot left for it.
#[derive(Debug, Clone, Serialize)]
pub struct ObsoleteInstance {
    pub existing: InstanceRecord,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum InstancePlan {
    New(NewInstance),
    Existing(ExistingInstance),
    Obsolete(ObsoleteInstance),
}

impl InstancePlan {
    pub fn instance_group(&self) -> &str {
        match self {
            InstancePlan::New(n) => &n.desired.instance_group,
            InstancePlan::Existing(e) => &e.desired.instance_group,
            InstancePlan::Obsolete(o) => &o.existing.instance_group,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            InstancePlan::New(n) => n.index,
            InstancePlan::Existing(e) => e.index,
            InstancePlan::Obsolete(o) => o.existing.index,
        }
    }

    pub fn az(&self) -> Option<&str> {
        match self {
            InstancePlan::New(n) => n.az.as_deref(),
            InstancePlan::Existing(e) => e.az.as_deref(),
            InstancePlan::Obsolete(o) => o.existing.az.as_deref(),
        }
    }

    /// `group/index` as shown to operators.
    pub fn name(&self) -> String {
        format!("{}/{}", self.instance_group(), self.index())
    }

    /// Network plans of a new or existing instance; empty for obsolete ones.
    pub fn network_plans(&self) -> &[NetworkPlan] {
        match self {
            InstancePlan::New(n) => &n.network_plans,
            InstancePlan::Existing(e) => &e.network_plans,
            InstancePlan::Obsolete(_) => &[],
        }
    }
}
