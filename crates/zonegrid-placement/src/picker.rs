//! Picker selection and the placement it produces.
//!
//! A group with any static IP goes through the static-IP picker, every other
//! group through the AZ picker. The choice is made once per instance group.

use std::collections::BTreeMap;
use std::net::IpAddr;

use zonegrid_core::{CloudTopology, InstanceGroup};
use zonegrid_state::InstanceRecord;

use crate::az_picker::AvailabilityZonePicker;
use crate::balancer::{FirstDeclared, RandomTieBreak, TieBreak};
use crate::error::PlacementResult;
use crate::instance_plan::DesiredInstance;
use crate::static_ips_picker::StaticIpsAvailabilityZonePicker;

/// Balancer bucket: an AZ name, or `None` for groups without AZs.
pub type AzKey = Option<String>;

/// Static IPs bound to a slot, keyed by network name.
pub type StaticAssignment = BTreeMap<String, IpAddr>;

/// A slot filled by an existing instance.
#[derive(Debug, Clone)]
pub struct PlacedExisting {
    pub desired: DesiredInstance,
    pub az: AzKey,
    pub record: InstanceRecord,
    pub static_ips: StaticAssignment,
}

/// A slot that needs a new instance.
#[derive(Debug, Clone)]
pub struct PlacedNew {
    pub desired: DesiredInstance,
    pub az: AzKey,
    pub static_ips: StaticAssignment,
}

/// Outcome of matching desired slots against existing instances.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub existing: Vec<PlacedExisting>,
    pub new: Vec<PlacedNew>,
    pub obsolete: Vec<InstanceRecord>,
}

impl Placement {
    /// Instances currently planned per AZ.
    pub fn az_counts(&self) -> BTreeMap<AzKey, usize> {
        let mut counts = BTreeMap::new();
        let azs = self
            .existing
            .iter()
            .map(|e| &e.az)
            .chain(self.new.iter().map(|n| &n.az));
        for az in azs {
            *counts.entry(az.clone()).or_insert(0) += 1;
        }
        counts
    }
}

pub enum Picker<'a> {
    Zones(AvailabilityZonePicker),
    StaticIps(StaticIpsAvailabilityZonePicker<'a>),
}

impl<'a> Picker<'a> {
    pub fn for_group(group: &InstanceGroup, topology: &'a CloudTopology, randomize: bool) -> Self {
        let tie_break: Box<dyn TieBreak<AzKey>> = if randomize {
            Box::new(RandomTieBreak::new())
        } else {
            Box::new(FirstDeclared)
        };
        Self::with_tie_break(group, topology, tie_break)
    }

    pub fn with_tie_break(
        group: &InstanceGroup,
        topology: &'a CloudTopology,
        tie_break: Box<dyn TieBreak<AzKey>>,
    ) -> Self {
        if group.has_static_ips() {
            Picker::StaticIps(StaticIpsAvailabilityZonePicker::new(group, topology, tie_break))
        } else {
            Picker::Zones(AvailabilityZonePicker::new(&group.name, group.az_names(), tie_break))
        }
    }

    pub fn place_and_match(
        self,
        desired: Vec<DesiredInstance>,
        existing: Vec<InstanceRecord>,
    ) -> PlacementResult<Placement> {
        match self {
            Picker::Zones(p) => p.place_and_match(desired, existing),
            Picker::StaticIps(p) => p.place_and_match(desired, existing),
        }
    }
}
