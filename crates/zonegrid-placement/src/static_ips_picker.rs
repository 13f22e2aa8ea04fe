//! AZ placement for instance groups that declare static IPs.
//!
//! Slot *i* owns the *i*-th static IP of every static network. A slot can
//! only live in an AZ that all of its addresses' subnets serve, so the AZ of
//! every slot is derived from its addresses rather than chosen freely.
//!
//! Existing instances claim slots in this order: ignored instances, then
//! instances already holding one of the slot's addresses, then any remaining
//! instance whose AZ the slot allows (active disk holders first).

use std::net::IpAddr;

use tracing::debug;
use zonegrid_core::{CloudTopology, InstanceGroup, JobNetwork};
use zonegrid_state::InstanceRecord;

use crate::balancer::{Balancer, TieBreak};
use crate::error::{PlacementError, PlacementResult};
use crate::instance_plan::DesiredInstance;
use crate::picker::{AzKey, PlacedExisting, PlacedNew, Placement, StaticAssignment};

struct StaticSlot {
    desired: DesiredInstance,
    ips: StaticAssignment,
    /// AZs this slot may be placed in, in the group's declaration order.
    candidates: Vec<AzKey>,
    claimed: bool,
}

pub struct StaticIpsAvailabilityZonePicker<'a> {
    group: InstanceGroup,
    topology: &'a CloudTopology,
    tie_break: Box<dyn TieBreak<AzKey>>,
}

impl<'a> StaticIpsAvailabilityZonePicker<'a> {
    pub fn new(
        group: &InstanceGroup,
        topology: &'a CloudTopology,
        tie_break: Box<dyn TieBreak<AzKey>>,
    ) -> Self {
        Self {
            group: group.clone(),
            topology,
            tie_break,
        }
    }

    /// AZs an address may be used in, given its subnet and the group's AZs.
    fn ip_azs(&self, network: &JobNetwork, ip: IpAddr) -> PlacementResult<Vec<AzKey>> {
        let subnet = self
            .topology
            .network(&network.name)
            .and_then(|n| n.subnet_for(ip))
            .ok_or_else(|| PlacementError::StaticIpOutsideSubnets {
                group: self.group.name.clone(),
                network: network.name.clone(),
                ip,
            })?;

        let keys: Vec<AzKey> = if self.group.azs.is_empty() {
            vec![None]
        } else {
            self.group.azs.iter().map(|az| Some(az.name.clone())).collect()
        };
        let azs: Vec<AzKey> = keys
            .into_iter()
            .filter(|key| subnet.serves(key.as_deref()))
            .collect();
        if azs.is_empty() {
            return Err(PlacementError::StaticIpOutsideAzs {
                group: self.group.name.clone(),
                ip,
            });
        }
        Ok(azs)
    }

    fn build_slots(&self, desired: Vec<DesiredInstance>) -> PlacementResult<Vec<StaticSlot>> {
        let statics: Vec<&JobNetwork> = self.group.static_networks().collect();
        for net in &statics {
            if net.static_ips.len() != desired.len() {
                return Err(PlacementError::StaticIpCount {
                    group: self.group.name.clone(),
                    network: net.name.clone(),
                    instances: desired.len() as u32,
                    ips: net.static_ips.len(),
                });
            }
        }

        let mut slots = Vec::with_capacity(desired.len());
        for (i, desired) in desired.into_iter().enumerate() {
            let mut ips = StaticAssignment::new();
            let mut candidates: Option<Vec<AzKey>> = None;
            for net in &statics {
                let ip = net.static_ips[i];
                let azs = self.ip_azs(net, ip)?;
                ips.insert(net.name.clone(), ip);
                candidates = Some(match candidates {
                    None => azs,
                    Some(current) => current.into_iter().filter(|az| azs.contains(az)).collect(),
                });
            }
            let candidates = candidates.unwrap_or_default();
            if candidates.is_empty() {
                return Err(PlacementError::UnevenStaticIps {
                    group: self.group.name.clone(),
                });
            }
            slots.push(StaticSlot {
                desired,
                ips,
                candidates,
                claimed: false,
            });
        }
        Ok(slots)
    }

    pub fn place_and_match(
        self,
        desired: Vec<DesiredInstance>,
        existing: Vec<InstanceRecord>,
    ) -> PlacementResult<Placement> {
        let mut slots = self.build_slots(desired)?;
        let statics: Vec<String> = self.group.static_networks().map(|n| n.name.clone()).collect();
        let zoned = !self.group.azs.is_empty();
        let key_of = |record: &InstanceRecord| if zoned { record.az.clone() } else { None };

        let Self {
            group, tie_break, ..
        } = self;
        let mut balancer = Balancer::with_tie_break(declared_keys(&group), tie_break);

        let (mut ignored, mut candidates): (Vec<_>, Vec<_>) =
            existing.into_iter().partition(|r| r.ignore);
        ignored.sort_by_key(|r| r.index);
        candidates.sort_by_key(|r| r.index);

        let mut placement = Placement::default();

        // Ignored instances own their slot outright.
        for record in ignored {
            let slot = slots.iter_mut().find(|s| {
                !s.claimed
                    && statics
                        .iter()
                        .all(|net| record.address_on(net) == s.ips.get(net).copied())
            });
            let Some(slot) = slot else {
                return Err(PlacementError::IgnoredInstanceStaticIpRemoved { group: group.name });
            };
            slot.claimed = true;
            let az = record.az.clone();
            balancer.record(&az);
            debug!(group = %group.name, instance = %record.name(), ?az, "ignored instance kept");
            placement.existing.push(PlacedExisting {
                desired: slot.desired.clone(),
                az,
                record,
                static_ips: slot.ips.clone(),
            });
        }

        // Instances already holding one of a slot's addresses keep that slot.
        let mut rest = Vec::new();
        for record in candidates {
            let held = slots.iter_mut().filter(|s| !s.claimed).find_map(|s| {
                let ip = statics.iter().find_map(|net| {
                    let ip = s.ips.get(net).copied()?;
                    (record.address_on(net) == Some(ip)).then_some(ip)
                })?;
                Some((s, ip))
            });
            let Some((slot, ip)) = held else {
                rest.push(record);
                continue;
            };
            let key = key_of(&record);
            if !slot.candidates.contains(&key) {
                return Err(PlacementError::ExistingInstanceIpAz {
                    instance: record.name(),
                    ip,
                    az: record.az.clone().unwrap_or_default(),
                });
            }
            slot.claimed = true;
            balancer.record(&key);
            debug!(group = %group.name, instance = %record.name(), %ip, "instance keeps static ip");
            placement.existing.push(PlacedExisting {
                desired: slot.desired.clone(),
                az: key,
                record,
                static_ips: slot.ips.clone(),
            });
        }

        // Everyone else takes a free slot compatible with its AZ.
        rest.sort_by_key(|r| (!r.has_active_disk(), r.index));
        for record in rest {
            let key = key_of(&record);
            let free = slots
                .iter_mut()
                .find(|s| !s.claimed && s.candidates.contains(&key));
            let Some(slot) = free else {
                debug!(group = %group.name, instance = %record.name(), "no static ip left for instance");
                placement.obsolete.push(record);
                continue;
            };
            slot.claimed = true;
            balancer.record(&key);
            debug!(group = %group.name, instance = %record.name(), az = ?key, "instance moved to new static ip");
            placement.existing.push(PlacedExisting {
                desired: slot.desired.clone(),
                az: key,
                record,
                static_ips: slot.ips.clone(),
            });
        }

        // Free slots become new instances. Pinned slots go first so the
        // balancer sees their load before flexible ones are placed.
        let (pinned, flexible): (Vec<_>, Vec<_>) = slots
            .into_iter()
            .filter(|s| !s.claimed)
            .partition(|s| s.candidates.len() == 1);
        for slot in pinned.into_iter().chain(flexible) {
            let az = balancer.pop_among(&slot.candidates).flatten();
            balancer.record(&az);
            debug!(group = %group.name, ?az, ordinal = slot.desired.ordinal, "new instance placed");
            placement.new.push(PlacedNew {
                desired: slot.desired,
                az,
                static_ips: slot.ips,
            });
        }

        placement.new.sort_by_key(|n| n.desired.ordinal);
        placement.obsolete.sort_by_key(|r| r.index);
        Ok(placement)
    }
}

fn declared_keys(group: &InstanceGroup) -> Vec<AzKey> {
    if group.azs.is_empty() {
        vec![None]
    } else {
        group.azs.iter().map(|a| Some(a.name.clone())).collect()
    }
}
