//! One reconciliation pass over a deployment.
//!
//! A [`Plan`] holds the pass-local state: index assignments and proposed
//! reservations made so far. Both are visible to later instance groups in the
//! same pass and to nobody else. Nothing is written to the store; executors
//! commit the outcome through [`IpLedger`](crate::ledger::IpLedger).

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use zonegrid_core::{CloudTopology, DeploymentManifest, InstanceGroup};
use zonegrid_state::{InstanceRecord, StateStore};

use crate::error::{PlacementError, PlacementResult};
use crate::ignored;
use crate::index_assigner::IndexAssigner;
use crate::instance_plan::{
    DesiredInstance, ExistingInstance, InstancePlan, NetworkPlan, NewInstance, ObsoleteInstance,
};
use crate::lock::DeploymentGuard;
use crate::picker::{Picker, StaticAssignment};
use crate::reservation::{NetworkReservationRepository, ReservationOwner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerOptions {
    /// Break ties between equally loaded AZs at random for new instances.
    pub randomize_az_placement: bool,
}

impl PlannerOptions {
    pub fn from_manifest(manifest: &DeploymentManifest) -> Self {
        Self {
            randomize_az_placement: manifest.features.randomize_az_placement,
        }
    }
}

pub struct Plan<'a> {
    guard: &'a DeploymentGuard,
    topology: &'a CloudTopology,
    store: &'a StateStore,
    options: PlannerOptions,
    indices: IndexAssigner,
    reservations: NetworkReservationRepository<'a>,
}

impl<'a> Plan<'a> {
    /// Start a pass for the deployment `guard` locks.
    pub fn new(
        guard: &'a DeploymentGuard,
        topology: &'a CloudTopology,
        store: &'a StateStore,
        options: PlannerOptions,
    ) -> PlacementResult<Self> {
        Ok(Self {
            guard,
            topology,
            store,
            options,
            indices: IndexAssigner::from_store(store, guard.deployment())?,
            reservations: NetworkReservationRepository::new(topology, store)?,
        })
    }

    pub fn deployment(&self) -> &str {
        self.guard.deployment()
    }

    /// Plan every instance group of `manifest`, in manifest order. The
    /// manifest must belong to the locked deployment.
    pub fn plan_manifest(&mut self, manifest: &DeploymentManifest) -> PlacementResult<Vec<InstancePlan>> {
        if manifest.name != self.guard.deployment() {
            return Err(PlacementError::DeploymentMismatch {
                locked: self.guard.deployment().to_string(),
                manifest: manifest.name.clone(),
            });
        }
        let groups = manifest
            .instance_groups
            .iter()
            .map(|config| InstanceGroup::resolve(config, self.topology))
            .collect::<Result<Vec<_>, _>>()?;
        check_migrations(&groups)?;

        let mut plans = Vec::new();
        for group in &groups {
            plans.extend(self.plan_group(group)?);
        }
        Ok(plans)
    }

    /// Plan `group` against its committed instance records, including those
    /// of the groups it migrates from.
    pub fn plan_group(&mut self, group: &InstanceGroup) -> PlacementResult<Vec<InstancePlan>> {
        let deployment = self.guard.deployment();
        let mut existing = self.store.list_instances(deployment, &group.name)?;
        for source in group.migrated_from.iter().filter(|s| s.name != group.name) {
            let records = self.store.list_instances(deployment, &source.name)?;
            if !records.is_empty() {
                info!(
                    deployment,
                    from = %source.name,
                    to = %group.name,
                    instances = records.len(),
                    "migrating instance group"
                );
            }
            for mut record in records {
                match (record.az.as_deref(), source.az.as_deref()) {
                    (Some(actual), Some(declared)) if actual != declared => {
                        return Err(PlacementError::MigratedAzMismatch {
                            from: source.name.clone(),
                            to: group.name.clone(),
                            actual: actual.to_string(),
                            declared: declared.to_string(),
                        });
                    }
                    (None, None) if !group.azs.is_empty() => {
                        return Err(PlacementError::MigratedAzMissing {
                            from: source.name.clone(),
                            to: group.name.clone(),
                        });
                    }
                    _ => {}
                }
                if record.az.is_none() {
                    record.az = source.az.clone();
                }
                existing.push(record);
            }
        }
        self.reconcile(group, existing)
    }

    /// Match `group`'s desired instances against `existing` and reserve
    /// addresses for everything that will run.
    ///
    /// Plans come back as existing instances, then new ones, then obsolete
    /// ones.
    pub fn reconcile(
        &mut self,
        group: &InstanceGroup,
        existing: Vec<InstanceRecord>,
    ) -> PlacementResult<Vec<InstancePlan>> {
        ignored::validate(group, &existing)?;

        let desired = DesiredInstance::slots(&group.name, group.instances);
        let picker = Picker::for_group(group, self.topology, self.options.randomize_az_placement);
        let mut placement = picker.place_and_match(desired, existing)?;

        // Ignored instances and instances already indexed in this group claim
        // their indices before migrated ones.
        placement.existing.sort_by_key(|e| {
            (
                !e.record.ignore,
                e.record.instance_group != group.name,
                e.record.index,
            )
        });

        let mut plans = Vec::with_capacity(
            placement.existing.len() + placement.new.len() + placement.obsolete.len(),
        );

        for placed in placement.existing {
            let record = placed.record;
            let index = self.indices.assign(&group.name, Some(&record));
            let owner = self.owner(group, &record.id, index);
            let network_plans = if record.ignore {
                self.held_network_plans(group, &owner, &record)?
            } else {
                self.network_plans(group, &owner, placed.az.as_deref(), &placed.static_ips, Some(&record))?
            };
            let released = record
                .ip_addresses
                .iter()
                .filter(|ip| !network_plans.iter().any(|p| p.address() == ip.address))
                .cloned()
                .collect();
            plans.push(InstancePlan::Existing(ExistingInstance {
                desired: placed.desired,
                az: placed.az,
                index,
                network_plans,
                existing: record,
                released,
            }));
        }

        let existing_count = plans.len();
        for placed in placement.new {
            let index = self.indices.assign(&group.name, None);
            let instance_id = Uuid::new_v4().to_string();
            let owner = self.owner(group, &instance_id, index);
            let network_plans =
                self.network_plans(group, &owner, placed.az.as_deref(), &placed.static_ips, None)?;
            plans.push(InstancePlan::New(NewInstance {
                desired: placed.desired,
                deployment: self.guard.deployment().to_string(),
                instance_id,
                az: placed.az,
                index,
                network_plans,
            }));
        }

        let new_count = plans.len() - existing_count;
        let obsolete_count = placement.obsolete.len();
        plans.extend(
            placement
                .obsolete
                .into_iter()
                .map(|existing| InstancePlan::Obsolete(ObsoleteInstance { existing })),
        );

        info!(
            deployment = %self.guard.deployment(),
            group = %group.name,
            existing = existing_count,
            new = new_count,
            obsolete = obsolete_count,
            "instance group planned"
        );
        Ok(plans)
    }

    fn owner(&self, group: &InstanceGroup, instance_id: &str, index: u32) -> ReservationOwner {
        ReservationOwner {
            deployment: self.guard.deployment().to_string(),
            instance_group: group.name.clone(),
            instance_id: instance_id.to_string(),
            index,
        }
    }

    /// One plan per declared network: the slot's static IP where it has one,
    /// otherwise a dynamic address, kept from `record` when still usable.
    fn network_plans(
        &mut self,
        group: &InstanceGroup,
        owner: &ReservationOwner,
        az: Option<&str>,
        static_ips: &StaticAssignment,
        record: Option<&InstanceRecord>,
    ) -> PlacementResult<Vec<NetworkPlan>> {
        let mut plans = Vec::with_capacity(group.networks.len());
        for net in &group.networks {
            let reservation = match static_ips.get(&net.name) {
                Some(&ip) => self.reservations.reserve_static(owner, &net.name, ip)?,
                None => {
                    let current: Option<IpAddr> = record.and_then(|r| r.address_on(&net.name));
                    let retained = match current {
                        Some(address) => {
                            self.reservations
                                .retain_dynamic(owner, &net.name, address, az)?
                        }
                        None => None,
                    };
                    match retained {
                        Some(reservation) => reservation,
                        None => self.reservations.reserve_dynamic(owner, &net.name, az)?,
                    }
                }
            };
            plans.push(NetworkPlan {
                network: net.name.clone(),
                reservation,
                default_route: net.default_route,
            });
        }
        Ok(plans)
    }

    /// Ignored instances keep exactly the addresses they hold.
    fn held_network_plans(
        &mut self,
        group: &InstanceGroup,
        owner: &ReservationOwner,
        record: &InstanceRecord,
    ) -> PlacementResult<Vec<NetworkPlan>> {
        let mut plans = Vec::with_capacity(record.ip_addresses.len());
        for ip in &record.ip_addresses {
            let reservation = self.reservations.reserve_held(owner, &ip.network, ip.address)?;
            plans.push(NetworkPlan {
                network: ip.network.clone(),
                reservation,
                default_route: group.network(&ip.network).is_some_and(|n| n.default_route),
            });
        }
        Ok(plans)
    }
}

/// A migrated group must be gone from the manifest and taken over by exactly
/// one group.
fn check_migrations(groups: &[InstanceGroup]) -> PlacementResult<()> {
    let mut claimed: BTreeSet<&str> = BTreeSet::new();
    for group in groups {
        for source in group.migrated_from.iter().filter(|s| s.name != group.name) {
            if groups.iter().any(|g| g.name == source.name) {
                return Err(PlacementError::MigratedGroupStillDeclared {
                    from: source.name.clone(),
                    to: group.name.clone(),
                });
            }
            if !claimed.insert(&source.name) {
                return Err(PlacementError::MigratedGroupClaimedTwice {
                    from: source.name.clone(),
                    to: group.name.clone(),
                });
            }
        }
    }
    Ok(())
}
