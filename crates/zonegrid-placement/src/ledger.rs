//! Ledger operations for executors.
//!
//! Planning only proposes reservations. Once an executor knows whether an
//! instance was created, updated or deleted it reports back here, and the
//! lease table and instance records are brought in line:
//! - `record_created` commits the plan's reservations, releases what the
//!   instance gave up and stores the instance record
//! - `record_failed` releases whatever the failed attempt may have committed
//! - `record_deleted` releases every lease of an obsolete instance and drops
//!   its record

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use zonegrid_state::{InstanceRecord, IpAddressRecord, StateError, StateStore};

use crate::error::{PlacementError, PlacementResult};
use crate::instance_plan::{InstancePlan, NetworkPlan};
use crate::reservation::NetworkReservation;

#[derive(Clone)]
pub struct IpLedger {
    store: StateStore,
}

impl IpLedger {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Commit one proposed reservation.
    ///
    /// Fails without side effects when another instance committed the
    /// address first.
    pub fn commit(&self, reservation: &NetworkReservation) -> PlacementResult<()> {
        let lease = reservation.to_lease(epoch_secs());
        match self.store.commit_lease(&lease) {
            Ok(()) => {
                debug!(
                    instance = %reservation.owner.name(),
                    network = %reservation.network,
                    address = %reservation.address,
                    "reservation committed"
                );
                Ok(())
            }
            Err(StateError::LeaseConflict {
                holder_instance,
                holder_deployment,
                ..
            }) => Err(PlacementError::AlreadyReserved {
                ip: reservation.address,
                instance: reservation.owner.name(),
                holder_instance,
                holder_deployment,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a reservation if its owner still holds it.
    pub fn release(&self, reservation: &NetworkReservation) -> PlacementResult<bool> {
        self.release_address(
            reservation.address,
            &reservation.owner.deployment,
            &reservation.owner.instance_id,
        )
    }

    fn release_address(&self, address: IpAddr, deployment: &str, instance_id: &str) -> PlacementResult<bool> {
        let released = self.store.release_lease(address, deployment, instance_id)?;
        if released {
            debug!(%address, deployment, instance_id, "reservation released");
        }
        Ok(released)
    }

    fn held_by(&self, reservation: &NetworkReservation) -> PlacementResult<bool> {
        Ok(self
            .store
            .get_lease(reservation.address)?
            .is_some_and(|l| l.is_held_by(&reservation.owner.deployment, &reservation.owner.instance_id)))
    }

    /// The instance behind `plan` is running: commit its reservations and
    /// store its record. Returns the stored record; obsolete plans record
    /// nothing.
    ///
    /// On a reservation conflict every lease committed by this call is
    /// released again before the error is returned.
    pub fn record_created(&self, plan: &InstancePlan) -> PlacementResult<Option<InstanceRecord>> {
        let (record, released, previous) = match plan {
            InstancePlan::New(n) => {
                let record = InstanceRecord {
                    id: n.instance_id.clone(),
                    deployment: n.deployment.clone(),
                    instance_group: n.desired.instance_group.clone(),
                    index: n.index,
                    az: n.az.clone(),
                    ip_addresses: addresses(&n.network_plans),
                    persistent_disks: Vec::new(),
                    ignore: false,
                    updated_at: epoch_secs(),
                };
                (record, &[][..], None)
            }
            InstancePlan::Existing(e) => {
                let record = InstanceRecord {
                    instance_group: e.desired.instance_group.clone(),
                    index: e.index,
                    az: e.az.clone(),
                    ip_addresses: addresses(&e.network_plans),
                    updated_at: epoch_secs(),
                    ..e.existing.clone()
                };
                (record, e.released.as_slice(), Some(&e.existing))
            }
            InstancePlan::Obsolete(_) => return Ok(None),
        };

        let mut acquired: Vec<&NetworkReservation> = Vec::new();
        for reservation in plan.network_plans().iter().map(|p| &p.reservation) {
            let already_held = self.held_by(reservation)?;
            if let Err(err) = self.commit(reservation) {
                warn!(instance = %record.name(), error = %err, "rolling back reservations");
                for r in acquired {
                    self.release(r)?;
                }
                return Err(err);
            }
            if !already_held {
                acquired.push(reservation);
            }
        }

        for ip in released {
            self.release_address(ip.address, &record.deployment, &record.id)?;
        }

        self.store.put_instance(&record)?;
        if let Some(previous) = previous {
            if previous.instance_group != record.instance_group {
                self.store.delete_instance(previous)?;
            }
        }

        info!(
            instance = %record.name(),
            az = ?record.az,
            addresses = record.ip_addresses.len(),
            released = released.len(),
            "instance recorded"
        );
        Ok(Some(record))
    }

    /// Creating or updating the instance behind `plan` failed. Releases any
    /// lease the attempt may have committed so the next pass can reuse it;
    /// addresses an existing instance held before the attempt stay leased.
    /// Returns how many leases were released.
    pub fn record_failed(&self, plan: &InstancePlan) -> PlacementResult<usize> {
        let mut count = 0;
        match plan {
            InstancePlan::New(n) => {
                for p in &n.network_plans {
                    count += usize::from(self.release(&p.reservation)?);
                }
            }
            InstancePlan::Existing(e) => {
                for p in e.network_plans.iter().filter(|p| !e.existing.holds(p.address())) {
                    count += usize::from(self.release(&p.reservation)?);
                }
            }
            InstancePlan::Obsolete(_) => {}
        }
        info!(instance = %plan.name(), released = count, "instance failed, reservations released");
        Ok(count)
    }

    /// The instance was deleted: release all its leases and drop its record.
    /// Returns how many leases were released.
    pub fn record_deleted(&self, record: &InstanceRecord) -> PlacementResult<usize> {
        let mut count = 0;
        for lease in self.store.list_leases_for_instance(&record.deployment, &record.id)? {
            count += usize::from(self.release_address(lease.address, &record.deployment, &record.id)?);
        }
        self.store.delete_instance(record)?;
        info!(instance = %record.name(), released = count, "instance deleted");
        Ok(count)
    }
}

fn addresses(plans: &[NetworkPlan]) -> Vec<IpAddressRecord> {
    plans
        .iter()
        .map(|p| IpAddressRecord {
            network: p.network.clone(),
            address: p.address(),
        })
        .collect()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
