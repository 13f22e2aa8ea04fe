//! Network reservations proposed during a planning pass.
//!
//! The [`NetworkReservationRepository`] shadows the committed lease table for
//! the length of one pass. Addresses it hands out are *proposed*: visible to
//! later lookups in the same pass, invisible to everyone else until the
//! executor commits them through [`IpLedger`](crate::ledger::IpLedger).

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};
use zonegrid_core::{CloudTopology, Network};
use zonegrid_state::{IpLease, ReservationKind, StateStore};

use crate::error::{PlacementError, PlacementResult};

/// The instance a reservation is made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationOwner {
    pub deployment: String,
    pub instance_group: String,
    pub instance_id: String,
    pub index: u32,
}

impl ReservationOwner {
    pub fn name(&self) -> String {
        format!("{}/{}", self.instance_group, self.index)
    }

    fn same_instance(&self, other: &ReservationOwner) -> bool {
        self.deployment == other.deployment && self.instance_id == other.instance_id
    }
}

/// One address on one network for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkReservation {
    pub network: String,
    pub address: IpAddr,
    pub kind: ReservationKind,
    pub owner: ReservationOwner,
}

impl NetworkReservation {
    pub fn to_lease(&self, committed_at: u64) -> IpLease {
        IpLease {
            address: self.address,
            network: self.network.clone(),
            deployment: self.owner.deployment.clone(),
            instance_id: self.owner.instance_id.clone(),
            instance_name: self.owner.name(),
            kind: self.kind,
            committed_at,
        }
    }
}

pub struct NetworkReservationRepository<'a> {
    topology: &'a CloudTopology,
    store: &'a StateStore,
    /// Addresses leased when the pass started, on any network.
    leased: BTreeSet<IpAddr>,
    proposed: HashMap<IpAddr, NetworkReservation>,
}

impl<'a> NetworkReservationRepository<'a> {
    pub fn new(topology: &'a CloudTopology, store: &'a StateStore) -> PlacementResult<Self> {
        let leased = store.list_leases()?.into_iter().map(|l| l.address).collect();
        Ok(Self {
            topology,
            store,
            leased,
            proposed: HashMap::new(),
        })
    }

    /// Reservations proposed so far in this pass.
    pub fn proposed(&self) -> impl Iterator<Item = &NetworkReservation> {
        self.proposed.values()
    }

    fn network(&self, owner: &ReservationOwner, name: &str) -> PlacementResult<&'a Network> {
        self.topology
            .network(name)
            .ok_or_else(|| PlacementError::UnknownNetwork {
                group: owner.instance_group.clone(),
                network: name.to_string(),
            })
    }

    /// Reserve a declared static IP.
    pub fn reserve_static(
        &mut self,
        owner: &ReservationOwner,
        network: &str,
        address: IpAddr,
    ) -> PlacementResult<NetworkReservation> {
        let net = self.network(owner, network)?;
        let subnet = net
            .subnet_for(address)
            .ok_or_else(|| PlacementError::StaticIpOutsideSubnets {
                group: owner.instance_group.clone(),
                network: network.to_string(),
                ip: address,
            })?;
        if subnet.is_reserved(address) {
            return Err(PlacementError::ReservedRange {
                ip: address,
                network: network.to_string(),
            });
        }
        if !subnet.is_static(address) {
            return Err(PlacementError::NotInStaticPool {
                ip: address,
                network: network.to_string(),
            });
        }
        self.propose(owner, network, address, ReservationKind::Static)
    }

    /// Keep an address the instance already holds, whatever pool it now falls
    /// in. Used for ignored instances, which never change addresses.
    pub fn reserve_held(
        &mut self,
        owner: &ReservationOwner,
        network: &str,
        address: IpAddr,
    ) -> PlacementResult<NetworkReservation> {
        let net = self.network(owner, network)?;
        let kind = match net.subnet_for(address) {
            Some(subnet) if subnet.is_static(address) => ReservationKind::Static,
            _ => ReservationKind::Dynamic,
        };
        self.propose(owner, network, address, kind)
    }

    /// Keep an existing dynamic address if it is still valid for an instance
    /// placed in `az`. Returns `None` when a fresh address is needed instead.
    pub fn retain_dynamic(
        &mut self,
        owner: &ReservationOwner,
        network: &str,
        address: IpAddr,
        az: Option<&str>,
    ) -> PlacementResult<Option<NetworkReservation>> {
        let net = self.network(owner, network)?;
        let usable = net
            .subnets
            .iter()
            .any(|s| s.serves(az) && s.is_dynamic(address));
        if !usable || self.proposed_for_other(owner, address) {
            return Ok(None);
        }
        self.propose(owner, network, address, ReservationKind::Dynamic)
            .map(Some)
    }

    /// Allocate the lowest free dynamic address on `network` from a subnet
    /// serving `az`.
    pub fn reserve_dynamic(
        &mut self,
        owner: &ReservationOwner,
        network: &str,
        az: Option<&str>,
    ) -> PlacementResult<NetworkReservation> {
        let net = self.network(owner, network)?;
        for subnet in net.subnets.iter().filter(|s| s.serves(az)) {
            let candidate = subnet
                .dynamic_pool()
                .find(|addr| !self.leased.contains(addr) && !self.proposed.contains_key(addr));
            if let Some(address) = candidate {
                return self.propose(owner, network, address, ReservationKind::Dynamic);
            }
        }
        warn!(instance = %owner.name(), network, az, "dynamic pool exhausted");
        Err(PlacementError::NoMoreDynamicIps {
            instance: owner.name(),
            network: network.to_string(),
        })
    }

    fn proposed_for_other(&self, owner: &ReservationOwner, address: IpAddr) -> bool {
        self.proposed
            .get(&address)
            .is_some_and(|r| !r.owner.same_instance(owner))
    }

    /// Record a proposal after checking nobody else holds or proposed the
    /// address.
    fn propose(
        &mut self,
        owner: &ReservationOwner,
        network: &str,
        address: IpAddr,
        kind: ReservationKind,
    ) -> PlacementResult<NetworkReservation> {
        if let Some(other) = self.proposed.get(&address) {
            if !other.owner.same_instance(owner) {
                return Err(PlacementError::AlreadyReserved {
                    ip: address,
                    instance: owner.name(),
                    holder_instance: other.owner.name(),
                    holder_deployment: other.owner.deployment.clone(),
                });
            }
        }
        if let Some(lease) = self.store.get_lease(address)? {
            if !lease.is_held_by(&owner.deployment, &owner.instance_id) {
                return Err(PlacementError::AlreadyReserved {
                    ip: address,
                    instance: owner.name(),
                    holder_instance: lease.instance_name,
                    holder_deployment: lease.deployment,
                });
            }
        }

        let reservation = NetworkReservation {
            network: network.to_string(),
            address,
            kind,
            owner: owner.clone(),
        };
        self.proposed.insert(address, reservation.clone());
        debug!(instance = %owner.name(), network, %address, ?kind, "reservation proposed");
        Ok(reservation)
    }
}
