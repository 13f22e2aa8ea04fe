//! Guards protecting ignored instances from reconciliation.
//!
//! Ignored instances are never moved, deleted or re-addressed. A desired
//! state that would require any of that is rejected before placement runs,
//! so a rejected pass leaves no trace in the store.

use std::collections::BTreeSet;

use zonegrid_core::InstanceGroup;
use zonegrid_state::InstanceRecord;

use crate::error::{PlacementError, PlacementResult};

/// Check `group`'s desired state against the ignored instances in `existing`.
pub fn validate(group: &InstanceGroup, existing: &[InstanceRecord]) -> PlacementResult<()> {
    let ignored: Vec<&InstanceRecord> = existing.iter().filter(|r| r.ignore).collect();
    if ignored.is_empty() {
        return Ok(());
    }

    if (group.instances as usize) < ignored.len() {
        return Err(PlacementError::IgnoredInstancesDeleted {
            group: group.name.clone(),
            ignored: ignored.len(),
            requested: group.instances,
        });
    }

    let declared = group.az_names();
    let removed: BTreeSet<String> = ignored
        .iter()
        .filter_map(|r| r.az.clone())
        .filter(|az| !declared.contains(az))
        .collect();
    if !removed.is_empty() {
        return Err(PlacementError::IgnoredInstanceAzsRemoved {
            group: group.name.clone(),
            azs: removed.into_iter().collect(),
        });
    }

    let networks = group.network_names();
    if ignored.iter().any(|r| r.network_names() != networks) {
        return Err(PlacementError::IgnoredInstanceNetworksChanged {
            group: group.name.clone(),
        });
    }

    for net in group.static_networks() {
        let dropped = ignored
            .iter()
            .filter_map(|r| r.address_on(&net.name))
            .any(|ip| !net.static_ips.contains(&ip));
        if dropped {
            return Err(PlacementError::IgnoredInstanceStaticIpRemoved {
                group: group.name.clone(),
            });
        }
    }

    Ok(())
}
