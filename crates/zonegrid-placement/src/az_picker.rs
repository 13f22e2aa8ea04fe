//! AZ placement for instance groups without static IPs.
//!
//! Matching order:
//! 1. Ignored instances keep their slot and AZ.
//! 2. Instances in AZs the group no longer declares become obsolete.
//! 3. Instances holding an active persistent disk are matched, lowest index
//!    first.
//! 4. Remaining instances are matched from the least-loaded AZ that still has
//!    unmatched instances, so scale-downs trim the fullest AZs first.
//! 5. Slots left over become new instances in the AZ the balancer picks.

use std::collections::VecDeque;

use tracing::debug;
use zonegrid_state::InstanceRecord;

use crate::balancer::{Balancer, TieBreak};
use crate::error::{PlacementError, PlacementResult};
use crate::instance_plan::DesiredInstance;
use crate::picker::{AzKey, PlacedExisting, PlacedNew, Placement, StaticAssignment};

pub struct AvailabilityZonePicker {
    group: String,
    azs: Vec<String>,
    tie_break: Box<dyn TieBreak<AzKey>>,
}

impl AvailabilityZonePicker {
    pub fn new(group: &str, azs: Vec<String>, tie_break: Box<dyn TieBreak<AzKey>>) -> Self {
        Self {
            group: group.to_string(),
            azs,
            tie_break,
        }
    }

    /// Bucket an existing instance counts towards.
    fn key_of(&self, record: &InstanceRecord) -> AzKey {
        if self.azs.is_empty() {
            None
        } else {
            record.az.clone()
        }
    }

    fn is_eligible(&self, record: &InstanceRecord) -> bool {
        self.azs.is_empty()
            || record
                .az
                .as_ref()
                .is_some_and(|az| self.azs.contains(az))
    }

    pub fn place_and_match(
        self,
        desired: Vec<DesiredInstance>,
        existing: Vec<InstanceRecord>,
    ) -> PlacementResult<Placement> {
        let buckets: Vec<AzKey> = if self.azs.is_empty() {
            vec![None]
        } else {
            self.azs.iter().cloned().map(Some).collect()
        };

        let requested = desired.len();
        let mut slots: VecDeque<DesiredInstance> = desired.into();
        let mut placement = Placement::default();

        let (mut ignored, mut candidates): (Vec<_>, Vec<_>) =
            existing.into_iter().partition(|r| r.ignore);
        ignored.sort_by_key(|r| r.index);
        candidates.sort_by_key(|r| r.index);

        let mut unmatched: Vec<(AzKey, VecDeque<InstanceRecord>)> =
            buckets.iter().map(|b| (b.clone(), VecDeque::new())).collect();
        let mut with_disk = Vec::new();
        for record in candidates {
            if !self.is_eligible(&record) {
                debug!(group = %self.group, instance = %record.name(), az = ?record.az, "instance outside declared AZs");
                placement.obsolete.push(record);
            } else if record.has_active_disk() {
                with_disk.push((self.key_of(&record), record));
            } else {
                let key = self.key_of(&record);
                if let Some((_, queue)) = unmatched.iter_mut().find(|(k, _)| *k == key) {
                    queue.push_back(record);
                }
            }
        }

        let Self {
            group, tie_break, ..
        } = self;
        let mut balancer = Balancer::with_tie_break(buckets, tie_break);

        let ignored_count = ignored.len();
        for record in ignored {
            let Some(desired) = slots.pop_front() else {
                return Err(PlacementError::IgnoredInstancesDeleted {
                    group,
                    ignored: ignored_count,
                    requested: requested as u32,
                });
            };
            let az = record.az.clone();
            balancer.record(&az);
            debug!(group = %group, instance = %record.name(), ?az, "ignored instance kept");
            placement.existing.push(PlacedExisting {
                desired,
                az,
                record,
                static_ips: StaticAssignment::new(),
            });
        }

        for (az, record) in with_disk {
            match slots.pop_front() {
                Some(desired) => {
                    balancer.record(&az);
                    debug!(group = %group, instance = %record.name(), ?az, "disk holder kept in place");
                    placement.existing.push(PlacedExisting {
                        desired,
                        az,
                        record,
                        static_ips: StaticAssignment::new(),
                    });
                }
                None => placement.obsolete.push(record),
            }
        }

        while !slots.is_empty() {
            // Least loaded AZ with instances left; ties go to the AZ with more
            // instances left, then declaration order.
            let next = unmatched
                .iter()
                .enumerate()
                .filter(|(_, (_, queue))| !queue.is_empty())
                .min_by_key(|(pos, (key, queue))| {
                    (
                        balancer.load(key).unwrap_or(usize::MAX),
                        std::cmp::Reverse(queue.len()),
                        *pos,
                    )
                })
                .map(|(pos, _)| pos);
            let Some(pos) = next else { break };
            let (key, queue) = &mut unmatched[pos];
            let (Some(record), Some(desired)) = (queue.pop_front(), slots.pop_front()) else {
                break;
            };
            balancer.record(key);
            debug!(group = %group, instance = %record.name(), az = ?key, "existing instance matched");
            placement.existing.push(PlacedExisting {
                desired,
                az: key.clone(),
                record,
                static_ips: StaticAssignment::new(),
            });
        }

        for (_, queue) in unmatched {
            placement.obsolete.extend(queue);
        }
        placement.obsolete.sort_by_key(|r| r.index);

        while let Some(desired) = slots.pop_front() {
            let az = balancer.pop().flatten();
            balancer.record(&az);
            debug!(group = %group, ?az, ordinal = desired.ordinal, "new instance placed");
            placement.new.push(PlacedNew {
                desired,
                az,
                static_ips: StaticAssignment::new(),
            });
        }

        Ok(placement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::FirstDeclared;
    use zonegrid_state::PersistentDisk;

    fn picker(azs: &[&str]) -> AvailabilityZonePicker {
        AvailabilityZonePicker::new(
            "db",
            azs.iter().map(|s| s.to_string()).collect(),
            Box::new(FirstDeclared),
        )
    }

    fn existing(index: u32, az: Option<&str>) -> InstanceRecord {
        InstanceRecord {
            id: format!("db-{index}"),
            deployment: "d".to_string(),
            instance_group: "db".to_string(),
            index,
            az: az.map(str::to_string),
            ip_addresses: Vec::new(),
            persistent_disks: Vec::new(),
            ignore: false,
            updated_at: 0,
        }
    }

    fn with_disk(mut r: InstanceRecord, active: bool) -> InstanceRecord {
        r.persistent_disks.push(PersistentDisk {
            disk_cid: format!("disk-{}", r.index),
            size_mb: 1024,
            active,
        });
        r
    }

    fn kept(p: &Placement) -> Vec<(u32, Option<&str>)> {
        p.existing
            .iter()
            .map(|e| (e.record.index, e.az.as_deref()))
            .collect()
    }

    fn new_azs(p: &Placement) -> Vec<Option<&str>> {
        p.new.iter().map(|n| n.az.as_deref()).collect()
    }

    fn obsolete(p: &Placement) -> Vec<u32> {
        p.obsolete.iter().map(|r| r.index).collect()
    }

    #[test]
    fn fresh_group_spreads_evenly() {
        let p = picker(&["z1", "z2", "z3"])
            .place_and_match(DesiredInstance::slots("db", 4), Vec::new())
            .unwrap();
        assert_eq!(
            new_azs(&p),
            vec![Some("z1"), Some("z2"), Some("z3"), Some("z1")]
        );
    }

    #[test]
    fn no_azs_places_without_az() {
        let p = picker(&[])
            .place_and_match(
                DesiredInstance::slots("db", 3),
                vec![existing(0, None), existing(1, Some("legacy"))],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(0, None), (1, None)]);
        assert_eq!(new_azs(&p), vec![None]);
    }

    #[test]
    fn keeps_instances_when_counts_match() {
        let p = picker(&["z1", "z2"])
            .place_and_match(
                DesiredInstance::slots("db", 2),
                vec![existing(0, Some("z1")), existing(1, Some("z1"))],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(0, Some("z1")), (1, Some("z1"))]);
        assert!(p.new.is_empty());
        assert!(p.obsolete.is_empty());
    }

    #[test]
    fn instances_in_removed_az_become_obsolete() {
        let p = picker(&["z1", "z2"])
            .place_and_match(
                DesiredInstance::slots("db", 3),
                vec![
                    existing(0, Some("z1")),
                    existing(1, Some("z2")),
                    existing(2, Some("z3")),
                ],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(0, Some("z1")), (1, Some("z2"))]);
        assert_eq!(new_azs(&p), vec![Some("z1")]);
        assert_eq!(obsolete(&p), vec![2]);
    }

    #[test]
    fn new_az_receives_new_instances() {
        // z1: 0; z2: 1, 2; growing to three AZs and four instances.
        let p = picker(&["z1", "z2", "z3"])
            .place_and_match(
                DesiredInstance::slots("db", 4),
                vec![
                    existing(0, Some("z1")),
                    existing(1, Some("z2")),
                    existing(2, Some("z2")),
                ],
            )
            .unwrap();
        let mut indices: Vec<u32> = p.existing.iter().map(|e| e.record.index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(new_azs(&p), vec![Some("z3")]);
    }

    #[test]
    fn scale_down_trims_fullest_az() {
        let p = picker(&["z1", "z2"])
            .place_and_match(
                DesiredInstance::slots("db", 2),
                vec![
                    existing(0, Some("z1")),
                    existing(1, Some("z1")),
                    existing(2, Some("z2")),
                ],
            )
            .unwrap();
        let mut azs: Vec<Option<&str>> = kept(&p).into_iter().map(|(_, az)| az).collect();
        azs.sort();
        assert_eq!(azs, vec![Some("z1"), Some("z2")]);
        assert_eq!(obsolete(&p), vec![1]);
    }

    #[test]
    fn scale_down_prefers_lower_indices() {
        let p = picker(&[])
            .place_and_match(
                DesiredInstance::slots("db", 1),
                vec![existing(1, None), existing(0, None)],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(0, None)]);
        assert_eq!(obsolete(&p), vec![1]);
    }

    #[test]
    fn active_disk_holder_survives_scale_down() {
        let p = picker(&["z1"])
            .place_and_match(
                DesiredInstance::slots("db", 1),
                vec![
                    existing(0, Some("z1")),
                    with_disk(existing(1, Some("z1")), true),
                ],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(1, Some("z1"))]);
        assert_eq!(obsolete(&p), vec![0]);
    }

    #[test]
    fn inactive_disk_gives_no_priority() {
        let p = picker(&["z1"])
            .place_and_match(
                DesiredInstance::slots("db", 1),
                vec![
                    existing(0, Some("z1")),
                    with_disk(existing(1, Some("z1")), false),
                ],
            )
            .unwrap();
        assert_eq!(kept(&p), vec![(0, Some("z1"))]);
        assert_eq!(obsolete(&p), vec![1]);
    }

    #[test]
    fn disk_holders_in_removed_az_are_replaced_evenly() {
        let instances = vec![
            with_disk(existing(0, Some("z1")), true),
            with_disk(existing(1, Some("z1")), true),
            with_disk(existing(2, Some("z2")), true),
            with_disk(existing(3, Some("z2")), true),
            with_disk(existing(4, Some("z3")), true),
            with_disk(existing(5, Some("z3")), true),
        ];
        let p = picker(&["z1", "z2"])
            .place_and_match(DesiredInstance::slots("db", 6), instances)
            .unwrap();
        assert_eq!(p.existing.len(), 4);
        assert_eq!(new_azs(&p), vec![Some("z1"), Some("z2")]);
        assert_eq!(obsolete(&p), vec![4, 5]);
    }

    #[test]
    fn ignored_instances_count_towards_balance() {
        let mut ignored = existing(3, Some("z1"));
        ignored.ignore = true;
        let p = picker(&["z1", "z2"])
            .place_and_match(DesiredInstance::slots("db", 3), vec![ignored])
            .unwrap();
        assert_eq!(kept(&p), vec![(3, Some("z1"))]);
        assert_eq!(new_azs(&p), vec![Some("z2"), Some("z1")]);
    }

    #[test]
    fn ignored_instances_cannot_be_dropped() {
        let mut a = existing(0, Some("z1"));
        a.ignore = true;
        let mut b = existing(1, Some("z1"));
        b.ignore = true;
        let err = picker(&["z1"])
            .place_and_match(DesiredInstance::slots("db", 1), vec![a, b])
            .unwrap_err();
        assert!(err.to_string().contains("Deleting ignored instances is not allowed"));
    }

    struct Recording(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl TieBreak<AzKey> for Recording {
        fn choose(&mut self, candidates: &[AzKey]) -> usize {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            candidates.len() - 1
        }
    }

    #[test]
    fn tie_break_only_used_for_new_slots() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let p = AvailabilityZonePicker::new(
            "db",
            vec!["z1".to_string(), "z2".to_string()],
            Box::new(Recording(calls.clone())),
        )
        .place_and_match(
            DesiredInstance::slots("db", 2),
            vec![existing(0, Some("z1")), existing(1, Some("z2"))],
        )
        .unwrap();
        assert_eq!(p.existing.len(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
