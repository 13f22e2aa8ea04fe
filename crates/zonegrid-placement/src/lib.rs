//! zonegrid-placement — instance placement and network reservation.
//!
//! Given an instance group's desired shape, the cloud topology and the
//! committed instance records, a [`Plan`] decides which instances to keep,
//! create or delete, where each runs, which index it carries and which
//! addresses it holds.
//!
//! - **Balancer**: least-loaded bucket selection with a pluggable tie-break
//! - **IndexAssigner**: stable per-group indices, gaps filled first
//! - **Pickers**: AZ matching for plain groups ([`AvailabilityZonePicker`])
//!   and for groups with static IPs ([`StaticIpsAvailabilityZonePicker`])
//! - **NetworkReservationRepository**: pass-local proposals over the lease
//!   table
//! - **IpLedger**: commit and release of leases once executors report back
//! - **DeploymentLocks**: one planning pass per deployment at a time
//!
//! # Lifecycle
//!
//! ```text
//! acquire lock → Plan::plan_group → InstancePlan[]
//!                                      │
//!           executor creates/updates/deletes VMs
//!                                      │
//!   IpLedger::record_created | record_failed | record_deleted
//! ```

pub mod az_picker;
pub mod balancer;
pub mod error;
pub mod ignored;
pub mod index_assigner;
pub mod instance_plan;
pub mod ledger;
pub mod lock;
pub mod picker;
pub mod plan;
pub mod reservation;
pub mod static_ips_picker;

pub use az_picker::AvailabilityZonePicker;
pub use balancer::{Balancer, FirstDeclared, RandomTieBreak, TieBreak};
pub use error::{PlacementError, PlacementResult};
pub use index_assigner::IndexAssigner;
pub use instance_plan::{
    DesiredInstance, ExistingInstance, InstancePlan, NetworkPlan, NewInstance, ObsoleteInstance,
};
pub use ledger::IpLedger;
pub use lock::{DeploymentGuard, DeploymentLocks};
pub use picker::{AzKey, Picker, Placement};
pub use plan::{Plan, PlannerOptions};
pub use reservation::{NetworkReservation, NetworkReservationRepository, ReservationOwner};
pub use static_ips_picker::StaticIpsAvailabilityZonePicker;
