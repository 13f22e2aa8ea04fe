//! Error types for placement planning.
//!
//! Messages name the offending instance group, AZ or address and are relied
//! on verbatim by callers and operators.

use std::net::IpAddr;

use thiserror::Error;
use zonegrid_core::ConfigError;
use zonegrid_state::StateError;

/// Result type alias for placement operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    // ── Configuration conflicts ────────────────────────────────────
    #[error(
        "Instance group '{group}' with network '{network}' declares static ip '{ip}', which belongs to no subnet"
    )]
    StaticIpOutsideSubnets {
        group: String,
        network: String,
        ip: IpAddr,
    },

    #[error(
        "Instance group '{group}' declares static ip '{ip}' which does not belong to any of the instance group's availability zones"
    )]
    StaticIpOutsideAzs { group: String, ip: IpAddr },

    #[error(
        "Instance group '{group}' has {instances} instances but was allocated {ips} static IPs in network '{network}'"
    )]
    StaticIpCount {
        group: String,
        network: String,
        instances: u32,
        ips: usize,
    },

    #[error("Failed to evenly distribute static IPs between zones for instance group '{group}'")]
    UnevenStaticIps { group: String },

    #[error("Existing instance '{instance}' is using IP '{ip}' in availability zone '{az}'")]
    ExistingInstanceIpAz {
        instance: String,
        ip: IpAddr,
        az: String,
    },

    #[error("IP '{ip}' on network '{network}' does not belong to static pool")]
    NotInStaticPool { ip: IpAddr, network: String },

    #[error("Failed to reserve IP '{ip}' for network '{network}': IP belongs to reserved range")]
    ReservedRange { ip: IpAddr, network: String },

    #[error("Instance group '{group}' references unknown network '{network}'")]
    UnknownNetwork { group: String, network: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    // ── Resource exhaustion ────────────────────────────────────────
    #[error(
        "Failed to reserve IP for '{instance}' on network '{network}': asked for a dynamic IP but there were no more available"
    )]
    NoMoreDynamicIps { instance: String, network: String },

    // ── Reservation conflicts ──────────────────────────────────────
    #[error(
        "Failed to reserve IP '{ip}' for instance '{instance}': already reserved by instance '{holder_instance}' from deployment '{holder_deployment}'"
    )]
    AlreadyReserved {
        ip: IpAddr,
        instance: String,
        holder_instance: String,
        holder_deployment: String,
    },

    // ── Ignored instances ──────────────────────────────────────────
    #[error(
        "Instance Group '{group}' has {ignored} ignored instance(s). {requested} instance(s) of that instance group were requested. Deleting ignored instances is not allowed."
    )]
    IgnoredInstancesDeleted {
        group: String,
        ignored: usize,
        requested: u32,
    },

    #[error("Instance Group '{group}' no longer contains AZs {azs:?} where ignored instance(s) exist.")]
    IgnoredInstanceAzsRemoved { group: String, azs: Vec<String> },

    #[error(
        "In instance group '{group}', which contains ignored vms, an attempt was made to modify the networks. This operation is not allowed."
    )]
    IgnoredInstanceNetworksChanged { group: String },

    #[error(
        "In instance group '{group}', an attempt was made to remove a static ip that is used by an ignored instance. This operation is not allowed."
    )]
    IgnoredInstanceStaticIpRemoved { group: String },

    // ── Migration ──────────────────────────────────────────────────
    #[error(
        "Failed to migrate instance group '{from}' to '{to}'. A deployment can not migrate an instance group and also specify it. Please remove instance group '{from}'."
    )]
    MigratedGroupStillDeclared { from: String, to: String },

    #[error(
        "Failed to migrate instance group '{from}' to '{to}'. An instance group may be migrated to only one instance group."
    )]
    MigratedGroupClaimedTwice { from: String, to: String },

    #[error(
        "Failed to migrate instance group '{from}' to '{to}', '{from}' belongs to availability zone '{actual}' and manifest specifies '{declared}'"
    )]
    MigratedAzMismatch {
        from: String,
        to: String,
        actual: String,
        declared: String,
    },

    #[error("Failed to migrate instance group '{from}' to '{to}', availability zone of '{from}' is not specified")]
    MigratedAzMissing { from: String, to: String },

    #[error("Manifest for deployment '{manifest}' cannot be planned under the lock for deployment '{locked}'")]
    DeploymentMismatch { locked: String, manifest: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
