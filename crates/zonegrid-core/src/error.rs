//! Error types for cloud config resolution.

use thiserror::Error;

/// Result type alias for config resolution.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while turning raw TOML config into a resolved topology.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("invalid IP range '{0}'")]
    InvalidRange(String),

    #[error("invalid subnet range '{range}' in network '{network}': {reason}")]
    InvalidSubnet {
        network: String,
        range: String,
        reason: String,
    },

    #[error("availability zone '{0}' is declared more than once")]
    DuplicateAz(String),

    #[error("network '{0}' is declared more than once")]
    DuplicateNetwork(String),

    #[error("network '{network}' subnet '{range}' specifies both 'az' and 'azs'")]
    SubnetAzConflict { network: String, range: String },

    #[error("network '{network}' refers to unknown availability zone '{az}'")]
    UnknownSubnetAz { network: String, az: String },

    #[error("{role} IP '{ip}' is out of subnet range '{range}' in network '{network}'")]
    AddressOutsideSubnet {
        role: &'static str,
        ip: String,
        range: String,
        network: String,
    },

    #[error("static IP '{ip}' is in the reserved range of network '{network}'")]
    StaticInReserved { ip: String, network: String },

    #[error("Instance group '{group}' references unknown availability zone '{az}'")]
    UnknownGroupAz { group: String, az: String },

    #[error(
        "Instance group '{from}' specified for migration to instance group '{group}' refers to availability zone '{az}'. Az '{az}' is not in the list of availability zones of instance group '{group}'."
    )]
    MigratedAzNotInGroup {
        group: String,
        from: String,
        az: String,
    },

    #[error("Instance group '{group}' references unknown network '{network}'")]
    UnknownGroupNetwork { group: String, network: String },

    #[error("Instance group '{group}' must specify at least one network")]
    NoNetworks { group: String },

    #[error("Instance group '{group}' declares static ip '{ip}' more than once")]
    DuplicateStaticIp { group: String, ip: String },

    #[error("Instance group '{group}' must specify exactly one default network")]
    DefaultRoute { group: String },
}
