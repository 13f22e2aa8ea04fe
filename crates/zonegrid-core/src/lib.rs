pub mod config;
pub mod error;
pub mod ip;
pub mod topology;

pub use config::{
    AzConfig, CloudConfig, DeploymentManifest, FeaturesConfig, InstanceGroupConfig, JobNetworkConfig,
    MigratedFromConfig, NetworkConfig, SubnetConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use topology::*;
