//! Cloud config and deployment manifest parsers (TOML).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Infrastructure topology: availability zones and networks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub azs: Vec<AzConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// CIDR block, e.g. `"10.10.0.0/24"`.
    pub range: String,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    /// Addresses handed out only as explicitly declared static IPs.
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
    /// Addresses never handed out.
    #[serde(default)]
    pub reserved: Vec<String>,
    pub az: Option<String>,
    pub azs: Option<Vec<String>>,
}

/// Desired shape of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub name: String,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Break AZ ties for brand-new instances randomly instead of by
    /// declaration order.
    #[serde(default)]
    pub randomize_az_placement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceGroupConfig {
    pub name: String,
    pub instances: u32,
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub networks: Vec<JobNetworkConfig>,
    /// Groups whose instances this group takes over.
    #[serde(default)]
    pub migrated_from: Vec<MigratedFromConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratedFromConfig {
    pub name: String,
    /// AZ for records of `name` that were created without one.
    pub az: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNetworkConfig {
    pub name: String,
    #[serde(default)]
    pub static_ips: Vec<String>,
    /// Whether this network carries the instance's default route.
    pub default: Option<bool>,
}

impl CloudConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CloudConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl DeploymentManifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: DeploymentManifest = toml::from_str(&content)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cloud_config() {
        let toml_str = r#"
[[azs]]
name = "z1"
[azs.cloud_properties]
zone = "us-east-1a"

[[azs]]
name = "z2"

[[networks]]
name = "private"

[[networks.subnets]]
range = "10.10.0.0/24"
gateway = "10.10.0.1"
static = ["10.10.0.10 - 10.10.0.20"]
reserved = ["10.10.0.2 - 10.10.0.9"]
az = "z1"

[[networks.subnets]]
range = "10.10.1.0/24"
azs = ["z1", "z2"]
"#;
        let config: CloudConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.azs.len(), 2);
        assert_eq!(
            config.azs[0].cloud_properties["zone"],
            serde_json::json!("us-east-1a")
        );
        let subnets = &config.networks[0].subnets;
        assert_eq!(subnets[0].static_ips, vec!["10.10.0.10 - 10.10.0.20"]);
        assert_eq!(subnets[0].az.as_deref(), Some("z1"));
        assert_eq!(subnets[1].azs.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_manifest() {
        let toml_str = r#"
name = "cf"

[features]
randomize_az_placement = true

[[instance_groups]]
name = "router"
instances = 3
azs = ["z1", "z2"]

[[instance_groups.networks]]
name = "private"
static_ips = ["10.10.0.10 - 10.10.0.12"]
"#;
        let manifest: DeploymentManifest = toml::from_str(toml_str).unwrap();
        assert_eq!(manifest.name, "cf");
        assert!(manifest.features.randomize_az_placement);
        let group = &manifest.instance_groups[0];
        assert_eq!(group.instances, 3);
        assert_eq!(group.networks[0].static_ips.len(), 1);
        assert!(group.networks[0].default.is_none());
        assert!(group.migrated_from.is_empty());
    }

    #[test]
    fn test_parse_migrated_from() {
        let toml_str = r#"
name = "cf"
[[instance_groups]]
name = "etcd"
instances = 2
azs = ["z1"]
migrated_from = [{ name = "etcd_z1", az = "z1" }, { name = "etcd_old" }]
"#;
        let manifest: DeploymentManifest = toml::from_str(toml_str).unwrap();
        let sources = &manifest.instance_groups[0].migrated_from;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "etcd_z1");
        assert_eq!(sources[0].az.as_deref(), Some("z1"));
        assert!(sources[1].az.is_none());
    }

    #[test]
    fn test_features_default_off() {
        let manifest: DeploymentManifest = toml::from_str("name = \"x\"").unwrap();
        assert!(!manifest.features.randomize_az_placement);
        assert!(manifest.instance_groups.is_empty());
    }
}
