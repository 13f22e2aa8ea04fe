//! Resolved cloud topology and instance groups.
//!
//! Raw [`CloudConfig`] and [`InstanceGroupConfig`] values carry strings; the
//! types here carry parsed addresses, normalised AZ membership and validated
//! references. Everything downstream of config loading works on these.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::config::{CloudConfig, InstanceGroupConfig, NetworkConfig, SubnetConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::ip::{self, AddressPool};

// ── Availability zones ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityZone {
    pub name: String,
    pub cloud_properties: BTreeMap<String, serde_json::Value>,
}

// ── Networks ───────────────────────────────────────────────────────

/// One CIDR block of a network together with its address pools.
#[derive(Debug, Clone)]
pub struct Subnet {
    pub range: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub static_ips: AddressPool,
    pub reserved: AddressPool,
    /// AZ names this subnet serves, in declaration order. Empty means the
    /// subnet is not bound to any AZ.
    pub azs: Vec<String>,
}

impl Subnet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.range.contains(addr)
    }

    /// Whether instances placed in `az` may take addresses from this subnet.
    /// Instances without an AZ may only use subnets not bound to any AZ.
    pub fn serves(&self, az: Option<&str>) -> bool {
        match az {
            Some(name) => self.azs.iter().any(|a| a == name),
            None => self.azs.is_empty(),
        }
    }

    pub fn is_static(&self, addr: IpAddr) -> bool {
        self.static_ips.contains(addr)
    }

    pub fn is_reserved(&self, addr: IpAddr) -> bool {
        self.reserved.contains(addr)
    }

    /// Network and (IPv4) broadcast addresses plus the gateway.
    fn is_infrastructure(&self, addr: IpAddr) -> bool {
        let (first, last) = ip::cidr_bounds(&self.range);
        let value = ip::to_u128(addr);
        value == first
            || (self.range.is_ipv4() && value == last)
            || self.gateway == Some(addr)
    }

    /// Whether `addr` belongs to the dynamic pool of this subnet.
    pub fn is_dynamic(&self, addr: IpAddr) -> bool {
        self.contains(addr)
            && !self.is_infrastructure(addr)
            && !self.is_reserved(addr)
            && !self.is_static(addr)
    }

    /// Dynamic pool addresses in ascending order. Reserved and static ranges
    /// are skipped whole.
    pub fn dynamic_pool(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let (first, last) = ip::cidr_bounds(&self.range);
        let ipv4 = self.range.is_ipv4();
        let after = move |value: u128| value.checked_add(1).filter(|v| *v <= last);
        let mut next = Some(first);
        std::iter::from_fn(move || {
            while let Some(value) = next {
                let taken = self
                    .reserved
                    .span_containing(value, ipv4)
                    .or_else(|| self.static_ips.span_containing(value, ipv4));
                if let Some((_, end)) = taken {
                    next = after(end);
                    continue;
                }
                next = after(value);
                let addr = ip::from_u128(value, ipv4);
                if !self.is_infrastructure(addr) {
                    return Some(addr);
                }
            }
            None
        })
    }

    fn resolve(network: &str, config: &SubnetConfig, known_azs: &[String]) -> ConfigResult<Self> {
        let range: IpNetwork = config
            .range
            .trim()
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| ConfigError::InvalidSubnet {
                network: network.to_string(),
                range: config.range.clone(),
                reason: e.to_string(),
            })?;

        let outside = |role: &'static str, addr: IpAddr| ConfigError::AddressOutsideSubnet {
            role,
            ip: addr.to_string(),
            range: config.range.clone(),
            network: network.to_string(),
        };

        let gateway = config.gateway.as_deref().map(ip::parse_ip).transpose()?;
        if let Some(gw) = gateway {
            if !range.contains(gw) {
                return Err(outside("gateway", gw));
            }
        }

        let dns = config
            .dns
            .iter()
            .map(|d| ip::parse_ip(d))
            .collect::<ConfigResult<Vec<_>>>()?;

        let static_ips = AddressPool::from_entries(&config.static_ips)?;
        let reserved = AddressPool::from_entries(&config.reserved)?;
        for (role, pool) in [("static", &static_ips), ("reserved", &reserved)] {
            for (first, last) in pool.ranges() {
                if !range.contains(first) {
                    return Err(outside(role, first));
                }
                if !range.contains(last) {
                    return Err(outside(role, last));
                }
            }
        }
        if let Some(addr) = static_ips.first_shared(&reserved) {
            return Err(ConfigError::StaticInReserved {
                ip: addr.to_string(),
                network: network.to_string(),
            });
        }

        let declared: Vec<String> = match (&config.az, &config.azs) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::SubnetAzConflict {
                    network: network.to_string(),
                    range: config.range.clone(),
                });
            }
            (Some(az), None) => vec![az.clone()],
            (None, Some(azs)) => azs.clone(),
            (None, None) => Vec::new(),
        };
        let mut azs: Vec<String> = Vec::with_capacity(declared.len());
        for az in declared {
            if !known_azs.contains(&az) {
                return Err(ConfigError::UnknownSubnetAz {
                    network: network.to_string(),
                    az,
                });
            }
            if !azs.contains(&az) {
                azs.push(az);
            }
        }

        Ok(Self {
            range,
            gateway,
            dns,
            static_ips,
            reserved,
            azs,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub subnets: Vec<Subnet>,
}

impl Network {
    /// The first subnet whose range contains `addr`.
    pub fn subnet_for(&self, addr: IpAddr) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.contains(addr))
    }

    fn resolve(config: &NetworkConfig, known_azs: &[String]) -> ConfigResult<Self> {
        let subnets = config
            .subnets
            .iter()
            .map(|s| Subnet::resolve(&config.name, s, known_azs))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self {
            name: config.name.clone(),
            subnets,
        })
    }
}

// ── Topology ───────────────────────────────────────────────────────

/// Validated cloud topology.
#[derive(Debug, Clone, Default)]
pub struct CloudTopology {
    pub azs: Vec<AvailabilityZone>,
    pub networks: BTreeMap<String, Network>,
}

impl CloudTopology {
    pub fn from_config(config: &CloudConfig) -> ConfigResult<Self> {
        let mut azs: Vec<AvailabilityZone> = Vec::with_capacity(config.azs.len());
        for az in &config.azs {
            if azs.iter().any(|a| a.name == az.name) {
                return Err(ConfigError::DuplicateAz(az.name.clone()));
            }
            azs.push(AvailabilityZone {
                name: az.name.clone(),
                cloud_properties: az.cloud_properties.clone(),
            });
        }
        let az_names: Vec<String> = azs.iter().map(|a| a.name.clone()).collect();

        let mut networks = BTreeMap::new();
        for net in &config.networks {
            let resolved = Network::resolve(net, &az_names)?;
            if networks.insert(net.name.clone(), resolved).is_some() {
                return Err(ConfigError::DuplicateNetwork(net.name.clone()));
            }
        }
        Ok(Self { azs, networks })
    }

    pub fn az(&self, name: &str) -> Option<&AvailabilityZone> {
        self.azs.iter().find(|a| a.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    /// Every subnet of every network, tagged with its network name.
    pub fn all_subnets(&self) -> impl Iterator<Item = (&str, &Subnet)> {
        self.networks
            .values()
            .flat_map(|n| n.subnets.iter().map(move |s| (n.name.as_str(), s)))
    }
}

// ── Instance groups ────────────────────────────────────────────────

/// A network attachment of an instance group.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNetwork {
    pub name: String,
    /// Declared static IPs in declaration order. Empty for dynamic networks.
    pub static_ips: Vec<IpAddr>,
    pub default_route: bool,
}

impl JobNetwork {
    pub fn is_static(&self) -> bool {
        !self.static_ips.is_empty()
    }
}

/// A group whose instances are taken over by another group.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedFrom {
    pub name: String,
    /// AZ assumed for records created without one.
    pub az: Option<String>,
}

/// Desired shape of one instance group, resolved against a topology.
#[derive(Debug, Clone)]
pub struct InstanceGroup {
    pub name: String,
    pub instances: u32,
    pub azs: Vec<AvailabilityZone>,
    pub networks: Vec<JobNetwork>,
    pub migrated_from: Vec<MigratedFrom>,
}

impl InstanceGroup {
    pub fn resolve(config: &InstanceGroupConfig, topology: &CloudTopology) -> ConfigResult<Self> {
        let mut azs: Vec<AvailabilityZone> = Vec::with_capacity(config.azs.len());
        for name in &config.azs {
            let az = topology.az(name).ok_or_else(|| ConfigError::UnknownGroupAz {
                group: config.name.clone(),
                az: name.clone(),
            })?;
            if !azs.iter().any(|a| a.name == az.name) {
                azs.push(az.clone());
            }
        }

        if config.networks.is_empty() {
            return Err(ConfigError::NoNetworks {
                group: config.name.clone(),
            });
        }

        let single = config.networks.len() == 1;
        let mut seen_static: BTreeSet<IpAddr> = BTreeSet::new();
        let mut networks = Vec::with_capacity(config.networks.len());
        for net in &config.networks {
            if topology.network(&net.name).is_none() {
                return Err(ConfigError::UnknownGroupNetwork {
                    group: config.name.clone(),
                    network: net.name.clone(),
                });
            }
            let static_ips = ip::expand_list(&net.static_ips)?;
            for addr in &static_ips {
                if !seen_static.insert(*addr) {
                    return Err(ConfigError::DuplicateStaticIp {
                        group: config.name.clone(),
                        ip: addr.to_string(),
                    });
                }
            }
            networks.push(JobNetwork {
                name: net.name.clone(),
                static_ips,
                default_route: net.default.unwrap_or(single),
            });
        }

        if networks.iter().filter(|n| n.default_route).count() != 1 {
            return Err(ConfigError::DefaultRoute {
                group: config.name.clone(),
            });
        }

        let mut migrated_from = Vec::with_capacity(config.migrated_from.len());
        for source in &config.migrated_from {
            if let Some(az) = &source.az {
                if !azs.iter().any(|a| &a.name == az) {
                    return Err(ConfigError::MigratedAzNotInGroup {
                        group: config.name.clone(),
                        from: source.name.clone(),
                        az: az.clone(),
                    });
                }
            }
            migrated_from.push(MigratedFrom {
                name: source.name.clone(),
                az: source.az.clone(),
            });
        }

        Ok(Self {
            name: config.name.clone(),
            instances: config.instances,
            azs,
            networks,
            migrated_from,
        })
    }

    pub fn az_names(&self) -> Vec<String> {
        self.azs.iter().map(|a| a.name.clone()).collect()
    }

    pub fn static_networks(&self) -> impl Iterator<Item = &JobNetwork> {
        self.networks.iter().filter(|n| n.is_static())
    }

    pub fn dynamic_networks(&self) -> impl Iterator<Item = &JobNetwork> {
        self.networks.iter().filter(|n| !n.is_static())
    }

    pub fn has_static_ips(&self) -> bool {
        self.networks.iter().any(JobNetwork::is_static)
    }

    pub fn network(&self, name: &str) -> Option<&JobNetwork> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// Sorted names of the networks this group attaches to.
    pub fn network_names(&self) -> BTreeSet<String> {
        self.networks.iter().map(|n| n.name.clone()).collect()
    }
}
