//! IP address helpers.
//!
//! Addresses are handled as `u128` internally so that IPv4 and IPv6 share one
//! arithmetic path. Pool entries in config accept a single address or an
//! inclusive `"first - last"` range.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::error::{ConfigError, ConfigResult};

pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`to_u128`]. For IPv4 the value is truncated to 32 bits.
pub fn from_u128(value: u128, ipv4: bool) -> IpAddr {
    if ipv4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

pub fn parse_ip(text: &str) -> ConfigResult<IpAddr> {
    text.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidIp(text.trim().to_string()))
}

/// First and last address (inclusive) covered by a CIDR block.
pub fn cidr_bounds(net: &IpNetwork) -> (u128, u128) {
    let width: u32 = if net.is_ipv4() { 32 } else { 128 };
    let host_bits = width - u32::from(net.prefix());
    let first = to_u128(net.network());
    let span = if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    (first, first | span)
}

/// Parse one pool entry (`"10.0.0.5"` or `"10.0.0.5 - 10.0.0.9"`) into its
/// inclusive bounds.
pub fn parse_entry(entry: &str) -> ConfigResult<(IpAddr, IpAddr)> {
    let Some((first, last)) = entry.split_once('-') else {
        let addr = parse_ip(entry)?;
        return Ok((addr, addr));
    };
    let first = parse_ip(first)?;
    let last = parse_ip(last)?;
    if first.is_ipv4() != last.is_ipv4() || to_u128(first) > to_u128(last) {
        return Err(ConfigError::InvalidRange(entry.trim().to_string()));
    }
    Ok((first, last))
}

/// Expand a list of entries into single addresses, keeping declaration order
/// and dropping repeats. Only for lists that name one address per instance;
/// subnet pools use [`AddressPool`].
pub fn expand_list(entries: &[String]) -> ConfigResult<Vec<IpAddr>> {
    let mut seen: BTreeSet<IpAddr> = BTreeSet::new();
    let mut out: Vec<IpAddr> = Vec::new();
    for entry in entries {
        let (first, last) = parse_entry(entry)?;
        let ipv4 = first.is_ipv4();
        for value in to_u128(first)..=to_u128(last) {
            let addr = from_u128(value, ipv4);
            if seen.insert(addr) {
                out.push(addr);
            }
        }
    }
    Ok(out)
}

/// A set of addresses kept as sorted, merged inclusive ranges per family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPool {
    v4: Vec<(u128, u128)>,
    v6: Vec<(u128, u128)>,
}

impl AddressPool {
    pub fn from_entries(entries: &[String]) -> ConfigResult<Self> {
        let mut pool = Self::default();
        for entry in entries {
            let (first, last) = parse_entry(entry)?;
            let spans = if first.is_ipv4() {
                &mut pool.v4
            } else {
                &mut pool.v6
            };
            spans.push((to_u128(first), to_u128(last)));
        }
        merge(&mut pool.v4);
        merge(&mut pool.v6);
        Ok(pool)
    }

    fn spans(&self, ipv4: bool) -> &[(u128, u128)] {
        if ipv4 { &self.v4 } else { &self.v6 }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.span_containing(to_u128(addr), addr.is_ipv4()).is_some()
    }

    /// The merged range holding `value`, if any.
    pub fn span_containing(&self, value: u128, ipv4: bool) -> Option<(u128, u128)> {
        let spans = self.spans(ipv4);
        let idx = spans.partition_point(|&(lo, _)| lo <= value);
        let &(lo, hi) = spans.get(idx.checked_sub(1)?)?;
        (value <= hi).then_some((lo, hi))
    }

    /// Merged ranges as `(first, last)` address pairs, IPv4 first.
    pub fn ranges(&self) -> impl Iterator<Item = (IpAddr, IpAddr)> + '_ {
        let v4 = self
            .v4
            .iter()
            .map(|&(lo, hi)| (from_u128(lo, true), from_u128(hi, true)));
        let v6 = self
            .v6
            .iter()
            .map(|&(lo, hi)| (from_u128(lo, false), from_u128(hi, false)));
        v4.chain(v6)
    }

    /// Lowest address present in both pools.
    pub fn first_shared(&self, other: &AddressPool) -> Option<IpAddr> {
        [true, false].into_iter().find_map(|ipv4| {
            let theirs = other.spans(ipv4);
            self.spans(ipv4).iter().find_map(|&(lo, hi)| {
                theirs
                    .iter()
                    .filter(|&&(olo, ohi)| olo <= hi && lo <= ohi)
                    .map(|&(olo, _)| lo.max(olo))
                    .min()
                    .map(|v| from_u128(v, ipv4))
            })
        })
    }
}

/// Sort and coalesce overlapping or adjacent ranges.
fn merge(spans: &mut Vec<(u128, u128)>) {
    spans.sort_unstable();
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(spans.len());
    for &(lo, hi) in spans.iter() {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    *spans = merged;
}
