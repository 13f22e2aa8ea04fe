use std::fmt::Write as _;
use std::path::Path;

use tracing::info;
use zonegrid_state::{IpLease, ReservationKind, StateStore};

/// Print committed IP leases, optionally for one deployment only.
pub fn leases(state_path: &Path, deployment: Option<&str>, format: &str) -> anyhow::Result<()> {
    let store = StateStore::open(state_path)?;
    let leases = select(&store, deployment)?;
    println!("{}", render(&leases, format)?);
    Ok(())
}

pub fn select(store: &StateStore, deployment: Option<&str>) -> anyhow::Result<Vec<IpLease>> {
    let mut leases: Vec<IpLease> = store
        .list_leases()?
        .into_iter()
        .filter(|l| deployment.is_none_or(|d| l.deployment == d))
        .collect();
    leases.sort_by_key(|l| l.address);
    info!(deployment = deployment.unwrap_or("*"), count = leases.len(), "leases listed");
    Ok(leases)
}

pub fn render(leases: &[IpLease], format: &str) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(leases)?);
    }

    let mut out = String::new();
    for lease in leases {
        let kind = match lease.kind {
            ReservationKind::Static => "static",
            ReservationKind::Dynamic => "dynamic",
        };
        writeln!(
            out,
            "{:<16} {:<12} {:<8} {}/{}",
            lease.address, lease.network, kind, lease.deployment, lease.instance_name
        )?;
    }
    Ok(out.trim_end().to_string())
}
