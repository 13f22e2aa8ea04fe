use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use tracing::info;
use zonegrid_core::{CloudConfig, CloudTopology, DeploymentManifest};
use zonegrid_placement::{DeploymentLocks, InstancePlan, Plan, PlannerOptions};
use zonegrid_state::StateStore;

/// Plan `manifest` against the state in `state_path` without committing
/// anything, and print the result.
pub async fn plan(cloud: &Path, manifest: &Path, state_path: &Path, format: &str) -> anyhow::Result<()> {
    let cloud = CloudConfig::from_file(cloud)
        .with_context(|| format!("reading cloud config {}", cloud.display()))?;
    let manifest = DeploymentManifest::from_file(manifest)
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let topology = CloudTopology::from_config(&cloud)?;
    let store = StateStore::open(state_path)?;

    let plans = dry_run(&topology, &store, &manifest).await?;
    println!("{}", render(&plans, format)?);
    Ok(())
}

pub async fn dry_run(
    topology: &CloudTopology,
    store: &StateStore,
    manifest: &DeploymentManifest,
) -> anyhow::Result<Vec<InstancePlan>> {
    info!(
        deployment = %manifest.name,
        groups = manifest.instance_groups.len(),
        "dry run started"
    );
    let locks = DeploymentLocks::new();
    let guard = locks.acquire(&manifest.name).await;
    let mut plan = Plan::new(&guard, topology, store, PlannerOptions::from_manifest(manifest))?;
    let plans = plan.plan_manifest(manifest)?;
    info!(deployment = %manifest.name, instances = plans.len(), "dry run planned");
    Ok(plans)
}

pub fn render(plans: &[InstancePlan], format: &str) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(plans)?);
    }

    let mut out = String::new();
    for plan in plans {
        let action = match plan {
            InstancePlan::New(_) => "create",
            InstancePlan::Existing(e) if e.changes_az() || e.changes_addresses() => "update",
            InstancePlan::Existing(_) => "keep",
            InstancePlan::Obsolete(_) => "delete",
        };
        let addresses: Vec<String> = plan
            .network_plans()
            .iter()
            .map(|p| format!("{}={}", p.network, p.address()))
            .collect();
        writeln!(
            out,
            "{action:<7} {:<20} {:<8} {}",
            plan.name(),
            plan.az().unwrap_or("-"),
            addresses.join(" ")
        )?;
    }
    Ok(out.trim_end().to_string())
}
