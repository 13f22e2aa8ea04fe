//! End-to-end reconciliation tests.
//!
//! Each test plans against a real (in-memory) store, plays the executor
//! through `IpLedger`, and plans again to check what the next deploy sees.

use std::net::IpAddr;

use zonegrid_core::{CloudConfig, CloudTopology, DeploymentManifest, InstanceGroup};
use zonegrid_placement::*;
use zonegrid_state::*;

const CLOUD: &str = r#"
[[azs]]
name = "z1"
[[azs]]
name = "z2"

[[networks]]
name = "private"
[[networks.subnets]]
range = "192.168.1.0/24"
gateway = "192.168.1.1"
reserved = ["192.168.1.2 - 192.168.1.9"]
static = ["192.168.1.10 - 192.168.1.20"]
az = "z1"
[[networks.subnets]]
range = "192.168.2.0/24"
gateway = "192.168.2.1"
reserved = ["192.168.2.2 - 192.168.2.9"]
static = ["192.168.2.10 - 192.168.2.20"]
az = "z2"

[[networks]]
name = "tiny"
[[networks.subnets]]
range = "10.9.0.0/30"
gateway = "10.9.0.1"
az = "z1"

[[networks]]
name = "flat"
[[networks.subnets]]
range = "172.16.0.0/24"
gateway = "172.16.0.1"
"#;

fn topology() -> CloudTopology {
    let config: CloudConfig = toml::from_str(CLOUD).unwrap();
    CloudTopology::from_config(&config).unwrap()
}

fn manifest(toml_src: &str) -> DeploymentManifest {
    toml::from_str(toml_src).unwrap()
}

fn group(topo: &CloudTopology, manifest: &DeploymentManifest, name: &str) -> InstanceGroup {
    let config = manifest
        .instance_groups
        .iter()
        .find(|g| g.name == name)
        .unwrap();
    InstanceGroup::resolve(config, topo).unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

const WEB: &str = r#"
name = "cf"
[[instance_groups]]
name = "web"
instances = 2
azs = ["z1", "z2"]
[[instance_groups.networks]]
name = "private"
"#;

async fn plan(
    locks: &DeploymentLocks,
    topo: &CloudTopology,
    store: &StateStore,
    manifest: &DeploymentManifest,
) -> PlacementResult<Vec<InstancePlan>> {
    let guard = locks.acquire(&manifest.name).await;
    let mut plan = Plan::new(&guard, topo, store, PlannerOptions::from_manifest(manifest))?;
    plan.plan_manifest(manifest)
}

#[tokio::test]
async fn replan_after_partial_failure_keeps_what_succeeded() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let ledger = IpLedger::new(store.clone());
    let web = manifest(WEB);

    let first = plan(&locks, &topo, &store, &web).await.unwrap();
    assert_eq!(first.len(), 2);
    let created = ledger.record_created(&first[0]).unwrap().unwrap();
    // The second VM failed after its address was committed.
    for p in first[1].network_plans() {
        ledger.commit(&p.reservation).unwrap();
    }
    ledger.record_failed(&first[1]).unwrap();

    let second = plan(&locks, &topo, &store, &web).await.unwrap();
    assert_eq!(second.len(), 2);
    let InstancePlan::Existing(kept) = &second[0] else {
        panic!("expected the created instance to be kept");
    };
    assert_eq!(kept.existing.id, created.id);
    assert_eq!(kept.index, first[0].index());
    assert_eq!(kept.az.as_deref(), first[0].az());
    assert_eq!(
        kept.network_plans[0].address(),
        first[0].network_plans()[0].address()
    );
    assert!(kept.released.is_empty());

    let InstancePlan::New(retry) = &second[1] else {
        panic!("expected the failed instance to be planned again");
    };
    assert_eq!(retry.index, first[1].index());
    assert_eq!(retry.az.as_deref(), first[1].az());
    assert_eq!(
        retry.network_plans[0].address(),
        first[1].network_plans()[0].address()
    );
}

#[tokio::test]
async fn static_ip_is_exclusive_across_deployments_until_released() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let ledger = IpLedger::new(store.clone());

    let a = manifest(
        r#"
name = "a"
[[instance_groups]]
name = "web"
instances = 1
azs = ["z1"]
[[instance_groups.networks]]
name = "private"
static_ips = ["192.168.1.10"]
"#,
    );
    let b = manifest(
        r#"
name = "b"
[[instance_groups]]
name = "db"
instances = 1
azs = ["z1"]
[[instance_groups.networks]]
name = "private"
static_ips = ["192.168.1.10"]
"#,
    );

    let planned = plan(&locks, &topo, &store, &a).await.unwrap();
    let holder = ledger.record_created(&planned[0]).unwrap().unwrap();

    let err = plan(&locks, &topo, &store, &b).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Failed to reserve IP '192.168.1.10' for instance 'db/0': already reserved by instance 'web/0' from deployment 'a'"
    );

    ledger.record_deleted(&holder).unwrap();
    let planned = plan(&locks, &topo, &store, &b).await.unwrap();
    assert_eq!(planned[0].network_plans()[0].address(), ip("192.168.1.10"));
    ledger.record_created(&planned[0]).unwrap();
    let lease = store.get_lease(ip("192.168.1.10")).unwrap().unwrap();
    assert_eq!(lease.deployment, "b");
    assert_eq!(lease.kind, ReservationKind::Static);
}

#[tokio::test]
async fn concurrent_deploys_race_for_one_address() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let ledger = IpLedger::new(store.clone());
    let one = |name: &str| {
        manifest(&format!(
            r#"
name = "{name}"
[[instance_groups]]
name = "web"
instances = 1
azs = ["z1"]
[[instance_groups.networks]]
name = "private"
"#
        ))
    };
    let (a, b) = (one("a"), one("b"));

    // Neither deploy sees the other's proposals.
    let plan_a = plan(&locks, &topo, &store, &a).await.unwrap();
    let plan_b = plan(&locks, &topo, &store, &b).await.unwrap();
    let contested = plan_a[0].network_plans()[0].address();
    assert_eq!(contested, plan_b[0].network_plans()[0].address());

    ledger.record_created(&plan_a[0]).unwrap();
    assert!(matches!(
        ledger.record_created(&plan_b[0]),
        Err(PlacementError::AlreadyReserved { .. })
    ));
    assert!(store.list_instances("b", "web").unwrap().is_empty());

    // The loser's next pass moves on to the next free address.
    let plan_b = plan(&locks, &topo, &store, &b).await.unwrap();
    assert_ne!(plan_b[0].network_plans()[0].address(), contested);
    ledger.record_created(&plan_b[0]).unwrap();
}

#[tokio::test]
async fn deleting_ignored_instances_changes_nothing() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let ledger = IpLedger::new(store.clone());
    let web = manifest(WEB);

    for p in plan(&locks, &topo, &store, &web).await.unwrap() {
        let mut record = ledger.record_created(&p).unwrap().unwrap();
        record.ignore = true;
        store.put_instance(&record).unwrap();
    }
    let instances = store.list_instances_for_deployment("cf").unwrap();
    let leases = store.list_leases().unwrap();

    let mut shrunk = web.clone();
    shrunk.instance_groups[0].instances = 1;
    let err = plan(&locks, &topo, &store, &shrunk).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Instance Group 'web' has 2 ignored instance(s). 1 instance(s) of that instance group were requested. Deleting ignored instances is not allowed."
    );
    assert_eq!(store.list_instances_for_deployment("cf").unwrap(), instances);
    assert_eq!(store.list_leases().unwrap(), leases);

    // Ignored instances survive an unchanged deploy untouched.
    let again = plan(&locks, &topo, &store, &web).await.unwrap();
    for p in &again {
        let InstancePlan::Existing(e) = p else {
            panic!("ignored instance must stay existing");
        };
        assert!(e.existing.ignore);
        assert!(!e.changes_az());
        assert!(!e.changes_addresses());
    }
}

#[tokio::test]
async fn exhausted_pool_fails_the_pass() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let m = manifest(
        r#"
name = "cf"
[[instance_groups]]
name = "worker"
instances = 2
azs = ["z1"]
[[instance_groups.networks]]
name = "tiny"
"#,
    );

    let err = plan(&locks, &topo, &store, &m).await.unwrap_err();
    assert!(err.to_string().contains("no more available"), "{err}");
    assert_eq!(
        err.to_string(),
        "Failed to reserve IP for 'worker/1' on network 'tiny': asked for a dynamic IP but there were no more available"
    );
}

#[tokio::test]
async fn existing_instances_do_not_move_between_zones() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    for index in 0..2 {
        store
            .put_instance(&InstanceRecord {
                id: format!("web-{index}"),
                deployment: "cf".to_string(),
                instance_group: "web".to_string(),
                index,
                az: Some("z1".to_string()),
                ip_addresses: Vec::new(),
                persistent_disks: Vec::new(),
                ignore: false,
                updated_at: 0,
            })
            .unwrap();
    }

    let plans = plan(&locks, &topo, &store, &manifest(WEB)).await.unwrap();
    let placed: Vec<(String, Option<&str>)> = plans.iter().map(|p| (p.name(), p.az())).collect();
    assert_eq!(
        placed,
        vec![
            ("web/0".to_string(), Some("z1")),
            ("web/1".to_string(), Some("z1")),
        ]
    );
    assert!(plans.iter().all(|p| matches!(p, InstancePlan::Existing(_))));
}

#[tokio::test]
async fn static_ips_pick_their_zones() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let m = manifest(
        r#"
name = "cf"
[[instance_groups]]
name = "db"
instances = 2
azs = ["z1", "z2"]
[[instance_groups.networks]]
name = "private"
static_ips = ["192.168.1.10", "192.168.2.10"]
"#,
    );
    let db = group(&topo, &m, "db");
    assert!(db.has_static_ips());

    let plans = plan(&locks, &topo, &store, &m).await.unwrap();
    let placed: Vec<(Option<&str>, IpAddr)> = plans
        .iter()
        .map(|p| (p.az(), p.network_plans()[0].address()))
        .collect();
    assert_eq!(
        placed,
        vec![
            (Some("z1"), ip("192.168.1.10")),
            (Some("z2"), ip("192.168.2.10")),
        ]
    );
    assert!(plans.iter().all(|p| matches!(p, InstancePlan::New(_))));
}

#[tokio::test]
async fn groups_without_zones_only_use_unzoned_subnets() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let on = |network: &str| {
        manifest(&format!(
            r#"
name = "cf"
[[instance_groups]]
name = "worker"
instances = 1
[[instance_groups.networks]]
name = "{network}"
"#
        ))
    };

    let err = plan(&locks, &topo, &store, &on("private")).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Failed to reserve IP for 'worker/0' on network 'private': asked for a dynamic IP but there were no more available"
    );

    let plans = plan(&locks, &topo, &store, &on("flat")).await.unwrap();
    assert_eq!(plans[0].az(), None);
    assert_eq!(plans[0].network_plans()[0].address(), ip("172.16.0.2"));
}

#[tokio::test]
async fn renamed_group_takes_over_migrated_instances() {
    let topo = topology();
    let store = StateStore::open_in_memory().unwrap();
    let locks = DeploymentLocks::new();
    let ledger = IpLedger::new(store.clone());
    let split = manifest(
        r#"
name = "cf"
[[instance_groups]]
name = "etcd_z1"
instances = 1
azs = ["z1"]
[[instance_groups.networks]]
name = "private"
[[instance_groups]]
name = "etcd_z2"
instances = 1
azs = ["z2"]
[[instance_groups.networks]]
name = "private"
"#,
    );
    let before: Vec<InstanceRecord> = plan(&locks, &topo, &store, &split)
        .await
        .unwrap()
        .iter()
        .map(|p| ledger.record_created(p).unwrap().unwrap())
        .collect();

    let merged = manifest(
        r#"
name = "cf"
[[instance_groups]]
name = "etcd"
instances = 2
azs = ["z1", "z2"]
migrated_from = [{ name = "etcd_z1", az = "z1" }, { name = "etcd_z2", az = "z2" }]
[[instance_groups.networks]]
name = "private"
"#,
    );
    let plans = plan(&locks, &topo, &store, &merged).await.unwrap();
    let mut names: Vec<String> = plans.iter().map(InstancePlan::name).collect();
    names.sort();
    assert_eq!(names, vec!["etcd/0", "etcd/1"]);
    for p in &plans {
        let InstancePlan::Existing(e) = p else {
            panic!("migrated instance must be kept");
        };
        let old = before.iter().find(|r| r.id == e.existing.id).unwrap();
        assert_eq!(p.az(), old.az.as_deref());
        assert_eq!(p.network_plans()[0].address(), old.ip_addresses[0].address);
        assert!(e.released.is_empty());
        ledger.record_created(p).unwrap();
    }

    assert!(store.list_instances("cf", "etcd_z1").unwrap().is_empty());
    assert!(store.list_instances("cf", "etcd_z2").unwrap().is_empty());
    let moved = store.list_instances("cf", "etcd").unwrap();
    assert_eq!(moved.len(), 2);
    for record in &moved {
        let lease = store.get_lease(record.ip_addresses[0].address).unwrap().unwrap();
        assert_eq!(lease.instance_name, record.name());
    }

    // Once moved, the next pass plans them as ordinary members.
    let again = plan(&locks, &topo, &store, &merged).await.unwrap();
    for p in &again {
        let InstancePlan::Existing(e) = p else {
            panic!("instance must stay existing");
        };
        assert_eq!(e.existing.instance_group, "etcd");
        assert_eq!(e.index, e.existing.index);
    }
}
