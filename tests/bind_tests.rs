//! Integration tests for the Bind reconciler

mod common;

use std::collections::BTreeMap;

use kube::ResourceExt;

use common::*;
use lbcf_operator::crd::{
    Bind, BindSpec, LoadBalancer, LoadBalancerStatus, PodBackend, PortSelector,
    TargetLoadBalancer, DELETE_BIND_FINALIZER, LABEL_BIND_NAME, LB_CREATED,
};
use lbcf_operator::crd::{Condition, ConditionStatus};
use lbcf_operator::reconcilers::BindReconciler;
use lbcf_operator::store::{Lister, ResourceClient};

const KEY: &str = "test/web";

fn reconciler(world: &World) -> BindReconciler {
    BindReconciler::new(world.listers(), &world.clients())
}

fn target(name: &str, driver: &str) -> TargetLoadBalancer {
    TargetLoadBalancer {
        name: name.to_string(),
        driver: driver.to_string(),
        spec: labels(&[("vip", "1.1.1.1")]),
        attributes: BTreeMap::new(),
    }
}

fn bind(targets: Vec<TargetLoadBalancer>) -> Bind {
    let mut metadata = meta("web");
    metadata.generation = Some(1);
    Bind {
        metadata,
        spec: BindSpec {
            load_balancers: targets,
            pods: PodBackend {
                ports: vec![PortSelector::tcp(80)],
                by_label: None,
                by_name: vec!["pod-0".to_string()],
            },
            parameters: BTreeMap::new(),
            ensure_policy: None,
            deregister_policy: None,
            deregister_webhook: None,
        },
        status: None,
    }
}

fn stored_bind(world: &World) -> Bind {
    world.binds.object(NS, "web").expect("bind exists")
}

fn children(world: &World) -> Vec<LoadBalancer> {
    world
        .lbs
        .list(Some(NS), &labels(&[(LABEL_BIND_NAME, "web")]))
}

#[tokio::test]
async fn creates_children_and_finalizer() {
    let world = World::with_driver();
    let inserted = world
        .binds
        .insert(bind(vec![target("a", DRIVER), target("b", DRIVER)]));

    let result = reconciler(&world).sync_bind(KEY).await;
    assert!(result.is_succ(), "{}", result);

    assert_eq!(stored_bind(&world).finalizers(), &[DELETE_BIND_FINALIZER.to_string()]);

    let lbs = children(&world);
    let names: Vec<String> = lbs.iter().map(|lb| lb.name_any()).collect();
    assert_eq!(names, vec!["web-a", "web-b"]);
    for lb in &lbs {
        assert_eq!(lb.spec.lb_driver, DRIVER);
        assert_eq!(lb.owner_references()[0].uid, inserted.uid().unwrap());
    }

    let group = world.groups.object(NS, "web").expect("group created");
    assert_eq!(group.spec.load_balancers, vec!["web-a", "web-b"]);
    assert_eq!(group.labels().get(LABEL_BIND_NAME).map(String::as_str), Some("web"));
    assert_eq!(group.owner_references()[0].kind, "Bind");

    let status = stored_bind(&world).status.expect("status written");
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.load_balancer_statuses.len(), 2);
}

#[tokio::test]
async fn mirrors_load_balancer_status() {
    let world = World::with_driver();
    world.binds.insert(bind(vec![target("a", DRIVER)]));
    let reconciler = reconciler(&world);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    let mut lb = world.lbs.object(NS, "web-a").unwrap();
    lb.status = Some(LoadBalancerStatus {
        lb_info: labels(&[("lbID", "lb-9")]),
        last_synced_attributes: BTreeMap::new(),
        conditions: vec![Condition::new(LB_CREATED, ConditionStatus::True)],
    });
    world.lbs.insert(lb);

    assert!(reconciler.sync_bind(KEY).await.is_succ());
    let status = stored_bind(&world).status.unwrap();
    let mirrored = &status.load_balancer_statuses[0];
    assert_eq!(mirrored.name, "a");
    assert_eq!(mirrored.driver, DRIVER);
    assert_eq!(mirrored.lb_info.get("lbID").map(String::as_str), Some("lb-9"));
    assert!(mirrored.conditions[0].is_true());

    world.binds.clear_writes();
    assert!(reconciler.sync_bind(KEY).await.is_succ());
    assert!(world.binds.writes().is_empty());
}

#[tokio::test]
async fn attribute_change_updates_load_balancer_in_place() {
    let world = World::with_driver();
    world.binds.insert(bind(vec![target("a", DRIVER)]));
    let reconciler = reconciler(&world);
    assert!(reconciler.sync_bind(KEY).await.is_succ());
    let before = world.lbs.object(NS, "web-a").unwrap();

    let mut changed = stored_bind(&world);
    changed.spec.load_balancers[0].attributes = labels(&[("weight", "5")]);
    world.binds.insert(changed);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    let after = world.lbs.object(NS, "web-a").unwrap();
    assert_eq!(after.uid(), before.uid());
    assert_eq!(after.spec.attributes.get("weight").map(String::as_str), Some("5"));
}

#[tokio::test]
async fn driver_change_replaces_load_balancer() {
    let world = World::with_driver();
    world.drivers.insert(driver("other-driver"));
    world.binds.insert(bind(vec![target("a", DRIVER)]));
    let reconciler = reconciler(&world);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    // keep the old child around like the LoadBalancer finalizer would
    let mut lb = world.lbs.object(NS, "web-a").unwrap();
    lb.metadata.finalizers = Some(vec!["test/hold".to_string()]);
    world.lbs.insert(lb);

    let mut changed = stored_bind(&world);
    changed.spec.load_balancers[0].driver = "other-driver".to_string();
    world.binds.insert(changed);

    let result = reconciler.sync_bind(KEY).await;
    assert!(result.is_running(), "{}", result);
    let old = world.lbs.object(NS, "web-a").unwrap();
    assert!(old.metadata.deletion_timestamp.is_some());
    assert_eq!(old.spec.lb_driver, DRIVER);

    // still waiting while the old child is being deleted
    assert!(reconciler.sync_bind(KEY).await.is_running());

    world.lbs.remove(NS, "web-a");
    assert!(reconciler.sync_bind(KEY).await.is_succ());
    let new = world.lbs.object(NS, "web-a").unwrap();
    assert_eq!(new.spec.lb_driver, "other-driver");
    assert!(new.metadata.deletion_timestamp.is_none());
}

#[tokio::test]
async fn removed_target_deletes_its_load_balancer() {
    let world = World::with_driver();
    world
        .binds
        .insert(bind(vec![target("a", DRIVER), target("b", DRIVER)]));
    let reconciler = reconciler(&world);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    let mut changed = stored_bind(&world);
    changed.spec.load_balancers.truncate(1);
    world.binds.insert(changed);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    let names: Vec<String> = children(&world).iter().map(|lb| lb.name_any()).collect();
    assert_eq!(names, vec!["web-a"]);
    let group = world.groups.object(NS, "web").unwrap();
    assert_eq!(group.spec.load_balancers, vec!["web-a"]);
}

#[tokio::test]
async fn deletion_removes_children_before_finalizer() {
    let world = World::with_driver();
    world.binds.insert(bind(vec![target("a", DRIVER)]));
    let reconciler = reconciler(&world);
    assert!(reconciler.sync_bind(KEY).await.is_succ());

    world.binds.delete(NS, "web").await.unwrap();
    let result = reconciler.sync_bind(KEY).await;
    assert!(result.is_running(), "{}", result);
    assert!(children(&world).is_empty());
    assert!(world.groups.object(NS, "web").is_none());
    assert!(!stored_bind(&world).finalizers().is_empty());

    assert!(reconciler.sync_bind(KEY).await.is_succ());
    assert!(world.binds.object(NS, "web").is_none());
}

#[tokio::test]
async fn vanished_bind_is_done() {
    let world = World::with_driver();
    assert!(reconciler(&world).sync_bind(KEY).await.is_succ());
    assert!(world.lbs.is_empty());
}
