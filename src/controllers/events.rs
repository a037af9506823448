//! Routing of watched objects to the keys they affect
//!
//! Every function is pure over the objects passed in so the routing can be
//! tested without a cluster.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};

use crate::crd::{
    driver_namespace, BackendGroup, BackendRecord, LoadBalancer, LoadBalancerDriver,
    LABEL_BIND_NAME, LABEL_GROUP_NAME, LABEL_LB_NAME, LABEL_POD_NAME,
};
use crate::reconcilers::util::{
    is_lb_match_backend_group, is_pod_match_backend_group, is_svc_match_backend_group,
};
use crate::store::namespaced_key;

/// Key of an object in its own queue
pub fn object_key<K: Resource>(obj: &K) -> String {
    namespaced_key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

fn group_keys<'a>(groups: impl Iterator<Item = &'a BackendGroup>) -> Vec<String> {
    groups.map(object_key).collect()
}

/// Groups selecting the pod, plus groups that still hold records of it
pub fn groups_for_pod(pod: &Pod, groups: &[BackendGroup], records: &[BackendRecord]) -> Vec<String> {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();
    let mut keys: BTreeSet<String> = groups
        .iter()
        .filter(|g| is_pod_match_backend_group(g, pod))
        .map(object_key)
        .collect();
    keys.extend(
        records
            .iter()
            .filter(|r| r.namespace().as_deref() == Some(namespace.as_str()))
            .filter(|r| r.labels().get(LABEL_POD_NAME) == Some(&pod_name))
            .filter_map(|r| r.labels().get(LABEL_GROUP_NAME))
            .map(|group| namespaced_key(&namespace, group)),
    );
    keys.into_iter().collect()
}

pub fn groups_for_service(svc: &Service, groups: &[BackendGroup]) -> Vec<String> {
    group_keys(groups.iter().filter(|g| is_svc_match_backend_group(g, svc)))
}

/// Node changes affect every service backed group
pub fn groups_for_node(groups: &[BackendGroup]) -> Vec<String> {
    group_keys(groups.iter().filter(|g| g.service_backend().is_some()))
}

pub fn groups_for_load_balancer(lb: &LoadBalancer, groups: &[BackendGroup]) -> Vec<String> {
    group_keys(groups.iter().filter(|g| is_lb_match_backend_group(g, lb)))
}

/// The group that generated the record
pub fn group_for_record(record: &BackendRecord) -> Option<String> {
    let namespace = record.namespace().unwrap_or_default();
    record
        .labels()
        .get(LABEL_GROUP_NAME)
        .map(|group| namespaced_key(&namespace, group))
}

/// The LoadBalancer the record is registered on
pub fn load_balancer_for_record(record: &BackendRecord) -> Option<String> {
    let namespace = record.namespace().unwrap_or_default();
    record
        .labels()
        .get(LABEL_LB_NAME)
        .map(|lb| namespaced_key(&namespace, lb))
}

/// LoadBalancers served by the driver
pub fn load_balancers_for_driver(
    driver: &LoadBalancerDriver,
    lbs: &[LoadBalancer],
) -> Vec<String> {
    let driver_name = driver.name_any();
    let driver_ns = driver.namespace().unwrap_or_default();
    lbs.iter()
        .filter(|lb| lb.spec.lb_driver == driver_name)
        .filter(|lb| {
            let lb_ns = lb.namespace().unwrap_or_default();
            driver_namespace(&driver_name, &lb_ns) == driver_ns
        })
        .map(object_key)
        .collect()
}

/// The Bind a LoadBalancer or BackendGroup was derived from
pub fn bind_for_child<K: Resource>(child: &K) -> Option<String> {
    let namespace = child.meta().namespace.as_deref().unwrap_or_default();
    child
        .meta()
        .labels
        .as_ref()?
        .get(LABEL_BIND_NAME)
        .map(|bind| namespaced_key(namespace, bind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BackendGroupSpec, BackendRecordSpec, BackendSelector, BackendSource, LoadBalancerDriverSpec,
        LoadBalancerSpec, PodBackend, PodBackendRecord, PortSelector, SelectPodByLabel,
        ServiceBackend,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(ns: &str, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn group(ns: &str, name: &str, backends: BackendSelector, lbs: &[&str]) -> BackendGroup {
        BackendGroup {
            metadata: meta(ns, name, &[]),
            spec: BackendGroupSpec {
                load_balancers: lbs.iter().map(|s| s.to_string()).collect(),
                backends,
                parameters: BTreeMap::new(),
                ensure_policy: None,
                deregister_policy: None,
                deregister_webhook: None,
            },
            status: None,
        }
    }

    fn pods_by_label(app: &str) -> BackendSelector {
        BackendSelector::Pods(PodBackend {
            ports: vec![PortSelector::tcp(80)],
            by_label: Some(SelectPodByLabel {
                selector: [("app".to_string(), app.to_string())].into(),
                except: vec![],
            }),
            by_name: vec![],
        })
    }

    fn lb(ns: &str, name: &str, driver: &str) -> LoadBalancer {
        LoadBalancer {
            metadata: meta(ns, name, &[]),
            spec: LoadBalancerSpec {
                lb_driver: driver.into(),
                lb_spec: BTreeMap::new(),
                attributes: BTreeMap::new(),
                ensure_policy: None,
            },
            status: None,
        }
    }

    #[test]
    fn pod_routes_to_selecting_and_holding_groups() {
        let pod = Pod {
            metadata: meta("test", "pod-0", &[("app", "web")]),
            ..Default::default()
        };
        let groups = vec![
            group("test", "web", pods_by_label("web"), &[]),
            group("test", "db", pods_by_label("db"), &[]),
            group("other", "web", pods_by_label("web"), &[]),
        ];
        let record = BackendRecord {
            metadata: meta(
                "test",
                "lb-1234",
                &[(LABEL_POD_NAME, "pod-0"), (LABEL_GROUP_NAME, "old")],
            ),
            spec: BackendRecordSpec {
                lb_name: "lb".into(),
                lb_driver: "driver".into(),
                lb_info: BTreeMap::new(),
                lb_attributes: BTreeMap::new(),
                backend: BackendSource::PodBackendInfo(PodBackendRecord {
                    name: "pod-0".into(),
                    port: PortSelector::tcp(80),
                }),
                parameters: BTreeMap::new(),
                ensure_policy: None,
                deregister_policy: None,
                deregister_webhook: None,
            },
            status: None,
        };

        let keys = groups_for_pod(&pod, &groups, &[record.clone()]);
        assert_eq!(keys, vec!["test/old", "test/web"]);
        assert_eq!(group_for_record(&record).as_deref(), Some("test/old"));
        assert_eq!(load_balancer_for_record(&record), None);
    }

    #[test]
    fn service_and_node_route_to_service_groups() {
        let svc_group = group(
            "test",
            "svc-group",
            BackendSelector::Service(ServiceBackend {
                name: "web".into(),
                port: PortSelector::tcp(80),
                node_selector: BTreeMap::new(),
            }),
            &[],
        );
        let static_group = group("test", "static", BackendSelector::Static(vec!["1.1.1.1:80".into()]), &[]);
        let groups = vec![svc_group, static_group];

        let svc = Service {
            metadata: meta("test", "web", &[]),
            ..Default::default()
        };
        assert_eq!(groups_for_service(&svc, &groups), vec!["test/svc-group"]);
        let other = Service {
            metadata: meta("test", "api", &[]),
            ..Default::default()
        };
        assert!(groups_for_service(&other, &groups).is_empty());
        assert_eq!(groups_for_node(&groups), vec!["test/svc-group"]);
    }

    #[test]
    fn load_balancer_routes_to_groups_and_bind() {
        let groups = vec![
            group("test", "a", pods_by_label("web"), &["lb-1"]),
            group("test", "b", pods_by_label("web"), &["lb-2"]),
        ];
        let mut target = lb("test", "lb-1", "driver");
        assert_eq!(groups_for_load_balancer(&target, &groups), vec!["test/a"]);
        assert_eq!(bind_for_child(&target), None);
        target.metadata.labels = Some([(LABEL_BIND_NAME.to_string(), "web".to_string())].into());
        assert_eq!(bind_for_child(&target).as_deref(), Some("test/web"));
    }

    #[test]
    fn driver_routes_to_its_load_balancers() {
        let driver = LoadBalancerDriver {
            metadata: meta("test", "my-driver", &[]),
            spec: LoadBalancerDriverSpec {
                driver_type: "Webhook".into(),
                url: "http://driver".into(),
                webhooks: vec![],
            },
        };
        let lbs = vec![
            lb("test", "lb-1", "my-driver"),
            lb("test", "lb-2", "other-driver"),
            lb("other", "lb-3", "my-driver"),
        ];
        assert_eq!(load_balancers_for_driver(&driver, &lbs), vec!["test/lb-1"]);

        let system = LoadBalancerDriver {
            metadata: meta("kube-system", "lbcf-shared", &[]),
            spec: driver.spec.clone(),
        };
        let lbs = vec![lb("test", "lb-1", "lbcf-shared"), lb("other", "lb-2", "lbcf-shared")];
        assert_eq!(
            load_balancers_for_driver(&system, &lbs),
            vec!["test/lb-1", "other/lb-2"]
        );
    }
}
