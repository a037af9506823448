//! Matching and naming helpers shared by the reconcilers

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{
    selector_matches, BackendGroup, LoadBalancer, PortSelector, LABEL_DRIVER_NAME,
    LABEL_GROUP_NAME, LABEL_LB_NAME, LABEL_POD_NAME, LABEL_SERVICE_NAME,
};

/// Pod can serve traffic: not deleting, has an IP and is Ready
pub fn pod_available(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = &pod.status else {
        return false;
    };
    let has_ip = status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty());
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    has_ip && ready
}

pub fn pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Running")
}

pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the pod is selected by the group's pod backend
pub fn is_pod_match_backend_group(group: &BackendGroup, pod: &Pod) -> bool {
    if group.namespace() != pod.namespace() {
        return false;
    }
    let Some(pods) = group.pod_backend() else {
        return false;
    };
    let name = pod.name_any();
    if pods.by_name.contains(&name) {
        return true;
    }
    pods.by_label.as_ref().is_some_and(|by_label| {
        selector_matches(&by_label.selector, pod.metadata.labels.as_ref())
            && !by_label.except.contains(&name)
    })
}

/// Whether the service is the group's service backend
pub fn is_svc_match_backend_group(group: &BackendGroup, svc: &Service) -> bool {
    group.namespace() == svc.namespace()
        && group
            .service_backend()
            .is_some_and(|backend| backend.name == svc.name_any())
}

/// Whether the group targets the load balancer
pub fn is_lb_match_backend_group(group: &BackendGroup, lb: &LoadBalancer) -> bool {
    group.namespace() == lb.namespace() && group.spec.load_balancers.contains(&lb.name_any())
}

/// Node port serving `port` of the service
pub fn find_node_port(svc: &Service, port: &PortSelector) -> Option<i32> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| {
            p.port == port.port && p.protocol.as_deref().unwrap_or("TCP") == port.protocol
        })
        .and_then(|p| p.node_port)
}

fn hashed_name(lb_name: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lb_name.as_bytes());
    for part in parts {
        hasher.update(b"_");
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", lb_name, &digest[..16])
}

/// Deterministic name of a pod backend
pub fn make_pod_backend_name(
    lb_name: &str,
    group_name: &str,
    pod_uid: &str,
    port: &PortSelector,
) -> String {
    hashed_name(
        lb_name,
        &[group_name, pod_uid, &port.port.to_string(), &port.protocol],
    )
}

/// Deterministic name of a service backend on one node
pub fn make_service_backend_name(
    lb_name: &str,
    group_name: &str,
    svc_name: &str,
    port: &PortSelector,
    node_name: &str,
) -> String {
    hashed_name(
        lb_name,
        &[group_name, svc_name, &port.port.to_string(), &port.protocol, node_name],
    )
}

/// Deterministic name of a static backend
pub fn make_static_backend_name(lb_name: &str, group_name: &str, addr: &str) -> String {
    hashed_name(lb_name, &[group_name, addr])
}

/// Labels every generated BackendRecord carries, empty values are left out
pub fn make_backend_labels(
    driver_name: &str,
    lb_name: &str,
    group_name: &str,
    svc_name: &str,
    pod_name: &str,
) -> BTreeMap<String, String> {
    [
        (LABEL_DRIVER_NAME, driver_name),
        (LABEL_LB_NAME, lb_name),
        (LABEL_GROUP_NAME, group_name),
        (LABEL_SERVICE_NAME, svc_name),
        (LABEL_POD_NAME, pod_name),
    ]
    .into_iter()
    .filter(|(_, v)| !v.is_empty())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
