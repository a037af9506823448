//! BackendRecord Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, DeregisterPolicy, DeregisterWebhookSpec, EnsurePolicyConfig, PortSelector};

/// BackendRecord resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lbcf.tkestack.io",
    version = "v1beta1",
    kind = "BackendRecord",
    plural = "backendrecords",
    singular = "backendrecord",
    shortname = "br",
    namespaced,
    status = "BackendRecordStatus",
    printcolumn = r#"{"name": "LB", "type": "string", "jsonPath": ".spec.lbName"}"#,
    printcolumn = r#"{"name": "Address", "type": "string", "jsonPath": ".status.backendAddr"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecordSpec {
    /// Owning LoadBalancer
    pub lb_name: String,

    /// Driver of the LoadBalancer
    pub lb_driver: String,

    /// Driver identification of the LoadBalancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lb_info: BTreeMap<String, String>,

    /// LoadBalancer attributes at the time the record was derived
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lb_attributes: BTreeMap<String, String>,

    /// Where the backend comes from
    #[serde(flatten)]
    pub backend: BackendSource,

    /// Parameters passed to the driver
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Ensure policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicyConfig>,

    /// Deregister policy inherited from the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_policy: Option<DeregisterPolicy>,

    /// Deregister webhook inherited from the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_webhook: Option<DeregisterWebhookSpec>,
}

/// Source of a backend, exactly one payload per record
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BackendSource {
    /// A port of a pod
    PodBackendInfo(PodBackendRecord),
    /// A node port of a service on one node
    ServiceBackendInfo(ServiceBackendRecord),
    /// A fixed address
    StaticAddr(String),
}

/// Pod backend
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodBackendRecord {
    /// Pod name
    pub name: String,

    /// Pod port
    pub port: PortSelector,
}

/// Service backend on a single node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackendRecord {
    /// Service name
    pub name: String,

    /// Service port
    pub port: PortSelector,

    /// Node port serving the service port
    pub node_port: i32,

    /// Node name
    pub node_name: String,
}

/// BackendRecord status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecordStatus {
    /// Address registered on the load balancer, empty until generated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_addr: String,

    /// Opaque data returned by the driver
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub injected_info: BTreeMap<String, String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl BackendRecord {
    pub fn backend_addr(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.backend_addr.as_str())
    }

    pub fn injected_info(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.injected_info.clone())
            .unwrap_or_default()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    /// Address present and not being deleted
    pub fn needs_ensure(&self) -> bool {
        !self.backend_addr().is_empty() && self.metadata.deletion_timestamp.is_none()
    }

    pub fn pod_name(&self) -> Option<&str> {
        match &self.spec.backend {
            BackendSource::PodBackendInfo(pod) => Some(&pod.name),
            _ => None,
        }
    }
}
