//! BackendGroup Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeregisterPolicy, DeregisterWebhookSpec, EnsurePolicyConfig, PortSelector};

/// BackendGroup resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lbcf.tkestack.io",
    version = "v1beta1",
    kind = "BackendGroup",
    plural = "backendgroups",
    singular = "backendgroup",
    shortname = "bg",
    namespaced,
    status = "BackendGroupStatus",
    printcolumn = r#"{"name": "Backends", "type": "integer", "jsonPath": ".status.backends"}"#,
    printcolumn = r#"{"name": "Registered", "type": "integer", "jsonPath": ".status.registeredBackends"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupSpec {
    /// Names of LoadBalancers in the same namespace
    #[serde(default)]
    pub load_balancers: Vec<String>,

    /// How backends are selected
    #[serde(flatten)]
    pub backends: BackendSelector,

    /// Parameters passed to the driver with every backend
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Ensure policy of the generated backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicyConfig>,

    /// When backends of unavailable pods are deregistered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_policy: Option<DeregisterPolicy>,

    /// Webhook consulted by the Webhook deregister policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_webhook: Option<DeregisterWebhookSpec>,
}

/// Backend selection, exactly one source per group
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BackendSelector {
    /// Pods of the group's namespace
    Pods(PodBackend),
    /// Node ports of a service
    Service(ServiceBackend),
    /// Fixed addresses
    Static(Vec<String>),
}

/// Pod selection
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodBackend {
    /// Ports registered for every selected pod
    pub ports: Vec<PortSelector>,

    /// Select pods by label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_label: Option<SelectPodByLabel>,

    /// Select pods by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_name: Vec<String>,
}

/// Label based pod selection
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectPodByLabel {
    /// Label equality selector
    pub selector: BTreeMap<String, String>,

    /// Names of pods excluded although selected
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// Service selection
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackend {
    /// Service name
    pub name: String,

    /// Service port, its node port is registered
    pub port: PortSelector,

    /// Only nodes carrying these labels are used
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// BackendGroup status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupStatus {
    /// Number of BackendRecords owned by the group
    #[serde(default)]
    pub backends: i32,

    /// Number of BackendRecords registered on their load balancer
    #[serde(default)]
    pub registered_backends: i32,
}

impl BackendGroup {
    pub fn pod_backend(&self) -> Option<&PodBackend> {
        match &self.spec.backends {
            BackendSelector::Pods(pods) => Some(pods),
            _ => None,
        }
    }

    pub fn service_backend(&self) -> Option<&ServiceBackend> {
        match &self.spec.backends {
            BackendSelector::Service(svc) => Some(svc),
            _ => None,
        }
    }
}
