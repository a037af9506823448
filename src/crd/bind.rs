//! Bind Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, DeregisterPolicy, DeregisterWebhookSpec, EnsurePolicyConfig, PodBackend};

/// Bind resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lbcf.tkestack.io",
    version = "v1beta1",
    kind = "Bind",
    plural = "binds",
    singular = "bind",
    namespaced,
    status = "BindStatus",
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BindSpec {
    /// Load balancers the pods are bound to
    pub load_balancers: Vec<TargetLoadBalancer>,

    /// Pods bound to every load balancer
    pub pods: PodBackend,

    /// Parameters passed to the driver with every backend
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Ensure policy for load balancers and backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicyConfig>,

    /// When backends of unavailable pods are deregistered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_policy: Option<DeregisterPolicy>,

    /// Webhook consulted by the Webhook deregister policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_webhook: Option<DeregisterWebhookSpec>,
}

/// One load balancer of a Bind
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetLoadBalancer {
    /// Name, unique within the Bind
    pub name: String,

    /// Driver name
    pub driver: String,

    /// Driver specific description of the load balancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub spec: BTreeMap<String, String>,

    /// Attributes applied through ensureLoadBalancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Bind status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindStatus {
    /// Status of every target load balancer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_statuses: Vec<TargetLoadBalancerStatus>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Mirrored status of one target load balancer
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetLoadBalancerStatus {
    pub name: String,

    pub driver: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lb_info: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_synced_attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
