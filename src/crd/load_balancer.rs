//! LoadBalancer Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{condition_is_true, Condition, EnsurePolicyConfig, LB_ATTRIBUTES_SYNCED, LB_CREATED};

/// LoadBalancer resource specification
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lbcf.tkestack.io",
    version = "v1beta1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    singular = "loadbalancer",
    shortname = "lb",
    namespaced,
    status = "LoadBalancerStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.lbDriver"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Name of the LoadBalancerDriver
    pub lb_driver: String,

    /// Driver specific description of the load balancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lb_spec: BTreeMap<String, String>,

    /// Attributes applied through ensureLoadBalancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Ensure policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicyConfig>,
}

/// LoadBalancer status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Driver returned identification of the load balancer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lb_info: BTreeMap<String, String>,

    /// Attributes the driver last confirmed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_synced_attributes: BTreeMap<String, String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LoadBalancer {
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    /// Whether the driver side load balancer exists
    pub fn is_created(&self) -> bool {
        condition_is_true(self.conditions(), LB_CREATED)
    }

    pub fn lb_info(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.lb_info.clone())
            .unwrap_or_default()
    }

    /// Whether ensureLoadBalancer must be called
    pub fn needs_ensure(&self) -> bool {
        if super::is_ensure_always(self.spec.ensure_policy.as_ref()) {
            return true;
        }
        let synced = self
            .status
            .as_ref()
            .map(|s| &s.last_synced_attributes);
        !condition_is_true(self.conditions(), LB_ATTRIBUTES_SYNCED)
            || synced != Some(&self.spec.attributes)
    }
}
