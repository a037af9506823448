//! LoadBalancerDriver Custom Resource Definition

use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label that marks a driver as draining
pub const DRIVER_DRAINING_LABEL: &str = "lbcf.tkestack.io/driver-draining";

/// Drivers with this name prefix are shared system drivers
pub const SYSTEM_DRIVER_PREFIX: &str = "lbcf-";

/// Namespace holding system drivers
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// LoadBalancerDriver resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lbcf.tkestack.io",
    version = "v1beta1",
    kind = "LoadBalancerDriver",
    plural = "loadbalancerdrivers",
    singular = "loadbalancerdriver",
    shortname = "lbdriver",
    namespaced,
    printcolumn = r#"{"name": "URL", "type": "string", "jsonPath": ".spec.url"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDriverSpec {
    /// Driver type, only "Webhook" is supported
    #[serde(default = "default_driver_type")]
    pub driver_type: String,

    /// Base URL of the driver, webhooks are served at `<url>/<hook>`
    pub url: String,

    /// Per-hook settings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookConfig>,
}

fn default_driver_type() -> String {
    "Webhook".to_string()
}

/// Per-hook settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Hook name, e.g. ensureBackendRegistered
    pub name: String,

    /// Call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl LoadBalancerDriver {
    /// Configured timeout of a hook, if any
    pub fn webhook_timeout(&self, hook: &str) -> Option<Duration> {
        self.spec
            .webhooks
            .iter()
            .find(|w| w.name == hook)
            .and_then(|w| w.timeout_seconds)
            .map(Duration::from_secs)
    }

    /// Draining drivers accept no new load balancers or backends
    pub fn is_draining(&self) -> bool {
        self.labels()
            .get(DRIVER_DRAINING_LABEL)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Namespace a driver referenced from `namespace` is looked up in
pub fn driver_namespace<'a>(driver_name: &str, namespace: &'a str) -> &'a str {
    if driver_name.starts_with(SYSTEM_DRIVER_PREFIX) {
        SYSTEM_NAMESPACE
    } else {
        namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn driver_with_label(value: Option<&str>) -> LoadBalancerDriver {
        let labels = value.map(|v| [(DRIVER_DRAINING_LABEL.to_string(), v.to_string())].into());
        LoadBalancerDriver {
            metadata: ObjectMeta {
                name: Some("my-driver".into()),
                labels,
                ..Default::default()
            },
            spec: LoadBalancerDriverSpec {
                driver_type: default_driver_type(),
                url: "http://driver".into(),
                webhooks: vec![WebhookConfig {
                    name: "ensureBackendRegistered".into(),
                    timeout_seconds: Some(3),
                }],
            },
        }
    }

    #[test]
    fn draining_label_is_case_insensitive() {
        assert!(driver_with_label(Some("true")).is_draining());
        assert!(driver_with_label(Some("True")).is_draining());
        assert!(!driver_with_label(Some("False")).is_draining());
        assert!(!driver_with_label(None).is_draining());
    }

    #[test]
    fn system_drivers_live_in_kube_system() {
        assert_eq!(driver_namespace("lbcf-aaa", "kube-system"), "kube-system");
        assert_eq!(driver_namespace("lbcf-aaa", "test"), "kube-system");
        assert_eq!(driver_namespace("my-driver", "test"), "test");
    }

    #[test]
    fn webhook_timeout_lookup() {
        let driver = driver_with_label(None);
        assert_eq!(
            driver.webhook_timeout("ensureBackendRegistered"),
            Some(Duration::from_secs(3))
        );
        assert_eq!(driver.webhook_timeout("generateBackendAddr"), None);
    }
}
