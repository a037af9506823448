//! Status conditions and the spec types shared between resources

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackendRecord condition: backend address has been generated
pub const BACKEND_ADDR_GENERATED: &str = "BackendAddrGenerated";
/// BackendRecord condition: backend is registered on the load balancer
pub const BACKEND_REGISTERED: &str = "BackendRegistered";
/// BackendRecord condition: backend was deregistered and may be removed
pub const BACKEND_READY_TO_DELETE: &str = "BackendReadyToDelete";

/// LoadBalancer condition: driver-side load balancer exists
pub const LB_CREATED: &str = "LBCreated";
/// LoadBalancer condition: attributes were applied by the driver
pub const LB_ATTRIBUTES_SYNCED: &str = "LBAttributesSynced";
/// LoadBalancer condition: driver-side load balancer was deleted
pub const LB_READY_TO_DELETE: &str = "LBReadyToDelete";

pub const REASON_OPERATION_FAILED: &str = "OperationFailed";
pub const REASON_OPERATION_IN_PROGRESS: &str = "OperationInProgress";
pub const REASON_INVALID_RESPONSE: &str = "InvalidResponse";
pub const REASON_DEREGISTERED: &str = "Deregistered";

/// Condition status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False)
    pub status: ConditionStatus,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Machine readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    /// A condition of the given type stamped with the current time
    pub fn new(type_: &str, status: ConditionStatus) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            last_transition_time: Utc::now(),
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Attach a message, empty messages are dropped
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.message = (!message.is_empty()).then_some(message);
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Return a new condition list with `condition` merged in.
///
/// An existing entry of the same type is overwritten in place, otherwise the
/// condition is appended. The transition time always comes from `condition`.
pub fn add_condition(existing: &[Condition], condition: Condition) -> Vec<Condition> {
    let mut conditions = existing.to_vec();
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(slot) => *slot = condition,
        None => conditions.push(condition),
    }
    conditions
}

/// Find the condition of the given type
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and is True
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(Condition::is_true)
}

/// Port and protocol of a backend
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    /// Port number
    pub port: i32,

    /// Protocol (TCP, UDP)
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl PortSelector {
    pub fn tcp(port: i32) -> Self {
        Self {
            port,
            protocol: default_protocol(),
        }
    }
}

/// When the ensure webhook is invoked again after a success
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum EnsurePolicy {
    /// Only retry until the first success
    #[default]
    IfNotSucc,
    /// Keep calling ensure periodically forever
    Always,
}

/// Ensure policy configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnsurePolicyConfig {
    /// Policy
    #[serde(default)]
    pub policy: EnsurePolicy,

    /// Minimum period between two periodic ensure calls (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_period_seconds: Option<u64>,
}

impl EnsurePolicyConfig {
    pub fn always(min_period_seconds: Option<u64>) -> Self {
        Self {
            policy: EnsurePolicy::Always,
            min_period_seconds,
        }
    }

    pub fn min_period(&self) -> Option<Duration> {
        self.min_period_seconds.map(Duration::from_secs)
    }
}

/// Whether an ensure policy asks for periodic re-ensure
pub fn is_ensure_always(policy: Option<&EnsurePolicyConfig>) -> bool {
    policy.is_some_and(|p| p.policy == EnsurePolicy::Always)
}

/// When backends of pods that stop being available are deregistered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DeregisterPolicy {
    /// Deregister as soon as the pod is not Ready
    #[default]
    IfNotReady,
    /// Keep the backend while the pod is still Running
    IfNotRunning,
    /// Ask the driver through the judgePodDeregister webhook
    Webhook,
}

/// Fallback used when the judgePodDeregister webhook cannot be consulted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DeregisterFailurePolicy {
    /// Keep every candidate backend
    #[default]
    DoNothing,
    IfNotReady,
    IfNotRunning,
}

/// Webhook consulted before deregistering not-ready pods
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterWebhookSpec {
    /// Driver that serves judgePodDeregister
    pub driver_name: String,

    /// What to do when the webhook fails
    #[serde(default)]
    pub failure_policy: DeregisterFailurePolicy,
}

/// Label equality selector
pub type Labels = BTreeMap<String, String>;

/// Whether every key/value of `selector` is present in `labels`
pub fn selector_matches(selector: &Labels, labels: Option<&Labels>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: ConditionStatus, reason: &str, message: &str) -> Condition {
        Condition::new(type_, status)
            .with_reason(reason)
            .with_message(message)
    }

    #[test]
    fn add_condition_to_empty_list() {
        let c = cond(LB_ATTRIBUTES_SYNCED, ConditionStatus::True, REASON_OPERATION_IN_PROGRESS, "ensured");
        let got = add_condition(&[], c.clone());
        assert_eq!(got, vec![c]);
    }

    #[test]
    fn add_condition_appends_new_type() {
        let created = Condition::new(LB_CREATED, ConditionStatus::True);
        let synced = cond(LB_ATTRIBUTES_SYNCED, ConditionStatus::True, REASON_OPERATION_IN_PROGRESS, "ensured");
        let got = add_condition(&[created.clone()], synced.clone());
        assert_eq!(got.len(), 2);
        assert_eq!(get_condition(&got, LB_CREATED), Some(&created));
        assert_eq!(get_condition(&got, LB_ATTRIBUTES_SYNCED), Some(&synced));
    }

    #[test]
    fn add_condition_overwrites_same_type_in_place() {
        let old = vec![
            cond(BACKEND_REGISTERED, ConditionStatus::False, REASON_OPERATION_IN_PROGRESS, "should-be-overwritten"),
            Condition::new(BACKEND_ADDR_GENERATED, ConditionStatus::True),
        ];
        let new = Condition::new(BACKEND_REGISTERED, ConditionStatus::True).with_message("overwrite");
        let got = add_condition(&old, new.clone());
        assert_eq!(got.len(), old.len());
        assert_eq!(got[0], new);
        assert_eq!(got[0].reason, None);
        // input list untouched
        assert_eq!(old[0].message.as_deref(), Some("should-be-overwritten"));
    }

    #[test]
    fn add_condition_refreshes_time_even_when_unchanged() {
        let mut old = Condition::new(BACKEND_REGISTERED, ConditionStatus::True);
        old.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        let new = Condition::new(BACKEND_REGISTERED, ConditionStatus::True);
        let got = add_condition(&[old.clone()], new.clone());
        assert_eq!(got[0].last_transition_time, new.last_transition_time);
        assert!(got[0].last_transition_time > old.last_transition_time);
    }

    #[test]
    fn condition_is_true_requires_presence() {
        let conditions = vec![Condition::new(LB_CREATED, ConditionStatus::False)];
        assert!(!condition_is_true(&conditions, LB_CREATED));
        assert!(!condition_is_true(&conditions, LB_ATTRIBUTES_SYNCED));
        let conditions = add_condition(&conditions, Condition::new(LB_CREATED, ConditionStatus::True));
        assert!(condition_is_true(&conditions, LB_CREATED));
    }

    #[test]
    fn empty_message_is_dropped() {
        assert_eq!(Condition::new(LB_CREATED, ConditionStatus::True).with_message("").message, None);
    }

    #[test]
    fn condition_serializes_type_field() {
        let json = serde_json::to_value(Condition::new(LB_CREATED, ConditionStatus::True)).unwrap();
        assert_eq!(json["type"], "LBCreated");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn selector_matches_subset() {
        let selector: Labels = [("k1", "v1"), ("k2", "v2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut labels = selector.clone();
        labels.insert("k3".into(), "v3".into());
        assert!(selector_matches(&selector, Some(&labels)));
        labels.remove("k2");
        assert!(!selector_matches(&selector, Some(&labels)));
        assert!(!selector_matches(&selector, None));
        assert!(selector_matches(&Labels::new(), None));
    }
}
