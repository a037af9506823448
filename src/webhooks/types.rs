//! Request and response bodies of the driver webhooks

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use serde::{Deserialize, Serialize};

use crate::crd::PortSelector;

pub const STATUS_SUCC: &str = "Succ";
pub const STATUS_FAIL: &str = "Fail";
pub const STATUS_RUNNING: &str = "Running";

/// Identifiers sent with every retryable hook
///
/// `record_id` is stable for the lifetime of the object, `retry_id` is new for
/// every call so drivers can tell retries of one operation apart.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RequestForRetryHooks {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "retryID")]
    pub retry_id: String,
}

impl RequestForRetryHooks {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            retry_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Answer of a hook that may fail and be retried
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseForFailRetryHooks {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub min_retry_delay_in_seconds: i64,
}

/// Interpretation of [`ResponseForFailRetryHooks::status`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    Succ,
    Fail,
    Running,
    /// Status token the operator does not know
    Invalid(String),
}

impl ResponseForFailRetryHooks {
    pub fn outcome(&self) -> HookOutcome {
        match self.status.as_str() {
            STATUS_SUCC => HookOutcome::Succ,
            STATUS_FAIL => HookOutcome::Fail,
            STATUS_RUNNING => HookOutcome::Running,
            other => HookOutcome::Invalid(other.to_string()),
        }
    }
}

/// Answer of a hook that is never retried
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResponseForNoRetryHooks {
    #[serde(default)]
    pub succ: bool,
    #[serde(default)]
    pub msg: String,
}

/// Operation a validation request is made for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ValidateOperation {
    Create,
    Update,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateLoadBalancerRequest {
    pub lb_spec: BTreeMap<String, String>,
    pub operation: ValidateOperation,
    pub attributes: BTreeMap<String, String>,
}

pub type ValidateLoadBalancerResponse = ResponseForNoRetryHooks;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerRequest {
    #[serde(flatten)]
    pub ids: RequestForRetryHooks,
    pub lb_spec: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerResponse {
    #[serde(flatten)]
    pub result: ResponseForFailRetryHooks,
    #[serde(default)]
    pub lb_info: BTreeMap<String, String>,
}

/// Body of ensureLoadBalancer and deleteLoadBalancer
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerOperationRequest {
    #[serde(flatten)]
    pub ids: RequestForRetryHooks,
    pub lb_info: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

pub type LoadBalancerOperationResponse = ResponseForFailRetryHooks;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateBackendRequest {
    pub backend_type: String,
    pub lb_info: BTreeMap<String, String>,
    pub operation: ValidateOperation,
    pub parameters: BTreeMap<String, String>,
}

pub type ValidateBackendResponse = ResponseForNoRetryHooks;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PodBackendInGenerateAddrRequest {
    pub pod: Pod,
    pub port: PortSelector,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackendInGenerateAddrRequest {
    pub service: Service,
    pub port: PortSelector,
    pub node_port: i32,
    pub node_name: String,
    pub node: Node,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBackendAddrRequest {
    #[serde(flatten)]
    pub ids: RequestForRetryHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_backend: Option<PodBackendInGenerateAddrRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_backend: Option<ServiceBackendInGenerateAddrRequest>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBackendAddrResponse {
    #[serde(flatten)]
    pub result: ResponseForFailRetryHooks,
    #[serde(default)]
    pub backend_addr: String,
}

/// Body of ensureBackendRegistered and ensureBackendDeregistered
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendOperationRequest {
    #[serde(flatten)]
    pub ids: RequestForRetryHooks,
    pub lb_info: BTreeMap<String, String>,
    pub backend_addr: String,
    pub parameters: BTreeMap<String, String>,
    pub injected_info: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendOperationResponse {
    #[serde(flatten)]
    pub result: ResponseForFailRetryHooks,
    #[serde(default)]
    pub injected_info: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct JudgePodDeregisterRequest {
    pub pods: Vec<Pod>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgePodDeregisterResponse {
    #[serde(flatten)]
    pub result: ResponseForNoRetryHooks,
    /// Pods whose backends must stay registered
    #[serde(default)]
    pub do_not_deregister: Vec<Pod>,
}
