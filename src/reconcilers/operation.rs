//! Status bookkeeping for driver operations that did not succeed

use crate::crd::{
    add_condition, get_condition, BackendRecord, BackendRecordStatus, Condition, ConditionStatus,
    LoadBalancer, LoadBalancerStatus, REASON_INVALID_RESPONSE, REASON_OPERATION_FAILED,
    REASON_OPERATION_IN_PROGRESS,
};
use crate::error::{Error, Result};
use crate::store::ResourceClient;
use crate::webhooks::ResponseForFailRetryHooks;

use super::result::{calculate_retry_interval, SyncResult};

/// Objects whose status carries a condition list
pub trait Conditioned: Clone + Send + Sync {
    fn conditions(&self) -> &[Condition];
    fn set_conditions(&mut self, conditions: Vec<Condition>);
}

impl Conditioned for BackendRecord {
    fn conditions(&self) -> &[Condition] {
        BackendRecord::conditions(self)
    }

    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.status
            .get_or_insert_with(BackendRecordStatus::default)
            .conditions = conditions;
    }
}

impl Conditioned for LoadBalancer {
    fn conditions(&self) -> &[Condition] {
        LoadBalancer::conditions(self)
    }

    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.status
            .get_or_insert_with(LoadBalancerStatus::default)
            .conditions = conditions;
    }
}

/// Copy of `obj` with `condition` merged into its status
pub fn with_condition<K: Conditioned>(obj: &K, condition: Condition) -> K {
    let mut cpy = obj.clone();
    let conditions = add_condition(obj.conditions(), condition);
    cpy.set_conditions(conditions);
    cpy
}

/// Write `condition` to the status of `obj`
pub async fn write_condition<K: Conditioned>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    condition: Condition,
) -> Result<K> {
    client.update_status(&with_condition(obj, condition)).await
}

/// The driver refused: condition False with reason OperationFailed, retry later
pub async fn set_operation_failed<K: Conditioned>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    rsp: &ResponseForFailRetryHooks,
    type_: &str,
) -> SyncResult {
    let condition = Condition::new(type_, ConditionStatus::False)
        .with_reason(REASON_OPERATION_FAILED)
        .with_message(rsp.msg.as_str());
    match write_condition(client, obj, condition).await {
        Ok(_) => SyncResult::fail(
            calculate_retry_interval(rsp.min_retry_delay_in_seconds),
            rsp.msg.clone(),
        ),
        Err(e) => SyncResult::from_write_error(e),
    }
}

/// The driver is still working: only reason and message change, the previous
/// status is kept
pub async fn set_operation_running<K: Conditioned>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    rsp: &ResponseForFailRetryHooks,
    type_: &str,
) -> SyncResult {
    let status = get_condition(obj.conditions(), type_).map_or(ConditionStatus::False, |c| c.status);
    let condition = Condition::new(type_, status)
        .with_reason(REASON_OPERATION_IN_PROGRESS)
        .with_message(rsp.msg.as_str());
    match write_condition(client, obj, condition).await {
        Ok(_) => SyncResult::running(calculate_retry_interval(rsp.min_retry_delay_in_seconds)),
        Err(e) => SyncResult::from_write_error(e),
    }
}

/// The driver answered with an unknown status token
pub async fn set_operation_invalid<K: Conditioned>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    rsp: &ResponseForFailRetryHooks,
    type_: &str,
) -> SyncResult {
    let condition = Condition::new(type_, ConditionStatus::False)
        .with_reason(REASON_INVALID_RESPONSE)
        .with_message(format!("unknown status {:?}, msg: {}", rsp.status, rsp.msg));
    match write_condition(client, obj, condition).await {
        Ok(_) => SyncResult::error(Error::InvalidResponse(rsp.status.clone())),
        Err(e) => SyncResult::from_write_error(e),
    }
}

/// Record a non-Succ answer on condition `type_`
pub async fn record_unsuccessful<K: Conditioned>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    rsp: &ResponseForFailRetryHooks,
    type_: &str,
) -> SyncResult {
    use crate::webhooks::HookOutcome;

    match rsp.outcome() {
        HookOutcome::Fail => set_operation_failed(client, obj, rsp, type_).await,
        HookOutcome::Running => set_operation_running(client, obj, rsp, type_).await,
        HookOutcome::Invalid(_) => set_operation_invalid(client, obj, rsp, type_).await,
        HookOutcome::Succ => SyncResult::succ(),
    }
}
