//! LoadBalancer reconciler
//!
//! Creates the driver-side load balancer, keeps its attributes in sync and
//! deletes it once every backend registered on it has been removed.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    driver_namespace, is_ensure_always, BackendRecord, Condition, ConditionStatus, LoadBalancer,
    LoadBalancerDriver, LoadBalancerStatus, DELETE_LOAD_BALANCER_FINALIZER, LABEL_LB_NAME,
    LB_ATTRIBUTES_SYNCED, LB_CREATED, LB_READY_TO_DELETE, REASON_OPERATION_FAILED,
};
use crate::error::{Error, Result};
use crate::store::{has_finalizer, remove_finalizer, split_key, Clients, Listers, ResourceClient};
use crate::webhooks::{
    CreateLoadBalancerRequest, HookOutcome, LoadBalancerOperationRequest, RequestForRetryHooks,
    ValidateLoadBalancerRequest, ValidateOperation, WebhookInvoker,
};

use super::operation::{record_unsuccessful, with_condition, write_condition};
use super::result::{ensure_period, SyncResult, DEFAULT_RETRY_INTERVAL};
use super::Syncer;

pub struct LoadBalancerReconciler {
    listers: Listers,
    load_balancers: Arc<dyn ResourceClient<LoadBalancer>>,
    records: Arc<dyn ResourceClient<BackendRecord>>,
    invoker: Arc<dyn WebhookInvoker>,
}

impl LoadBalancerReconciler {
    pub fn new(listers: Listers, clients: &Clients, invoker: Arc<dyn WebhookInvoker>) -> Self {
        Self {
            listers,
            load_balancers: clients.load_balancers.clone(),
            records: clients.backend_records.clone(),
            invoker,
        }
    }

    #[instrument(skip(self))]
    pub async fn sync_load_balancer(&self, key: &str) -> SyncResult {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => return SyncResult::error(e),
        };
        let Some(lb) = self.listers.load_balancers.get(namespace, name) else {
            debug!("LoadBalancer is gone");
            return SyncResult::succ();
        };

        if lb.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(lb.metadata.finalizers.as_ref(), DELETE_LOAD_BALANCER_FINALIZER) {
                return SyncResult::succ();
            }
            return self.delete_load_balancer(&lb).await;
        }

        let lb = match self.add_finalizer(lb).await {
            ControlFlow::Continue(latest) => latest,
            ControlFlow::Break(result) => return result,
        };

        let lb = if lb.is_created() {
            lb
        } else {
            match self.create_load_balancer(&lb).await {
                ControlFlow::Continue(latest) => latest,
                ControlFlow::Break(result) => return result,
            }
        };

        if lb.needs_ensure() {
            return self.ensure_load_balancer(&lb).await;
        }
        SyncResult::succ()
    }

    fn driver(&self, lb: &LoadBalancer) -> Result<LoadBalancerDriver> {
        let namespace = lb.namespace().unwrap_or_default();
        let driver_name = &lb.spec.lb_driver;
        self.listers
            .drivers
            .get(driver_namespace(driver_name, &namespace), driver_name)
            .ok_or_else(|| {
                Error::missing(format!(
                    "driver {:?} for LoadBalancer {} not found",
                    driver_name,
                    lb.name_any()
                ))
            })
    }

    fn operation_request(lb: &LoadBalancer) -> LoadBalancerOperationRequest {
        LoadBalancerOperationRequest {
            ids: RequestForRetryHooks::new(lb.uid().unwrap_or_default()),
            lb_info: lb.lb_info(),
            attributes: lb.spec.attributes.clone(),
        }
    }

    async fn add_finalizer(&self, lb: LoadBalancer) -> ControlFlow<SyncResult, LoadBalancer> {
        if has_finalizer(lb.metadata.finalizers.as_ref(), DELETE_LOAD_BALANCER_FINALIZER) {
            return ControlFlow::Continue(lb);
        }
        let mut cpy = lb;
        cpy.finalizers_mut()
            .push(DELETE_LOAD_BALANCER_FINALIZER.to_string());
        match self.load_balancers.update(&cpy).await {
            Ok(latest) => ControlFlow::Continue(latest),
            Err(e) => ControlFlow::Break(SyncResult::from_write_error(e)),
        }
    }

    async fn create_load_balancer(
        &self,
        lb: &LoadBalancer,
    ) -> ControlFlow<SyncResult, LoadBalancer> {
        let driver = match self.driver(lb) {
            Ok(driver) => driver,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };
        if driver.is_draining() {
            warn!(driver = %driver.name_any(), "Driver is draining, LoadBalancer not created");
            return ControlFlow::Break(SyncResult::fail(
                DEFAULT_RETRY_INTERVAL,
                format!("driver {} is draining", driver.name_any()),
            ));
        }

        let validate = ValidateLoadBalancerRequest {
            lb_spec: lb.spec.lb_spec.clone(),
            operation: ValidateOperation::Create,
            attributes: lb.spec.attributes.clone(),
        };
        let rsp = match self.invoker.validate_load_balancer(&driver, &validate).await {
            Ok(rsp) => rsp,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };
        if !rsp.succ {
            warn!(msg = %rsp.msg, "LoadBalancer rejected by driver");
            let condition = Condition::new(LB_CREATED, ConditionStatus::False)
                .with_reason(REASON_OPERATION_FAILED)
                .with_message(rsp.msg.as_str());
            return ControlFlow::Break(
                match write_condition(self.load_balancers.as_ref(), lb, condition).await {
                    Ok(_) => SyncResult::fail(DEFAULT_RETRY_INTERVAL, rsp.msg),
                    Err(e) => SyncResult::from_write_error(e),
                },
            );
        }

        let req = CreateLoadBalancerRequest {
            ids: RequestForRetryHooks::new(lb.uid().unwrap_or_default()),
            lb_spec: lb.spec.lb_spec.clone(),
            attributes: lb.spec.attributes.clone(),
        };
        let rsp = match self.invoker.create_load_balancer(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };
        if rsp.result.outcome() != HookOutcome::Succ {
            return ControlFlow::Break(
                record_unsuccessful(self.load_balancers.as_ref(), lb, &rsp.result, LB_CREATED)
                    .await,
            );
        }

        let lb_info = if rsp.lb_info.is_empty() {
            lb.spec.lb_spec.clone()
        } else {
            rsp.lb_info
        };
        info!(?lb_info, "LoadBalancer created");
        let mut cpy = with_condition(
            lb,
            Condition::new(LB_CREATED, ConditionStatus::True).with_message(rsp.result.msg),
        );
        cpy.status.get_or_insert_with(LoadBalancerStatus::default).lb_info = lb_info;
        match self.load_balancers.update_status(&cpy).await {
            Ok(latest) => ControlFlow::Continue(latest),
            Err(e) => ControlFlow::Break(SyncResult::from_write_error(e)),
        }
    }

    async fn ensure_load_balancer(&self, lb: &LoadBalancer) -> SyncResult {
        let driver = match self.driver(lb) {
            Ok(driver) => driver,
            Err(e) => return SyncResult::error(e),
        };
        let req = Self::operation_request(lb);
        let rsp = match self.invoker.ensure_load_balancer(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return SyncResult::error(e),
        };
        if rsp.outcome() != HookOutcome::Succ {
            return record_unsuccessful(self.load_balancers.as_ref(), lb, &rsp, LB_ATTRIBUTES_SYNCED)
                .await;
        }

        let mut cpy = with_condition(
            lb,
            Condition::new(LB_ATTRIBUTES_SYNCED, ConditionStatus::True)
                .with_message(rsp.msg.as_str()),
        );
        cpy.status
            .get_or_insert_with(LoadBalancerStatus::default)
            .last_synced_attributes = lb.spec.attributes.clone();
        if let Err(e) = self.load_balancers.update_status(&cpy).await {
            return SyncResult::from_write_error(e);
        }
        debug!("LoadBalancer attributes synced");

        match &lb.spec.ensure_policy {
            Some(policy) if is_ensure_always(Some(policy)) => {
                SyncResult::periodic(ensure_period(policy.min_period()))
            }
            _ => SyncResult::succ(),
        }
    }

    async fn delete_load_balancer(&self, lb: &LoadBalancer) -> SyncResult {
        if !lb.is_created() {
            debug!("LoadBalancer was never created, releasing finalizer");
            return self.remove_finalizer(lb).await;
        }

        let namespace = lb.namespace().unwrap_or_default();
        let selector: BTreeMap<String, String> =
            [(LABEL_LB_NAME.to_string(), lb.name_any())].into();
        let records = self.listers.backend_records.list(Some(&namespace), &selector);
        if !records.is_empty() {
            let mut errors = Vec::new();
            for record in records
                .iter()
                .filter(|r| r.metadata.deletion_timestamp.is_none())
            {
                if let Err(e) = self.records.delete(&namespace, &record.name_any()).await {
                    errors.push(e);
                }
            }
            if let Some(err) = Error::aggregate(errors) {
                return SyncResult::error(err);
            }
            debug!(remaining = records.len(), "Waiting for backends to be deregistered");
            return SyncResult::running(DEFAULT_RETRY_INTERVAL);
        }

        let driver = match self.driver(lb) {
            Ok(driver) => driver,
            Err(e) => return SyncResult::error(e),
        };
        let req = Self::operation_request(lb);
        let rsp = match self.invoker.delete_load_balancer(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return SyncResult::error(e),
        };
        if rsp.outcome() != HookOutcome::Succ {
            return record_unsuccessful(self.load_balancers.as_ref(), lb, &rsp, LB_READY_TO_DELETE)
                .await;
        }

        let condition = Condition::new(LB_READY_TO_DELETE, ConditionStatus::True)
            .with_message(rsp.msg.as_str());
        let latest = match write_condition(self.load_balancers.as_ref(), lb, condition).await {
            Ok(latest) => latest,
            Err(e) => return SyncResult::from_write_error(e),
        };
        info!("LoadBalancer deleted by driver");
        self.remove_finalizer(&latest).await
    }

    async fn remove_finalizer(&self, lb: &LoadBalancer) -> SyncResult {
        let mut cpy = lb.clone();
        cpy.metadata.finalizers = Some(remove_finalizer(
            lb.finalizers(),
            DELETE_LOAD_BALANCER_FINALIZER,
        ));
        match self.load_balancers.update(&cpy).await {
            Ok(_) => SyncResult::succ(),
            Err(e) => SyncResult::from_write_error(e),
        }
    }
}

#[async_trait]
impl Syncer for LoadBalancerReconciler {
    fn kind(&self) -> &'static str {
        "LoadBalancer"
    }

    async fn sync(&self, key: &str) -> SyncResult {
        self.sync_load_balancer(key).await
    }
}
