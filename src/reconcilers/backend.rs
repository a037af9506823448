//! BackendRecord reconciler
//!
//! Drives one backend through its lifecycle on the driver:
//! - address generation (pod and service backends ask the driver, static
//!   backends use their address as is)
//! - registration through ensureBackendRegistered, repeated periodically
//!   under the Always ensure policy
//! - deregistration through ensureBackendDeregistered before the record may
//!   be removed

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::crd::{
    add_condition, driver_namespace, is_ensure_always, BackendRecord, BackendRecordStatus,
    BackendSource, Condition, ConditionStatus, LoadBalancerDriver, BACKEND_ADDR_GENERATED,
    BACKEND_READY_TO_DELETE, BACKEND_REGISTERED, DEREGISTER_BACKEND_FINALIZER, REASON_DEREGISTERED,
};
use crate::error::{Error, Result};
use crate::store::{has_finalizer, remove_finalizer, split_key, Clients, Listers, ResourceClient};
use crate::webhooks::{
    BackendOperationRequest, GenerateBackendAddrRequest, HookOutcome,
    PodBackendInGenerateAddrRequest, RequestForRetryHooks, ServiceBackendInGenerateAddrRequest,
    WebhookInvoker,
};

use super::operation::{record_unsuccessful, with_condition};
use super::result::{ensure_period, SyncResult};
use super::Syncer;

/// How the address of a backend is obtained
#[derive(Debug)]
pub enum AddrSource {
    /// Ask the driver through generateBackendAddr
    Webhook(Box<GenerateBackendAddrRequest>),
    /// The address is known already
    Static(String),
}

pub struct BackendReconciler {
    listers: Listers,
    records: Arc<dyn ResourceClient<BackendRecord>>,
    invoker: Arc<dyn WebhookInvoker>,
}

impl BackendReconciler {
    pub fn new(listers: Listers, clients: &Clients, invoker: Arc<dyn WebhookInvoker>) -> Self {
        Self {
            listers,
            records: clients.backend_records.clone(),
            invoker,
        }
    }

    #[instrument(skip(self))]
    pub async fn sync_backend_record(&self, key: &str) -> SyncResult {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => return SyncResult::error(e),
        };
        let Some(record) = self.listers.backend_records.get(namespace, name) else {
            debug!("BackendRecord is gone");
            return SyncResult::succ();
        };

        if record.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(record.metadata.finalizers.as_ref(), DEREGISTER_BACKEND_FINALIZER) {
                return SyncResult::succ();
            }
            return self.deregister_backend(&record).await;
        }

        let record = if record.backend_addr().is_empty() {
            match self.generate_backend_addr(&record).await {
                ControlFlow::Continue(latest) => latest,
                ControlFlow::Break(result) => return result,
            }
        } else {
            record
        };

        if record.needs_ensure() {
            return self.ensure_backend(&record).await;
        }
        SyncResult::succ()
    }

    fn driver(&self, record: &BackendRecord) -> Result<LoadBalancerDriver> {
        let namespace = record.namespace().unwrap_or_default();
        let driver_name = &record.spec.lb_driver;
        self.listers
            .drivers
            .get(driver_namespace(driver_name, &namespace), driver_name)
            .ok_or_else(|| {
                Error::missing(format!(
                    "driver {:?} for BackendRecord {} not found",
                    driver_name,
                    record.name_any()
                ))
            })
    }

    fn record_id(record: &BackendRecord) -> String {
        record.uid().unwrap_or_default()
    }

    /// Decide how the address of `record` is generated
    pub fn resolve_addr_source(&self, record: &BackendRecord) -> Result<AddrSource> {
        let namespace = record.namespace().unwrap_or_default();
        let ids = RequestForRetryHooks::new(Self::record_id(record));
        match &record.spec.backend {
            BackendSource::PodBackendInfo(info) => {
                let pod = self.listers.pods.get(&namespace, &info.name).ok_or_else(|| {
                    Error::missing(format!("pod {}/{} not found", namespace, info.name))
                })?;
                Ok(AddrSource::Webhook(Box::new(GenerateBackendAddrRequest {
                    ids,
                    pod_backend: Some(PodBackendInGenerateAddrRequest {
                        pod,
                        port: info.port.clone(),
                    }),
                    service_backend: None,
                })))
            }
            BackendSource::ServiceBackendInfo(info) => {
                let service = self.listers.services.get(&namespace, &info.name).ok_or_else(|| {
                    Error::missing(format!("service {}/{} not found", namespace, info.name))
                })?;
                let node = self.listers.nodes.get("", &info.node_name).ok_or_else(|| {
                    Error::missing(format!("node {} not found", info.node_name))
                })?;
                Ok(AddrSource::Webhook(Box::new(GenerateBackendAddrRequest {
                    ids,
                    pod_backend: None,
                    service_backend: Some(ServiceBackendInGenerateAddrRequest {
                        service,
                        port: info.port.clone(),
                        node_port: info.node_port,
                        node_name: info.node_name.clone(),
                        node,
                    }),
                })))
            }
            BackendSource::StaticAddr(addr) => Ok(AddrSource::Static(addr.clone())),
        }
    }

    async fn generate_backend_addr(
        &self,
        record: &BackendRecord,
    ) -> ControlFlow<SyncResult, BackendRecord> {
        let req = match self.resolve_addr_source(record) {
            Ok(AddrSource::Static(addr)) => {
                return self.save_backend_addr(record, addr, String::new()).await;
            }
            Ok(AddrSource::Webhook(req)) => req,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };
        let driver = match self.driver(record) {
            Ok(driver) => driver,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };

        let rsp = match self.invoker.generate_backend_addr(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return ControlFlow::Break(SyncResult::error(e)),
        };
        match rsp.result.outcome() {
            HookOutcome::Succ => {
                info!(addr = %rsp.backend_addr, "Backend address generated");
                self.save_backend_addr(record, rsp.backend_addr, rsp.result.msg)
                    .await
            }
            _ => ControlFlow::Break(
                record_unsuccessful(
                    self.records.as_ref(),
                    record,
                    &rsp.result,
                    BACKEND_ADDR_GENERATED,
                )
                .await,
            ),
        }
    }

    async fn save_backend_addr(
        &self,
        record: &BackendRecord,
        addr: String,
        msg: String,
    ) -> ControlFlow<SyncResult, BackendRecord> {
        let mut cpy = with_condition(
            record,
            Condition::new(BACKEND_ADDR_GENERATED, ConditionStatus::True).with_message(msg),
        );
        cpy.status
            .get_or_insert_with(BackendRecordStatus::default)
            .backend_addr = addr;
        match self.records.update_status(&cpy).await {
            Ok(latest) => ControlFlow::Continue(latest),
            Err(e) => ControlFlow::Break(SyncResult::from_write_error(e)),
        }
    }

    fn operation_request(record: &BackendRecord) -> BackendOperationRequest {
        BackendOperationRequest {
            ids: RequestForRetryHooks::new(Self::record_id(record)),
            lb_info: record.spec.lb_info.clone(),
            backend_addr: record.backend_addr().to_string(),
            parameters: record.spec.parameters.clone(),
            injected_info: record.injected_info(),
        }
    }

    async fn ensure_backend(&self, record: &BackendRecord) -> SyncResult {
        let driver = match self.driver(record) {
            Ok(driver) => driver,
            Err(e) => return SyncResult::error(e),
        };
        let req = Self::operation_request(record);
        let rsp = match self.invoker.ensure_backend_registered(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return SyncResult::error(e),
        };
        if rsp.result.outcome() != HookOutcome::Succ {
            return record_unsuccessful(self.records.as_ref(), record, &rsp.result, BACKEND_REGISTERED)
                .await;
        }

        let mut cpy = with_condition(
            record,
            Condition::new(BACKEND_REGISTERED, ConditionStatus::True)
                .with_message(rsp.result.msg.as_str()),
        );
        if !rsp.injected_info.is_empty() {
            cpy.status
                .get_or_insert_with(BackendRecordStatus::default)
                .injected_info = rsp.injected_info;
        }
        if let Err(e) = self.records.update_status(&cpy).await {
            return SyncResult::from_write_error(e);
        }

        match &record.spec.ensure_policy {
            Some(policy) if is_ensure_always(Some(policy)) => {
                SyncResult::periodic(ensure_period(policy.min_period()))
            }
            _ => SyncResult::succ(),
        }
    }

    async fn deregister_backend(&self, record: &BackendRecord) -> SyncResult {
        if record.backend_addr().is_empty() {
            debug!("Backend has no address, nothing to deregister");
            return self.release(record.clone()).await;
        }
        let driver = match self.driver(record) {
            Ok(driver) => driver,
            Err(e) => return SyncResult::error(e),
        };
        let req = Self::operation_request(record);
        let rsp = match self.invoker.ensure_backend_deregistered(&driver, &req).await {
            Ok(rsp) => rsp,
            Err(e) => return SyncResult::error(e),
        };
        if rsp.result.outcome() != HookOutcome::Succ {
            return record_unsuccessful(
                self.records.as_ref(),
                record,
                &rsp.result,
                BACKEND_READY_TO_DELETE,
            )
            .await;
        }

        // The deregistered state must be durable before the finalizer goes away
        let mut cpy = record.clone();
        let status = cpy.status.get_or_insert_with(BackendRecordStatus::default);
        status.backend_addr.clear();
        status.conditions = add_condition(
            &status.conditions,
            Condition::new(BACKEND_REGISTERED, ConditionStatus::False)
                .with_reason(REASON_DEREGISTERED),
        );
        status.conditions = add_condition(
            &status.conditions,
            Condition::new(BACKEND_READY_TO_DELETE, ConditionStatus::True),
        );
        match self.records.update_status(&cpy).await {
            Ok(latest) => self.release(latest).await,
            Err(e) => SyncResult::from_write_error(e),
        }
    }

    /// Drop the deregister finalizer so the record can go away
    async fn release(&self, mut record: BackendRecord) -> SyncResult {
        let finalizers = remove_finalizer(record.finalizers(), DEREGISTER_BACKEND_FINALIZER);
        record.metadata.finalizers = Some(finalizers);
        match self.records.update(&record).await {
            Ok(_) => {
                info!("Backend deregistered");
                SyncResult::succ()
            }
            Err(e) => SyncResult::from_write_error(e),
        }
    }
}

#[async_trait]
impl Syncer for BackendReconciler {
    fn kind(&self) -> &'static str {
        "BackendRecord"
    }

    async fn sync(&self, key: &str) -> SyncResult {
        self.sync_backend_record(key).await
    }
}
