//! BackendGroup reconciler
//!
//! Projects a group's backend selector onto the live pods, services and
//! nodes, and makes the BackendRecords owned by the group match.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    condition_is_true, driver_namespace, BackendGroup, BackendGroupStatus, BackendRecord,
    BackendRecordSpec, BackendSelector, BackendSource, DeregisterFailurePolicy, DeregisterPolicy,
    Labels, LoadBalancer, PodBackend, PodBackendRecord, ServiceBackend, ServiceBackendRecord,
    BACKEND_REGISTERED, DEREGISTER_BACKEND_FINALIZER, LABEL_GROUP_NAME,
};
use crate::error::{Error, Result};
use crate::store::{split_key, Clients, Listers, ResourceClient};
use crate::webhooks::{JudgePodDeregisterRequest, WebhookInvoker};

use super::diff::{compare_backend_records, BackendDiff};
use super::result::SyncResult;
use super::util::{
    find_node_port, is_pod_match_backend_group, make_backend_labels, make_pod_backend_name,
    make_service_backend_name, make_static_backend_name, node_ready, pod_available, pod_running,
};
use super::Syncer;

pub struct BackendGroupReconciler {
    listers: Listers,
    groups: Arc<dyn ResourceClient<BackendGroup>>,
    records: Arc<dyn ResourceClient<BackendRecord>>,
    invoker: Arc<dyn WebhookInvoker>,
}

/// Keep the first record of each name, repeated ports or addresses in the
/// group collapse into one backend
fn dedup_by_name(records: Vec<BackendRecord>) -> Vec<BackendRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.name_any()))
        .collect()
}

/// Selector of the records owned by a group
pub fn group_selector(group_name: &str) -> Labels {
    [(LABEL_GROUP_NAME.to_string(), group_name.to_string())].into()
}

/// Pods whose backends stay registered when the judgePodDeregister webhook
/// cannot be consulted
fn apply_failure_policy(policy: DeregisterFailurePolicy, pods: &[Pod]) -> HashSet<String> {
    match policy {
        DeregisterFailurePolicy::DoNothing => pods.iter().map(|p| p.name_any()).collect(),
        DeregisterFailurePolicy::IfNotReady => HashSet::new(),
        DeregisterFailurePolicy::IfNotRunning => pods
            .iter()
            .filter(|p| pod_running(p))
            .map(|p| p.name_any())
            .collect(),
    }
}

impl BackendGroupReconciler {
    pub fn new(listers: Listers, clients: &Clients, invoker: Arc<dyn WebhookInvoker>) -> Self {
        Self {
            listers,
            groups: clients.backend_groups.clone(),
            records: clients.backend_records.clone(),
            invoker,
        }
    }

    #[instrument(skip(self))]
    pub async fn sync_backend_group(&self, key: &str) -> SyncResult {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => return SyncResult::error(e),
        };
        let Some(group) = self.listers.backend_groups.get(namespace, name) else {
            debug!("BackendGroup is gone");
            return SyncResult::succ();
        };
        if group.metadata.deletion_timestamp.is_some() {
            return SyncResult::succ();
        }

        let lbs = self.target_load_balancers(&group);
        let desired = match self.desired_records(&group, &lbs) {
            Ok(desired) => desired,
            Err(e) => return SyncResult::error(e),
        };
        let existing = self
            .listers
            .backend_records
            .list(Some(namespace), &group_selector(name));
        let protected = self.protected_records(&group, &existing).await;

        let mut diff = compare_backend_records(desired, &existing, &protected);
        diff.add.retain(|record| !self.driver_draining(record));
        if !diff.is_empty() {
            info!(
                add = diff.add.len(),
                update = diff.update.len(),
                delete = diff.delete.len(),
                "Applying backend changes"
            );
        }

        let errors = self.apply(&diff).await;
        let status_result = self.update_status(&group, &existing, &diff).await;
        match Error::aggregate(errors) {
            Some(err) => SyncResult::error(err),
            None => status_result,
        }
    }

    /// LoadBalancers of the group that exist and were created by their driver
    fn target_load_balancers(&self, group: &BackendGroup) -> Vec<LoadBalancer> {
        let namespace = group.namespace().unwrap_or_default();
        group
            .spec
            .load_balancers
            .iter()
            .filter_map(|name| self.listers.load_balancers.get(&namespace, name))
            .filter(|lb| lb.metadata.deletion_timestamp.is_none() && lb.is_created())
            .collect()
    }

    /// BackendRecords that should exist for the group
    pub fn desired_records(
        &self,
        group: &BackendGroup,
        lbs: &[LoadBalancer],
    ) -> Result<Vec<BackendRecord>> {
        if lbs.is_empty() {
            return Ok(Vec::new());
        }
        let records = match &group.spec.backends {
            BackendSelector::Pods(pods) => self.desired_pod_records(group, pods, lbs),
            BackendSelector::Service(svc) => self.desired_service_records(group, svc, lbs),
            BackendSelector::Static(addrs) => lbs
                .iter()
                .flat_map(|lb| {
                    addrs.iter().map(move |addr| {
                        new_backend_record(
                            group,
                            lb,
                            make_static_backend_name(&lb.name_any(), &group.name_any(), addr),
                            BackendSource::StaticAddr(addr.clone()),
                            "",
                            "",
                        )
                    })
                })
                .collect(),
        };
        Ok(dedup_by_name(records))
    }

    fn desired_pod_records(
        &self,
        group: &BackendGroup,
        selector: &PodBackend,
        lbs: &[LoadBalancer],
    ) -> Vec<BackendRecord> {
        let namespace = group.namespace().unwrap_or_default();
        let pods: Vec<Pod> = self
            .listers
            .pods
            .list(Some(&namespace), &Labels::new())
            .into_iter()
            .filter(|pod| is_pod_match_backend_group(group, pod) && pod_available(pod))
            .collect();

        let mut records = Vec::with_capacity(lbs.len() * pods.len() * selector.ports.len());
        for lb in lbs {
            for pod in &pods {
                let pod_name = pod.name_any();
                let pod_uid = pod.uid().unwrap_or_default();
                for port in &selector.ports {
                    records.push(new_backend_record(
                        group,
                        lb,
                        make_pod_backend_name(&lb.name_any(), &group.name_any(), &pod_uid, port),
                        BackendSource::PodBackendInfo(PodBackendRecord {
                            name: pod_name.clone(),
                            port: port.clone(),
                        }),
                        "",
                        &pod_name,
                    ));
                }
            }
        }
        records
    }

    fn desired_service_records(
        &self,
        group: &BackendGroup,
        selector: &ServiceBackend,
        lbs: &[LoadBalancer],
    ) -> Vec<BackendRecord> {
        let namespace = group.namespace().unwrap_or_default();
        let Some(svc) = self.listers.services.get(&namespace, &selector.name) else {
            debug!(service = %selector.name, "Service not found, no backends");
            return Vec::new();
        };
        let Some(node_port) = find_node_port(&svc, &selector.port) else {
            warn!(
                service = %selector.name,
                port = selector.port.port,
                protocol = %selector.port.protocol,
                "Service exposes no node port for the selected port"
            );
            return Vec::new();
        };
        let nodes: Vec<String> = self
            .listers
            .nodes
            .list(None, &selector.node_selector)
            .iter()
            .filter(|node| node_ready(node))
            .map(|node| node.name_any())
            .collect();

        let mut records = Vec::with_capacity(lbs.len() * nodes.len());
        for lb in lbs {
            for node_name in &nodes {
                records.push(new_backend_record(
                    group,
                    lb,
                    make_service_backend_name(
                        &lb.name_any(),
                        &group.name_any(),
                        &selector.name,
                        &selector.port,
                        node_name,
                    ),
                    BackendSource::ServiceBackendInfo(ServiceBackendRecord {
                        name: selector.name.clone(),
                        port: selector.port.clone(),
                        node_port,
                        node_name: node_name.clone(),
                    }),
                    &selector.name,
                    "",
                ));
            }
        }
        records
    }

    /// Names of existing records that must not be deleted
    async fn protected_records(
        &self,
        group: &BackendGroup,
        existing: &[BackendRecord],
    ) -> HashSet<String> {
        let mut protected: HashSet<String> = existing
            .iter()
            .filter(|r| r.metadata.deletion_timestamp.is_some())
            .map(|r| r.name_any())
            .collect();

        let policy = group.spec.deregister_policy.unwrap_or_default();
        if policy == DeregisterPolicy::IfNotReady {
            return protected;
        }

        let namespace = group.namespace().unwrap_or_default();
        let mut candidates: BTreeMap<String, Pod> = BTreeMap::new();
        for pod_name in existing.iter().filter_map(BackendRecord::pod_name) {
            if candidates.contains_key(pod_name) {
                continue;
            }
            if let Some(pod) = self.listers.pods.get(&namespace, pod_name) {
                if is_pod_match_backend_group(group, &pod) && !pod_available(&pod) {
                    candidates.insert(pod_name.to_string(), pod);
                }
            }
        }
        if candidates.is_empty() {
            return protected;
        }

        let pods: Vec<Pod> = candidates.into_values().collect();
        let keep = match policy {
            DeregisterPolicy::IfNotRunning => {
                apply_failure_policy(DeregisterFailurePolicy::IfNotRunning, &pods)
            }
            DeregisterPolicy::Webhook => self.judge_pod_deregister(group, pods).await,
            DeregisterPolicy::IfNotReady => HashSet::new(),
        };
        protected.extend(
            existing
                .iter()
                .filter(|r| r.pod_name().is_some_and(|p| keep.contains(p)))
                .map(|r| r.name_any()),
        );
        protected
    }

    /// Pods the driver wants to keep registered although they are not ready
    async fn judge_pod_deregister(&self, group: &BackendGroup, pods: Vec<Pod>) -> HashSet<String> {
        let failure_policy = group
            .spec
            .deregister_webhook
            .as_ref()
            .map(|w| w.failure_policy)
            .unwrap_or_default();
        let Some(webhook) = &group.spec.deregister_webhook else {
            warn!("Webhook deregister policy without deregisterWebhook, applying failure policy");
            return apply_failure_policy(failure_policy, &pods);
        };

        let namespace = group.namespace().unwrap_or_default();
        let driver_ns = driver_namespace(&webhook.driver_name, &namespace);
        let Some(driver) = self.listers.drivers.get(driver_ns, &webhook.driver_name) else {
            warn!(driver = %webhook.driver_name, "Deregister driver not found, applying failure policy");
            return apply_failure_policy(failure_policy, &pods);
        };

        let req = JudgePodDeregisterRequest { pods };
        match self.invoker.judge_pod_deregister(&driver, &req).await {
            Ok(rsp) if rsp.result.succ => rsp
                .do_not_deregister
                .iter()
                .map(|p| p.name_any())
                .collect(),
            Ok(rsp) => {
                warn!(msg = %rsp.result.msg, "judgePodDeregister refused, applying failure policy");
                apply_failure_policy(failure_policy, &req.pods)
            }
            Err(e) => {
                warn!(error = %e, "judgePodDeregister failed, applying failure policy");
                apply_failure_policy(failure_policy, &req.pods)
            }
        }
    }

    fn driver_draining(&self, record: &BackendRecord) -> bool {
        let namespace = record.namespace().unwrap_or_default();
        let driver_name = &record.spec.lb_driver;
        let draining = self
            .listers
            .drivers
            .get(driver_namespace(driver_name, &namespace), driver_name)
            .is_some_and(|driver| driver.is_draining());
        if draining {
            debug!(record = %record.name_any(), driver = %driver_name, "Driver is draining, backend not added");
        }
        draining
    }

    /// Attempt every change, collecting the failures
    async fn apply(&self, diff: &BackendDiff) -> Vec<Error> {
        let mut errors = Vec::new();
        for record in &diff.add {
            match self.records.create(record).await {
                Ok(_) => debug!(record = %record.name_any(), "BackendRecord created"),
                Err(e) => errors.push(e),
            }
        }
        for record in &diff.update {
            match self.records.update(record).await {
                Ok(_) => debug!(record = %record.name_any(), "BackendRecord updated"),
                Err(e) => errors.push(e),
            }
        }
        for record in &diff.delete {
            let namespace = record.namespace().unwrap_or_default();
            match self.records.delete(&namespace, &record.name_any()).await {
                Ok(()) => debug!(record = %record.name_any(), "BackendRecord deleted"),
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    async fn update_status(
        &self,
        group: &BackendGroup,
        existing: &[BackendRecord],
        diff: &BackendDiff,
    ) -> SyncResult {
        let backends = (existing.len() + diff.add.len()).saturating_sub(diff.delete.len());
        let registered = existing
            .iter()
            .filter(|r| condition_is_true(r.conditions(), BACKEND_REGISTERED))
            .count();
        let status = BackendGroupStatus {
            backends: i32::try_from(backends).unwrap_or(i32::MAX),
            registered_backends: i32::try_from(registered).unwrap_or(i32::MAX),
        };
        if group.status.as_ref() == Some(&status) {
            return SyncResult::succ();
        }

        let mut cpy = group.clone();
        cpy.status = Some(status);
        match self.groups.update_status(&cpy).await {
            Ok(_) => SyncResult::succ(),
            Err(e) => SyncResult::from_write_error(e),
        }
    }
}

/// A BackendRecord for `backend` on `lb`, owned by `group`
fn new_backend_record(
    group: &BackendGroup,
    lb: &LoadBalancer,
    name: String,
    backend: BackendSource,
    svc_name: &str,
    pod_name: &str,
) -> BackendRecord {
    let mut record = BackendRecord::new(
        &name,
        BackendRecordSpec {
            lb_name: lb.name_any(),
            lb_driver: lb.spec.lb_driver.clone(),
            lb_info: lb.lb_info(),
            lb_attributes: lb.spec.attributes.clone(),
            backend,
            parameters: group.spec.parameters.clone(),
            ensure_policy: group.spec.ensure_policy.clone(),
            deregister_policy: group.spec.deregister_policy,
            deregister_webhook: group.spec.deregister_webhook.clone(),
        },
    );
    record.metadata.namespace = group.namespace();
    record.metadata.labels = Some(make_backend_labels(
        &lb.spec.lb_driver,
        &lb.name_any(),
        &group.name_any(),
        svc_name,
        pod_name,
    ));
    record.metadata.finalizers = Some(vec![DEREGISTER_BACKEND_FINALIZER.to_string()]);
    record.metadata.owner_references = group.controller_owner_ref(&()).map(|owner| vec![owner]);
    record
}

#[async_trait]
impl Syncer for BackendGroupReconciler {
    fn kind(&self) -> &'static str {
        "BackendGroup"
    }

    async fn sync(&self, key: &str) -> SyncResult {
        self.sync_backend_group(key).await
    }
}
