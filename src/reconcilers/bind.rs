//! Bind reconciler
//!
//! A Bind is shorthand for one LoadBalancer per target plus a BackendGroup
//! binding the selected pods to all of them. The reconciler owns those
//! children and mirrors their status back onto the Bind.

use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::crd::{
    BackendGroup, BackendGroupSpec, BackendSelector, Bind, BindStatus, LoadBalancer,
    LoadBalancerSpec, TargetLoadBalancer, TargetLoadBalancerStatus, DELETE_BIND_FINALIZER,
    LABEL_BIND_NAME,
};
use crate::error::Error;
use crate::store::{has_finalizer, remove_finalizer, split_key, Clients, Listers, ResourceClient};

use super::result::{SyncResult, DEFAULT_RETRY_INTERVAL};
use super::Syncer;

pub struct BindReconciler {
    listers: Listers,
    binds: Arc<dyn ResourceClient<Bind>>,
    load_balancers: Arc<dyn ResourceClient<LoadBalancer>>,
    groups: Arc<dyn ResourceClient<BackendGroup>>,
}

/// Name of the LoadBalancer derived for `target`
pub fn load_balancer_name(bind_name: &str, target: &str) -> String {
    format!("{}-{}", bind_name, target)
}

fn bind_selector(bind_name: &str) -> BTreeMap<String, String> {
    [(LABEL_BIND_NAME.to_string(), bind_name.to_string())].into()
}

/// Children of one kind that need to be written
struct ChildPlan<K> {
    create: Vec<K>,
    update: Vec<K>,
    delete: Vec<K>,
    /// A child is being deleted and will be recreated afterwards
    waiting: bool,
}

impl<K> Default for ChildPlan<K> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
            waiting: false,
        }
    }
}

/// Match desired children to existing ones by name.
///
/// `replace` tells whether an existing child must be deleted and created
/// again, `changed` whether it can be updated in place.
fn plan_children<K, R, C>(desired: Vec<K>, existing: &[K], replace: R, changed: C) -> ChildPlan<K>
where
    K: Resource + Clone,
    R: Fn(&K, &K) -> bool,
    C: Fn(&K, &K) -> bool,
{
    let mut plan = ChildPlan::default();
    let wanted: HashSet<String> = desired.iter().map(|d| d.name_any()).collect();
    for want in desired {
        let name = want.name_any();
        match existing.iter().find(|e| e.name_any() == name) {
            None => plan.create.push(want),
            Some(have) if have.meta().deletion_timestamp.is_some() => plan.waiting = true,
            Some(have) if replace(have, &want) => {
                plan.delete.push(have.clone());
                plan.waiting = true;
            }
            Some(have) if changed(have, &want) => {
                let mut updated = want;
                let meta = updated.meta_mut();
                meta.resource_version = have.meta().resource_version.clone();
                meta.uid = have.meta().uid.clone();
                meta.finalizers = have.meta().finalizers.clone();
                plan.update.push(updated);
            }
            Some(_) => {}
        }
    }
    plan.delete.extend(
        existing
            .iter()
            .filter(|e| e.meta().deletion_timestamp.is_none() && !wanted.contains(&e.name_any()))
            .cloned(),
    );
    plan
}

impl BindReconciler {
    pub fn new(listers: Listers, clients: &Clients) -> Self {
        Self {
            listers,
            binds: clients.binds.clone(),
            load_balancers: clients.load_balancers.clone(),
            groups: clients.backend_groups.clone(),
        }
    }

    #[instrument(skip(self))]
    pub async fn sync_bind(&self, key: &str) -> SyncResult {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => return SyncResult::error(e),
        };
        let Some(bind) = self.listers.binds.get(namespace, name) else {
            debug!("Bind is gone");
            return SyncResult::succ();
        };

        if bind.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(bind.metadata.finalizers.as_ref(), DELETE_BIND_FINALIZER) {
                return SyncResult::succ();
            }
            return self.delete_children(&bind).await;
        }

        let bind = match self.add_finalizer(bind).await {
            ControlFlow::Continue(latest) => latest,
            ControlFlow::Break(result) => return result,
        };

        let selector = bind_selector(name);
        let existing_lbs = self.listers.load_balancers.list(Some(namespace), &selector);
        let existing_groups = self.listers.backend_groups.list(Some(namespace), &selector);

        let lb_plan = plan_children(
            desired_load_balancers(&bind),
            &existing_lbs,
            |have, want| {
                have.spec.lb_driver != want.spec.lb_driver || have.spec.lb_spec != want.spec.lb_spec
            },
            |have, want| have.spec != want.spec,
        );
        let group_plan = plan_children(
            vec![desired_backend_group(&bind)],
            &existing_groups,
            |_, _| false,
            |have, want| have.spec != want.spec,
        );

        let mut errors = self.apply(self.load_balancers.as_ref(), &lb_plan).await;
        errors.extend(self.apply(self.groups.as_ref(), &group_plan).await);
        if let Some(err) = Error::aggregate(errors) {
            return SyncResult::error(err);
        }

        if let Err(e) = self.update_status(&bind, &existing_lbs).await {
            return SyncResult::from_write_error(e);
        }
        if lb_plan.waiting || group_plan.waiting {
            return SyncResult::running(DEFAULT_RETRY_INTERVAL);
        }
        SyncResult::succ()
    }

    async fn add_finalizer(&self, bind: Bind) -> ControlFlow<SyncResult, Bind> {
        if has_finalizer(bind.metadata.finalizers.as_ref(), DELETE_BIND_FINALIZER) {
            return ControlFlow::Continue(bind);
        }
        let mut cpy = bind;
        cpy.finalizers_mut().push(DELETE_BIND_FINALIZER.to_string());
        match self.binds.update(&cpy).await {
            Ok(latest) => ControlFlow::Continue(latest),
            Err(e) => ControlFlow::Break(SyncResult::from_write_error(e)),
        }
    }

    async fn apply<K>(&self, client: &dyn ResourceClient<K>, plan: &ChildPlan<K>) -> Vec<Error>
    where
        K: Resource + Clone + Send + Sync,
    {
        let mut errors = Vec::new();
        for child in &plan.create {
            match client.create(child).await {
                Ok(_) => info!(child = %child.name_any(), "Child created"),
                Err(e) => errors.push(e),
            }
        }
        for child in &plan.update {
            match client.update(child).await {
                Ok(_) => info!(child = %child.name_any(), "Child updated"),
                Err(e) => errors.push(e),
            }
        }
        for child in &plan.delete {
            let namespace = child.namespace().unwrap_or_default();
            match client.delete(&namespace, &child.name_any()).await {
                Ok(()) => info!(child = %child.name_any(), "Child deleted"),
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    async fn update_status(&self, bind: &Bind, lbs: &[LoadBalancer]) -> crate::error::Result<()> {
        let status = BindStatus {
            load_balancer_statuses: bind
                .spec
                .load_balancers
                .iter()
                .map(|target| target_status(&bind.name_any(), target, lbs))
                .collect(),
            observed_generation: bind.metadata.generation,
        };
        if bind.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut cpy = bind.clone();
        cpy.status = Some(status);
        self.binds.update_status(&cpy).await.map(|_| ())
    }

    async fn delete_children(&self, bind: &Bind) -> SyncResult {
        let namespace = bind.namespace().unwrap_or_default();
        let selector = bind_selector(&bind.name_any());
        let lbs = self.listers.load_balancers.list(Some(&namespace), &selector);
        let groups = self.listers.backend_groups.list(Some(&namespace), &selector);

        if !lbs.is_empty() || !groups.is_empty() {
            let lb_plan = ChildPlan {
                delete: lbs
                    .into_iter()
                    .filter(|lb| lb.metadata.deletion_timestamp.is_none())
                    .collect(),
                ..Default::default()
            };
            let group_plan = ChildPlan {
                delete: groups
                    .into_iter()
                    .filter(|g| g.metadata.deletion_timestamp.is_none())
                    .collect(),
                ..Default::default()
            };
            let mut errors = self.apply(self.load_balancers.as_ref(), &lb_plan).await;
            errors.extend(self.apply(self.groups.as_ref(), &group_plan).await);
            if let Some(err) = Error::aggregate(errors) {
                return SyncResult::error(err);
            }
            debug!("Waiting for children to be deleted");
            return SyncResult::running(DEFAULT_RETRY_INTERVAL);
        }

        let mut cpy = bind.clone();
        cpy.metadata.finalizers = Some(remove_finalizer(bind.finalizers(), DELETE_BIND_FINALIZER));
        match self.binds.update(&cpy).await {
            Ok(_) => {
                info!("Bind children removed");
                SyncResult::succ()
            }
            Err(e) => SyncResult::from_write_error(e),
        }
    }
}

fn owned_by_bind<K: Resource>(child: &mut K, bind: &Bind) {
    let meta = child.meta_mut();
    meta.namespace = bind.namespace();
    meta.labels = Some(bind_selector(&bind.name_any()));
    meta.owner_references = bind.controller_owner_ref(&()).map(|owner| vec![owner]);
}

/// LoadBalancers a Bind asks for
pub fn desired_load_balancers(bind: &Bind) -> Vec<LoadBalancer> {
    bind.spec
        .load_balancers
        .iter()
        .map(|target| {
            let mut lb = LoadBalancer::new(
                &load_balancer_name(&bind.name_any(), &target.name),
                LoadBalancerSpec {
                    lb_driver: target.driver.clone(),
                    lb_spec: target.spec.clone(),
                    attributes: target.attributes.clone(),
                    ensure_policy: bind.spec.ensure_policy.clone(),
                },
            );
            owned_by_bind(&mut lb, bind);
            lb
        })
        .collect()
}

/// BackendGroup binding the Bind's pods to all of its LoadBalancers
pub fn desired_backend_group(bind: &Bind) -> BackendGroup {
    let bind_name = bind.name_any();
    let mut group = BackendGroup::new(
        &bind_name,
        BackendGroupSpec {
            load_balancers: bind
                .spec
                .load_balancers
                .iter()
                .map(|target| load_balancer_name(&bind_name, &target.name))
                .collect(),
            backends: BackendSelector::Pods(bind.spec.pods.clone()),
            parameters: bind.spec.parameters.clone(),
            ensure_policy: bind.spec.ensure_policy.clone(),
            deregister_policy: bind.spec.deregister_policy,
            deregister_webhook: bind.spec.deregister_webhook.clone(),
        },
    );
    owned_by_bind(&mut group, bind);
    group
}

fn target_status(
    bind_name: &str,
    target: &TargetLoadBalancer,
    lbs: &[LoadBalancer],
) -> TargetLoadBalancerStatus {
    let lb_name = load_balancer_name(bind_name, &target.name);
    let lb_status = lbs
        .iter()
        .find(|lb| lb.name_any() == lb_name)
        .and_then(|lb| lb.status.clone())
        .unwrap_or_default();
    TargetLoadBalancerStatus {
        name: target.name.clone(),
        driver: target.driver.clone(),
        lb_info: lb_status.lb_info,
        last_synced_attributes: lb_status.last_synced_attributes,
        conditions: lb_status.conditions,
    }
}

#[async_trait]
impl Syncer for BindReconciler {
    fn kind(&self) -> &'static str {
        "Bind"
    }

    async fn sync(&self, key: &str) -> SyncResult {
        self.sync_bind(key).await
    }
}
