//! Controllers wiring watches, work queues and reconcilers together
//!
//! One reflector per watched kind keeps a cache the reconcilers read through
//! [`Listers`]. Every object a watch touches is routed to the queues of the
//! objects it affects, and a fixed number of workers per kind drain the
//! queues into the reconcilers.

pub mod events;
pub mod worker;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::{
    runtime::{
        reflector::{self, Store},
        watcher, WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::{BackendGroup, BackendRecord, Bind, LoadBalancer, LoadBalancerDriver};
use crate::metrics;
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::reconcilers::{
    BackendGroupReconciler, BackendReconciler, BindReconciler, LoadBalancerReconciler, Syncer,
};
use crate::store::cluster::{KubeClient, KubeLister};
use crate::store::{Clients, Listers};
use crate::webhooks::{HttpInvoker, WebhookInvoker};

use events::object_key;

/// Work queues of the reconciled kinds
#[derive(Clone)]
pub struct Queues {
    pub backend_records: Arc<WorkQueue>,
    pub backend_groups: Arc<WorkQueue>,
    pub load_balancers: Arc<WorkQueue>,
    pub binds: Arc<WorkQueue>,
}

impl Queues {
    pub fn new(config: &OperatorConfig) -> Self {
        let queue = |name: &'static str| {
            WorkQueue::new(
                name,
                ExponentialBackoff::new(config.backoff_base(), config.backoff_max()),
            )
        };
        Self {
            backend_records: queue("BackendRecord"),
            backend_groups: queue("BackendGroup"),
            load_balancers: queue("LoadBalancer"),
            binds: queue("Bind"),
        }
    }

    fn all(&self) -> [&Arc<WorkQueue>; 4] {
        [
            &self.backend_records,
            &self.backend_groups,
            &self.load_balancers,
            &self.binds,
        ]
    }

    pub fn shut_down(&self) {
        for queue in self.all() {
            queue.shut_down();
        }
    }
}

/// Reflector for one kind: the cache and the stream that keeps it filled
fn reflect<K>(api: Api<K>) -> (Store<K>, BoxStream<'static, K>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(error = %e, "Watch error");
                    None
                }
            }
        })
        .boxed();
    (reader, stream)
}

/// Route every touched object until shutdown
fn feed<K, F>(
    mut objects: BoxStream<'static, K>,
    shutdown: CancellationToken,
    route: F,
) -> JoinHandle<()>
where
    K: Send + 'static,
    F: Fn(&K) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                next = objects.next() => match next {
                    Some(obj) => route(&obj),
                    None => return,
                },
            }
        }
    })
}

fn add_all(queue: &WorkQueue, keys: impl IntoIterator<Item = String>) {
    for key in keys {
        queue.add(key);
    }
}

/// Re-enqueue every cached object of the reconciled kinds periodically
fn resync(
    listers: Listers,
    queues: Queues,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = config.resync_period();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let all = Default::default();
                    add_all(&queues.backend_records, listers.backend_records.list(None, &all).iter().map(object_key));
                    add_all(&queues.backend_groups, listers.backend_groups.list(None, &all).iter().map(object_key));
                    add_all(&queues.load_balancers, listers.load_balancers.list(None, &all).iter().map(object_key));
                    add_all(&queues.binds, listers.binds.list(None, &all).iter().map(object_key));
                }
            }
        }
    })
}

/// Run every controller until `shutdown` is cancelled
pub async fn run(
    client: Client,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (pods, pod_events) = reflect(Api::<Pod>::all(client.clone()));
    let (services, service_events) = reflect(Api::<Service>::all(client.clone()));
    let (nodes, node_events) = reflect(Api::<Node>::all(client.clone()));
    let (drivers, driver_events) = reflect(Api::<LoadBalancerDriver>::all(client.clone()));
    let (lbs, lb_events) = reflect(Api::<LoadBalancer>::all(client.clone()));
    let (groups, group_events) = reflect(Api::<BackendGroup>::all(client.clone()));
    let (records, record_events) = reflect(Api::<BackendRecord>::all(client.clone()));
    let (binds, bind_events) = reflect(Api::<Bind>::all(client.clone()));

    let listers = Listers {
        pods: Arc::new(KubeLister::new(pods.clone())),
        services: Arc::new(KubeLister::new(services.clone())),
        nodes: Arc::new(KubeLister::new(nodes.clone())),
        drivers: Arc::new(KubeLister::new(drivers.clone())),
        load_balancers: Arc::new(KubeLister::new(lbs.clone())),
        backend_groups: Arc::new(KubeLister::new(groups.clone())),
        backend_records: Arc::new(KubeLister::new(records.clone())),
        binds: Arc::new(KubeLister::new(binds.clone())),
    };
    let clients = Clients {
        load_balancers: Arc::new(KubeClient::<LoadBalancer>::new(client.clone())),
        backend_groups: Arc::new(KubeClient::<BackendGroup>::new(client.clone())),
        backend_records: Arc::new(KubeClient::<BackendRecord>::new(client.clone())),
        binds: Arc::new(KubeClient::<Bind>::new(client.clone())),
    };
    let invoker: Arc<dyn WebhookInvoker> = Arc::new(HttpInvoker::new(config.webhook_timeout())?);
    let queues = Queues::new(config);

    let mut tasks = Vec::new();
    {
        let (l, q) = (listers.clone(), queues.clone());
        tasks.push(feed(pod_events, shutdown.clone(), move |pod: &Pod| {
            let groups = l.backend_groups.list(None, &Default::default());
            let records = l.backend_records.list(None, &Default::default());
            add_all(&q.backend_groups, events::groups_for_pod(pod, &groups, &records));
        }));
    }
    {
        let (l, q) = (listers.clone(), queues.clone());
        tasks.push(feed(service_events, shutdown.clone(), move |svc: &Service| {
            let groups = l.backend_groups.list(None, &Default::default());
            add_all(&q.backend_groups, events::groups_for_service(svc, &groups));
        }));
    }
    {
        let (l, q) = (listers.clone(), queues.clone());
        tasks.push(feed(node_events, shutdown.clone(), move |_: &Node| {
            let groups = l.backend_groups.list(None, &Default::default());
            add_all(&q.backend_groups, events::groups_for_node(&groups));
        }));
    }
    {
        let (l, q) = (listers.clone(), queues.clone());
        tasks.push(feed(driver_events, shutdown.clone(), move |driver: &LoadBalancerDriver| {
            let lbs = l.load_balancers.list(None, &Default::default());
            add_all(&q.load_balancers, events::load_balancers_for_driver(driver, &lbs));
        }));
    }
    {
        let (l, q) = (listers.clone(), queues.clone());
        tasks.push(feed(lb_events, shutdown.clone(), move |lb: &LoadBalancer| {
            q.load_balancers.add(object_key(lb));
            let groups = l.backend_groups.list(None, &Default::default());
            add_all(&q.backend_groups, events::groups_for_load_balancer(lb, &groups));
            add_all(&q.binds, events::bind_for_child(lb));
        }));
    }
    {
        let q = queues.clone();
        tasks.push(feed(group_events, shutdown.clone(), move |group: &BackendGroup| {
            q.backend_groups.add(object_key(group));
            add_all(&q.binds, events::bind_for_child(group));
        }));
    }
    {
        let q = queues.clone();
        tasks.push(feed(record_events, shutdown.clone(), move |record: &BackendRecord| {
            q.backend_records.add(object_key(record));
            add_all(&q.backend_groups, events::group_for_record(record));
            add_all(&q.load_balancers, events::load_balancer_for_record(record));
        }));
    }
    {
        let q = queues.clone();
        tasks.push(feed(bind_events, shutdown.clone(), move |bind: &Bind| {
            q.binds.add(object_key(bind));
        }));
    }

    info!("Waiting for caches to sync");
    tokio::select! {
        synced = wait_for_caches(&pods, &services, &nodes, &drivers, &lbs, &groups, &records, &binds) => synced?,
        _ = shutdown.cancelled() => return Ok(()),
    }
    metrics::set_ready(true);
    info!("Caches synced, starting workers");

    let syncers: [(Arc<WorkQueue>, Arc<dyn Syncer>); 4] = [
        (
            queues.backend_records.clone(),
            Arc::new(BackendReconciler::new(listers.clone(), &clients, invoker.clone())),
        ),
        (
            queues.backend_groups.clone(),
            Arc::new(BackendGroupReconciler::new(listers.clone(), &clients, invoker.clone())),
        ),
        (
            queues.load_balancers.clone(),
            Arc::new(LoadBalancerReconciler::new(listers.clone(), &clients, invoker.clone())),
        ),
        (
            queues.binds.clone(),
            Arc::new(BindReconciler::new(listers.clone(), &clients)),
        ),
    ];
    let mut workers = Vec::new();
    for (queue, syncer) in syncers {
        info!(kind = syncer.kind(), workers = config.workers, "Starting workers");
        workers.extend(worker::spawn_workers(queue, syncer, config.workers));
    }
    tasks.push(resync(listers, queues.clone(), config, shutdown.clone()));

    shutdown.cancelled().await;
    info!("Shutting down controllers");
    metrics::set_ready(false);
    queues.shut_down();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task failed");
        }
    }
    for handle in tasks {
        handle.abort();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn wait_for_caches(
    pods: &Store<Pod>,
    services: &Store<Service>,
    nodes: &Store<Node>,
    drivers: &Store<LoadBalancerDriver>,
    lbs: &Store<LoadBalancer>,
    groups: &Store<BackendGroup>,
    records: &Store<BackendRecord>,
    binds: &Store<Bind>,
) -> anyhow::Result<()> {
    pods.wait_until_ready().await?;
    services.wait_until_ready().await?;
    nodes.wait_until_ready().await?;
    drivers.wait_until_ready().await?;
    lbs.wait_until_ready().await?;
    groups.wait_until_ready().await?;
    records.wait_until_ready().await?;
    binds.wait_until_ready().await?;
    Ok(())
}
