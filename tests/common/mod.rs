//! Shared fixtures for the reconciler tests
//!
//! Reconcilers run against in-memory stores and a [`FakeInvoker`] that
//! answers webhooks from a script and records every request it receives.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, NodeStatus, Pod, PodCondition, PodStatus, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use lbcf_operator::crd::{
    BackendGroup, BackendGroupSpec, BackendRecord, BackendRecordSpec, BackendSelector,
    BackendSource, Bind, Condition, ConditionStatus, LoadBalancer, LoadBalancerDriver,
    LoadBalancerDriverSpec, LoadBalancerSpec, LoadBalancerStatus, PodBackend, PortSelector,
    SelectPodByLabel, DEREGISTER_BACKEND_FINALIZER, DRIVER_DRAINING_LABEL, LB_CREATED,
};
use lbcf_operator::error::{Error, Result};
use lbcf_operator::store::memory::MemoryStore;
use lbcf_operator::store::{Clients, Listers};
use lbcf_operator::webhooks::*;

pub const NS: &str = "test";
pub const DRIVER: &str = "test-driver";

/// One scripted answer
enum Answer {
    Respond(Value),
    TransportError(String),
}

/// A recorded webhook call
#[derive(Clone, Debug)]
pub struct Call {
    pub hook: String,
    pub driver: String,
    pub request: Value,
}

/// [`WebhookInvoker`] answering from a script
///
/// Scripted answers are consumed in order per hook. Once a hook's script is
/// exhausted its default answer is used, which is a success.
pub struct FakeInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Answer>>>,
    defaults: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeInvoker {
    pub fn new() -> Arc<Self> {
        let defaults = [
            (VALIDATE_LOAD_BALANCER, json!({"succ": true})),
            (VALIDATE_BACKEND, json!({"succ": true})),
            (JUDGE_POD_DEREGISTER, json!({"succ": true, "doNotDeregister": []})),
            (CREATE_LOAD_BALANCER, json!({"status": "Succ", "lbInfo": {"lbID": "lb-1"}})),
            (ENSURE_LOAD_BALANCER, json!({"status": "Succ"})),
            (DELETE_LOAD_BALANCER, json!({"status": "Succ"})),
            (GENERATE_BACKEND_ADDR, json!({"status": "Succ", "backendAddr": "10.0.0.1:80"})),
            (ENSURE_BACKEND_REGISTERED, json!({"status": "Succ"})),
            (ENSURE_BACKEND_DEREGISTERED, json!({"status": "Succ"})),
        ]
        .into_iter()
        .map(|(hook, value)| (hook.to_string(), value))
        .collect();
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            defaults: Mutex::new(defaults),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answer the next call of `hook` with `value`
    pub fn respond(&self, hook: &str, value: Value) {
        self.scripts
            .lock()
            .unwrap()
            .entry(hook.to_string())
            .or_default()
            .push_back(Answer::Respond(value));
    }

    /// Fail the next call of `hook` as if the driver were unreachable
    pub fn fail_transport(&self, hook: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(hook.to_string())
            .or_default()
            .push_back(Answer::TransportError("connection refused".to_string()));
    }

    /// Answer every unscripted call of `hook` with `value`
    pub fn set_default(&self, hook: &str, value: Value) {
        self.defaults.lock().unwrap().insert(hook.to_string(), value);
    }

    /// Requests of every call of `hook`, oldest first
    pub fn calls(&self, hook: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.hook == hook)
            .map(|c| c.request.clone())
            .collect()
    }

    pub fn all_calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn answer<Req, Rsp>(&self, driver: &LoadBalancerDriver, hook: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        self.calls.lock().unwrap().push(Call {
            hook: hook.to_string(),
            driver: driver.name_any(),
            request: serde_json::to_value(req)?,
        });
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(hook)
            .and_then(VecDeque::pop_front);
        let value = match scripted {
            Some(Answer::Respond(value)) => value,
            Some(Answer::TransportError(msg)) => {
                return Err(Error::webhook(&driver.name_any(), hook, msg))
            }
            None => self.defaults.lock().unwrap()[hook].clone(),
        };
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl WebhookInvoker for FakeInvoker {
    async fn validate_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateLoadBalancerRequest,
    ) -> Result<ValidateLoadBalancerResponse> {
        self.answer(driver, VALIDATE_LOAD_BALANCER, req)
    }

    async fn create_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &CreateLoadBalancerRequest,
    ) -> Result<CreateLoadBalancerResponse> {
        self.answer(driver, CREATE_LOAD_BALANCER, req)
    }

    async fn ensure_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse> {
        self.answer(driver, ENSURE_LOAD_BALANCER, req)
    }

    async fn delete_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse> {
        self.answer(driver, DELETE_LOAD_BALANCER, req)
    }

    async fn validate_backend(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateBackendRequest,
    ) -> Result<ValidateBackendResponse> {
        self.answer(driver, VALIDATE_BACKEND, req)
    }

    async fn generate_backend_addr(
        &self,
        driver: &LoadBalancerDriver,
        req: &GenerateBackendAddrRequest,
    ) -> Result<GenerateBackendAddrResponse> {
        self.answer(driver, GENERATE_BACKEND_ADDR, req)
    }

    async fn ensure_backend_registered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse> {
        self.answer(driver, ENSURE_BACKEND_REGISTERED, req)
    }

    async fn ensure_backend_deregistered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse> {
        self.answer(driver, ENSURE_BACKEND_DEREGISTERED, req)
    }

    async fn judge_pod_deregister(
        &self,
        driver: &LoadBalancerDriver,
        req: &JudgePodDeregisterRequest,
    ) -> Result<JudgePodDeregisterResponse> {
        self.answer(driver, JUDGE_POD_DEREGISTER, req)
    }
}

/// In-memory cluster shared by a reconciler under test
pub struct World {
    pub pods: Arc<MemoryStore<Pod>>,
    pub services: Arc<MemoryStore<Service>>,
    pub nodes: Arc<MemoryStore<Node>>,
    pub drivers: Arc<MemoryStore<LoadBalancerDriver>>,
    pub lbs: Arc<MemoryStore<LoadBalancer>>,
    pub groups: Arc<MemoryStore<BackendGroup>>,
    pub records: Arc<MemoryStore<BackendRecord>>,
    pub binds: Arc<MemoryStore<Bind>>,
    pub invoker: Arc<FakeInvoker>,
}

impl World {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(MemoryStore::new()),
            services: Arc::new(MemoryStore::new()),
            nodes: Arc::new(MemoryStore::new()),
            drivers: Arc::new(MemoryStore::new()),
            lbs: Arc::new(MemoryStore::new()),
            groups: Arc::new(MemoryStore::new()),
            records: Arc::new(MemoryStore::new()),
            binds: Arc::new(MemoryStore::new()),
            invoker: FakeInvoker::new(),
        }
    }

    /// A world with the default driver installed
    pub fn with_driver() -> Self {
        let world = Self::new();
        world.drivers.insert(driver(DRIVER));
        world
    }

    pub fn listers(&self) -> Listers {
        Listers {
            pods: self.pods.clone(),
            services: self.services.clone(),
            nodes: self.nodes.clone(),
            drivers: self.drivers.clone(),
            load_balancers: self.lbs.clone(),
            backend_groups: self.groups.clone(),
            backend_records: self.records.clone(),
            binds: self.binds.clone(),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            load_balancers: self.lbs.clone(),
            backend_groups: self.groups.clone(),
            backend_records: self.records.clone(),
            binds: self.binds.clone(),
        }
    }

    pub fn invoker(&self) -> Arc<dyn WebhookInvoker> {
        self.invoker.clone()
    }
}

pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NS.to_string()),
        ..Default::default()
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn driver(name: &str) -> LoadBalancerDriver {
    LoadBalancerDriver {
        metadata: meta(name),
        spec: LoadBalancerDriverSpec {
            driver_type: "Webhook".to_string(),
            url: "http://driver.test".to_string(),
            webhooks: vec![],
        },
    }
}

pub fn draining_driver(name: &str) -> LoadBalancerDriver {
    let mut driver = driver(name);
    driver.metadata.labels = Some(labels(&[(DRIVER_DRAINING_LABEL, "true")]));
    driver
}

/// A pod in phase `phase`, Ready when `ready`
pub fn pod(name: &str, app: &str, phase: &str, ready: bool) -> Pod {
    let mut metadata = meta(name);
    metadata.labels = Some(labels(&[("app", app)]));
    metadata.uid = Some(format!("uid-{}", name));
    Pod {
        metadata,
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some("192.168.0.10".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn node(name: &str, node_labels: &[(&str, &str)], ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(node_labels)),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn service(name: &str, port: i32, node_port: i32) -> Service {
    Service {
        metadata: meta(name),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port,
                node_port: Some(node_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn load_balancer(name: &str) -> LoadBalancer {
    LoadBalancer {
        metadata: meta(name),
        spec: LoadBalancerSpec {
            lb_driver: DRIVER.to_string(),
            lb_spec: labels(&[("vip", "1.1.1.1")]),
            attributes: BTreeMap::new(),
            ensure_policy: None,
        },
        status: None,
    }
}

/// A LoadBalancer the driver has created
pub fn created_load_balancer(name: &str) -> LoadBalancer {
    let mut lb = load_balancer(name);
    lb.status = Some(LoadBalancerStatus {
        lb_info: labels(&[("lbID", name)]),
        last_synced_attributes: BTreeMap::new(),
        conditions: vec![Condition::new(LB_CREATED, ConditionStatus::True)],
    });
    lb
}

pub fn pods_by_label(app: &str, ports: &[i32]) -> BackendSelector {
    BackendSelector::Pods(PodBackend {
        ports: ports.iter().map(|p| PortSelector::tcp(*p)).collect(),
        by_label: Some(SelectPodByLabel {
            selector: labels(&[("app", app)]),
            except: vec![],
        }),
        by_name: vec![],
    })
}

pub fn group(name: &str, lbs: &[&str], backends: BackendSelector) -> BackendGroup {
    BackendGroup {
        metadata: meta(name),
        spec: BackendGroupSpec {
            load_balancers: lbs.iter().map(|s| s.to_string()).collect(),
            backends,
            parameters: BTreeMap::new(),
            ensure_policy: None,
            deregister_policy: None,
            deregister_webhook: None,
        },
        status: None,
    }
}

/// A BackendRecord for `backend` on the default driver, carrying the deregister finalizer
pub fn record(name: &str, backend: BackendSource) -> BackendRecord {
    let mut metadata = meta(name);
    metadata.finalizers = Some(vec![DEREGISTER_BACKEND_FINALIZER.to_string()]);
    BackendRecord {
        metadata,
        spec: BackendRecordSpec {
            lb_name: "lb".to_string(),
            lb_driver: DRIVER.to_string(),
            lb_info: labels(&[("lbID", "lb-1")]),
            lb_attributes: BTreeMap::new(),
            backend,
            parameters: BTreeMap::new(),
            ensure_policy: None,
            deregister_policy: None,
            deregister_webhook: None,
        },
        status: None,
    }
}
