//! Driver webhooks
//!
//! Drivers implement a fixed set of hooks served over HTTP at
//! `<driver url>/<hook name>`. Reconcilers call them through the
//! [`WebhookInvoker`] trait so tests can script the answers.

mod types;

pub use types::*;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::crd::LoadBalancerDriver;
use crate::error::{Error, Result};
use crate::metrics;

pub const VALIDATE_LOAD_BALANCER: &str = "validateLoadBalancer";
pub const CREATE_LOAD_BALANCER: &str = "createLoadBalancer";
pub const ENSURE_LOAD_BALANCER: &str = "ensureLoadBalancer";
pub const DELETE_LOAD_BALANCER: &str = "deleteLoadBalancer";
pub const VALIDATE_BACKEND: &str = "validateBackend";
pub const GENERATE_BACKEND_ADDR: &str = "generateBackendAddr";
pub const ENSURE_BACKEND_REGISTERED: &str = "ensureBackendRegistered";
pub const ENSURE_BACKEND_DEREGISTERED: &str = "ensureBackendDeregistered";
pub const JUDGE_POD_DEREGISTER: &str = "judgePodDeregister";

/// Timeout used for hooks the driver does not configure
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls driver hooks
///
/// An `Err` means the call itself failed (transport, HTTP status, decoding).
/// What the driver answered, including unknown status tokens, is in `Ok`.
#[async_trait]
pub trait WebhookInvoker: Send + Sync {
    async fn validate_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateLoadBalancerRequest,
    ) -> Result<ValidateLoadBalancerResponse>;

    async fn create_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &CreateLoadBalancerRequest,
    ) -> Result<CreateLoadBalancerResponse>;

    async fn ensure_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse>;

    async fn delete_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse>;

    async fn validate_backend(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateBackendRequest,
    ) -> Result<ValidateBackendResponse>;

    async fn generate_backend_addr(
        &self,
        driver: &LoadBalancerDriver,
        req: &GenerateBackendAddrRequest,
    ) -> Result<GenerateBackendAddrResponse>;

    async fn ensure_backend_registered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse>;

    async fn ensure_backend_deregistered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse>;

    async fn judge_pod_deregister(
        &self,
        driver: &LoadBalancerDriver,
        req: &JudgePodDeregisterRequest,
    ) -> Result<JudgePodDeregisterResponse>;
}

/// [`WebhookInvoker`] speaking JSON over HTTP
#[derive(Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpInvoker {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::config(format!("failed to build webhook client: {}", e)))?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    async fn call<Req, Rsp>(&self, driver: &LoadBalancerDriver, hook: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let driver_name = driver.name_any();
        let url = hook_url(&driver.spec.url, hook);
        let timeout = driver.webhook_timeout(hook).unwrap_or(self.default_timeout);
        let _timer = metrics::WEBHOOK_DURATION
            .with_label_values(&[hook])
            .start_timer();
        let start = Instant::now();

        let result = self.send(&url, timeout, req).await;
        match &result {
            Ok(_) => {
                metrics::WEBHOOK_CALLS.with_label_values(&[hook, "ok"]).inc();
                debug!(driver = %driver_name, hook, elapsed = ?start.elapsed(), "Webhook call finished");
            }
            Err(e) => {
                metrics::WEBHOOK_CALLS.with_label_values(&[hook, "error"]).inc();
                warn!(driver = %driver_name, hook, url = %url, error = %e, "Webhook call failed");
            }
        }
        result.map_err(|msg| Error::webhook(&driver_name, hook, msg))
    }

    async fn send<Req, Rsp>(&self, url: &str, timeout: Duration, req: &Req) -> std::result::Result<Rsp, String>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let rsp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, body));
        }
        rsp.json::<Rsp>()
            .await
            .map_err(|e| format!("invalid response body: {}", e))
    }
}

/// URL a hook is served at
pub fn hook_url(base: &str, hook: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), hook)
}

#[async_trait]
impl WebhookInvoker for HttpInvoker {
    async fn validate_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateLoadBalancerRequest,
    ) -> Result<ValidateLoadBalancerResponse> {
        self.call(driver, VALIDATE_LOAD_BALANCER, req).await
    }

    async fn create_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &CreateLoadBalancerRequest,
    ) -> Result<CreateLoadBalancerResponse> {
        self.call(driver, CREATE_LOAD_BALANCER, req).await
    }

    async fn ensure_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse> {
        self.call(driver, ENSURE_LOAD_BALANCER, req).await
    }

    async fn delete_load_balancer(
        &self,
        driver: &LoadBalancerDriver,
        req: &LoadBalancerOperationRequest,
    ) -> Result<LoadBalancerOperationResponse> {
        self.call(driver, DELETE_LOAD_BALANCER, req).await
    }

    async fn validate_backend(
        &self,
        driver: &LoadBalancerDriver,
        req: &ValidateBackendRequest,
    ) -> Result<ValidateBackendResponse> {
        self.call(driver, VALIDATE_BACKEND, req).await
    }

    async fn generate_backend_addr(
        &self,
        driver: &LoadBalancerDriver,
        req: &GenerateBackendAddrRequest,
    ) -> Result<GenerateBackendAddrResponse> {
        self.call(driver, GENERATE_BACKEND_ADDR, req).await
    }

    async fn ensure_backend_registered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse> {
        self.call(driver, ENSURE_BACKEND_REGISTERED, req).await
    }

    async fn ensure_backend_deregistered(
        &self,
        driver: &LoadBalancerDriver,
        req: &BackendOperationRequest,
    ) -> Result<BackendOperationResponse> {
        self.call(driver, ENSURE_BACKEND_DEREGISTERED, req).await
    }

    async fn judge_pod_deregister(
        &self,
        driver: &LoadBalancerDriver,
        req: &JudgePodDeregisterRequest,
    ) -> Result<JudgePodDeregisterResponse> {
        self.call(driver, JUDGE_POD_DEREGISTER, req).await
    }
}
