//! Reconcilers for the LBCF resources
//!
//! Every reconciler reads through injected listers, writes through injected
//! clients and reports the outcome of one pass as a [`SyncResult`]:
//! - [`backend`]: address generation, registration and deregistration of BackendRecords
//! - [`backend_group`]: derives BackendRecords from BackendGroups
//! - [`load_balancer`]: create, ensure and delete of driver-side load balancers
//! - [`bind`]: derives LoadBalancers and a BackendGroup from a Bind

pub mod backend;
pub mod backend_group;
pub mod bind;
pub mod diff;
pub mod load_balancer;
pub mod operation;
pub mod result;
pub mod util;

pub use backend::BackendReconciler;
pub use backend_group::BackendGroupReconciler;
pub use bind::BindReconciler;
pub use load_balancer::LoadBalancerReconciler;
pub use result::SyncResult;

use async_trait::async_trait;

/// Reconciles the objects of one kind by key
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Kind name used in logs and metrics
    fn kind(&self) -> &'static str;

    async fn sync(&self, key: &str) -> SyncResult;
}
