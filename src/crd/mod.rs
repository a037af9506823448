//! Custom Resource Definitions for the LBCF operator

mod backend_group;
mod backend_record;
mod bind;
mod condition;
mod driver;
mod load_balancer;

pub use backend_group::*;
pub use backend_record::*;
pub use bind::*;
pub use condition::*;
pub use driver::*;
pub use load_balancer::*;

use kube::CustomResourceExt;

/// Finalizer guarding driver-side deregistration of a BackendRecord
pub const DEREGISTER_BACKEND_FINALIZER: &str = "lbcf.tkestack.io/deregister-backend";

/// Finalizer guarding driver-side deletion of a LoadBalancer
pub const DELETE_LOAD_BALANCER_FINALIZER: &str = "lbcf.tkestack.io/delete-load-balancer";

/// Finalizer guarding cleanup of a Bind's children
pub const DELETE_BIND_FINALIZER: &str = "lbcf.tkestack.io/delete-bind";

pub const LABEL_DRIVER_NAME: &str = "lbcf.tkestack.io/lb-driver";
pub const LABEL_LB_NAME: &str = "lbcf.tkestack.io/lb-name";
pub const LABEL_GROUP_NAME: &str = "lbcf.tkestack.io/backend-group";
pub const LABEL_POD_NAME: &str = "lbcf.tkestack.io/backend-pod";
pub const LABEL_SERVICE_NAME: &str = "lbcf.tkestack.io/backend-service";
pub const LABEL_BIND_NAME: &str = "lbcf.tkestack.io/bind";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    [
        LoadBalancerDriver::crd(),
        LoadBalancer::crd(),
        BackendGroup::crd(),
        BackendRecord::crd(),
        Bind::crd(),
    ]
    .iter()
    .map(serde_yaml::to_string)
    .collect()
}
