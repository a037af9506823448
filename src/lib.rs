//! LBCF Kubernetes Operator
//!
//! This operator binds pods, services and static addresses to external load
//! balancers. Load balancers and backends are created, kept in sync and
//! removed through the webhooks of LoadBalancerDriver resources.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod store;
pub mod webhooks;

pub use error::{Error, Result};
