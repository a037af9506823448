//! Operator configuration
//!
//! Every flag can also be set through an environment variable, which is how
//! the deployment manifests configure the operator.

use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

/// LBCF operator - drives external load balancers through driver webhooks
#[derive(Parser, Debug, Clone)]
#[command(name = "lbcf-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Worker tasks per resource kind
    #[arg(long, env = "LBCF_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Interval at which every cached object is synced again
    #[arg(long, env = "LBCF_RESYNC_PERIOD_SECONDS", default_value_t = 300)]
    pub resync_period_seconds: u64,

    /// Port of the metrics and health endpoint
    #[arg(long, env = "LBCF_METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Timeout of webhooks the driver does not configure
    #[arg(long, env = "LBCF_WEBHOOK_TIMEOUT_SECONDS", default_value_t = 10)]
    pub webhook_timeout_seconds: u64,

    /// First delay after a failed sync
    #[arg(long, env = "LBCF_BACKOFF_BASE_MILLIS", default_value_t = 5)]
    pub backoff_base_millis: u64,

    /// Cap of the delay between failed syncs
    #[arg(long, env = "LBCF_BACKOFF_MAX_SECONDS", default_value_t = 1000)]
    pub backoff_max_seconds: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            resync_period_seconds: 300,
            metrics_port: 8080,
            webhook_timeout_seconds: 10,
            backoff_base_millis: 5,
            backoff_max_seconds: 1000,
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.resync_period_seconds == 0 {
            return Err(Error::config("resync period must be positive"));
        }
        if self.webhook_timeout_seconds == 0 {
            return Err(Error::config("webhook timeout must be positive"));
        }
        if self.backoff_base_millis == 0 {
            return Err(Error::config("backoff base must be positive"));
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(Error::config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base(),
                self.backoff_max()
            )));
        }
        Ok(())
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_seconds)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_millis)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_flags() {
        let parsed = OperatorConfig::try_parse_from(["lbcf-operator"]).unwrap();
        let defaults = OperatorConfig::default();
        assert_eq!(parsed.workers, defaults.workers);
        assert_eq!(parsed.resync_period(), defaults.resync_period());
        assert_eq!(parsed.metrics_port, defaults.metrics_port);
        assert_eq!(parsed.webhook_timeout(), Duration::from_secs(10));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let parsed = OperatorConfig::try_parse_from([
            "lbcf-operator",
            "--workers",
            "2",
            "--backoff-base-millis",
            "100",
            "--backoff-max-seconds",
            "30",
        ])
        .unwrap();
        assert_eq!(parsed.workers, 2);
        assert_eq!(parsed.backoff_base(), Duration::from_millis(100));
        assert_eq!(parsed.backoff_max(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_invalid_values() {
        let config = OperatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = OperatorConfig {
            backoff_base_millis: 60_000,
            backoff_max_seconds: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
