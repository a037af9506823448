//! Outcome of one reconciliation pass

use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// Delay used when a driver does not ask for one
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Lower bound of the period between two ensure calls under the Always policy
pub const DEFAULT_ENSURE_PERIOD: Duration = Duration::from_secs(60);

/// What the work queue should do with a key after it was synced
#[derive(Debug)]
pub enum SyncResult {
    /// Done, nothing to do until the object changes
    Succ,
    /// Done, sync again after the period
    Periodic(Duration),
    /// An asynchronous operation is in progress, check again after the delay
    Running(Duration),
    /// The driver refused, retry after the delay
    Fail { retry_after: Duration, reason: String },
    /// Unexpected failure, retried with backoff
    Error(Error),
}

impl SyncResult {
    pub fn succ() -> Self {
        SyncResult::Succ
    }

    pub fn periodic(period: Duration) -> Self {
        SyncResult::Periodic(period)
    }

    pub fn running(delay: Duration) -> Self {
        SyncResult::Running(delay)
    }

    pub fn fail(retry_after: Duration, reason: impl Into<String>) -> Self {
        SyncResult::Fail {
            retry_after,
            reason: reason.into(),
        }
    }

    pub fn error(err: Error) -> Self {
        SyncResult::Error(err)
    }

    /// Result of a failed write to the object being reconciled.
    ///
    /// The object vanishing in the meantime is not an error.
    pub fn from_write_error(err: Error) -> Self {
        if err.is_not_found() {
            SyncResult::Succ
        } else {
            SyncResult::Error(err)
        }
    }

    pub fn is_succ(&self) -> bool {
        matches!(self, SyncResult::Succ)
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, SyncResult::Periodic(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SyncResult::Running(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncResult::Fail { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncResult::Error(_))
    }

    /// Delay before the key is synced again, `None` for Succ and Error
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            SyncResult::Periodic(d) | SyncResult::Running(d) => Some(*d),
            SyncResult::Fail { retry_after, .. } => Some(*retry_after),
            SyncResult::Succ | SyncResult::Error(_) => None,
        }
    }

    /// Metric label of the outcome
    pub fn label(&self) -> &'static str {
        match self {
            SyncResult::Succ => "succ",
            SyncResult::Periodic(_) => "periodic",
            SyncResult::Running(_) => "running",
            SyncResult::Fail { .. } => "fail",
            SyncResult::Error(_) => "error",
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncResult::Succ => write!(f, "succ"),
            SyncResult::Periodic(d) => write!(f, "periodic every {:?}", d),
            SyncResult::Running(d) => write!(f, "running, recheck in {:?}", d),
            SyncResult::Fail { retry_after, reason } => {
                write!(f, "failed ({}), retry in {:?}", reason, retry_after)
            }
            SyncResult::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Retry delay requested by a driver, [`DEFAULT_RETRY_INTERVAL`] unless positive
pub fn calculate_retry_interval(seconds: i64) -> Duration {
    match u64::try_from(seconds) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => DEFAULT_RETRY_INTERVAL,
    }
}

/// Period of the Always ensure policy, never shorter than [`DEFAULT_ENSURE_PERIOD`]
pub fn ensure_period(min_period: Option<Duration>) -> Duration {
    min_period.map_or(DEFAULT_ENSURE_PERIOD, |p| p.max(DEFAULT_ENSURE_PERIOD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_interval() {
        assert_eq!(calculate_retry_interval(10), Duration::from_secs(10));
        assert_eq!(calculate_retry_interval(0), DEFAULT_RETRY_INTERVAL);
        assert_eq!(calculate_retry_interval(-1), DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn ensure_period_has_floor() {
        assert_eq!(ensure_period(None), DEFAULT_ENSURE_PERIOD);
        assert_eq!(ensure_period(Some(Duration::from_secs(30))), DEFAULT_ENSURE_PERIOD);
        assert_eq!(
            ensure_period(Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn exactly_one_outcome() {
        let all = [
            SyncResult::succ(),
            SyncResult::periodic(Duration::from_secs(5)),
            SyncResult::running(Duration::from_secs(5)),
            SyncResult::fail(Duration::from_secs(5), "no"),
            SyncResult::error(Error::config("boom")),
        ];
        for result in &all {
            let flags = [
                result.is_succ(),
                result.is_periodic(),
                result.is_running(),
                result.is_failed(),
                result.is_error(),
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{}", result);
        }
    }

    #[test]
    fn requeue_delays() {
        assert_eq!(SyncResult::succ().requeue_after(), None);
        assert_eq!(SyncResult::error(Error::config("x")).requeue_after(), None);
        assert_eq!(
            SyncResult::fail(Duration::from_secs(7), "r").requeue_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            SyncResult::running(Duration::from_secs(3)).requeue_after(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn vanished_object_is_success() {
        assert!(SyncResult::from_write_error(Error::NotFound("x".into())).is_succ());
        assert!(SyncResult::from_write_error(Error::Conflict("x".into())).is_error());
    }
}
