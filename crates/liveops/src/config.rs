use crate::error::LiveOpsError;
use std::time::Duration;

/// Configuration shared by coordinators, instances and queue processors.
#[derive(Debug, Clone)]
pub struct LiveOpsConfig {
    /// Key prefix for every store key and bus scope. Default: "".
    pub prefix: String,
    /// Queue segment this process serves (e.g. a world id). Default: None.
    pub segment: Option<String>,
    /// Number of work-queue buckets. Default: 256.
    pub bucket_count: u32,
    /// Delay between work-queue polls. Default: 100ms.
    pub poll_interval: Duration,
    /// Delay between side-effect queue drains. Default: 100ms.
    pub side_effect_poll_interval: Duration,
    /// Interval between instance heartbeats. Default: 1000ms.
    pub heartbeat_interval: Duration,
    /// Ticks a service survives without a heartbeat. Default: 10.
    pub default_ttl: u32,
    /// Upper bound a heartbeat can refresh the ttl to. Default: 10.
    pub max_ttl: u32,
    /// Coordinator tick and leader-lock check interval. Default: 2000ms.
    pub status_check_interval: Duration,
    /// How often a follower re-requests the system snapshot until it
    /// arrives. Default: 500ms.
    pub snapshot_retry_interval: Duration,
    /// TTL of the coordinator leader lock. Must exceed
    /// `status_check_interval` so the holder refreshes it in time.
    /// Default: 6000ms.
    pub leader_lock_ttl: Duration,
    /// Upper bound on transaction-log entries inspected by one revert walk.
    /// Default: 1024.
    pub max_revert_steps: usize,
    /// How long `shutdown` waits for each background task. Default: 5s.
    pub shutdown_timeout: Duration,
}

impl LiveOpsConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `bucket_count >= 1` (prevents division-by-zero in bucket hashing)
    /// - `default_ttl >= 1` and `max_ttl >= default_ttl`
    /// - `leader_lock_ttl > status_check_interval`
    /// - All intervals are non-zero
    pub fn validate(&self) -> Result<(), LiveOpsError> {
        if self.bucket_count < 1 {
            return Err(LiveOpsError::InvalidConfig {
                reason: format!("bucket_count must be >= 1, got {}", self.bucket_count),
            });
        }
        if self.default_ttl < 1 {
            return Err(LiveOpsError::InvalidConfig {
                reason: "default_ttl must be >= 1".to_string(),
            });
        }
        if self.max_ttl < self.default_ttl {
            return Err(LiveOpsError::InvalidConfig {
                reason: format!(
                    "max_ttl ({}) must be >= default_ttl ({})",
                    self.max_ttl, self.default_ttl
                ),
            });
        }
        if self.max_revert_steps == 0 {
            return Err(LiveOpsError::InvalidConfig {
                reason: "max_revert_steps must be >= 1".to_string(),
            });
        }
        if let Some(segment) = &self.segment {
            if segment.is_empty() || segment.contains(':') {
                return Err(LiveOpsError::InvalidConfig {
                    reason: format!("segment must be non-empty and contain no ':', got {segment:?}"),
                });
            }
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("side_effect_poll_interval", self.side_effect_poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("status_check_interval", self.status_check_interval),
            ("snapshot_retry_interval", self.snapshot_retry_interval),
            ("leader_lock_ttl", self.leader_lock_ttl),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(LiveOpsError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.leader_lock_ttl <= self.status_check_interval {
            return Err(LiveOpsError::InvalidConfig {
                reason: "leader_lock_ttl must be greater than status_check_interval".to_string(),
            });
        }
        Ok(())
    }

    /// Upper bound on how long a dead service stays in the tables.
    pub fn liveness_bound(&self) -> Duration {
        self.status_check_interval * self.default_ttl
    }
}

impl Default for LiveOpsConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            segment: None,
            bucket_count: 256,
            poll_interval: Duration::from_millis(100),
            side_effect_poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(1000),
            default_ttl: 10,
            max_ttl: 10,
            status_check_interval: Duration::from_millis(2000),
            snapshot_retry_interval: Duration::from_millis(500),
            leader_lock_ttl: Duration::from_millis(6000),
            max_revert_steps: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = LiveOpsConfig::default();
        assert_eq!(config.bucket_count, 256);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.default_ttl, 10);
        assert_eq!(config.max_ttl, 10);
        assert_eq!(config.status_check_interval, Duration::from_millis(2000));
        assert_eq!(config.snapshot_retry_interval, Duration::from_millis(500));
        assert!(config.segment.is_none());
    }

    #[test]
    fn default_config_is_valid() {
        LiveOpsConfig::default().validate().unwrap();
    }

    #[test]
    fn custom_config() {
        let config = LiveOpsConfig {
            bucket_count: 16,
            prefix: "test".into(),
            ..Default::default()
        };
        assert_eq!(config.bucket_count, 16);
        // Other fields keep defaults
        assert_eq!(config.default_ttl, 10);
    }

    #[test]
    fn validate_bucket_count_zero() {
        let config = LiveOpsConfig {
            bucket_count: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("bucket_count"), "got: {msg}");
    }

    #[test]
    fn validate_max_ttl_below_default() {
        let config = LiveOpsConfig {
            max_ttl: 5,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("max_ttl"), "got: {msg}");
    }

    #[test]
    fn validate_zero_duration() {
        let config = LiveOpsConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("poll_interval"), "got: {msg}");
    }

    #[test]
    fn validate_leader_lock_shorter_than_check() {
        let config = LiveOpsConfig {
            leader_lock_ttl: Duration::from_millis(1000),
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("leader_lock_ttl"), "got: {msg}");
    }

    #[test]
    fn validate_segment_with_separator() {
        let config = LiveOpsConfig {
            segment: Some("eu:1".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn liveness_bound_is_ttl_times_interval() {
        let config = LiveOpsConfig::default();
        assert_eq!(config.liveness_bound(), Duration::from_secs(20));
    }
}
