use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Live-ops prometheus metrics for one process.
pub struct LiveOpsMetrics {
    /// Services known to the coordinator tables.
    pub services: IntGauge,
    /// Groups known to the coordinator tables.
    pub groups: IntGauge,
    /// Work-queue buckets owned by this process.
    pub owned_buckets: IntGauge,
    /// 1 while this process holds coordinator leadership.
    pub coordinator_leader: IntGauge,
    pub actions_reduced: IntCounter,
    /// Actions whose handler reported failure.
    pub actions_failed: IntCounter,
    pub reverts_emitted: IntCounter,
    pub transactions_completed: IntCounter,
    pub side_effect_failures: IntCounter,
}

impl LiveOpsMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let services = IntGauge::with_opts(Opts::new(
            "liveops_services",
            "Number of services known to the coordinator",
        ))?;
        let groups = IntGauge::with_opts(Opts::new(
            "liveops_groups",
            "Number of service groups known to the coordinator",
        ))?;
        let owned_buckets = IntGauge::with_opts(Opts::new(
            "liveops_owned_buckets",
            "Number of work-queue buckets owned by this process",
        ))?;
        let coordinator_leader = IntGauge::with_opts(Opts::new(
            "liveops_coordinator_leader",
            "Whether this process is the coordinator leader",
        ))?;
        let actions_reduced = IntCounter::with_opts(Opts::new(
            "liveops_actions_reduced_total",
            "Actions taken from the work queue and reduced",
        ))?;
        let actions_failed = IntCounter::with_opts(Opts::new(
            "liveops_actions_failed_total",
            "Actions whose reducer reported failure",
        ))?;
        let reverts_emitted = IntCounter::with_opts(Opts::new(
            "liveops_reverts_emitted_total",
            "Compensating actions enqueued by revert walks",
        ))?;
        let transactions_completed = IntCounter::with_opts(Opts::new(
            "liveops_transactions_completed_total",
            "Transactions drained after their final action",
        ))?;
        let side_effect_failures = IntCounter::with_opts(Opts::new(
            "liveops_side_effect_failures_total",
            "Trigger handler invocations that returned an error",
        ))?;

        registry.register(Box::new(services.clone()))?;
        registry.register(Box::new(groups.clone()))?;
        registry.register(Box::new(owned_buckets.clone()))?;
        registry.register(Box::new(coordinator_leader.clone()))?;
        registry.register(Box::new(actions_reduced.clone()))?;
        registry.register(Box::new(actions_failed.clone()))?;
        registry.register(Box::new(reverts_emitted.clone()))?;
        registry.register(Box::new(transactions_completed.clone()))?;
        registry.register(Box::new(side_effect_failures.clone()))?;

        Ok(Self {
            services,
            groups,
            owned_buckets,
            coordinator_leader,
            actions_reduced,
            actions_failed,
            reverts_emitted,
            transactions_completed,
            side_effect_failures,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            services: IntGauge::new("liveops_services", "services").expect("valid metric name"),
            groups: IntGauge::new("liveops_groups", "groups").expect("valid metric name"),
            owned_buckets: IntGauge::new("liveops_owned_buckets", "buckets")
                .expect("valid metric name"),
            coordinator_leader: IntGauge::new("liveops_coordinator_leader", "leader")
                .expect("valid metric name"),
            actions_reduced: IntCounter::new("liveops_actions_reduced_total", "reduced")
                .expect("valid metric name"),
            actions_failed: IntCounter::new("liveops_actions_failed_total", "failed")
                .expect("valid metric name"),
            reverts_emitted: IntCounter::new("liveops_reverts_emitted_total", "reverts")
                .expect("valid metric name"),
            transactions_completed: IntCounter::new(
                "liveops_transactions_completed_total",
                "completed",
            )
            .expect("valid metric name"),
            side_effect_failures: IntCounter::new(
                "liveops_side_effect_failures_total",
                "side effects",
            )
            .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = LiveOpsMetrics::unregistered();
        m.services.set(3);
        m.actions_reduced.inc();
        assert_eq!(m.services.get(), 3);
        assert_eq!(m.actions_reduced.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = LiveOpsMetrics::new(&r).unwrap();
        m.owned_buckets.set(86);
        assert_eq!(m.owned_buckets.get(), 86);
        assert_eq!(r.gather().len(), 9);
    }

    #[test]
    fn double_registration_fails() {
        let r = Registry::new();
        LiveOpsMetrics::new(&r).unwrap();
        assert!(LiveOpsMetrics::new(&r).is_err());
    }
}
