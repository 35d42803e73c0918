//! Recycle policy
//!
//! Pure decision function over an instance record: should this instance be
//! retired? Retirement on use count and age bounds memory growth in
//! long-lived renderer processes; the idle check bounds resource cost during
//! low traffic.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::PoolConfig;

use super::instance::{InstanceRecord, InstanceStatus};

/// Why an instance was retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    RenderCount,
    Age,
    Crashed,
    IdleTimeout,
}

impl RetireReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RetireReason::RenderCount => "render_count",
            RetireReason::Age => "age",
            RetireReason::Crashed => "crashed",
            RetireReason::IdleTimeout => "idle_timeout",
        }
    }
}

/// Outcome of a recycle evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleDecision {
    Keep,
    Retire(RetireReason),
}

/// Retirement thresholds for one shard
#[derive(Debug, Clone)]
pub struct RecyclePolicy {
    max_renders: u64,
    max_age: Duration,
    idle_timeout: Duration,
}

impl RecyclePolicy {
    #[must_use]
    pub fn new(max_renders: u64, max_age: Duration, idle_timeout: Duration) -> Self {
        Self {
            max_renders,
            max_age,
            idle_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.max_renders_per_instance(),
            config.max_instance_age(),
            config.idle_timeout(),
        )
    }

    /// Decide whether an instance should be retired at release time
    ///
    /// Crash always wins over the count/age thresholds so eviction is
    /// reported under the cause that actually fired.
    #[must_use]
    pub fn evaluate(&self, record: &InstanceRecord, now: Instant) -> RecycleDecision {
        if record.status == InstanceStatus::Crashed {
            return RecycleDecision::Retire(RetireReason::Crashed);
        }
        if record.render_count >= self.max_renders {
            return RecycleDecision::Retire(RetireReason::RenderCount);
        }
        if record.age(now) >= self.max_age {
            return RecycleDecision::Retire(RetireReason::Age);
        }
        RecycleDecision::Keep
    }

    /// Whether an idle instance has sat unused past the idle timeout
    #[must_use]
    pub fn idle_expired(&self, record: &InstanceRecord, now: Instant) -> bool {
        record.status == InstanceStatus::Idle && record.idle_for(now) >= self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_policy() -> RecyclePolicy {
        RecyclePolicy::new(
            1000,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    fn fresh_record() -> InstanceRecord {
        let mut record = InstanceRecord::new();
        record.transition(InstanceStatus::Idle);
        record
    }

    #[tokio::test]
    async fn fresh_instance_is_kept() {
        let record = fresh_record();
        assert_eq!(
            test_policy().evaluate(&record, Instant::now()),
            RecycleDecision::Keep
        );
    }

    #[tokio::test]
    async fn render_count_threshold_retires() {
        let mut record = fresh_record();
        record.render_count = 1000;
        assert_eq!(
            test_policy().evaluate(&record, Instant::now()),
            RecycleDecision::Retire(RetireReason::RenderCount)
        );
    }

    #[tokio::test]
    async fn age_threshold_retires() {
        let record = fresh_record();
        let later = Instant::now() + Duration::from_secs(3601);
        assert_eq!(
            test_policy().evaluate(&record, later),
            RecycleDecision::Retire(RetireReason::Age)
        );
    }

    #[tokio::test]
    async fn crash_wins_over_count() {
        // An instance that crashes on its 1000th render reports the crash,
        // not the count threshold.
        let mut record = fresh_record();
        record.transition(InstanceStatus::Busy);
        record.render_count = 999;
        record.transition(InstanceStatus::Crashed);
        assert_eq!(
            test_policy().evaluate(&record, Instant::now()),
            RecycleDecision::Retire(RetireReason::Crashed)
        );
    }

    #[tokio::test]
    async fn idle_expiry_only_applies_to_idle_instances() {
        let policy = test_policy();
        let mut record = fresh_record();
        let later = Instant::now() + Duration::from_secs(301);
        assert!(policy.idle_expired(&record, later));
        record.transition(InstanceStatus::Busy);
        assert!(!policy.idle_expired(&record, later));
    }

    proptest! {
        #[test]
        fn keep_implies_under_both_thresholds(
            renders in 0u64..5000,
            age_secs in 0u64..10_000,
        ) {
            let policy = test_policy();
            let mut record = fresh_record();
            record.render_count = renders;
            let now = Instant::now() + Duration::from_secs(age_secs);
            match policy.evaluate(&record, now) {
                RecycleDecision::Keep => {
                    prop_assert!(renders < 1000);
                    prop_assert!(age_secs < 3600);
                }
                RecycleDecision::Retire(_) => {
                    prop_assert!(renders >= 1000 || age_secs >= 3600);
                }
            }
        }
    }
}
