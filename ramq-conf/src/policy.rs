use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use ramq_utils::{deserialize_duration, deserialize_duration_option};

/// How many unacknowledged messages the broker may push to a consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchPolicy {
    #[serde(default = "PrefetchPolicy::queue_default")]
    pub queue: i32,
    #[serde(default = "PrefetchPolicy::topic_default")]
    pub topic: i32,
    #[serde(default = "PrefetchPolicy::durable_topic_default")]
    pub durable_topic: i32,
    #[serde(default = "PrefetchPolicy::queue_browser_default")]
    pub queue_browser: i32,
    #[serde(default)]
    pub max_pending_message_limit: i32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            queue: Self::queue_default(),
            topic: Self::topic_default(),
            durable_topic: Self::durable_topic_default(),
            queue_browser: Self::queue_browser_default(),
            max_pending_message_limit: 0,
        }
    }
}

impl PrefetchPolicy {
    fn queue_default() -> i32 {
        1000
    }
    fn topic_default() -> i32 {
        32766
    }
    fn durable_topic_default() -> i32 {
        100
    }
    fn queue_browser_default() -> i32 {
        500
    }

    #[inline]
    pub fn all(size: i32) -> Self {
        Self { queue: size, topic: size, durable_topic: size, queue_browser: size, max_pending_message_limit: 0 }
    }
}

/// Local redelivery of messages a listener failed to consume.
#[derive(Debug, Clone, Deserialize)]
pub struct RedeliveryPolicy {
    //-1 means no limit.
    #[serde(default = "RedeliveryPolicy::maximum_redeliveries_default")]
    pub maximum_redeliveries: i32,
    #[serde(default = "RedeliveryPolicy::delay_default", deserialize_with = "deserialize_duration")]
    pub initial_redelivery_delay: Duration,
    #[serde(default = "RedeliveryPolicy::delay_default", deserialize_with = "deserialize_duration")]
    pub redelivery_delay: Duration,
    #[serde(default)]
    pub use_exponential_backoff: bool,
    #[serde(default = "RedeliveryPolicy::backoff_multiplier_default")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub use_collision_avoidance: bool,
    #[serde(default = "RedeliveryPolicy::collision_avoidance_percent_default")]
    pub collision_avoidance_percent: u8,
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub maximum_redelivery_delay: Option<Duration>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: Self::maximum_redeliveries_default(),
            initial_redelivery_delay: Self::delay_default(),
            redelivery_delay: Self::delay_default(),
            use_exponential_backoff: false,
            backoff_multiplier: Self::backoff_multiplier_default(),
            use_collision_avoidance: false,
            collision_avoidance_percent: Self::collision_avoidance_percent_default(),
            maximum_redelivery_delay: None,
        }
    }
}

impl RedeliveryPolicy {
    pub const NO_MAXIMUM_REDELIVERIES: i32 = -1;

    fn maximum_redeliveries_default() -> i32 {
        6
    }
    fn delay_default() -> Duration {
        Duration::from_secs(1)
    }
    fn backoff_multiplier_default() -> f64 {
        5.0
    }
    fn collision_avoidance_percent_default() -> u8 {
        15
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.maximum_redeliveries < Self::NO_MAXIMUM_REDELIVERIES {
            return Err(anyhow!("redelivery.maximum_redeliveries must be -1 or greater"));
        }
        if self.collision_avoidance_percent > 100 {
            return Err(anyhow!("redelivery.collision_avoidance_percent must be at most 100"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow!("redelivery.backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }

    /// Whether a message redelivered `redelivery_counter` times has used up its attempts.
    #[inline]
    pub fn is_exhausted(&self, redelivery_counter: i32) -> bool {
        self.maximum_redeliveries != Self::NO_MAXIMUM_REDELIVERIES && redelivery_counter > self.maximum_redeliveries
    }

    /// Delay before the next redelivery given the delay used for the previous one.
    pub fn next_redelivery_delay(&self, previous: Duration) -> Duration {
        let mut next = if previous.is_zero() {
            self.initial_redelivery_delay
        } else if self.use_exponential_backoff && self.backoff_multiplier > 1.0 {
            previous.mul_f64(self.backoff_multiplier)
        } else {
            self.redelivery_delay
        };

        if let Some(max) = self.maximum_redelivery_delay {
            if next > max {
                next = max;
            }
        }

        if self.use_collision_avoidance && !next.is_zero() {
            let percent = f64::from(self.collision_avoidance_percent) / 100.0;
            // uniform in [-percent, +percent)
            let variance = (rand::random::<f64>() * 2.0 - 1.0) * percent;
            next = next.mul_f64((1.0 + variance).max(0.0));
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_delay() {
        let p = RedeliveryPolicy {
            initial_redelivery_delay: Duration::from_millis(10),
            redelivery_delay: Duration::from_millis(20),
            ..Default::default()
        };
        assert_eq!(p.next_redelivery_delay(Duration::ZERO), Duration::from_millis(10));
        assert_eq!(p.next_redelivery_delay(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(p.next_redelivery_delay(Duration::from_millis(20)), Duration::from_millis(20));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let p = RedeliveryPolicy {
            initial_redelivery_delay: Duration::from_millis(100),
            use_exponential_backoff: true,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let d1 = p.next_redelivery_delay(Duration::ZERO);
        let d2 = p.next_redelivery_delay(d1);
        let d3 = p.next_redelivery_delay(d2);
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(300));
    }

    #[test]
    fn collision_avoidance_stays_in_range() {
        let p = RedeliveryPolicy {
            initial_redelivery_delay: Duration::from_millis(1000),
            use_collision_avoidance: true,
            collision_avoidance_percent: 10,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = p.next_redelivery_delay(Duration::ZERO);
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100), "{:?}", d);
        }
    }

    #[test]
    fn exhaustion() {
        let p = RedeliveryPolicy { maximum_redeliveries: 2, ..Default::default() };
        assert!(!p.is_exhausted(2));
        assert!(p.is_exhausted(3));
        let unlimited = RedeliveryPolicy { maximum_redeliveries: -1, ..Default::default() };
        assert!(!unlimited.is_exhausted(i32::MAX));
    }
}
