use serde_json::json;

use ramq_utils::Counter;

/// Live gauges of one connection. Each counter tracks the current value and the
/// highest value seen.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub sessions: Counter,
    pub consumers: Counter,
    pub producers: Counter,
    pub dispatched: Counter,
    pub unmatched: Counter,
    pub requests: Counter,
}

impl ConnectionStats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sessions": self.sessions.to_json(),
            "consumers": self.consumers.to_json(),
            "producers": self.producers.to_json(),
            "dispatched": self.dispatched.to_json(),
            "unmatched": self.unmatched.to_json(),
            "requests": self.requests.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let stats = ConnectionStats::new();
        stats.sessions.inc();
        stats.sessions.inc();
        stats.sessions.dec();
        stats.dispatched.incs(5);
        let v = stats.to_json();
        assert_eq!(v["sessions"], stats.sessions.to_json());
        assert_eq!(stats.sessions.count(), 1);
        assert_eq!(stats.sessions.max(), 2);
        assert_eq!(stats.dispatched.count(), 5);
        assert!(v.get("requests").is_some());
    }
}
