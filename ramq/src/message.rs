
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ramq_utils::{timestamp_millis, TimestampMillis};

use crate::types::{Destination, HashMap, MessageId, TransactionId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub destination: Option<Destination>,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub kind: Option<String>,
    pub transaction_id: Option<TransactionId>,
    pub priority: u8,
    pub persistent: bool,
    pub timestamp: TimestampMillis,
    //0 means never expires.
    pub expiration: TimestampMillis,
    pub redelivery_counter: i32,
    pub compressed: bool,
    pub properties: HashMap<String, Value>,
    pub body: Bytes,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            message_id: None,
            destination: None,
            reply_to: None,
            correlation_id: None,
            kind: None,
            transaction_id: None,
            priority: Self::DEFAULT_PRIORITY,
            persistent: true,
            timestamp: 0,
            expiration: 0,
            redelivery_counter: 0,
            compressed: false,
            properties: HashMap::default(),
            body: Bytes::new(),
        }
    }
}

impl Message {
    pub const DEFAULT_PRIORITY: u8 = 4;
    pub const MAX_PRIORITY: u8 = 9;

    #[inline]
    pub fn new<B: Into<Bytes>>(body: B) -> Self {
        Self { body: body.into(), ..Default::default() }
    }

    #[inline]
    pub fn text(body: &str) -> Self {
        Self::new(Bytes::copy_from_slice(body.as_bytes()))
    }

    #[inline]
    pub fn with_property<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(Self::MAX_PRIORITY);
        self
    }

    #[inline]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    #[inline]
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Approximate wire size, used for producer flow control.
    #[inline]
    pub fn size(&self) -> usize {
        const HEADER_ESTIMATE: usize = 64;
        HEADER_ESTIMATE
            + self.body.len()
            + self.properties.iter().map(|(k, v)| k.len() + v.to_string().len()).sum::<usize>()
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expiration > 0 && timestamp_millis() > self.expiration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry() {
        let mut m = Message::text("x");
        assert!(!m.is_expired());
        m.expiration = timestamp_millis() - 10;
        assert!(m.is_expired());
        m.expiration = timestamp_millis() + 60_000;
        assert!(!m.is_expired());
        m.expiration = 0;
        assert!(!m.is_expired());
    }

    #[test]
    fn properties_and_priority() {
        let m = Message::text("body").with_property("k", 1).with_priority(42);
        assert_eq!(m.priority, Message::MAX_PRIORITY);
        assert_eq!(m.property("k"), Some(&Value::from(1)));
        assert_eq!(m.body_text(), Some("body"));
        assert!(m.size() > 4);
    }
}
