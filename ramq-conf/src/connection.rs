use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use ramq_utils::{deserialize_duration, deserialize_non_empty, Bytesize};

use crate::policy::{PrefetchPolicy, RedeliveryPolicy};

/// Everything a connection reads at creation time. Immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "ConnectionConfig::broker_url_default")]
    pub broker_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    //Generated per connection when not set.
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub client_id: Option<String>,

    //Every session dispatches asynchronously, even the first AUTO/INDIVIDUAL one.
    #[serde(default = "ConnectionConfig::always_session_async_default")]
    pub always_session_async: bool,
    //Asks the broker to dispatch to consumers asynchronously.
    #[serde(default = "ConnectionConfig::dispatch_async_default")]
    pub dispatch_async: bool,
    #[serde(default)]
    pub always_sync_send: bool,
    #[serde(default)]
    pub use_async_send: bool,
    #[serde(default = "ConnectionConfig::send_acks_async_default")]
    pub send_acks_async: bool,
    #[serde(default)]
    pub message_priority_supported: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default = "ConnectionConfig::compression_level_default")]
    pub compression_level: i32,

    //Zero disables the timeout.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    #[serde(default = "ConnectionConfig::close_timeout_default", deserialize_with = "deserialize_duration")]
    pub close_timeout: Duration,
    //Timeout for internal sync requests, zero waits forever.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,

    //Zero disables producer flow control.
    #[serde(default)]
    pub producer_window_size: Bytesize,
    //Bound of each asynchronous session's delivery queue.
    #[serde(default = "ConnectionConfig::session_queue_capacity_default")]
    pub session_queue_capacity: usize,

    #[serde(default)]
    pub prefetch: PrefetchPolicy,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
}

impl Default for ConnectionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            broker_url: Self::broker_url_default(),
            username: None,
            password: None,
            client_id: None,
            always_session_async: Self::always_session_async_default(),
            dispatch_async: Self::dispatch_async_default(),
            always_sync_send: false,
            use_async_send: false,
            send_acks_async: Self::send_acks_async_default(),
            message_priority_supported: false,
            use_compression: false,
            compression_level: Self::compression_level_default(),
            send_timeout: Duration::ZERO,
            close_timeout: Self::close_timeout_default(),
            request_timeout: Duration::ZERO,
            producer_window_size: Bytesize(0),
            session_queue_capacity: Self::session_queue_capacity_default(),
            prefetch: PrefetchPolicy::default(),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    fn broker_url_default() -> String {
        "tcp://127.0.0.1:61616".into()
    }
    fn always_session_async_default() -> bool {
        true
    }
    fn dispatch_async_default() -> bool {
        true
    }
    fn send_acks_async_default() -> bool {
        true
    }
    fn compression_level_default() -> i32 {
        -1
    }
    fn close_timeout_default() -> Duration {
        Duration::from_secs(15)
    }
    fn session_queue_capacity_default() -> usize {
        1000
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_queue_capacity == 0 {
            return Err(anyhow!("connection.session_queue_capacity must be greater than 0"));
        }
        if !(-1..=9).contains(&self.compression_level) {
            return Err(anyhow!(
                "connection.compression_level must be between -1 and 9, got {}",
                self.compression_level
            ));
        }
        self.redelivery.validate()?;
        Ok(())
    }

    #[inline]
    pub fn with_always_session_async(mut self, v: bool) -> Self {
        self.always_session_async = v;
        self
    }

    #[inline]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[inline]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[inline]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[inline]
    pub fn with_producer_window_size(mut self, size: usize) -> Self {
        self.producer_window_size = Bytesize(size);
        self
    }

    #[inline]
    pub fn with_message_priority_supported(mut self, v: bool) -> Self {
        self.message_priority_supported = v;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_rejected() {
        let res: std::result::Result<ConnectionConfig, _> = serde_json::from_str(r#"{"client_id":"  "}"#);
        assert!(res.is_err());
        let cfg: ConnectionConfig = serde_json::from_str(r#"{"client_id":"c1"}"#).unwrap();
        assert_eq!(cfg.client_id.as_deref(), Some("c1"));
        assert!(cfg.send_acks_async);
    }

    #[test]
    fn builders() {
        let cfg = ConnectionConfig::default()
            .with_always_session_async(false)
            .with_client_id("x")
            .with_producer_window_size(1024);
        assert!(!cfg.always_session_async);
        assert_eq!(cfg.client_id.as_deref(), Some("x"));
        assert_eq!(cfg.producer_window_size.as_usize(), 1024);
        assert!(cfg.validate().is_ok());
    }
}
