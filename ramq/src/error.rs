use std::sync::Arc;
use std::time::Duration;

use crate::types::{BrokerError, CommandId, ConsumerId};

/// Every failure surfaced by the engine. `Clone` so one recorded cause can be
/// handed to every waiter and every later caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CmsError {
    #[error("connection is closed")]
    Closed,
    /// First transport failure, recorded once per connection
    #[error("connection failed, {0}")]
    ConnectionFailed(Arc<CmsError>),
    #[error("transport error, {0}")]
    Transport(String),
    #[error("no response to command {command_id} within {timeout:?}")]
    RequestTimeout { command_id: CommandId, timeout: Duration },
    #[error("no dispatcher registered for consumer {0}")]
    NoDispatcherRegistered(ConsumerId),
    #[error("broker rejected command, {class}: {message}")]
    BrokerRejected { class: String, message: String },
    #[error("illegal state, {0}")]
    IllegalState(String),
    #[error("invalid client id, {0}")]
    InvalidClientId(String),
    #[error("invalid destination, {0}")]
    InvalidDestination(String),
    /// Application callback returned an error or panicked
    #[error("listener failure, {0}")]
    Listener(String),
    #[error("{0}")]
    Msg(String),
}

impl CmsError {
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, CmsError::Closed)
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CmsError::RequestTimeout { .. })
    }

    /// The original cause behind a `ConnectionFailed` chain.
    #[inline]
    pub fn root_cause(&self) -> &CmsError {
        match self {
            CmsError::ConnectionFailed(cause) => cause.root_cause(),
            other => other,
        }
    }
}

impl From<BrokerError> for CmsError {
    #[inline]
    fn from(e: BrokerError) -> Self {
        CmsError::BrokerRejected { class: e.exception_class, message: e.message }
    }
}

impl From<anyhow::Error> for CmsError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        CmsError::Msg(e.to_string())
    }
}

impl From<String> for CmsError {
    #[inline]
    fn from(e: String) -> Self {
        CmsError::Msg(e)
    }
}

impl From<&str> for CmsError {
    #[inline]
    fn from(e: &str) -> Self {
        CmsError::Msg(e.to_string())
    }
}

pub type Result<T, E = CmsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_conversion() {
        let e = CmsError::from(BrokerError::new("javax.jms.InvalidClientIDException", "in use"));
        assert!(matches!(&e, CmsError::BrokerRejected { class, .. } if class == "javax.jms.InvalidClientIDException"));
        assert_eq!(e.to_string(), "broker rejected command, javax.jms.InvalidClientIDException: in use");
    }

    #[test]
    fn root_cause_unwraps_failures() {
        let cause = CmsError::Transport("reset by peer".into());
        let failed = CmsError::ConnectionFailed(Arc::new(cause));
        assert!(matches!(failed.root_cause(), CmsError::Transport(m) if m == "reset by peer"));
        assert!(CmsError::Closed.is_closed());
        assert!(CmsError::RequestTimeout { command_id: 1, timeout: Duration::from_millis(5) }.is_timeout());
    }
}
