//! The boundary between the engine and whatever moves frames to the broker.
//!
//! A transport accepts outbound [`Frame`]s and reports inbound traffic to a single
//! [`TransportListener`], serially, from its own receive task. Marshaling and the
//! physical medium live behind this trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CmsError, Result};
use crate::types::{Command, Frame};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering inbound traffic to the listener.
    async fn start(&self) -> Result<()>;

    /// Send without waiting for any reply.
    async fn oneway(&self, frame: Frame) -> Result<()>;

    /// Release the underlying resource. Called once per connection.
    async fn close(&self) -> Result<()>;

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>);

    #[inline]
    fn is_fault_tolerant(&self) -> bool {
        false
    }

    #[inline]
    fn is_connected(&self) -> bool {
        true
    }
}

/// Receives inbound traffic. Implementations must not assume which task calls them,
/// only that calls from one transport are never concurrent.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_command(&self, command: Command);

    async fn on_exception(&self, error: CmsError);

    async fn transport_interrupted(&self) {}

    async fn transport_resumed(&self) {}
}
