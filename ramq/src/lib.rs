#![deny(unsafe_code)]

//! Client side connection and session engine for JMS-style brokers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ramq::transport::mock::MockTransport;
//! use ramq::{message_listener_fn, AckMode, ConnectionFactory, Destination, Message, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let factory = ConnectionFactory::default().with_client_id("orders");
//!     let conn = factory.create_connection(Arc::new(MockTransport::new())).await?;
//!
//!     let session = conn.create_session(AckMode::Auto).await?;
//!     let consumer = session.create_consumer(&Destination::queue("orders.in")).await?;
//!     consumer
//!         .set_message_listener(Some(message_listener_fn(|m| {
//!             log::info!("received {:?}", m.body_text());
//!             Ok(())
//!         })))
//!         .await?;
//!     conn.start().await?;
//!
//!     let producer = session.create_producer(Some(&Destination::queue("orders.out"))).await?;
//!     producer.send(Message::text("hello")).await?;
//!
//!     conn.close().await
//! }
//! ```

/// Connection level
pub mod connection; // Lifecycle, inbound routing and recovery
pub mod correlator; // Request/response matching
pub mod dispatcher; // ConsumerId -> dispatcher registry
pub mod factory;
pub mod interruption; // Transport interruption bookkeeping
pub mod tracker; // Registrations replayed after a reconnect

/// Sessions and their children
pub mod consumer;
pub mod producer;
pub mod session;

/// Support
pub mod error;
mod executor;
pub mod listener;
pub mod message;
pub mod queue;
pub mod stats;
pub mod transport;
pub mod types;

pub use connection::{Connection, ConnectionState};
pub use consumer::Consumer;
pub use error::{CmsError, Result};
pub use factory::ConnectionFactory;
pub use interruption::RecoveryState;
pub use listener::{exception_listener_fn, message_listener_fn, ExceptionListener, MessageListener};
pub use message::Message;
pub use producer::{Producer, SendOptions};
pub use session::Session;
pub use transport::{Transport, TransportListener};
pub use types::{AckMode, Destination};

pub use ramq_conf as conf;
pub use ramq_utils as utils;
