use std::sync::Arc;

use ramq_conf::{ConnectionConfig, Settings};

use crate::connection::Connection;
use crate::error::Result;
use crate::transport::Transport;

/// Creates connections that share one configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFactory {
    config: ConnectionConfig,
}

impl ConnectionFactory {
    #[inline]
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Uses the `[connection]` section of loaded settings.
    #[inline]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.connection.clone())
    }

    #[inline]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config = self.config.with_credentials(username, password);
        self
    }

    #[inline]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config = self.config.with_client_id(client_id);
        self
    }

    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// A new connection over `transport`. Two connections created with a fixed
    /// client id will be told apart only by the broker, which rejects the second.
    pub async fn create_connection(&self, transport: Arc<dyn Transport>) -> Result<Connection> {
        log::debug!("creating connection to {}", self.config.broker_url);
        Connection::connect(transport, self.config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CmsError;
    use crate::transport::mock::MockTransport;
    use crate::types::{AckMode, Command};

    #[tokio::test]
    async fn connections_carry_factory_settings() {
        let settings = Settings::from_toml(
            r#"
            [connection]
            broker_url = "tcp://broker:61616"
            always_session_async = false
            "#,
        )
        .unwrap();
        let factory = ConnectionFactory::from_settings(&settings).with_credentials("app", "secret");
        assert_eq!(factory.config().broker_url, "tcp://broker:61616");

        let transport = MockTransport::new();
        let conn = factory.create_connection(Arc::new(transport.clone())).await.unwrap();
        assert!(!conn.config().always_session_async);
        conn.create_session(AckMode::Auto).await.unwrap();

        let info = transport
            .sent_commands()
            .into_iter()
            .find_map(|c| match c {
                Command::ConnectionInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.username.as_deref(), Some("app"));
        assert_eq!(info.password.as_deref(), Some("secret"));
        assert!(info.client_id.starts_with("ID:"));
    }

    #[tokio::test]
    async fn generated_client_ids_are_unique() {
        let factory = ConnectionFactory::default();
        let a = factory.create_connection(Arc::new(MockTransport::new())).await.unwrap();
        let b = factory.create_connection(Arc::new(MockTransport::new())).await.unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert_ne!(a.connection_id(), b.connection_id());

        let fixed = ConnectionFactory::default().with_client_id("fixed");
        let c = fixed.create_connection(Arc::new(MockTransport::new())).await.unwrap();
        assert_eq!(c.client_id(), "fixed");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = ConnectionConfig::default();
        config.session_queue_capacity = 0;
        let res = ConnectionFactory::new(config).create_connection(Arc::new(MockTransport::new())).await;
        assert!(matches!(res, Err(CmsError::Msg(_))));
    }
}
