/// Overrides supplied by the embedding application, applied after files and environment.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra config filename
    pub cfg_name: Option<String>,
    /// Broker url override
    pub broker_url: Option<String>,
    /// Client id override
    pub client_id: Option<String>,
}

impl Options {
    #[inline]
    pub fn with_cfg_name(mut self, name: impl Into<String>) -> Self {
        self.cfg_name = Some(name.into());
        self
    }

    #[inline]
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = Some(url.into());
        self
    }

    #[inline]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}
