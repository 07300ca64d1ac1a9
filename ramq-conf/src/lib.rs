#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::Deserialize;

pub use self::connection::ConnectionConfig;
pub use self::logging::Log;
pub use self::options::Options;
pub use self::policy::{PrefetchPolicy, RedeliveryPolicy};

pub mod connection;
pub mod logger;
pub mod logging;
pub mod options;
pub mod policy;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Loads `/etc/ramq/ramq.toml`, `ramq.toml`, the file named by `opts`, then
    /// `RAMQ__*` environment variables, later sources overriding earlier ones.
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/ramq/ramq").required(false))
            .add_source(File::with_name("ramq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        Self::build(builder, opts)
    }

    /// Settings from an in-memory TOML document plus the environment.
    pub fn from_toml(text: &str) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::build(builder, Options::default())
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>, opts: Options) -> Result<Self> {
        let builder = builder.add_source(
            config::Environment::with_prefix("ramq").prefix_separator("__").separator("__").try_parsing(true),
        );
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(url) = opts.broker_url.as_ref() {
            inner.connection.broker_url.clone_from(url);
        }
        if let Some(client_id) = opts.client_id.as_ref() {
            inner.connection.client_id = Some(client_id.clone());
        }

        inner.connection.validate()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn try_instance() -> Option<&'static Self> {
        SETTINGS.get()
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::try_instance().ok_or_else(|| anyhow!("Settings not initialized"))?;
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("broker_url is {}", cfg.connection.broker_url);
        log::info!("always_session_async is {}", cfg.connection.always_session_async);
        log::info!("close_timeout is {:?}", cfg.connection.close_timeout);
        log::info!("prefetch policy is {:?}", cfg.connection.prefetch);
        log::info!("redelivery policy is {:?}", cfg.connection.redelivery);
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}
