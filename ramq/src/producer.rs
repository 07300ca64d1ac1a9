use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use ramq_conf::ConnectionConfig;
use ramq_utils::{timestamp_millis, SequenceGenerator};

use crate::error::{CmsError, Result};
use crate::message::Message;
use crate::session::SessionInner;
use crate::types::{Command, Destination, MessageId, ProducerId, ProducerInfo};

/// Per producer defaults stamped on every message sent.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub persistent: bool,
    pub priority: u8,
    pub time_to_live: Option<Duration>,
    pub disable_message_timestamp: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: Message::DEFAULT_PRIORITY,
            time_to_live: None,
            disable_message_timestamp: false,
        }
    }
}

struct WindowState {
    used: usize,
    closed: bool,
}

/// Byte credit for asynchronous sends, replenished by the broker's ProducerAck.
struct ProducerWindow {
    limit: usize,
    state: Mutex<WindowState>,
    notify: Notify,
}

impl ProducerWindow {
    fn new(limit: usize) -> Self {
        Self { limit, state: Mutex::new(WindowState { used: 0, closed: false }), notify: Notify::new() }
    }

    /// Waits while the window is full, then charges `size`.
    async fn acquire(&self, size: usize) -> Result<()> {
        loop {
            let space = self.notify.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(CmsError::Closed);
                }
                if state.used < self.limit {
                    state.used += size;
                    return Ok(());
                }
            }
            space.await;
        }
    }

    fn release(&self, size: usize) {
        {
            let mut state = self.state.lock();
            state.used = state.used.saturating_sub(size);
        }
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    #[inline]
    fn used(&self) -> usize {
        self.state.lock().used
    }
}

#[derive(Clone)]
pub struct Producer(Arc<ProducerInner>);

impl Deref for Producer {
    type Target = ProducerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Producer {{ id: {}, destination: {:?}, closed: {} }}", self.id(), self.destination(), self.is_closed())
    }
}

impl Producer {
    pub(crate) fn new(info: ProducerInfo, session: Weak<SessionInner>, config: &ConnectionConfig) -> Self {
        let window = if info.window_size > 0 { Some(ProducerWindow::new(info.window_size)) } else { None };
        Producer(Arc::new(ProducerInner {
            info,
            session,
            sequence: SequenceGenerator::new(),
            options: RwLock::new(SendOptions::default()),
            window,
            always_sync_send: config.always_sync_send,
            use_async_send: config.use_async_send,
            use_compression: config.use_compression,
            send_timeout: config.send_timeout,
            closed: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<ProducerInner> {
        Arc::downgrade(&self.0)
    }
}

pub struct ProducerInner {
    info: ProducerInfo,
    session: Weak<SessionInner>,
    sequence: SequenceGenerator,
    options: RwLock<SendOptions>,
    window: Option<ProducerWindow>,
    always_sync_send: bool,
    use_async_send: bool,
    use_compression: bool,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl ProducerInner {
    #[inline]
    pub fn id(&self) -> &ProducerId {
        &self.info.producer_id
    }

    #[inline]
    pub fn destination(&self) -> Option<&Destination> {
        self.info.destination.as_ref()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn options(&self) -> SendOptions {
        self.options.read().clone()
    }

    #[inline]
    pub fn set_persistent(&self, persistent: bool) {
        self.options.write().persistent = persistent;
    }

    #[inline]
    pub fn set_priority(&self, priority: u8) {
        self.options.write().priority = priority.min(Message::MAX_PRIORITY);
    }

    #[inline]
    pub fn set_time_to_live(&self, ttl: Option<Duration>) {
        self.options.write().time_to_live = ttl;
    }

    #[inline]
    pub fn set_disable_message_timestamp(&self, disable: bool) {
        self.options.write().disable_message_timestamp = disable;
    }

    /// Window bytes charged by asynchronous sends and not yet credited back.
    #[inline]
    pub fn window_usage(&self) -> usize {
        self.window.as_ref().map(|w| w.used()).unwrap_or_default()
    }

    /// Sends to the producer's own destination.
    #[inline]
    pub async fn send(&self, message: Message) -> Result<()> {
        self.send_inner(None, message).await
    }

    /// Sends to `destination`. Only allowed for producers created without one.
    #[inline]
    pub async fn send_to(&self, destination: &Destination, message: Message) -> Result<()> {
        self.send_inner(Some(destination), message).await
    }

    async fn send_inner(&self, destination: Option<&Destination>, mut message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(CmsError::IllegalState(format!("producer {} is closed", self.id())));
        }
        let destination = match (self.destination(), destination) {
            (Some(own), None) => own.clone(),
            (None, Some(given)) => given.clone(),
            (Some(own), Some(_)) => {
                return Err(CmsError::IllegalState(format!("producer {} is bound to {}", self.id(), own)))
            }
            (None, None) => return Err(CmsError::InvalidDestination("no destination given".into())),
        };
        let session = self.session.upgrade().ok_or(CmsError::Closed)?;
        session.check_closed()?;
        let connection = session.connection()?;

        let options = self.options();
        message.message_id =
            Some(MessageId { producer_id: self.id().clone(), producer_sequence_id: self.sequence.next() });
        message.destination = Some(destination);
        message.persistent = options.persistent;
        message.priority = options.priority;
        let now = timestamp_millis();
        message.timestamp = if options.disable_message_timestamp { 0 } else { now };
        message.expiration = match options.time_to_live {
            Some(ttl) if !ttl.is_zero() => now + ttl.as_millis() as i64,
            _ => 0,
        };
        message.compressed = self.use_compression;
        message.transaction_id = session.ensure_transaction().await?;

        let sync = self.always_sync_send
            || (message.persistent && !self.use_async_send && message.transaction_id.is_none());
        if sync {
            connection.sync_request(Command::Message(Box::new(message)), self.send_timeout).await?;
        } else {
            let size = message.size();
            if let Some(window) = self.window.as_ref() {
                window.acquire(size).await?;
            }
            if let Err(e) = connection.oneway(Command::Message(Box::new(message))).await {
                if let Some(window) = self.window.as_ref() {
                    window.release(size);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.session.upgrade() {
            Some(session) => session.remove_producer(self.id()).await,
            None => {
                self.dispose();
                Ok(())
            }
        }
    }

    /// Local teardown. Returns `false` when already disposed.
    pub(crate) fn dispose(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(window) = self.window.as_ref() {
            window.close();
        }
        true
    }

    pub(crate) fn on_producer_ack(&self, size: usize) {
        match self.window.as_ref() {
            Some(window) => window.release(size),
            None => log::debug!("producer {} has no window, ack of {} bytes ignored", self.id(), size),
        }
    }
}
