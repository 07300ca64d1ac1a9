//! In-memory transport that records outbound frames and replays scripted inbound
//! traffic through one receive task, the way a socket transport would.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use super::{Transport, TransportListener};
use crate::error::{CmsError, Result};
use crate::message::Message;
use crate::types::{Command, ConsumerId, Frame, MessageDispatch, Response};

/// Produces the broker's reply, if any, for an outbound frame.
pub type Responder = Arc<dyn Fn(&Frame) -> Option<Command> + Send + Sync>;

enum Inbound {
    Command(Command),
    Exception(CmsError),
    Interrupted,
    Resumed,
    Shutdown,
}

#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    responder: RwLock<Option<Responder>>,
    sent: Mutex<Vec<Frame>>,
    sent_notify: Notify,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    send_failure: RwLock<Option<String>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MockTransport {{ sent: {}, closed: {} }}",
            self.inner.sent.lock().len(),
            self.inner.closed.load(Ordering::SeqCst)
        )
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Acknowledges every frame that asks for a response.
    pub fn new() -> Self {
        let t = Self::silent();
        t.set_responder(|frame: &Frame| {
            if frame.response_required {
                Some(Command::Response(Response::ok(frame.command_id)))
            } else {
                None
            }
        });
        t
    }

    /// Never replies to anything.
    pub fn silent() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockInner {
                listener: RwLock::new(None),
                responder: RwLock::new(None),
                sent: Mutex::new(Vec::new()),
                sent_notify: Notify::new(),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                send_failure: RwLock::new(None),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&Frame) -> Option<Command> + Send + Sync + 'static,
    {
        *self.inner.responder.write() = Some(Arc::new(f));
    }

    #[inline]
    pub fn clear_responder(&self) {
        *self.inner.responder.write() = None;
    }

    /// Make every later `oneway` fail with a transport error.
    #[inline]
    pub fn fail_sends(&self, reason: Option<&str>) {
        *self.inner.send_failure.write() = reason.map(|r| r.to_string());
    }

    #[inline]
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner.sent.lock().clone()
    }

    #[inline]
    pub fn sent_commands(&self) -> Vec<Command> {
        self.inner.sent.lock().iter().map(|f| f.command.clone()).collect()
    }

    #[inline]
    pub fn count_sent<P>(&self, pred: P) -> usize
    where
        P: Fn(&Command) -> bool,
    {
        self.inner.sent.lock().iter().filter(|f| pred(&f.command)).count()
    }

    /// Waits until at least `n` sent frames match `pred`.
    pub async fn wait_for_sent<P>(&self, n: usize, pred: P, timeout: Duration) -> bool
    where
        P: Fn(&Command) -> bool,
    {
        let waiting = async {
            loop {
                let notified = self.inner.sent_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.count_sent(&pred) >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, waiting).await.is_ok()
    }

    #[inline]
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_listener(&self) -> bool {
        self.inner.listener.read().is_some()
    }

    #[inline]
    pub fn inject(&self, command: Command) {
        self.push(Inbound::Command(command));
    }

    #[inline]
    pub fn dispatch(&self, consumer_id: &ConsumerId, message: Message) {
        self.inject(Command::MessageDispatch(MessageDispatch::new(consumer_id.clone(), message)));
    }

    #[inline]
    pub fn inject_exception(&self, error: CmsError) {
        self.push(Inbound::Exception(error));
    }

    #[inline]
    pub fn interrupt(&self) {
        self.push(Inbound::Interrupted);
    }

    #[inline]
    pub fn resume(&self) {
        self.push(Inbound::Resumed);
    }

    fn push(&self, inbound: Inbound) {
        if self.inner.inbound_tx.send(inbound).is_err() {
            log::debug!("mock transport receive loop is gone, inbound event dropped");
        }
    }

    async fn receive_loop(inner: Weak<MockInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            if matches!(inbound, Inbound::Shutdown) {
                break;
            }
            let listener = match inner.upgrade() {
                Some(inner) => inner.listener.read().clone(),
                None => break,
            };
            let listener = match listener {
                Some(l) => l,
                None => {
                    log::debug!("mock transport has no listener, inbound event dropped");
                    continue;
                }
            };
            match inbound {
                Inbound::Shutdown => break,
                Inbound::Command(cmd) => listener.on_command(cmd).await,
                Inbound::Exception(e) => listener.on_exception(e).await,
                Inbound::Interrupted => listener.transport_interrupted().await,
                Inbound::Resumed => listener.transport_resumed().await,
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        let rx = self.inner.inbound_rx.lock().take();
        if let Some(rx) = rx {
            tokio::spawn(Self::receive_loop(Arc::downgrade(&self.inner), rx));
        }
        Ok(())
    }

    async fn oneway(&self, frame: Frame) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CmsError::Transport("transport is closed".into()));
        }
        if let Some(reason) = self.inner.send_failure.read().clone() {
            return Err(CmsError::Transport(reason));
        }
        let reply = self.inner.responder.read().clone().and_then(|r| r(&frame));
        self.inner.sent.lock().push(frame);
        self.inner.sent_notify.notify_waiters();
        if let Some(reply) = reply {
            self.push(Inbound::Command(reply));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.push(Inbound::Shutdown);
        Ok(())
    }

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        *self.inner.listener.write() = listener;
    }

    #[inline]
    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }
}
