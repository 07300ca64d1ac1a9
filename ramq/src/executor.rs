//! Tasks that run application callbacks away from the transport's receive task.
//!
//! A [`SessionExecutor`] owns the delivery queue of one asynchronous session and a
//! single worker that drains it in order. A [`ConnectionExecutor`] serializes
//! exception and transport-event notifications to connection level listeners.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::ConnectionInner;
use crate::error::CmsError;
use crate::listener::panic_message;
use crate::queue::DispatchChannel;
use crate::session::SessionInner;
use crate::types::{Command, MessageDispatch};

pub(crate) struct SessionExecutor {
    channel: Arc<DispatchChannel>,
    session: Weak<SessionInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionExecutor {
    pub(crate) fn new(session: Weak<SessionInner>, capacity: usize, priority: bool) -> Self {
        Self { channel: Arc::new(DispatchChannel::new(capacity, priority)), session, worker: Mutex::new(None) }
    }

    /// Queues `dispatch` behind everything already waiting, suspending while the
    /// queue is full.
    pub(crate) async fn execute(&self, dispatch: MessageDispatch) {
        if let Err(d) = self.channel.enqueue(dispatch).await {
            log::debug!("session executor closed, dispatch for {} dropped", d.consumer_id);
        }
    }

    /// Starts delivering. The worker is spawned on first start.
    pub(crate) fn start(&self) {
        if self.channel.is_closed() {
            return;
        }
        self.channel.start();
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(tokio::spawn(Self::run(self.channel.clone(), self.session.clone())));
        }
    }

    #[inline]
    pub(crate) fn stop(&self) {
        self.channel.stop();
    }

    /// Ends the worker after its current delivery and returns what was never delivered.
    /// Never waits for the worker, which may be the caller.
    pub(crate) fn close(&self) -> Vec<MessageDispatch> {
        let leftovers = self.channel.close();
        self.worker.lock().take();
        leftovers
    }

    #[inline]
    pub(crate) fn clear(&self) -> Vec<MessageDispatch> {
        self.channel.clear()
    }

    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.channel.len()
    }

    async fn run(channel: Arc<DispatchChannel>, session: Weak<SessionInner>) {
        while let Some(dispatch) = channel.dequeue().await {
            match session.upgrade() {
                Some(s) => s.deliver(dispatch).await,
                None => break,
            }
        }
        log::debug!("session executor worker exited");
    }
}

pub(crate) enum ConnectionEvent {
    //For the exception listener.
    Exception(CmsError),
    //For application transport listeners.
    Command(Command),
    TransportException(CmsError),
    Interrupted,
    Resumed,
}

pub(crate) struct ConnectionExecutor {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionExecutor {
    pub(crate) fn start(connection: Weak<ConnectionInner>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(connection, rx));
        Self { tx }
    }

    #[inline]
    pub(crate) fn execute(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("connection executor is gone, event dropped");
        }
    }

    async fn run(connection: Weak<ConnectionInner>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            let connection = match connection.upgrade() {
                Some(c) => c,
                None => break,
            };
            if let Err(panic) = AssertUnwindSafe(connection.deliver_event(event)).catch_unwind().await {
                log::warn!("connection listener error, {}", panic_message(panic.as_ref()));
            }
        }
    }
}
