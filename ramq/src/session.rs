use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use ramq_conf::ConnectionConfig;

use crate::connection::ConnectionInner;
use crate::consumer::Consumer;
use crate::dispatcher::Dispatcher;
use crate::error::{CmsError, Result};
use crate::executor::SessionExecutor;
use crate::producer::Producer;
use crate::types::{
    AckMode, Command, ConsumerId, ConsumerInfo, DataStructureId, Destination, MessageAck, MessageDispatch,
    ProducerId, ProducerInfo, RemoveInfo, SessionId, SessionInfo, TransactionId, TransactionInfo, TransactionType,
};

#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl Deref for Session {
    type Target = SessionInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session {{ id: {}, ack_mode: {:?}, async: {}, started: {}, closed: {} }}",
            self.id(),
            self.ack_mode(),
            self.is_async(),
            self.is_started(),
            self.is_closed()
        )
    }
}

impl Session {
    pub(crate) fn new(
        info: SessionInfo,
        connection: Weak<ConnectionInner>,
        config: Arc<ConnectionConfig>,
        async_dispatch: bool,
    ) -> Self {
        Session(Arc::new_cyclic(|me: &Weak<SessionInner>| {
            let executor = if async_dispatch {
                Some(SessionExecutor::new(
                    me.clone(),
                    config.session_queue_capacity,
                    config.message_priority_supported,
                ))
            } else {
                None
            };
            SessionInner {
                info,
                me: me.clone(),
                connection,
                config,
                executor,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                consumers: RwLock::new(Vec::new()),
                producers: RwLock::new(Vec::new()),
                transaction: tokio::sync::Mutex::new(None),
                last_delivered_sequence_id: AtomicI64::new(0),
            }
        }))
    }
}

pub struct SessionInner {
    info: SessionInfo,
    me: Weak<SessionInner>,
    connection: Weak<ConnectionInner>,
    config: Arc<ConnectionConfig>,
    //Present for asynchronous sessions only, fixed at creation.
    executor: Option<SessionExecutor>,
    started: AtomicBool,
    closed: AtomicBool,
    consumers: RwLock<Vec<Consumer>>,
    producers: RwLock<Vec<Producer>>,
    transaction: tokio::sync::Mutex<Option<TransactionId>>,
    last_delivered_sequence_id: AtomicI64,
}

#[async_trait]
impl Dispatcher for SessionInner {
    async fn dispatch(&self, dispatch: MessageDispatch) {
        match self.executor.as_ref() {
            Some(executor) => executor.execute(dispatch).await,
            None => {
                if self.is_started() {
                    self.deliver(dispatch).await;
                } else {
                    log::trace!("session {} is stopped, dispatch for {} dropped", self.id(), dispatch.consumer_id);
                }
            }
        }
    }
}

impl SessionInner {
    #[inline]
    pub fn id(&self) -> &SessionId {
        &self.info.session_id
    }

    #[inline]
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    #[inline]
    pub fn ack_mode(&self) -> AckMode {
        self.info.ack_mode
    }

    #[inline]
    pub fn is_transacted(&self) -> bool {
        self.info.ack_mode.is_transacted()
    }

    /// Whether delivery runs on the session's own worker. Fixed at creation.
    #[inline]
    pub fn is_async(&self) -> bool {
        self.executor.is_some()
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn consumers(&self) -> Vec<Consumer> {
        self.consumers.read().clone()
    }

    #[inline]
    pub fn producers(&self) -> Vec<Producer> {
        self.producers.read().clone()
    }

    /// Dispatches waiting in the session's delivery queue.
    #[inline]
    pub fn pending(&self) -> usize {
        self.executor.as_ref().map(|e| e.pending()).unwrap_or_default()
    }

    #[inline]
    pub async fn create_consumer(&self, destination: &Destination) -> Result<Consumer> {
        self.create_consumer_inner(destination, None, None, false).await
    }

    #[inline]
    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Consumer> {
        self.create_consumer_inner(destination, selector, None, no_local).await
    }

    pub async fn create_durable_consumer(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Consumer> {
        if !matches!(topic, Destination::Topic(_)) {
            return Err(CmsError::InvalidDestination(format!("durable subscriptions need a topic, got {}", topic)));
        }
        if name.is_empty() {
            return Err(CmsError::IllegalState("durable subscription name is empty".into()));
        }
        self.create_consumer_inner(topic, selector, Some(name), no_local).await
    }

    async fn create_consumer_inner(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        subscription_name: Option<&str>,
        no_local: bool,
    ) -> Result<Consumer> {
        self.check_closed()?;
        let connection = self.connection()?;
        connection.check_closed_or_failed()?;

        let prefetch = &self.config.prefetch;
        let prefetch_size = if subscription_name.is_some() {
            prefetch.durable_topic
        } else if destination.is_topic() {
            prefetch.topic
        } else {
            prefetch.queue
        };
        let info = ConsumerInfo {
            consumer_id: connection.next_consumer_id(self.id()),
            destination: destination.clone(),
            selector: selector.map(str::to_string),
            subscription_name: subscription_name.map(str::to_string),
            prefetch_size,
            maximum_pending_message_limit: prefetch.max_pending_message_limit,
            dispatch_async: self.config.dispatch_async,
            no_local,
            browser: false,
        };
        let consumer = Consumer::new(
            info.clone(),
            self.me.clone(),
            Arc::downgrade(&connection),
            self.ack_mode(),
            !self.is_async(),
            &self.config,
        );
        let dispatcher: Arc<dyn Dispatcher> = self.me.upgrade().ok_or(CmsError::Closed)?;

        self.consumers.write().push(consumer.clone());
        let registered = match connection.add_dispatcher(consumer.id().clone(), &dispatcher) {
            Ok(()) => connection.sync_request(Command::ConsumerInfo(info), connection.request_timeout()).await.map(|_| ()),
            Err(e) => Err(e),
        };
        let registered = registered.and_then(|_| self.check_closed());
        if let Err(e) = registered {
            log::debug!("session {} create consumer error, {:?}", self.id(), e);
            connection.remove_dispatcher(consumer.id());
            self.forget_consumer(consumer.id());
            consumer.dispose();
            return Err(e);
        }

        if self.is_started() {
            consumer.start();
        }
        connection.stats().consumers.inc();
        Ok(consumer)
    }

    /// `None` creates an anonymous producer that names the destination per send.
    pub async fn create_producer(&self, destination: Option<&Destination>) -> Result<Producer> {
        self.check_closed()?;
        let connection = self.connection()?;
        connection.check_closed_or_failed()?;

        let info = ProducerInfo {
            producer_id: connection.next_producer_id(self.id()),
            destination: destination.cloned(),
            window_size: self.config.producer_window_size.0,
            dispatch_async: self.config.use_async_send,
        };
        let producer = Producer::new(info.clone(), self.me.clone(), &self.config);
        connection.sync_request(Command::ProducerInfo(info), connection.request_timeout()).await?;
        self.producers.write().push(producer.clone());
        connection.add_producer(&producer);
        connection.stats().producers.inc();
        Ok(producer)
    }

    #[inline]
    pub async fn create_temporary_queue(&self) -> Result<Destination> {
        self.check_closed()?;
        self.connection()?.create_temporary_destination(false).await
    }

    #[inline]
    pub async fn create_temporary_topic(&self) -> Result<Destination> {
        self.check_closed()?;
        self.connection()?.create_temporary_destination(true).await
    }

    /// Commits the open transaction: the deliveries of every consumer are acked as
    /// part of it, then the broker commits.
    pub async fn commit(&self) -> Result<()> {
        self.check_closed()?;
        if !self.is_transacted() {
            return Err(CmsError::IllegalState("commit on a session that is not transacted".into()));
        }
        let connection = self.connection()?;
        let consumers = self.consumers();
        let mut transaction = self.transaction.lock().await;
        let transaction_id = match transaction.take() {
            Some(id) => id,
            None if consumers.iter().any(|c| c.has_delivered()) => self.begin(&connection).await?,
            None => return Ok(()),
        };
        for consumer in consumers.iter() {
            if let Some(ack) = consumer.take_commit_ack(&transaction_id) {
                connection.oneway(Command::MessageAck(ack)).await?;
            }
        }
        let info = TransactionInfo {
            connection_id: connection.connection_id().clone(),
            transaction_id,
            kind: TransactionType::Commit,
        };
        connection.sync_request(Command::TransactionInfo(info), connection.request_timeout()).await?;
        Ok(())
    }

    /// Rolls back the open transaction and redelivers what it consumed.
    pub async fn rollback(&self) -> Result<()> {
        self.check_closed()?;
        if !self.is_transacted() {
            return Err(CmsError::IllegalState("rollback on a session that is not transacted".into()));
        }
        let connection = self.connection()?;
        let rolled_back = {
            let mut transaction = self.transaction.lock().await;
            match transaction.take() {
                Some(transaction_id) => {
                    let info = TransactionInfo {
                        connection_id: connection.connection_id().clone(),
                        transaction_id,
                        kind: TransactionType::Rollback,
                    };
                    connection.sync_request(Command::TransactionInfo(info), connection.request_timeout()).await.map(|_| ())
                }
                None => Ok(()),
            }
        };
        for consumer in self.consumers() {
            consumer.rollback().await;
        }
        rolled_back
    }

    /// Redelivers every delivered but unacknowledged message.
    pub async fn recover(&self) -> Result<()> {
        self.check_closed()?;
        if self.is_transacted() {
            return Err(CmsError::IllegalState("recover on a transacted session, use rollback".into()));
        }
        for consumer in self.consumers() {
            consumer.rollback().await;
        }
        Ok(())
    }

    /// Acknowledges everything delivered by this session. A no-op unless CLIENT.
    pub async fn acknowledge(&self) -> Result<()> {
        self.check_closed()?;
        if self.ack_mode() != AckMode::Client {
            return Ok(());
        }
        for consumer in self.consumers() {
            consumer.acknowledge_delivered().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.close_inner(true).await
    }

    /// Local teardown used by connection close: the broker forgets the session with
    /// the connection.
    pub(crate) async fn dispose(&self) -> Result<()> {
        self.close_inner(false).await
    }

    async fn close_inner(&self, notify_broker: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop();
        let connection = self.connection.upgrade();

        if self.is_transacted() {
            let open = self.transaction.lock().await.take();
            if let (Some(transaction_id), Some(connection)) = (open, connection.as_ref()) {
                if notify_broker && !connection.is_closed_or_failed() {
                    let info = TransactionInfo {
                        connection_id: connection.connection_id().clone(),
                        transaction_id,
                        kind: TransactionType::Rollback,
                    };
                    if let Err(e) =
                        connection.sync_request(Command::TransactionInfo(info), connection.request_timeout()).await
                    {
                        log::warn!("session {} rollback on close error, {:?}", self.id(), e);
                    }
                }
            }
        }

        let consumers = std::mem::take(&mut *self.consumers.write());
        for consumer in consumers.iter() {
            self.last_delivered_sequence_id.fetch_max(consumer.last_delivered_sequence_id(), Ordering::SeqCst);
            if let Some(connection) = connection.as_ref() {
                connection.remove_dispatcher(consumer.id());
                connection.stats().consumers.dec();
            }
            consumer.dispose();
        }
        let producers = std::mem::take(&mut *self.producers.write());
        for producer in producers.iter() {
            if let Some(connection) = connection.as_ref() {
                connection.remove_producer(producer.id());
                connection.stats().producers.dec();
            }
            producer.dispose();
        }
        if let Some(executor) = self.executor.as_ref() {
            let dropped = executor.close();
            if !dropped.is_empty() {
                log::debug!("session {} closed with {} undelivered dispatches", self.id(), dropped.len());
            }
        }

        let connection = match connection {
            Some(c) => c,
            None => return Ok(()),
        };
        connection.remove_session(self.id());
        if notify_broker && !connection.is_closed_or_failed() {
            let remove = RemoveInfo {
                object_id: DataStructureId::Session(self.id().clone()),
                last_delivered_sequence_id: self.last_delivered_sequence_id.load(Ordering::SeqCst),
            };
            connection.oneway(Command::RemoveInfo(remove)).await?;
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(CmsError::IllegalState(format!("session {} is closed", self.id())))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.connection.upgrade().ok_or(CmsError::Closed)
    }

    pub(crate) fn start(&self) {
        if self.is_closed() {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        for consumer in self.consumers.read().iter() {
            consumer.start();
        }
        if let Some(executor) = self.executor.as_ref() {
            executor.start();
        }
    }

    pub(crate) fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        if let Some(executor) = self.executor.as_ref() {
            executor.stop();
        }
        for consumer in self.consumers.read().iter() {
            consumer.stop();
        }
    }

    /// Hands `dispatch` to the consumer it names. Runs on the session worker, or
    /// inline for a synchronous session.
    pub(crate) async fn deliver(&self, dispatch: MessageDispatch) {
        let consumer = self.consumers.read().iter().find(|c| c.id() == &dispatch.consumer_id).cloned();
        match consumer {
            Some(consumer) => {
                if let Some(connection) = self.connection.upgrade() {
                    connection.stats().dispatched.inc();
                }
                consumer.dispatch(dispatch).await;
            }
            None => log::debug!("session {} has no consumer {}, dispatch dropped", self.id(), dispatch.consumer_id),
        }
    }

    pub(crate) async fn send_ack(&self, ack: MessageAck, sync: bool) -> Result<()> {
        let connection = self.connection()?;
        if sync {
            connection.sync_request(Command::MessageAck(ack), connection.request_timeout()).await.map(|_| ())
        } else {
            connection.oneway(Command::MessageAck(ack)).await
        }
    }

    /// The open transaction of a TRANSACTED session, begun on first use.
    pub(crate) async fn ensure_transaction(&self) -> Result<Option<TransactionId>> {
        if !self.is_transacted() {
            return Ok(None);
        }
        let mut transaction = self.transaction.lock().await;
        if let Some(id) = transaction.as_ref() {
            return Ok(Some(id.clone()));
        }
        let connection = self.connection()?;
        let id = self.begin(&connection).await?;
        *transaction = Some(id.clone());
        Ok(Some(id))
    }

    async fn begin(&self, connection: &ConnectionInner) -> Result<TransactionId> {
        let transaction_id = connection.next_transaction_id();
        let info = TransactionInfo {
            connection_id: connection.connection_id().clone(),
            transaction_id: transaction_id.clone(),
            kind: TransactionType::Begin,
        };
        connection.oneway(Command::TransactionInfo(info)).await?;
        log::debug!("session {} began transaction {}", self.id(), transaction_id);
        Ok(transaction_id)
    }

    #[inline]
    fn forget_consumer(&self, id: &ConsumerId) -> Option<Consumer> {
        let mut consumers = self.consumers.write();
        let pos = consumers.iter().position(|c| c.id() == id)?;
        Some(consumers.remove(pos))
    }

    pub(crate) async fn remove_consumer(&self, id: &ConsumerId) -> Result<()> {
        let consumer = match self.forget_consumer(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        self.last_delivered_sequence_id.fetch_max(consumer.last_delivered_sequence_id(), Ordering::SeqCst);
        let connection = self.connection.upgrade();
        if let Some(connection) = connection.as_ref() {
            connection.remove_dispatcher(id);
        }
        if !consumer.dispose() {
            return Ok(());
        }
        let connection = match connection {
            Some(c) => c,
            None => return Ok(()),
        };
        connection.stats().consumers.dec();
        if connection.is_closed_or_failed() {
            return Ok(());
        }
        let remove = RemoveInfo {
            object_id: DataStructureId::Consumer(id.clone()),
            last_delivered_sequence_id: consumer.last_delivered_sequence_id(),
        };
        connection.oneway(Command::RemoveInfo(remove)).await
    }

    pub(crate) async fn remove_producer(&self, id: &ProducerId) -> Result<()> {
        let producer = {
            let mut producers = self.producers.write();
            match producers.iter().position(|p| p.id() == id) {
                Some(pos) => producers.remove(pos),
                None => return Ok(()),
            }
        };
        if !producer.dispose() {
            return Ok(());
        }
        let connection = match self.connection.upgrade() {
            Some(c) => c,
            None => return Ok(()),
        };
        connection.remove_producer(id);
        connection.stats().producers.dec();
        if connection.is_closed_or_failed() {
            return Ok(());
        }
        let remove = RemoveInfo { object_id: DataStructureId::Producer(id.clone()), last_delivered_sequence_id: 0 };
        connection.oneway(Command::RemoveInfo(remove)).await
    }

    #[inline]
    pub(crate) fn has_consumer_on(&self, destination: &Destination) -> bool {
        self.consumers.read().iter().any(|c| c.destination() == destination)
    }

    #[inline]
    pub(crate) fn find_consumer(&self, id: &ConsumerId) -> Option<Consumer> {
        self.consumers.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Drops dispatches queued for delivery, used after a transport interruption
    /// since the broker redelivers them.
    pub(crate) fn clear_queued(&self) {
        if let Some(executor) = self.executor.as_ref() {
            let dropped = executor.clear();
            if !dropped.is_empty() {
                log::debug!("session {} dropped {} queued dispatches after interruption", self.id(), dropped.len());
            }
        }
    }
}
