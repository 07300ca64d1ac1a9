//! One logical broker connection multiplexed over a single transport.
//!
//! The connection owns its sessions, the dispatcher registry, the request
//! correlator and the interruption coordinator, and is the only listener of its
//! transport. Inbound traffic arrives serially on the transport's receive task;
//! application callbacks never run there, they go through the connection executor
//! or a session worker.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use ramq_conf::ConnectionConfig;
use ramq_utils::{IdGenerator, SequenceGenerator};

use crate::consumer::Consumer;
use crate::correlator::ResponseCorrelator;
use crate::dispatcher::{Dispatcher, DispatcherRegistry};
use crate::error::{CmsError, Result};
use crate::executor::{ConnectionEvent, ConnectionExecutor};
use crate::interruption::{Epoch, InterruptionCoordinator, RecoveryState};
use crate::listener::ExceptionListener;
use crate::producer::{Producer, ProducerInner};
use crate::session::Session;
use crate::stats::ConnectionStats;
use crate::tracker::ConnectionStateTracker;
use crate::transport::{Transport, TransportListener};
use crate::types::{
    AckMode, AckType, BrokerInfo, Command, ConnectionId, ConnectionInfo, ConsumerControl, ConsumerId, DashMap,
    DashSet, DataStructureId, Destination, DestinationInfo, DestinationOperation, MessageAck, MessageDispatch,
    ProducerId, RemoveInfo, Response, ResponseBody, SessionId, SessionInfo, TransactionId,
};

static CONNECTION_ID_GENERATOR: Lazy<IdGenerator> = Lazy::new(IdGenerator::new);
static CLIENT_ID_GENERATOR: Lazy<IdGenerator> = Lazy::new(IdGenerator::new);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Started,
    Stopped,
    Closing,
    Closed,
    TransportFailed,
}

#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl Deref for Connection {
    type Target = ConnectionInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection {{ id: {}, client_id: {}, state: {:?}, sessions: {} }}",
            self.connection_id(),
            self.client_id(),
            self.state(),
            self.sessions.read().len()
        )
    }
}

impl Connection {
    /// Creates a connection over `transport`, becomes its listener and starts it.
    /// Nothing is sent until the first session, `start()` or `set_client_id`.
    pub async fn connect(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;
        let config = Arc::new(config);
        let connection_id = ConnectionId::new(CONNECTION_ID_GENERATOR.generate_id());
        let user_client_id = config.client_id.is_some();
        let client_id = config.client_id.clone().unwrap_or_else(|| CLIENT_ID_GENERATOR.generate_id());
        let info = ConnectionInfo {
            connection_id: connection_id.clone(),
            client_id: client_id.into(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        let inner = Arc::new_cyclic(|me: &Weak<ConnectionInner>| ConnectionInner {
            me: me.clone(),
            config,
            transport,
            connection_id,
            info: RwLock::new(info),
            session_ids: SequenceGenerator::new(),
            consumer_ids: SequenceGenerator::new(),
            producer_ids: SequenceGenerator::new(),
            transaction_ids: SequenceGenerator::new(),
            temp_destination_ids: SequenceGenerator::new(),
            started: AtomicBool::new(false),
            ever_started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport_failed: AtomicBool::new(false),
            connection_info_sent: AtomicBool::new(false),
            client_id_set: AtomicBool::new(user_client_id),
            ensure_info: tokio::sync::Mutex::new(()),
            start_stop: Mutex::new(()),
            closed_notify: Notify::new(),
            first_failure: OnceCell::new(),
            sessions: RwLock::new(Vec::new()),
            dispatchers: DispatcherRegistry::new(),
            producers: DashMap::default(),
            temp_destinations: DashSet::default(),
            correlator: ResponseCorrelator::new(),
            interruption: InterruptionCoordinator::new(),
            tracker: ConnectionStateTracker::new(),
            exception_listener: RwLock::new(None),
            transport_listeners: RwLock::new(Vec::new()),
            broker_info: RwLock::new(None),
            executor: ConnectionExecutor::start(me.clone()),
            stats: ConnectionStats::new(),
        });

        let listener: Arc<dyn TransportListener> = Arc::new(ConnectionListener(Arc::downgrade(&inner)));
        inner.transport.set_listener(Some(listener));
        if let Err(e) = inner.transport.start().await {
            inner.transport.set_listener(None);
            return Err(e);
        }
        log::debug!("connection {} created, client id {}", inner.connection_id, inner.client_id());
        Ok(Connection(inner))
    }
}

/// The transport's view of a connection. Does not keep it alive.
struct ConnectionListener(Weak<ConnectionInner>);

#[async_trait]
impl TransportListener for ConnectionListener {
    async fn on_command(&self, command: Command) {
        if let Some(c) = self.0.upgrade() {
            c.on_command(command).await;
        }
    }

    async fn on_exception(&self, error: CmsError) {
        if let Some(c) = self.0.upgrade() {
            c.on_exception(error).await;
        }
    }

    async fn transport_interrupted(&self) {
        if let Some(c) = self.0.upgrade() {
            c.transport_interrupted().await;
        }
    }

    async fn transport_resumed(&self) {
        if let Some(c) = self.0.upgrade() {
            c.transport_resumed().await;
        }
    }
}

pub struct ConnectionInner {
    me: Weak<ConnectionInner>,
    config: Arc<ConnectionConfig>,
    transport: Arc<dyn Transport>,
    connection_id: ConnectionId,
    info: RwLock<ConnectionInfo>,

    session_ids: SequenceGenerator,
    consumer_ids: SequenceGenerator,
    producer_ids: SequenceGenerator,
    transaction_ids: SequenceGenerator,
    temp_destination_ids: SequenceGenerator,

    started: AtomicBool,
    ever_started: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    transport_failed: AtomicBool,
    connection_info_sent: AtomicBool,
    client_id_set: AtomicBool,
    //Serializes the one-time ConnectionInfo send.
    ensure_info: tokio::sync::Mutex<()>,
    start_stop: Mutex<()>,
    closed_notify: Notify,
    first_failure: OnceCell<Arc<CmsError>>,

    sessions: RwLock<Vec<Session>>,
    dispatchers: DispatcherRegistry,
    producers: DashMap<ProducerId, Weak<ProducerInner>>,
    temp_destinations: DashSet<Destination>,

    correlator: ResponseCorrelator,
    interruption: InterruptionCoordinator,
    tracker: ConnectionStateTracker,

    exception_listener: RwLock<Option<Arc<dyn ExceptionListener>>>,
    transport_listeners: RwLock<Vec<Arc<dyn TransportListener>>>,
    broker_info: RwLock<Option<BrokerInfo>>,
    executor: ConnectionExecutor,
    stats: ConnectionStats,
}

impl ConnectionInner {
    #[inline]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[inline]
    pub fn client_id(&self) -> String {
        self.info.read().client_id.to_string()
    }

    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    #[inline]
    pub fn broker_info(&self) -> Option<BrokerInfo> {
        self.broker_info.read().clone()
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
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) && !self.is_closed()
    }

    #[inline]
    pub fn is_transport_failed(&self) -> bool {
        self.transport_failed.load(Ordering::SeqCst)
    }

    /// The first transport failure, if any. Recorded once.
    #[inline]
    pub fn first_failure(&self) -> Option<CmsError> {
        self.first_failure.get().map(|e| e.as_ref().clone())
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.closing.load(Ordering::SeqCst) {
            ConnectionState::Closing
        } else if self.is_transport_failed() {
            ConnectionState::TransportFailed
        } else if self.is_started() {
            ConnectionState::Started
        } else if self.ever_started.load(Ordering::SeqCst) {
            ConnectionState::Stopped
        } else {
            ConnectionState::New
        }
    }

    #[inline]
    pub fn recovery_state(&self) -> RecoveryState {
        self.interruption.state()
    }

    #[inline]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().clone()
    }

    #[inline]
    pub fn set_exception_listener(&self, listener: Option<Arc<dyn ExceptionListener>>) {
        *self.exception_listener.write() = listener;
    }

    #[inline]
    pub fn exception_listener(&self) -> Option<Arc<dyn ExceptionListener>> {
        self.exception_listener.read().clone()
    }

    /// Receives a copy of every inbound command and transport event, on the
    /// connection executor.
    #[inline]
    pub fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.transport_listeners.write().push(listener);
    }

    #[inline]
    pub fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.transport_listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Sets the client id. Only allowed once, before the connection is used.
    pub async fn set_client_id(&self, client_id: &str) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(CmsError::Closed);
        }
        if client_id.is_empty() {
            return Err(CmsError::InvalidClientId("client id must not be empty".into()));
        }
        {
            let _guard = self.ensure_info.lock().await;
            if self.connection_info_sent.load(Ordering::SeqCst) {
                return Err(CmsError::IllegalState("client id cannot be set once the connection is in use".into()));
            }
            if self.client_id_set.swap(true, Ordering::SeqCst) {
                return Err(CmsError::IllegalState("client id is already set".into()));
            }
            self.info.write().client_id = client_id.into();
        }
        self.ensure_connection_info_sent().await
    }

    /// Sends ConnectionInfo once. Concurrent callers wait for the single send.
    async fn ensure_connection_info_sent(&self) -> Result<()> {
        if self.connection_info_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.ensure_info.lock().await;
        if self.connection_info_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.check_closed_or_failed()?;
        let info = self.info.read().clone();
        self.sync_request(Command::ConnectionInfo(info), self.request_timeout()).await?;
        self.connection_info_sent.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Creates a session. Its dispatch mode is decided here and never changes: it
    /// is asynchronous when configured so, when another session already exists, or
    /// for CLIENT and TRANSACTED acknowledgement.
    pub async fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        self.check_closed_or_failed()?;
        self.ensure_connection_info_sent().await?;

        let info = SessionInfo { session_id: SessionId::new(&self.connection_id, self.session_ids.next()), ack_mode };
        let session = {
            let mut sessions = self.sessions.write();
            if self.closing.load(Ordering::SeqCst) {
                return Err(CmsError::Closed);
            }
            let async_dispatch = self.config.always_session_async
                || !sessions.is_empty()
                || matches!(ack_mode, AckMode::Transacted | AckMode::Client);
            let session = Session::new(info.clone(), self.me.clone(), self.config.clone(), async_dispatch);
            sessions.push(session.clone());
            self.stats.sessions.inc();
            session
        };

        if let Err(e) = self.oneway(Command::SessionInfo(info)).await {
            if let Err(e) = session.dispose().await {
                log::debug!("session {} dispose error, {:?}", session.id(), e);
            }
            return Err(e);
        }
        if self.is_started() {
            session.start();
        }
        log::debug!("session {} created, {:?}, async: {}", session.id(), ack_mode, session.is_async());
        Ok(session)
    }

    /// Starts delivery on every session. Starting twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.check_closed_or_failed()?;
        self.ensure_connection_info_sent().await?;
        let _guard = self.start_stop.lock();
        if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.ever_started.store(true, Ordering::SeqCst);
            for session in self.sessions.read().iter() {
                session.start();
            }
        }
        Ok(())
    }

    /// Stops delivery on every session. Commands can still be sent.
    pub fn stop(&self) -> Result<()> {
        self.check_closed_or_failed()?;
        let _guard = self.start_stop.lock();
        if self.started.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            for session in self.sessions.read().iter() {
                session.stop();
            }
        }
        Ok(())
    }

    /// Closes every session, tells the broker and releases the transport once.
    /// Concurrent callers return when the first one has finished. Failures along
    /// the way are logged, never returned.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            loop {
                let closed = self.closed_notify.notified();
                tokio::pin!(closed);
                closed.as_mut().enable();
                if self.is_closed() {
                    return Ok(());
                }
                closed.await;
            }
        }
        log::debug!("closing connection {}", self.connection_id);

        {
            let _guard = self.start_stop.lock();
            self.started.store(false, Ordering::SeqCst);
        }
        let sessions = std::mem::take(&mut *self.sessions.write());
        for session in sessions.iter() {
            session.stop();
        }
        for session in sessions {
            if let Err(e) = session.dispose().await {
                log::warn!("connection {} close, session {} error, {:?}", self.connection_id, session.id(), e);
            }
            self.stats.sessions.dec();
        }
        self.dispatchers.clear();
        self.producers.clear();
        self.interruption.release();

        let healthy = self.connection_info_sent.load(Ordering::SeqCst) && !self.is_transport_failed();
        let temp_destinations: Vec<Destination> = self.temp_destinations.iter().map(|d| d.key().clone()).collect();
        self.temp_destinations.clear();
        if healthy {
            for destination in temp_destinations {
                let info = DestinationInfo {
                    connection_id: self.connection_id.clone(),
                    destination: destination.clone(),
                    operation: DestinationOperation::Remove,
                };
                let res = self
                    .correlator
                    .request(self.transport.as_ref(), Command::DestinationInfo(info), self.config.close_timeout)
                    .await;
                if let Err(e) = res {
                    log::warn!("connection {} close, delete {} error, {:?}", self.connection_id, destination, e);
                }
            }

            let remove = RemoveInfo {
                object_id: DataStructureId::Connection(self.connection_id.clone()),
                last_delivered_sequence_id: 0,
            };
            let res = self
                .correlator
                .request(self.transport.as_ref(), Command::RemoveInfo(remove), self.config.close_timeout)
                .await;
            if let Err(e) = res {
                log::warn!("connection {} close, remove error, {:?}", self.connection_id, e);
            }
            if let Err(e) = self.correlator.oneway(self.transport.as_ref(), Command::ShutdownInfo).await {
                log::warn!("connection {} close, shutdown error, {:?}", self.connection_id, e);
            }
        }

        self.transport.set_listener(None);
        if let Err(e) = self.transport.close().await {
            log::warn!("connection {} close, transport error, {:?}", self.connection_id, e);
        }
        self.correlator.dispose(CmsError::Closed);
        self.tracker.clear();

        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        log::debug!("connection {} closed", self.connection_id);
        Ok(())
    }

    /// Sends `command` and waits for the broker's answer. A zero `timeout` waits
    /// forever. A broker side failure comes back as `BrokerRejected`.
    pub async fn sync_request(&self, command: Command, timeout: Duration) -> Result<Response> {
        self.check_closed_or_failed()?;
        let tracked = if ConnectionStateTracker::tracks(&command) { Some(command.clone()) } else { None };
        self.stats.requests.inc();
        let _in_flight = scopeguard::guard((), |_| self.stats.requests.dec());

        let response = self.correlator.request(self.transport.as_ref(), command, timeout).await?;
        if let ResponseBody::Exception(e) = &response.body {
            return Err(e.clone().into());
        }
        if let Some(command) = tracked {
            self.tracker.track(&command);
        }
        Ok(response)
    }

    /// Sends `command` without waiting for an answer.
    pub async fn oneway(&self, command: Command) -> Result<()> {
        self.check_closed_or_failed()?;
        if ConnectionStateTracker::tracks(&command) {
            self.tracker.track(&command);
        }
        self.correlator.oneway(self.transport.as_ref(), command).await
    }

    /// Registers `dispatcher` for inbound messages addressed to `consumer_id`.
    #[inline]
    pub fn add_dispatcher(&self, consumer_id: ConsumerId, dispatcher: &Arc<dyn Dispatcher>) -> Result<()> {
        self.dispatchers.register(consumer_id, dispatcher)
    }

    #[inline]
    pub fn remove_dispatcher(&self, consumer_id: &ConsumerId) -> bool {
        self.dispatchers.unregister(consumer_id)
    }

    /// Asks the broker to remove `destination`.
    pub async fn destroy_destination(&self, destination: &Destination) -> Result<()> {
        let info = DestinationInfo {
            connection_id: self.connection_id.clone(),
            destination: destination.clone(),
            operation: DestinationOperation::Remove,
        };
        self.sync_request(Command::DestinationInfo(info), self.request_timeout()).await.map(|_| ())
    }

    /// Deletes a temporary destination created by this connection. Fails while a
    /// consumer of it is open.
    pub async fn delete_temporary_destination(&self, destination: &Destination) -> Result<()> {
        self.check_closed_or_failed()?;
        if !destination.is_temporary() {
            return Err(CmsError::InvalidDestination(format!("{} is not temporary", destination)));
        }
        if self.sessions().iter().any(|s| s.has_consumer_on(destination)) {
            return Err(CmsError::IllegalState(format!("{} still has an active consumer", destination)));
        }
        self.destroy_destination(destination).await?;
        self.temp_destinations.remove(destination);
        Ok(())
    }

    #[inline]
    pub fn is_temporary_destination(&self, destination: &Destination) -> bool {
        self.temp_destinations.contains(destination)
    }

    /// Resolves once every consumer has finished reacting to the current transport
    /// interruption.
    #[inline]
    pub async fn wait_for_transport_interruption_processing_to_complete(&self) {
        self.interruption.wait_for_completion().await
    }

    #[inline]
    pub fn signal_interruption_processing_complete(&self, epoch: Epoch) {
        if !self.interruption.signal(epoch) {
            log::trace!("connection {} interruption signal for epoch {} not counted", self.connection_id, epoch);
        }
    }

    #[inline]
    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    #[inline]
    pub(crate) fn is_closed_or_failed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.is_closed() || self.is_transport_failed()
    }

    pub(crate) fn check_closed_or_failed(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(CmsError::Closed);
        }
        if let Some(cause) = self.first_failure.get() {
            return Err(CmsError::ConnectionFailed(cause.clone()));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn next_consumer_id(&self, session_id: &SessionId) -> ConsumerId {
        ConsumerId::new(session_id, self.consumer_ids.next())
    }

    #[inline]
    pub(crate) fn next_producer_id(&self, session_id: &SessionId) -> ProducerId {
        ProducerId::new(session_id, self.producer_ids.next())
    }

    #[inline]
    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId { connection_id: self.connection_id.value.clone(), value: self.transaction_ids.next() }
    }

    pub(crate) async fn create_temporary_destination(&self, topic: bool) -> Result<Destination> {
        self.check_closed_or_failed()?;
        let name = format!("{}:{}", self.connection_id, self.temp_destination_ids.next());
        let destination =
            if topic { Destination::TempTopic(name.into()) } else { Destination::TempQueue(name.into()) };
        let info = DestinationInfo {
            connection_id: self.connection_id.clone(),
            destination: destination.clone(),
            operation: DestinationOperation::Add,
        };
        self.sync_request(Command::DestinationInfo(info), self.request_timeout()).await?;
        self.temp_destinations.insert(destination.clone());
        Ok(destination)
    }

    #[inline]
    pub(crate) fn add_producer(&self, producer: &Producer) {
        self.producers.insert(producer.id().clone(), producer.downgrade());
    }

    #[inline]
    pub(crate) fn remove_producer(&self, producer_id: &ProducerId) {
        self.producers.remove(producer_id);
    }

    pub(crate) fn remove_session(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(pos) = sessions.iter().position(|s| s.id() == session_id) {
            sessions.remove(pos);
            self.stats.sessions.dec();
        }
    }

    /// Queues `error` for the exception listener unless the connection is closing.
    pub(crate) fn fire_exception(&self, error: CmsError) {
        if self.closing.load(Ordering::SeqCst) {
            log::debug!("connection {} is closing, exception not reported, {:?}", self.connection_id, error);
            return;
        }
        self.executor.execute(ConnectionEvent::Exception(error));
    }

    #[inline]
    fn has_transport_listeners(&self) -> bool {
        !self.transport_listeners.read().is_empty()
    }

    async fn on_command(&self, command: Command) {
        if self.has_transport_listeners() {
            self.executor.execute(ConnectionEvent::Command(command.clone()));
        }
        match command {
            Command::Response(response) => {
                self.correlator.on_response(response);
            }
            Command::MessageDispatch(dispatch) => self.on_message_dispatch(dispatch).await,
            Command::ProducerAck(ack) => {
                let producer = self.producers.get(&ack.producer_id).and_then(|p| p.upgrade());
                match producer {
                    Some(producer) => producer.on_producer_ack(ack.size),
                    None => log::debug!("producer ack for unknown producer {}", ack.producer_id),
                }
            }
            Command::BrokerInfo(info) => {
                log::info!("connection {} broker is {} ({})", self.connection_id, info.broker_name, info.broker_url);
                *self.broker_info.write() = Some(info);
            }
            Command::ConnectionError(error) => {
                log::warn!("connection {} broker error, {}: {}", self.connection_id, error.exception_class, error.message);
                self.fire_exception(error.into());
            }
            Command::ConsumerControl(control) => self.on_consumer_control(control),
            Command::KeepAlive => {
                log::trace!("connection {} keep alive", self.connection_id);
            }
            other => {
                log::debug!("connection {} ignored inbound {}", self.connection_id, other.name());
            }
        }
    }

    async fn on_message_dispatch(&self, dispatch: MessageDispatch) {
        if self.interruption.is_interrupted() {
            self.interruption.wait_for_completion().await;
        }
        match self.dispatchers.lookup(&dispatch.consumer_id) {
            Some(dispatcher) => dispatcher.dispatch(dispatch).await,
            None => {
                self.stats.unmatched.inc();
                if self.closing.load(Ordering::SeqCst) {
                    log::debug!("connection {} is closing, dispatch for {} dropped", self.connection_id, dispatch.consumer_id);
                    return;
                }
                log::warn!("connection {} has no dispatcher for {}, message dropped", self.connection_id, dispatch.consumer_id);
                let ack = MessageAck::for_dispatch(&dispatch, AckType::Delivered);
                if let Err(e) = self.oneway(Command::MessageAck(ack)).await {
                    log::debug!("connection {} delivered ack error, {:?}", self.connection_id, e);
                }
                self.fire_exception(CmsError::NoDispatcherRegistered(dispatch.consumer_id));
            }
        }
    }

    fn find_consumer(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.sessions.read().iter().find_map(|s| s.find_consumer(consumer_id))
    }

    fn on_consumer_control(&self, control: ConsumerControl) {
        let consumer = match self.find_consumer(&control.consumer_id) {
            Some(c) => c,
            None => {
                log::debug!("consumer control for unknown consumer {}", control.consumer_id);
                return;
            }
        };
        if control.close {
            tokio::spawn(async move {
                if let Err(e) = consumer.close().await {
                    log::warn!("consumer {} close on broker request error, {:?}", consumer.id(), e);
                }
            });
        } else {
            consumer.set_prefetch(control.prefetch);
        }
    }

    async fn on_exception(&self, error: CmsError) {
        if self.has_transport_listeners() {
            self.executor.execute(ConnectionEvent::TransportException(error.clone()));
        }
        let cause = Arc::new(error);
        if self.first_failure.set(cause.clone()).is_err() {
            log::debug!("connection {} already failed, {:?}", self.connection_id, cause);
            return;
        }
        self.transport_failed.store(true, Ordering::SeqCst);
        log::error!("connection {} transport failed, {:?}", self.connection_id, cause);
        let failure = CmsError::ConnectionFailed(cause);
        self.correlator.dispose(failure.clone());
        self.interruption.fail();
        self.fire_exception(failure);
    }

    async fn transport_interrupted(&self) {
        let consumers: Vec<Consumer> = self.sessions().iter().flat_map(|s| s.consumers()).collect();
        let epoch = self.interruption.begin(consumers.len());
        for session in self.sessions() {
            session.clear_queued();
        }
        for consumer in consumers {
            consumer.in_progress_clear_required();
            tokio::spawn(async move { consumer.clear_messages_in_progress(epoch) });
        }
        if self.has_transport_listeners() {
            self.executor.execute(ConnectionEvent::Interrupted);
        }
    }

    async fn transport_resumed(&self) {
        if self.connection_info_sent.load(Ordering::SeqCst) && !self.is_closed_or_failed() {
            let commands = self.tracker.restore_commands();
            log::debug!("connection {} resumed, replaying {} registrations", self.connection_id, commands.len());
            for command in commands {
                if let Err(e) = self.correlator.oneway(self.transport.as_ref(), command).await {
                    log::warn!("connection {} restore error, {:?}", self.connection_id, e);
                    break;
                }
            }
        }
        if self.has_transport_listeners() {
            self.executor.execute(ConnectionEvent::Resumed);
        }
    }

    pub(crate) async fn deliver_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Exception(error) => match self.exception_listener() {
                Some(listener) => listener.on_exception(&error),
                None => log::debug!("connection {} has no exception listener, {:?}", self.connection_id, error),
            },
            ConnectionEvent::Command(command) => {
                let listeners = self.transport_listeners.read().clone();
                for listener in listeners {
                    listener.on_command(command.clone()).await;
                }
            }
            ConnectionEvent::TransportException(error) => {
                let listeners = self.transport_listeners.read().clone();
                for listener in listeners {
                    listener.on_exception(error.clone()).await;
                }
            }
            ConnectionEvent::Interrupted => {
                let listeners = self.transport_listeners.read().clone();
                for listener in listeners {
                    listener.transport_interrupted().await;
                }
            }
            ConnectionEvent::Resumed => {
                let listeners = self.transport_listeners.read().clone();
                for listener in listeners {
                    listener.transport_resumed().await;
                }
            }
        }
    }
}
