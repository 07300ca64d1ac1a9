use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use ramq_conf::{ConnectionConfig, RedeliveryPolicy};

use crate::connection::ConnectionInner;
use crate::error::{CmsError, Result};
use crate::interruption::Epoch;
use crate::listener::{panic_message, MessageListener};
use crate::message::Message;
use crate::queue::DispatchChannel;
use crate::session::SessionInner;
use crate::types::{
    AckMode, AckType, BrokerError, Command, ConsumerId, ConsumerInfo, Destination, MessageAck, MessageDispatch,
    MessagePull, TransactionId,
};

const POISON_CAUSE_CLASS: &str = "ramq.RedeliveryExhausted";

enum Wait {
    Forever,
    For(Duration),
    No,
}

/// Listener hand-off state. Whatever sits in `backlog` is older than any
/// dispatch arriving later and reaches the listener first.
#[derive(Default)]
struct Delivery {
    listener: Option<Arc<dyn MessageListener>>,
    backlog: VecDeque<MessageDispatch>,
    //A failed dispatch is waiting out its redelivery delay.
    paused: bool,
    //Some task is running the listener over the backlog.
    draining: bool,
}

#[derive(Clone)]
pub struct Consumer(Arc<ConsumerInner>);

impl Deref for Consumer {
    type Target = ConsumerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consumer {{ id: {}, destination: {}, closed: {} }}", self.id(), self.destination(), self.is_closed())
    }
}

impl Consumer {
    pub(crate) fn new(
        info: ConsumerInfo,
        session: Weak<SessionInner>,
        connection: Weak<ConnectionInner>,
        ack_mode: AckMode,
        inline_dispatch: bool,
        config: &ConnectionConfig,
    ) -> Self {
        let capacity = info.prefetch_size.max(1) as usize;
        let prefetch = info.prefetch_size;
        Consumer(Arc::new_cyclic(|me| ConsumerInner {
            info,
            me: me.clone(),
            session,
            connection,
            ack_mode,
            inline_dispatch,
            send_acks_async: config.send_acks_async,
            redelivery: config.redelivery.clone(),
            delivery: Mutex::new(Delivery::default()),
            unconsumed: DispatchChannel::new(capacity, config.message_priority_supported),
            delivered: Mutex::new(VecDeque::new()),
            redelivery_delay: Mutex::new(Duration::ZERO),
            prefetch: AtomicI32::new(prefetch),
            last_delivered_sequence_id: AtomicI64::new(0),
            clear_required: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct ConsumerInner {
    info: ConsumerInfo,
    me: Weak<ConsumerInner>,
    session: Weak<SessionInner>,
    connection: Weak<ConnectionInner>,
    ack_mode: AckMode,
    //Listeners run on the transport receive task.
    inline_dispatch: bool,
    send_acks_async: bool,
    redelivery: RedeliveryPolicy,
    delivery: Mutex<Delivery>,
    //Dispatches waiting for `receive`.
    unconsumed: DispatchChannel,
    //Handed to the application but not yet acknowledged, oldest first.
    delivered: Mutex<VecDeque<MessageDispatch>>,
    redelivery_delay: Mutex<Duration>,
    prefetch: AtomicI32,
    last_delivered_sequence_id: AtomicI64,
    clear_required: AtomicBool,
    closed: AtomicBool,
}

impl ConsumerInner {
    #[inline]
    pub fn id(&self) -> &ConsumerId {
        &self.info.consumer_id
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.info.destination
    }

    #[inline]
    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    #[inline]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    #[inline]
    pub fn prefetch_size(&self) -> i32 {
        self.prefetch.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Messages waiting for `receive`.
    #[inline]
    pub fn pending(&self) -> usize {
        self.unconsumed.len()
    }

    /// Messages handed to the application and not yet acknowledged.
    #[inline]
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    #[inline]
    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.delivery.lock().listener.clone()
    }

    /// Installs or removes the asynchronous listener. Messages already queued for
    /// `receive` are handed to a new listener in arrival order, ahead of anything
    /// dispatched later.
    pub async fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> Result<()> {
        self.check_closed()?;
        if listener.is_some() && self.prefetch_size() == 0 {
            return Err(CmsError::IllegalState(
                "cannot set an asynchronous listener on a consumer with a zero prefetch".into(),
            ));
        }
        let installing = listener.is_some();
        {
            let mut delivery = self.delivery.lock();
            delivery.listener = listener;
            if installing {
                for d in self.unconsumed.clear().into_iter().rev() {
                    delivery.backlog.push_front(d);
                }
            }
        }
        self.drain().await;
        Ok(())
    }

    /// Waits until a message arrives or the consumer closes.
    #[inline]
    pub async fn receive(&self) -> Result<Option<Message>> {
        self.receive_inner(Wait::Forever).await
    }

    #[inline]
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.receive_inner(Wait::For(timeout)).await
    }

    #[inline]
    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.receive_inner(Wait::No).await
    }

    /// Acknowledges `message` according to the session's mode: CLIENT acknowledges
    /// everything the session delivered, INDIVIDUAL only this message.
    pub async fn acknowledge_message(&self, message: &Message) -> Result<()> {
        self.check_closed()?;
        match self.ack_mode {
            AckMode::Client => self.session()?.acknowledge().await,
            AckMode::Individual => {
                let id = message
                    .message_id
                    .as_ref()
                    .ok_or_else(|| CmsError::IllegalState("message has no id, cannot acknowledge".into()))?;
                let dispatch = {
                    let mut delivered = self.delivered.lock();
                    delivered.iter().position(|d| d.message_id() == Some(id)).and_then(|pos| delivered.remove(pos))
                };
                match dispatch {
                    Some(d) => {
                        let ack = MessageAck::for_dispatch(&d, AckType::Individual);
                        self.session()?.send_ack(ack, self.acks_wait()).await
                    }
                    None => Ok(()),
                }
            }
            AckMode::Auto | AckMode::Transacted => Ok(()),
        }
    }

    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.session.upgrade() {
            Some(session) => session.remove_consumer(self.id()).await,
            None => {
                self.dispose();
                Ok(())
            }
        }
    }

    #[inline]
    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(CmsError::IllegalState(format!("consumer {} is closed", self.id())))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(CmsError::Closed)
    }

    pub(crate) fn start(&self) {
        if self.is_closed() {
            return;
        }
        self.unconsumed.start();
        if self.delivery.lock().backlog.is_empty() {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            tokio::spawn(async move { me.drain().await });
        }
    }

    pub(crate) fn stop(&self) {
        self.unconsumed.stop();
    }

    /// Local teardown. Returns `false` when already disposed.
    pub(crate) fn dispose(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let held = {
            let mut delivery = self.delivery.lock();
            delivery.listener = None;
            std::mem::take(&mut delivery.backlog)
        };
        let mut dropped = self.unconsumed.close();
        dropped.extend(held);
        let forgotten = {
            let mut delivered = self.delivered.lock();
            let n = delivered.len();
            delivered.clear();
            n
        };
        if !dropped.is_empty() || forgotten > 0 {
            log::debug!(
                "consumer {} closed with {} queued and {} unacknowledged messages",
                self.id(),
                dropped.len(),
                forgotten
            );
        }
        true
    }

    #[inline]
    pub(crate) fn last_delivered_sequence_id(&self) -> i64 {
        self.last_delivered_sequence_id.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_prefetch(&self, prefetch: i32) {
        log::debug!("consumer {} prefetch changed to {}", self.id(), prefetch);
        self.prefetch.store(prefetch, Ordering::SeqCst);
    }

    /// Entry point for every dispatch routed to this consumer. Runs on the session
    /// worker, or on the transport task for a synchronous session.
    pub(crate) async fn dispatch(&self, dispatch: MessageDispatch) {
        if self.is_closed() {
            log::debug!("consumer {} is closed, dispatch dropped", self.id());
            return;
        }
        if Self::is_expired(&dispatch) {
            self.ack(&dispatch, AckType::Delivered, false).await;
            return;
        }
        let queued = {
            let mut delivery = self.delivery.lock();
            if delivery.listener.is_none() && delivery.backlog.is_empty() {
                Some(self.unconsumed.enqueue_now(dispatch))
            } else {
                delivery.backlog.push_back(dispatch);
                None
            }
        };
        match queued {
            Some(Err(d)) => log::debug!("consumer {} queue closed, dispatch {:?} dropped", self.id(), d.message_id()),
            Some(Ok(())) => {}
            None => self.drain().await,
        }
    }

    /// Runs the listener over the backlog until it is empty, paused, or handed
    /// to `receive` because the listener went away. One task drains at a time,
    /// the others leave their dispatches to it.
    async fn drain(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }
        let draining = scopeguard::guard((), |_| self.delivery.lock().draining = false);
        loop {
            let next = {
                let mut delivery = self.delivery.lock();
                let next = self.next_for_listener(&mut delivery);
                if next.is_none() {
                    delivery.draining = false;
                }
                next
            };
            match next {
                Some((listener, dispatch)) => self.deliver_to_listener(listener, dispatch).await,
                None => {
                    scopeguard::ScopeGuard::into_inner(draining);
                    return;
                }
            }
        }
    }

    fn next_for_listener(&self, delivery: &mut Delivery) -> Option<(Arc<dyn MessageListener>, MessageDispatch)> {
        if delivery.paused || self.is_closed() || !self.unconsumed.is_running() {
            return None;
        }
        match delivery.listener.clone() {
            Some(listener) => delivery.backlog.pop_front().map(|d| (listener, d)),
            None => {
                for d in delivery.backlog.drain(..) {
                    if let Err(d) = self.unconsumed.enqueue_now(d) {
                        log::debug!("consumer {} queue closed, dispatch {:?} dropped", self.id(), d.message_id());
                    }
                }
                None
            }
        }
    }

    async fn deliver_to_listener(&self, listener: Arc<dyn MessageListener>, mut dispatch: MessageDispatch) {
        let message = match dispatch.message.as_ref() {
            Some(m) => m,
            None => return,
        };
        self.before_consumed(&dispatch).await;
        let failure = match AssertUnwindSafe(listener.on_message(message)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        let failure = match failure {
            None => {
                self.after_consumed(dispatch, self.acks_wait()).await;
                return;
            }
            Some(failure) => failure,
        };

        log::warn!("consumer {} listener error, {}", self.id(), failure);
        if let Some(connection) = self.connection.upgrade() {
            connection.fire_exception(CmsError::Listener(failure));
        }

        if !matches!(self.ack_mode, AckMode::Auto | AckMode::Individual) {
            return;
        }
        match self.prepare_redelivery(&mut dispatch).await {
            None => {}
            Some(delay) if delay.is_zero() => self.delivery.lock().backlog.push_front(dispatch),
            Some(delay) => self.pause_for_redelivery(dispatch, delay),
        }
    }

    /// Holds back this consumer's deliveries until `delay` has passed, then
    /// retries `dispatch` ahead of them. The dispatching task moves on.
    fn pause_for_redelivery(&self, dispatch: MessageDispatch, delay: Duration) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        {
            let mut delivery = self.delivery.lock();
            delivery.backlog.push_front(dispatch);
            delivery.paused = true;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.delivery.lock().paused = false;
            me.drain().await;
        });
    }

    /// Whether acks sent outside `receive` wait for the broker. A synchronous
    /// session runs listeners on the transport receive task, which cannot wait
    /// for its own responses.
    #[inline]
    fn acks_wait(&self) -> bool {
        !self.send_acks_async && !self.inline_dispatch
    }

    /// Bumps the redelivery counter after a failed listener call. `None` when the
    /// message was poisoned instead.
    async fn prepare_redelivery(&self, dispatch: &mut MessageDispatch) -> Option<Duration> {
        let previous = dispatch.redelivery_counter;
        Self::bump_redelivery_counter(dispatch);
        if self.ack_mode == AckMode::Individual {
            let mut delivered = self.delivered.lock();
            if delivered.back().map(|d| d.message_id() == dispatch.message_id()).unwrap_or(false) {
                delivered.pop_back();
            }
        }

        if self.redelivery.is_exhausted(dispatch.redelivery_counter) {
            let mut ack = MessageAck::for_dispatch(dispatch, AckType::Poison);
            ack.poison_cause = Some(self.poison_cause(dispatch.redelivery_counter));
            self.send_ack(ack, !self.inline_dispatch).await;
            *self.redelivery_delay.lock() = Duration::ZERO;
            return None;
        }
        if previous > 0 {
            self.ack(dispatch, AckType::Redelivered, false).await;
        }
        Some(self.next_redelivery_delay(previous))
    }

    #[inline]
    fn next_redelivery_delay(&self, previous_counter: i32) -> Duration {
        let mut delay = self.redelivery_delay.lock();
        let previous = if previous_counter > 0 { *delay } else { Duration::ZERO };
        *delay = self.redelivery.next_redelivery_delay(previous);
        *delay
    }

    #[inline]
    fn bump_redelivery_counter(dispatch: &mut MessageDispatch) {
        dispatch.redelivery_counter += 1;
        if let Some(m) = dispatch.message.as_mut() {
            m.redelivery_counter = dispatch.redelivery_counter;
        }
    }

    fn poison_cause(&self, counter: i32) -> BrokerError {
        BrokerError::new(
            POISON_CAUSE_CLASS,
            format!(
                "delivery to consumer {} failed {} times, maximum redeliveries is {}",
                self.id(),
                counter,
                self.redelivery.maximum_redeliveries
            ),
        )
    }

    #[inline]
    fn is_expired(dispatch: &MessageDispatch) -> bool {
        dispatch.message.as_ref().map(|m| m.is_expired()).unwrap_or(false)
    }

    async fn before_consumed(&self, dispatch: &MessageDispatch) {
        if let Some(id) = dispatch.message_id() {
            self.last_delivered_sequence_id.fetch_max(id.producer_sequence_id, Ordering::SeqCst);
        }
        match self.ack_mode {
            AckMode::Auto => {}
            AckMode::Transacted => {
                let begun = match self.session() {
                    Ok(session) => session.ensure_transaction().await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = begun {
                    log::warn!("consumer {} begin transaction error, {:?}", self.id(), e);
                }
                self.delivered.lock().push_back(dispatch.clone());
            }
            AckMode::Client | AckMode::Individual => {
                self.delivered.lock().push_back(dispatch.clone());
            }
        }
    }

    async fn after_consumed(&self, dispatch: MessageDispatch, sync: bool) {
        if self.ack_mode == AckMode::Auto {
            self.ack(&dispatch, AckType::Standard, sync).await;
            *self.redelivery_delay.lock() = Duration::ZERO;
        }
    }

    async fn receive_inner(&self, wait: Wait) -> Result<Option<Message>> {
        self.check_closed()?;
        if self.delivery.lock().listener.is_some() {
            return Err(CmsError::IllegalState(
                "cannot receive synchronously while a message listener is set".into(),
            ));
        }
        if self.prefetch_size() == 0 {
            self.pull(&wait).await?;
        }

        let deadline = match wait {
            Wait::For(t) => Some(Instant::now() + t),
            _ => None,
        };
        loop {
            let dispatch = match (&wait, deadline) {
                (Wait::No, _) => self.unconsumed.try_dequeue(),
                (_, Some(deadline)) => {
                    tokio::time::timeout_at(deadline, self.unconsumed.dequeue()).await.unwrap_or_default()
                }
                (_, None) => self.unconsumed.dequeue().await,
            };
            let dispatch = match dispatch {
                Some(d) => d,
                None => return Ok(None),
            };
            if Self::is_expired(&dispatch) {
                self.ack(&dispatch, AckType::Delivered, false).await;
                continue;
            }
            let message = match dispatch.message.clone() {
                Some(m) => m,
                None => return Ok(None),
            };
            self.before_consumed(&dispatch).await;
            self.after_consumed(dispatch, !self.send_acks_async).await;
            return Ok(Some(message));
        }
    }

    async fn pull(&self, wait: &Wait) -> Result<()> {
        let timeout = match wait {
            Wait::Forever => Some(Duration::ZERO),
            Wait::For(t) => Some(*t),
            Wait::No => None,
        };
        let pull = MessagePull { consumer_id: self.id().clone(), destination: self.destination().clone(), timeout };
        self.session()?.connection()?.oneway(Command::MessagePull(pull)).await
    }

    async fn ack(&self, dispatch: &MessageDispatch, ack_type: AckType, sync: bool) {
        self.send_ack(MessageAck::for_dispatch(dispatch, ack_type), sync).await;
    }

    async fn send_ack(&self, ack: MessageAck, sync: bool) {
        let ack_type = ack.ack_type;
        let sent = match self.session() {
            Ok(session) => session.send_ack(ack, sync).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            log::debug!("consumer {} {:?} ack error, {:?}", self.id(), ack_type, e);
        }
    }

    /// One ack covering every dispatch in `dispatches`, oldest first.
    fn range_ack(&self, dispatches: &VecDeque<MessageDispatch>, ack_type: AckType) -> Option<MessageAck> {
        let first = dispatches.front()?;
        let last = dispatches.back()?;
        Some(MessageAck {
            ack_type,
            consumer_id: self.id().clone(),
            destination: first.destination.clone().or_else(|| Some(self.destination().clone())),
            first_message_id: first.message_id().cloned(),
            last_message_id: last.message_id().cloned(),
            message_count: dispatches.len() as i32,
            transaction_id: None,
            poison_cause: None,
        })
    }

    /// Acknowledges everything delivered so far in one Standard ack.
    pub(crate) async fn acknowledge_delivered(&self) -> Result<()> {
        let delivered = std::mem::take(&mut *self.delivered.lock());
        let ack = match self.range_ack(&delivered, AckType::Standard) {
            Some(ack) => ack,
            None => return Ok(()),
        };
        *self.redelivery_delay.lock() = Duration::ZERO;
        self.session()?.send_ack(ack, !self.send_acks_async).await
    }

    /// The ack that makes this consumer's deliveries part of `transaction_id`.
    pub(crate) fn take_commit_ack(&self, transaction_id: &TransactionId) -> Option<MessageAck> {
        let delivered = std::mem::take(&mut *self.delivered.lock());
        let mut ack = self.range_ack(&delivered, AckType::Standard)?;
        ack.transaction_id = Some(transaction_id.clone());
        *self.redelivery_delay.lock() = Duration::ZERO;
        Some(ack)
    }

    #[inline]
    pub(crate) fn has_delivered(&self) -> bool {
        !self.delivered.lock().is_empty()
    }

    /// Redelivers everything delivered but unacknowledged, used by `recover` and
    /// transaction rollback.
    pub(crate) async fn rollback(&self) {
        let mut delivered = std::mem::take(&mut *self.delivered.lock());
        let previous = match delivered.front() {
            Some(d) => d.redelivery_counter,
            None => return,
        };
        delivered.iter_mut().for_each(Self::bump_redelivery_counter);
        let highest = delivered.iter().map(|d| d.redelivery_counter).max().unwrap_or_default();

        if self.redelivery.is_exhausted(highest) {
            if let Some(mut ack) = self.range_ack(&delivered, AckType::Poison) {
                ack.poison_cause = Some(self.poison_cause(highest));
                self.send_ack(ack, !self.inline_dispatch).await;
            }
            *self.redelivery_delay.lock() = Duration::ZERO;
            return;
        }
        if previous > 0 {
            if let Some(ack) = self.range_ack(&delivered, AckType::Redelivered) {
                self.send_ack(ack, false).await;
            }
        }
        let delay = self.next_redelivery_delay(previous);
        self.schedule_redelivery(delivered.into(), delay);
    }

    /// Hands `dispatches` back after `delay`, ahead of anything dispatched since.
    fn schedule_redelivery(&self, dispatches: Vec<MessageDispatch>, delay: Duration) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if me.is_closed() {
                return;
            }
            let to_listener = {
                let mut delivery = me.delivery.lock();
                if delivery.listener.is_some() {
                    for d in dispatches.into_iter().rev() {
                        delivery.backlog.push_front(d);
                    }
                    true
                } else {
                    for d in dispatches.into_iter().rev() {
                        if let Err(d) = me.unconsumed.enqueue_first(d) {
                            log::debug!("consumer {} queue closed, redelivery {:?} dropped", me.id(), d.message_id());
                        }
                    }
                    false
                }
            };
            if to_listener {
                me.drain().await;
            }
        });
    }

    #[inline]
    pub(crate) fn in_progress_clear_required(&self) {
        self.clear_required.store(true, Ordering::SeqCst);
    }

    /// Drops what the broker will redeliver after an interruption, then reports
    /// completion for `epoch`.
    pub(crate) fn clear_messages_in_progress(&self, epoch: Epoch) {
        if self.clear_required.swap(false, Ordering::SeqCst) {
            let held = std::mem::take(&mut self.delivery.lock().backlog).len();
            let dropped = self.unconsumed.clear().len() + held;
            let forgotten = {
                let mut delivered = self.delivered.lock();
                let n = delivered.len();
                delivered.clear();
                n
            };
            log::debug!(
                "consumer {} cleared {} queued and {} unacknowledged messages after interruption",
                self.id(),
                dropped,
                forgotten
            );
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.signal_interruption_processing_complete(epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::listener::message_listener_fn;
    use crate::transport::mock::MockTransport;
    use crate::types::{MessageId, ProducerId, SessionId};
    use ramq_conf::PrefetchPolicy;
    use std::sync::atomic::AtomicUsize;

    async fn connected(config: ConnectionConfig) -> (Connection, MockTransport) {
        let transport = MockTransport::new();
        let connection = Connection::connect(Arc::new(transport.clone()), config).await.unwrap();
        (connection, transport)
    }

    fn fast_redelivery(max: i32) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        config.redelivery.maximum_redeliveries = max;
        config.redelivery.initial_redelivery_delay = Duration::from_millis(5);
        config.redelivery.redelivery_delay = Duration::from_millis(5);
        config
    }

    fn message(body: &str, seq: i64) -> Message {
        let producer_id = ProducerId::new(&SessionId::new(&crate::types::ConnectionId::new("broker"), 1), 1);
        let mut m = Message::text(body);
        m.message_id = Some(MessageId { producer_id, producer_sequence_id: seq });
        m
    }

    fn acks(transport: &MockTransport, ack_type: AckType) -> usize {
        transport.count_sent(|c| matches!(c, Command::MessageAck(a) if a.ack_type == ack_type))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_and_auto_ack() {
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("orders")).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("one", 1));
        let m = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(m.body_text(), Some("one"));
        assert!(transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(_)), Duration::from_secs(5)).await);
        assert_eq!(acks(&transport, AckType::Standard), 1);

        assert!(consumer.receive_no_wait().await.unwrap().is_none());
        assert!(consumer.receive_timeout(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_messages_are_not_handed_out() {
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        conn.start().await.unwrap();

        let mut stale = message("stale", 1);
        stale.expiration = 1;
        transport.dispatch(consumer.id(), stale);
        transport.dispatch(consumer.id(), message("fresh", 2));

        let m = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(m.body_text(), Some("fresh"));
        assert_eq!(acks(&transport, AckType::Delivered), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_rejected_while_listener_set() {
        let (conn, _transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        consumer.set_message_listener(Some(message_listener_fn(|_| Ok(())))).await.unwrap();
        assert!(matches!(consumer.receive_no_wait().await, Err(CmsError::IllegalState(_))));
        consumer.set_message_listener(None).await.unwrap();
        assert!(consumer.receive_no_wait().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_prefetch_pulls() {
        let mut config = ConnectionConfig::default();
        config.prefetch = PrefetchPolicy::all(0);
        let (conn, transport) = connected(config).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        conn.start().await.unwrap();

        assert!(consumer.receive_no_wait().await.unwrap().is_none());
        assert_eq!(
            transport.count_sent(|c| matches!(c, Command::MessagePull(p) if p.timeout.is_none())),
            1
        );
        assert!(consumer.set_message_listener(Some(message_listener_fn(|_| Ok(())))).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_messages_go_to_a_new_listener_in_order() {
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        conn.start().await.unwrap();
        for i in 1..=3 {
            transport.dispatch(consumer.id(), message(&format!("m{}", i), i));
        }
        let queued = async {
            while consumer.pending() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), queued).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = seen.clone();
            message_listener_fn(move |m| {
                seen.lock().push(m.body_text().unwrap_or_default().to_string());
                Ok(())
            })
        };
        consumer.set_message_listener(Some(listener)).await.unwrap();
        transport.dispatch(consumer.id(), message("m4", 4));
        assert!(transport.wait_for_sent(4, |c| matches!(c, Command::MessageAck(_)), Duration::from_secs(5)).await);
        assert_eq!(*seen.lock(), vec!["m1", "m2", "m3", "m4"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_listener_is_redelivered_then_poisoned() {
        let (conn, transport) = connected(fast_redelivery(2)).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let listener = {
            let calls = calls.clone();
            message_listener_fn(move |m| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(m.redelivery_counter as usize + 1, calls.load(Ordering::SeqCst));
                Err(anyhow::anyhow!("cannot handle {:?}", m.body_text()))
            })
        };
        consumer.set_message_listener(Some(listener)).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("bad", 1));
        assert!(
            transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Poison), Duration::from_secs(5))
                .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(acks(&transport, AckType::Redelivered), 1);
        assert_eq!(acks(&transport, AckType::Standard), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_listener_is_contained() {
        let (conn, transport) = connected(fast_redelivery(0)).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        let listener = message_listener_fn(|m| {
            if m.body_text() == Some("boom") {
                panic!("boom");
            }
            Ok(())
        });
        consumer.set_message_listener(Some(listener)).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("boom", 1));
        transport.dispatch(consumer.id(), message("fine", 2));
        assert!(
            transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Standard), Duration::from_secs(5))
                .await
        );
        assert_eq!(acks(&transport, AckType::Poison), 1);
    }

    fn inline_acks(config: ConnectionConfig) -> ConnectionConfig {
        let mut config = config.with_always_session_async(false);
        config.send_acks_async = false;
        config
    }

    async fn request_completes(conn: &Connection) -> bool {
        conn.sync_request(Command::KeepAlive, Duration::from_secs(2)).await.is_ok()
    }

    fn recording_listener(seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn MessageListener> {
        let seen = seen.clone();
        message_listener_fn(move |m| {
            seen.lock().push(m.body_text().unwrap_or_default().to_string());
            Ok(())
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inline_listener_acks_leave_the_connection_usable() {
        let (conn, transport) = connected(inline_acks(ConnectionConfig::default())).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        assert!(!session.is_async());
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        consumer.set_message_listener(Some(recording_listener(&seen))).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("one", 1));
        transport.dispatch(consumer.id(), message("two", 2));
        assert!(
            transport.wait_for_sent(2, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Standard), Duration::from_secs(5))
                .await
        );
        assert!(request_completes(&conn).await);
        assert_eq!(*seen.lock(), vec!["one", "two"]);
        let waited = transport
            .sent_frames()
            .into_iter()
            .filter(|f| matches!(f.command, Command::MessageAck(_)) && f.response_required)
            .count();
        assert_eq!(waited, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inline_poison_leaves_the_connection_usable() {
        let (conn, transport) = connected(inline_acks(fast_redelivery(0))).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        consumer.set_message_listener(Some(message_listener_fn(|_| Err(anyhow::anyhow!("rejected"))))).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("bad", 1));
        assert!(
            transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Poison), Duration::from_secs(5))
                .await
        );
        assert!(request_completes(&conn).await);
        assert_eq!(acks(&transport, AckType::Standard), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inline_redelivery_delay_does_not_block_receiving() {
        let mut config = inline_acks(ConnectionConfig::default());
        config.redelivery.maximum_redeliveries = 3;
        config.redelivery.initial_redelivery_delay = Duration::from_millis(400);
        let (conn, transport) = connected(config).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = seen.clone();
            message_listener_fn(move |m| {
                let body = m.body_text().unwrap_or_default().to_string();
                let first_try = m.redelivery_counter == 0;
                seen.lock().push(body.clone());
                if body == "flaky" && first_try {
                    return Err(anyhow::anyhow!("try again"));
                }
                Ok(())
            })
        };
        consumer.set_message_listener(Some(listener)).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("flaky", 1));
        transport.dispatch(consumer.id(), message("next", 2));
        let started = Instant::now();
        let answered = conn.sync_request(Command::KeepAlive, Duration::from_millis(200)).await;
        assert!(answered.is_ok());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(*seen.lock(), vec!["flaky"]);

        assert!(
            transport.wait_for_sent(2, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Standard), Duration::from_secs(5))
                .await
        );
        assert_eq!(*seen.lock(), vec!["flaky", "flaky", "next"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redelivery_delay_does_not_hold_up_other_consumers() {
        let mut config = ConnectionConfig::default();
        config.redelivery.maximum_redeliveries = 1;
        config.redelivery.initial_redelivery_delay = Duration::from_millis(500);
        let (conn, transport) = connected(config).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        assert!(session.is_async());
        let bad = session.create_consumer(&Destination::queue("bad")).await.unwrap();
        let good = session.create_consumer(&Destination::queue("good")).await.unwrap();
        bad.set_message_listener(Some(message_listener_fn(|_| Err(anyhow::anyhow!("rejected"))))).await.unwrap();
        let delivered_at = Arc::new(Mutex::new(None));
        let listener = {
            let delivered_at = delivered_at.clone();
            message_listener_fn(move |_| {
                *delivered_at.lock() = Some(Instant::now());
                Ok(())
            })
        };
        good.set_message_listener(Some(listener)).await.unwrap();
        conn.start().await.unwrap();

        let started = Instant::now();
        transport.dispatch(bad.id(), message("bad", 1));
        transport.dispatch(good.id(), message("good", 2));
        assert!(
            transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Standard), Duration::from_secs(5))
                .await
        );
        let at = delivered_at.lock().unwrap();
        assert!(at.duration_since(started) < Duration::from_millis(300));
        assert_eq!(acks(&transport, AckType::Poison), 0);

        assert!(
            transport.wait_for_sent(1, |c| matches!(c, Command::MessageAck(a) if a.ack_type == AckType::Poison), Duration::from_secs(5))
                .await
        );
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listener_installed_mid_stream_sees_every_message_in_order() {
        const COUNT: i64 = 200;
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        conn.start().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let install = {
            let consumer = consumer.clone();
            let listener = recording_listener(&seen);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                consumer.set_message_listener(Some(listener)).await
            })
        };
        for i in 1..=COUNT {
            transport.dispatch(consumer.id(), message(&format!("m{}", i), i));
            if i % 20 == 0 {
                tokio::task::yield_now().await;
            }
        }
        install.await.unwrap().unwrap();

        let all = async {
            while seen.lock().len() < COUNT as usize {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all).await.unwrap();
        let expected: Vec<String> = (1..=COUNT).map(|i| format!("m{}", i)).collect();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(consumer.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_the_listener_hands_held_messages_to_receive() {
        let mut config = ConnectionConfig::default();
        config.redelivery.maximum_redeliveries = 5;
        config.redelivery.initial_redelivery_delay = Duration::from_secs(1);
        let (conn, transport) = connected(config).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        consumer.set_message_listener(Some(message_listener_fn(|_| Err(anyhow::anyhow!("rejected"))))).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("held", 1));
        transport.dispatch(consumer.id(), message("behind", 2));
        let failed = async {
            while conn.stats().dispatched.count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), failed).await.unwrap();
        consumer.set_message_listener(None).await.unwrap();

        let first = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.body_text(), Some("held"));
        assert_eq!(first.redelivery_counter, 1);
        let second = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(second.body_text(), Some("behind"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn individual_ack_and_client_ack() {
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let individual = conn.create_session(AckMode::Individual).await.unwrap();
        let c1 = individual.create_consumer(&Destination::queue("a")).await.unwrap();
        let client = conn.create_session(AckMode::Client).await.unwrap();
        let c2 = client.create_consumer(&Destination::queue("b")).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(c1.id(), message("a1", 1));
        transport.dispatch(c1.id(), message("a2", 2));
        let a1 = c1.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        let _a2 = c1.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(c1.delivered_count(), 2);
        c1.acknowledge_message(&a1).await.unwrap();
        assert_eq!(c1.delivered_count(), 1);
        assert_eq!(acks(&transport, AckType::Individual), 1);

        transport.dispatch(c2.id(), message("b1", 3));
        transport.dispatch(c2.id(), message("b2", 4));
        let _ = c2.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        let b2 = c2.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(acks(&transport, AckType::Standard), 0);
        c2.acknowledge_message(&b2).await.unwrap();
        let standard: Vec<_> = transport
            .sent_commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::MessageAck(a) if a.ack_type == AckType::Standard => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(standard.len(), 1);
        assert_eq!(standard[0].message_count, 2);
        assert_eq!(c2.delivered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recover_redelivers_unacknowledged() {
        let mut config = fast_redelivery(5);
        config.redelivery.initial_redelivery_delay = Duration::ZERO;
        let (conn, transport) = connected(config).await;
        let session = conn.create_session(AckMode::Client).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        conn.start().await.unwrap();

        transport.dispatch(consumer.id(), message("x", 1));
        let first = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.redelivery_counter, 0);
        session.recover().await.unwrap();
        let again = consumer.receive_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(again.body_text(), Some("x"));
        assert_eq!(again.redelivery_counter, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_unregisters_and_is_idempotent() {
        let (conn, transport) = connected(ConnectionConfig::default()).await;
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let consumer = session.create_consumer(&Destination::queue("q")).await.unwrap();
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
        assert!(consumer.is_closed());
        assert_eq!(transport.count_sent(|c| matches!(c, Command::RemoveInfo(_))), 1);
        assert!(matches!(consumer.receive_no_wait().await, Err(CmsError::IllegalState(_))));
        assert_eq!(session.consumers().len(), 0);
    }
}
