use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::message::Message;

pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Correlates an outbound frame with the broker's response.
pub type CommandId = u32;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    pub value: ByteString,
}

impl ConnectionId {
    #[inline]
    pub fn new<V: Into<ByteString>>(value: V) -> Self {
        Self { value: value.into() }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: ByteString,
    pub value: i64,
}

impl SessionId {
    #[inline]
    pub fn new(connection_id: &ConnectionId, value: i64) -> Self {
        Self { connection_id: connection_id.value.clone(), value }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub connection_id: ByteString,
    pub session_id: i64,
    pub value: i64,
}

impl ConsumerId {
    #[inline]
    pub fn new(session_id: &SessionId, value: i64) -> Self {
        Self { connection_id: session_id.connection_id.clone(), session_id: session_id.value, value }
    }

    #[inline]
    pub fn parent(&self) -> SessionId {
        SessionId { connection_id: self.connection_id.clone(), value: self.session_id }
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub connection_id: ByteString,
    pub session_id: i64,
    pub value: i64,
}

impl ProducerId {
    #[inline]
    pub fn new(session_id: &SessionId, value: i64) -> Self {
        Self { connection_id: session_id.connection_id.clone(), session_id: session_id.value, value }
    }

    #[inline]
    pub fn parent(&self) -> SessionId {
        SessionId { connection_id: self.connection_id.clone(), value: self.session_id }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub producer_id: ProducerId,
    pub producer_sequence_id: i64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub connection_id: ByteString,
    pub value: i64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Queue(ByteString),
    Topic(ByteString),
    TempQueue(ByteString),
    TempTopic(ByteString),
}

impl Destination {
    #[inline]
    pub fn queue<N: Into<ByteString>>(name: N) -> Self {
        Destination::Queue(name.into())
    }

    #[inline]
    pub fn topic<N: Into<ByteString>>(name: N) -> Self {
        Destination::Topic(name.into())
    }

    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(n) | Destination::Topic(n) | Destination::TempQueue(n) | Destination::TempTopic(n) => n,
        }
    }

    #[inline]
    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_) | Destination::TempTopic(_))
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        matches!(self, Destination::TempQueue(_) | Destination::TempTopic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(n) => write!(f, "queue://{}", n),
            Destination::Topic(n) => write!(f, "topic://{}", n),
            Destination::TempQueue(n) => write!(f, "temp-queue://{}", n),
            Destination::TempTopic(n) => write!(f, "temp-topic://{}", n),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckMode {
    Auto,
    Client,
    Transacted,
    Individual,
}

impl AckMode {
    #[inline]
    pub fn is_transacted(&self) -> bool {
        matches!(self, AckMode::Transacted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckType {
    /// Received, not consumed.
    Delivered = 0,
    Poison = 1,
    Standard = 2,
    Redelivered = 3,
    Individual = 4,
    Unmatched = 5,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: ByteString,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub ack_mode: AckMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
    pub prefetch_size: i32,
    pub maximum_pending_message_limit: i32,
    pub dispatch_async: bool,
    pub no_local: bool,
    pub browser: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Option<Destination>,
    pub window_size: usize,
    pub dispatch_async: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStructureId {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub object_id: DataStructureId,
    pub last_delivered_sequence_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    pub message: Option<Message>,
    pub redelivery_counter: i32,
}

impl MessageDispatch {
    #[inline]
    pub fn new(consumer_id: ConsumerId, message: Message) -> Self {
        let destination = message.destination.clone();
        let redelivery_counter = message.redelivery_counter;
        Self { consumer_id, destination, message: Some(message), redelivery_counter }
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.message.as_ref().map(|m| m.priority).unwrap_or(Message::DEFAULT_PRIORITY)
    }

    #[inline]
    pub fn message_id(&self) -> Option<&MessageId> {
        self.message.as_ref().and_then(|m| m.message_id.as_ref())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageAck {
    pub ack_type: AckType,
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: i32,
    pub transaction_id: Option<TransactionId>,
    pub poison_cause: Option<BrokerError>,
}

impl MessageAck {
    /// Ack covering exactly one dispatched message.
    pub fn for_dispatch(dispatch: &MessageDispatch, ack_type: AckType) -> Self {
        let id = dispatch.message_id().cloned();
        Self {
            ack_type,
            consumer_id: dispatch.consumer_id.clone(),
            destination: dispatch.destination.clone(),
            first_message_id: id.clone(),
            last_message_id: id,
            message_count: 1,
            transaction_id: None,
            poison_cause: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    /// `None` asks for an immediate answer, zero waits without limit.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationOperation {
    Add,
    Remove,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub connection_id: ConnectionId,
    pub destination: Destination,
    pub operation: DestinationOperation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Begin,
    Commit,
    Rollback,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub connection_id: ConnectionId,
    pub transaction_id: TransactionId,
    pub kind: TransactionType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerError {
    pub exception_class: String,
    pub message: String,
}

impl BrokerError {
    #[inline]
    pub fn new(exception_class: impl Into<String>, message: impl Into<String>) -> Self {
        Self { exception_class: exception_class.into(), message: message.into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResponseBody {
    Empty,
    Exception(BrokerError),
    Data(Bytes),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: CommandId,
    pub body: ResponseBody,
}

impl Response {
    #[inline]
    pub fn ok(correlation_id: CommandId) -> Self {
        Self { correlation_id, body: ResponseBody::Empty }
    }

    #[inline]
    pub fn exception(correlation_id: CommandId, error: BrokerError) -> Self {
        Self { correlation_id, body: ResponseBody::Exception(error) }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        matches!(self.body, ResponseBody::Exception(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub broker_id: String,
    pub broker_name: String,
    pub broker_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerControl {
    pub consumer_id: ConsumerId,
    pub close: bool,
    pub prefetch: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerAck {
    pub producer_id: ProducerId,
    pub size: usize,
}

/// Everything exchanged with the broker. Marshaling is the transport's concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    RemoveInfo(RemoveInfo),
    ShutdownInfo,
    Message(Box<Message>),
    MessageDispatch(MessageDispatch),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    DestinationInfo(DestinationInfo),
    TransactionInfo(TransactionInfo),
    Response(Response),
    BrokerInfo(BrokerInfo),
    ConnectionError(BrokerError),
    ConsumerControl(ConsumerControl),
    ProducerAck(ProducerAck),
    KeepAlive,
}

impl Command {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConnectionInfo(_) => "ConnectionInfo",
            Command::SessionInfo(_) => "SessionInfo",
            Command::ConsumerInfo(_) => "ConsumerInfo",
            Command::ProducerInfo(_) => "ProducerInfo",
            Command::RemoveInfo(_) => "RemoveInfo",
            Command::ShutdownInfo => "ShutdownInfo",
            Command::Message(_) => "Message",
            Command::MessageDispatch(_) => "MessageDispatch",
            Command::MessageAck(_) => "MessageAck",
            Command::MessagePull(_) => "MessagePull",
            Command::DestinationInfo(_) => "DestinationInfo",
            Command::TransactionInfo(_) => "TransactionInfo",
            Command::Response(_) => "Response",
            Command::BrokerInfo(_) => "BrokerInfo",
            Command::ConnectionError(_) => "ConnectionError",
            Command::ConsumerControl(_) => "ConsumerControl",
            Command::ProducerAck(_) => "ProducerAck",
            Command::KeepAlive => "KeepAlive",
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self, Command::Response(_))
    }
}

/// An outbound command as handed to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub command_id: CommandId,
    pub response_required: bool,
    pub command: Command,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_and_parents() {
        let conn = ConnectionId::new("ID:abc:1");
        let sid = SessionId::new(&conn, 2);
        let cid = ConsumerId::new(&sid, 3);
        let pid = ProducerId::new(&sid, 4);
        assert_eq!(sid.to_string(), "ID:abc:1:2");
        assert_eq!(cid.to_string(), "ID:abc:1:2:3");
        assert_eq!(cid.parent(), sid);
        assert_eq!(pid.parent(), sid);
        let mid = MessageId { producer_id: pid, producer_sequence_id: 9 };
        assert_eq!(mid.to_string(), "ID:abc:1:2:4:9");
    }

    #[test]
    fn destinations() {
        let q = Destination::queue("orders");
        let t = Destination::TempTopic("ID:x:1".into());
        assert_eq!(q.to_string(), "queue://orders");
        assert_eq!(q.name(), "orders");
        assert!(!q.is_topic() && !q.is_temporary());
        assert!(t.is_topic() && t.is_temporary());
    }

    #[test]
    fn ack_for_dispatch_covers_one_message() {
        let sid = SessionId::new(&ConnectionId::new("c"), 1);
        let cid = ConsumerId::new(&sid, 1);
        let mut msg = Message::text("hello");
        msg.message_id = Some(MessageId { producer_id: ProducerId::new(&sid, 1), producer_sequence_id: 7 });
        msg.destination = Some(Destination::queue("q"));
        let d = MessageDispatch::new(cid.clone(), msg);
        let ack = MessageAck::for_dispatch(&d, AckType::Delivered);
        assert_eq!(ack.ack_type as u8, 0);
        assert_eq!(ack.consumer_id, cid);
        assert_eq!(ack.message_count, 1);
        assert_eq!(ack.first_message_id, ack.last_message_id);
        assert_eq!(ack.destination, Some(Destination::queue("q")));
    }
}
