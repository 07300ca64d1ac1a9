use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::types::{
    Command, ConnectionInfo, ConsumerInfo, DataStructureId, ProducerInfo, SessionInfo,
};

#[derive(Default)]
struct SessionState {
    info: Option<SessionInfo>,
    producers: BTreeMap<i64, ProducerInfo>,
    consumers: BTreeMap<i64, ConsumerInfo>,
}

#[derive(Default)]
struct TrackedState {
    connection: Option<ConnectionInfo>,
    sessions: BTreeMap<i64, SessionState>,
}

/// Remembers the registrations the broker holds for this connection so they can be
/// replayed after the transport resumes.
#[derive(Default)]
pub struct ConnectionStateTracker {
    state: Mutex<TrackedState>,
}

impl ConnectionStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `command` changes what the broker holds for this connection.
    #[inline]
    pub fn tracks(command: &Command) -> bool {
        matches!(
            command,
            Command::ConnectionInfo(_)
                | Command::SessionInfo(_)
                | Command::ConsumerInfo(_)
                | Command::ProducerInfo(_)
                | Command::RemoveInfo(_)
        )
    }

    pub fn track(&self, command: &Command) {
        let mut state = self.state.lock();
        match command {
            Command::ConnectionInfo(info) => {
                state.connection = Some(info.clone());
            }
            Command::SessionInfo(info) => {
                state.sessions.entry(info.session_id.value).or_default().info = Some(info.clone());
            }
            Command::ConsumerInfo(info) => {
                state
                    .sessions
                    .entry(info.consumer_id.session_id)
                    .or_default()
                    .consumers
                    .insert(info.consumer_id.value, info.clone());
            }
            Command::ProducerInfo(info) => {
                state
                    .sessions
                    .entry(info.producer_id.session_id)
                    .or_default()
                    .producers
                    .insert(info.producer_id.value, info.clone());
            }
            Command::RemoveInfo(remove) => match &remove.object_id {
                DataStructureId::Connection(_) => {
                    *state = TrackedState::default();
                }
                DataStructureId::Session(id) => {
                    state.sessions.remove(&id.value);
                }
                DataStructureId::Consumer(id) => {
                    if let Some(s) = state.sessions.get_mut(&id.session_id) {
                        s.consumers.remove(&id.value);
                    }
                }
                DataStructureId::Producer(id) => {
                    if let Some(s) = state.sessions.get_mut(&id.session_id) {
                        s.producers.remove(&id.value);
                    }
                }
            },
            _ => {}
        }
    }

    /// Registrations in replay order: connection, then per session its info,
    /// producers and consumers.
    pub fn restore_commands(&self) -> Vec<Command> {
        let state = self.state.lock();
        let mut commands = Vec::new();
        let connection = match state.connection.as_ref() {
            Some(c) => c,
            None => return commands,
        };
        commands.push(Command::ConnectionInfo(connection.clone()));
        for session in state.sessions.values() {
            if let Some(info) = session.info.as_ref() {
                commands.push(Command::SessionInfo(info.clone()));
            }
            commands.extend(session.producers.values().cloned().map(Command::ProducerInfo));
            commands.extend(session.consumers.values().cloned().map(Command::ConsumerInfo));
        }
        commands
    }

    #[inline]
    pub fn clear(&self) {
        *self.state.lock() = TrackedState::default();
    }
}
