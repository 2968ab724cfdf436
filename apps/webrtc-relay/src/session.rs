use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use slab::Slab;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use signaling_proto::{Connection, ConnectionId, Control, SignalingMessage};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Outbound frames buffered per connection before new ones are dropped.
    pub per_connection_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

/// Who is connected to which session.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, Arc<SessionState>>,
    config: SessionConfig,
    next_connection_id: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::Receiver<Message>,
    pub members: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: String,
    pub connections: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub relayed: u64,
    pub dropped: u64,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                config,
                next_connection_id: AtomicU64::new(1),
                relayed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Adds a member and pushes the new roster to everyone, the new member
    /// included, before any of its frames can be relayed.
    pub fn join(&self, session: &str, remote: String, user_agent: String) -> Registration {
        let (tx, rx) = mpsc::channel(self.inner.config.per_connection_buffer);
        let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);

        loop {
            let state = Arc::clone(
                self.inner
                    .sessions
                    .entry(session.to_string())
                    .or_insert_with(|| Arc::new(SessionState::new(session.to_string())))
                    .value(),
            );
            let member = Member {
                info: Connection {
                    id: connection_id,
                    remote: remote.clone(),
                    user_agent: user_agent.clone(),
                    created: OffsetDateTime::now_utc(),
                },
                sender: tx.clone(),
            };
            if let Some(members) = state.add(member) {
                return Registration {
                    connection_id,
                    receiver: rx,
                    members,
                };
            }
            // Emptied by a concurrent leave; replace it with a fresh session.
            self.inner
                .sessions
                .remove_if(session, |_, current| Arc::ptr_eq(current, &state));
        }
    }

    pub fn leave(&self, session: &str, connection_id: ConnectionId) -> usize {
        let Some(state) = self.session(session) else {
            return 0;
        };
        let remaining = state.remove(connection_id);
        if remaining == 0 {
            self.inner
                .sessions
                .remove_if(session, |_, current| Arc::ptr_eq(current, &state));
        }
        remaining
    }

    /// Forwards `message` to every member of `session` except its sender.
    pub fn relay(&self, session: &str, source: ConnectionId, message: Message) -> RelayOutcome {
        let Some(state) = self.session(session) else {
            return RelayOutcome::default();
        };
        let outcome = state.relay(source, message);
        self.inner
            .relayed
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.inner
            .dropped
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        outcome
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session: entry.key().clone(),
                connections: entry.value().len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session.cmp(&b.session));
        sessions
    }

    pub fn totals(&self) -> Totals {
        Totals {
            relayed: self.inner.relayed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    fn session(&self, session: &str) -> Option<Arc<SessionState>> {
        self.inner
            .sessions
            .get(session)
            .map(|entry| Arc::clone(entry.value()))
    }
}

struct Member {
    info: Connection,
    sender: mpsc::Sender<Message>,
}

struct SessionState {
    name: String,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    members: Slab<Member>,
    index: HashMap<ConnectionId, usize>,
    retired: bool,
}

impl SessionState {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(SessionInner {
                members: Slab::new(),
                index: HashMap::new(),
                retired: false,
            }),
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    fn add(&self, member: Member) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return None;
        }
        let id = member.info.id;
        let key = inner.members.insert(member);
        inner.index.insert(id, key);
        self.announce(&mut inner);
        Some(inner.members.len())
    }

    fn remove(&self, connection_id: ConnectionId) -> usize {
        let mut inner = self.inner.lock();
        if let Some(key) = inner.index.remove(&connection_id) {
            inner.members.remove(key);
            self.announce(&mut inner);
        }
        if inner.members.is_empty() {
            inner.retired = true;
        }
        inner.members.len()
    }

    /// Members whose receiver is gone are left for [`SessionRegistry::leave`]
    /// so the remaining members still get a roster update.
    fn relay(&self, source: ConnectionId, message: Message) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        let inner = self.inner.lock();
        for (_, member) in inner.members.iter() {
            if member.info.id == source {
                continue;
            }
            match member.sender.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    warn!(
                        session = %self.name,
                        connection_id = member.info.id,
                        "outbound buffer full; dropping frame"
                    );
                }
                Err(TrySendError::Closed(_)) => outcome.closed += 1,
            }
        }
        outcome
    }

    /// Sends every member the roster as seen from its own connection id.
    fn announce(&self, inner: &mut SessionInner) {
        let roster: Vec<Connection> = inner
            .members
            .iter()
            .map(|(_, member)| member.info.clone())
            .collect();
        for (_, member) in inner.members.iter() {
            let control = SignalingMessage::Control(Control {
                connection_id: member.info.id,
                connections: roster.clone(),
            });
            let text = match control.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode control message");
                    continue;
                }
            };
            if member.sender.try_send(Message::Text(text)).is_err() {
                debug!(session = %self.name, connection_id = member.info.id, "could not queue roster update");
            }
        }
    }
}
