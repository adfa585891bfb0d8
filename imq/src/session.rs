use std::num::NonZeroU16;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};

use imq_utils::{timestamp_millis, TimestampMillis};

use crate::types::{ClientId, ProtocolVersion, QoS, TopicFilter};

/// Parameters a client negotiates on every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub version: ProtocolVersion,
    pub keep_alive: u16,
    pub clean_start: bool,
}

/// One logical client, kept across its connections unless it asked for a clean session.
pub struct Session {
    pub client_id: ClientId,
    pub created_at: TimestampMillis,
    params: RwLock<SessionParams>,
    subscriptions: DashMap<TopicFilter, QoS>,
    //outbound packet ids still waiting for an acknowledgment
    inflight: DashSet<NonZeroU16>,
    last_packet_id: Mutex<u16>,
}

impl Session {
    pub fn new(client_id: ClientId, params: SessionParams) -> Self {
        Self {
            client_id,
            created_at: timestamp_millis(),
            params: RwLock::new(params),
            subscriptions: DashMap::default(),
            inflight: DashSet::default(),
            last_packet_id: Mutex::new(0),
        }
    }

    #[inline]
    pub fn params(&self) -> SessionParams {
        *self.params.read()
    }

    #[inline]
    pub(crate) fn set_params(&self, params: SessionParams) {
        *self.params.write() = params;
    }

    #[inline]
    pub fn subscribe(&self, filter: TopicFilter, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    #[inline]
    pub fn unsubscribe(&self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<(TopicFilter, QoS)> {
        self.subscriptions.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    /// Allocates the next free outbound packet id and marks it in flight.
    ///
    /// Returns `None` when all 65535 ids are pending.
    pub fn next_packet_id(&self) -> Option<NonZeroU16> {
        let mut last = self.last_packet_id.lock();
        for _ in 0..u16::MAX {
            *last = last.wrapping_add(1);
            if let Some(id) = NonZeroU16::new(*last) {
                if self.inflight.insert(id) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Forgets every in-flight id before the pending ones are restored from the store.
    #[inline]
    pub(crate) fn reset_inflight(&self) {
        self.inflight.clear();
    }

    /// Marks an id restored from the store as in flight.
    #[inline]
    pub fn mark_inflight(&self, packet_id: NonZeroU16) {
        self.inflight.insert(packet_id);
    }

    #[inline]
    pub fn is_inflight(&self, packet_id: NonZeroU16) -> bool {
        self.inflight.contains(&packet_id)
    }

    /// Frees an acknowledged id, returns whether it was in flight.
    #[inline]
    pub fn release_packet_id(&self, packet_id: NonZeroU16) -> bool {
        self.inflight.remove(&packet_id).is_some()
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("params", &self.params())
            .field("subscriptions", &self.subscriptions.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Outcome of opening a session during a handshake.
pub struct OpenedSession {
    pub session: Arc<Session>,
    /// A prior session was resumed, reported as `session_present` in CONNACK.
    pub present: bool,
    /// A prior session that a clean start replaced; its state must be released.
    pub discarded: Option<Arc<Session>>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<ClientId, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes the client's session or creates a new one.
    ///
    /// A clean start always creates a new session, discarding any prior one.
    pub fn open(&self, client_id: &ClientId, params: SessionParams) -> OpenedSession {
        if params.clean_start {
            let session = Arc::new(Session::new(client_id.clone(), params));
            let discarded = self.sessions.insert(client_id.clone(), session.clone());
            return OpenedSession { session, present: false, discarded };
        }

        let mut present = true;
        let session = self
            .sessions
            .entry(client_id.clone())
            .or_insert_with(|| {
                present = false;
                Arc::new(Session::new(client_id.clone(), params))
            })
            .value()
            .clone();
        if present {
            session.set_params(params);
        }
        OpenedSession { session, present, discarded: None }
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    /// Removes the client's session only if it is still `session`.
    #[inline]
    pub fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        self.sessions.remove_if(&session.client_id, |_, s| Arc::ptr_eq(s, session)).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
