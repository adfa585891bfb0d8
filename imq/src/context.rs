use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::persist::{client_keys, NonePersist, PersistHandle};
use crate::registry::Registry;
use crate::router::Router;
use crate::session::{Session, SessionStore};
use crate::types::{ProtocolVersion, Publish};

/// Broker wide state shared by every listener and connection.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub registry: Registry,
    pub sessions: SessionStore,
    pub router: Router,
    /// QoS 2 publishes received from clients, waiting for PUBREL.
    pub inbound: PersistHandle,
    /// QoS 1/2 deliveries to clients, waiting for their acknowledgments.
    pub outbound: PersistHandle,
    /// Preferred protocol version.
    pub version: ProtocolVersion,
    /// Accept clients of either protocol version.
    pub compatible: bool,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    /// Whether a client speaking `version` may connect.
    #[inline]
    pub fn version_allowed(&self, version: ProtocolVersion) -> bool {
        self.compatible || self.version == version
    }

    /// Fans `publish` out to the online subscribers of its topic.
    ///
    /// Each subscriber gets a copy downgraded to its granted QoS. Returns how many
    /// connections accepted the message.
    pub async fn publish(&self, from: &str, publish: &Publish) -> usize {
        let mut delivered = 0;
        for (client_id, granted) in self.router.matches(from, &publish.topic) {
            let Some(handle) = self.registry.get(&client_id) else {
                log::debug!("{client_id} is offline, message on {:?} skipped", publish.topic);
                continue;
            };
            let mut p = publish.clone();
            p.qos = publish.qos.less_value(granted);
            p.dup = false;
            p.retain = false;
            p.packet_id = None;
            if let Some(props) = p.properties.as_mut() {
                props.topic_alias = None;
            }
            if handle.deliver(p).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Releases everything a discarded session still holds.
    pub async fn clear_session(&self, session: &Session) {
        for (filter, _) in session.subscriptions() {
            self.router.remove(&filter, &session.client_id);
        }
        self.clear_pending(&session.client_id).await;
    }

    /// Deletes the client's pending records from both stores.
    pub async fn clear_pending(&self, client_id: &str) {
        for store in [&self.inbound, &self.outbound] {
            let keys = match client_keys(store.as_ref(), client_id).await {
                Ok(keys) => keys,
                Err(e) => {
                    log::warn!("{client_id} listing {} records failed, {e}", store.name());
                    continue;
                }
            };
            for key in keys {
                if let Err(e) = store.delete(&key).await {
                    log::warn!("{client_id} deleting {} record {key} failed, {e}", store.name());
                }
            }
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("connections", &self.registry.len())
            .field("sessions", &self.sessions.len())
            .field("inbound", &self.inbound.name())
            .field("outbound", &self.outbound.name())
            .field("version", &self.version)
            .field("compatible", &self.compatible)
            .finish()
    }
}

pub struct ServerContextBuilder {
    inbound: Option<PersistHandle>,
    outbound: Option<PersistHandle>,
    version: ProtocolVersion,
    compatible: bool,
}

impl Default for ServerContextBuilder {
    fn default() -> Self {
        Self { inbound: None, outbound: None, version: ProtocolVersion::MQTT5, compatible: true }
    }
}

impl ServerContextBuilder {
    pub fn inbound(mut self, inbound: PersistHandle) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn outbound(mut self, outbound: PersistHandle) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn compatible(mut self, compatible: bool) -> Self {
        self.compatible = compatible;
        self
    }

    /// Stores that were not set keep nothing.
    pub fn build(self) -> ServerContext {
        ServerContext {
            inner: Arc::new(ServerContextInner {
                registry: Registry::new(),
                sessions: SessionStore::new(),
                router: Router::new(),
                inbound: self.inbound.unwrap_or_else(|| Arc::new(NonePersist)),
                outbound: self.outbound.unwrap_or_else(|| Arc::new(NonePersist)),
                version: self.version,
                compatible: self.compatible,
            }),
        }
    }
}
