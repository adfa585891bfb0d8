//! Client identifier to live connection map, shared by every listener.
//!
//! At most one connection is registered per client identifier. Registering a new
//! connection evicts the previous one, which is drained with `SessionTakenOver`.
//! A connection removes itself on close only while it is still the registered one,
//! so a stale cleanup never evicts its successor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{AtomicConnState, ClientId, ConnState, ConnectionId, Publish, QoS, Reason};

#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ConnectionId,
    client_id: ClientId,
    remote_addr: SocketAddr,
    state: AtomicConnState,
    reason: Mutex<Option<Reason>>,
    cancel: CancellationToken,
    deliver_tx: mpsc::Sender<Publish>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        client_id: ClientId,
        remote_addr: SocketAddr,
        deliver_tx: mpsc::Sender<Publish>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                client_id,
                remote_addr,
                state: AtomicConnState::default(),
                reason: Mutex::new(None),
                cancel: CancellationToken::new(),
                deliver_tx,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.inner.state.get()
    }

    /// The reason recorded when the connection started draining.
    #[inline]
    pub fn reason(&self) -> Option<Reason> {
        *self.inner.reason.lock()
    }

    /// Starts draining with `reason`, only the first call records a reason.
    ///
    /// Cancels the connection scope, which stops both the receive and the send loop.
    pub fn drain(&self, reason: Reason) -> bool {
        {
            let mut r = self.inner.reason.lock();
            if r.is_some() {
                return false;
            }
            *r = Some(reason);
        }
        self.inner.state.advance(ConnState::Draining);
        self.inner.cancel.cancel();
        true
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ConnState) -> bool {
        self.inner.state.advance(state)
    }

    #[inline]
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Queues a publish on the connection's deliver channel.
    ///
    /// QoS 0 messages are dropped when the channel is full, others wait for room
    /// unless the connection goes away first.
    pub(crate) async fn deliver(&self, publish: Publish) -> bool {
        if publish.qos == QoS::AtMostOnce {
            return match self.inner.deliver_tx.try_send(publish) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(p)) => {
                    log::warn!("{} deliver queue is full, QoS0 message on {:?} dropped", self.client_id(), p.topic);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            };
        }

        tokio::select! {
            res = self.inner.deliver_tx.send(publish) => res.is_ok(),
            _ = self.inner.cancel.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("client_id", self.client_id())
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
pub struct Registry {
    conns: DashMap<ClientId, ConnectionHandle>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers `handle` under its client id, draining and returning any previous holder.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let prev = self.conns.insert(handle.client_id().clone(), handle);
        if let Some(prev) = prev.as_ref() {
            log::info!(
                "{} session taken over, evicting connection {} from {}",
                prev.client_id(),
                prev.id(),
                prev.remote_addr()
            );
            prev.drain(Reason::SessionTakenOver);
        }
        prev
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.conns.get(client_id).map(|h| h.value().clone())
    }

    #[inline]
    pub fn contains(&self, client_id: &str) -> bool {
        self.conns.contains_key(client_id)
    }

    /// Removes the entry only if it still belongs to connection `id`.
    #[inline]
    pub fn remove_if_current(&self, client_id: &str, id: ConnectionId) -> bool {
        self.conns.remove_if(client_id, |_, h| h.id() == id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.conns.iter().map(|e| e.value().clone()).collect()
    }

    /// Drains every registered connection with `reason`, returns how many were asked to stop.
    pub fn drain_all(&self, reason: Reason) -> usize {
        self.handles().into_iter().filter(|h| h.drain(reason)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(reg: &Registry, client_id: &str) -> (ConnectionHandle, mpsc::Receiver<Publish>) {
        let (tx, rx) = mpsc::channel(2);
        (ConnectionHandle::new(reg.next_id(), client_id.into(), ([127, 0, 0, 1], 1883).into(), tx), rx)
    }

    #[test]
    fn test_register_evicts_previous() {
        let reg = Registry::new();
        let (h1, _rx1) = handle(&reg, "c1");
        let (h2, _rx2) = handle(&reg, "c1");
        assert!(reg.register(h1.clone()).is_none());
        let prev = reg.register(h2.clone()).unwrap();
        assert_eq!(prev.id(), h1.id());
        assert_eq!(h1.reason(), Some(Reason::SessionTakenOver));
        assert_eq!(h1.state(), ConnState::Draining);
        assert!(h1.cancel_token().is_cancelled());
        assert!(!h2.is_draining());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("c1").unwrap().id(), h2.id());
    }

    #[test]
    fn test_stale_cleanup_keeps_successor() {
        let reg = Registry::new();
        let (h1, _rx1) = handle(&reg, "c1");
        let (h2, _rx2) = handle(&reg, "c1");
        reg.register(h1.clone());
        reg.register(h2.clone());
        assert!(!reg.remove_if_current("c1", h1.id()));
        assert!(reg.contains("c1"));
        assert!(reg.remove_if_current("c1", h2.id()));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_first_reason_wins() {
        let reg = Registry::new();
        let (h, _rx) = handle(&reg, "c1");
        assert!(h.drain(Reason::KeepAliveTimeout));
        assert!(!h.drain(Reason::ServerShuttingDown));
        assert_eq!(h.reason(), Some(Reason::KeepAliveTimeout));
    }

    #[tokio::test]
    async fn test_deliver_qos0_drops_when_full() {
        let reg = Registry::new();
        let (h, mut rx) = handle(&reg, "c1");
        let p = Publish {
            dup: false,
            retain: false,
            qos: QoS::AtMostOnce,
            topic: "t".into(),
            packet_id: None,
            payload: bytes::Bytes::from_static(b"x"),
            properties: None,
            delay_interval: None,
            create_time: None,
        };
        assert!(h.deliver(p.clone()).await);
        assert!(h.deliver(p.clone()).await);
        assert!(!h.deliver(p.clone()).await);
        assert!(rx.recv().await.is_some());

        //QoS1 waits, and gives up once the connection drains
        let mut p1 = p.clone();
        p1.qos = QoS::AtLeastOnce;
        assert!(h.deliver(p1.clone()).await);
        let h2 = h.clone();
        let waiter = tokio::spawn(async move { h2.deliver(p1).await });
        tokio::task::yield_now().await;
        h.drain(Reason::NormalDisconnection);
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_drain_all() {
        let reg = Registry::new();
        let (h1, _rx1) = handle(&reg, "c1");
        let (h2, _rx2) = handle(&reg, "c2");
        reg.register(h1.clone());
        reg.register(h2.clone());
        assert_eq!(reg.drain_all(Reason::ServerShuttingDown), 2);
        assert_eq!(h2.reason(), Some(Reason::ServerShuttingDown));
    }
}
