use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection;
use crate::context::ServerContext;
use crate::net::{Listener, ListenerType, Result};
use crate::types::Reason;

pub struct SupervisorBuilder {
    scx: ServerContext,
    listeners: Vec<Listener>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl SupervisorBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::default(), shutdown: CancellationToken::new(), grace: Duration::from_secs(10) }
    }

    pub fn listener(mut self, listen: Listener) -> Self {
        self.listeners.push(listen);
        self
    }

    /// Token whose cancellation stops every accept loop.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// How long WebSocket upgrades in progress may take once shutdown starts.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn build(self) -> Supervisor {
        Supervisor {
            inner: Arc::new(SupervisorInner {
                scx: self.scx,
                listeners: Mutex::new(self.listeners),
                shutdown: self.shutdown,
                grace: self.grace,
            }),
        }
    }
}

/// Runs the accept loops of the configured listeners.
///
/// Shutdown stops new connections only; established connections keep running until they
/// end on their own or [`Supervisor::shutdown_connections`] is called.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

pub struct SupervisorInner {
    pub scx: ServerContext,
    listeners: Mutex<Vec<Listener>>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl Deref for Supervisor {
    type Target = SupervisorInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Supervisor {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> SupervisorBuilder {
        SupervisorBuilder::new(scx)
    }

    /// Stops accepting on every listener.
    #[inline]
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drains every live connection with `ServerShuttingDown`, returns how many were asked to stop.
    pub fn shutdown_connections(&self) -> usize {
        let n = self.scx.registry.drain_all(Reason::ServerShuttingDown);
        log::info!("{n} connections asked to shut down");
        n
    }

    /// Serves until shutdown, then returns once every accept loop has finished.
    pub async fn run(&self) -> Result<()> {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        if listeners.is_empty() {
            return Err(anyhow::anyhow!("no listener to run"));
        }

        futures::future::join_all(
            listeners.into_iter().map(|l| listen(self.scx.clone(), l, self.shutdown.clone(), self.grace)),
        )
        .await;
        log::info!("all listeners stopped");
        Ok(())
    }
}

async fn listen(scx: ServerContext, l: Listener, shutdown: CancellationToken, grace: Duration) {
    let typ = l.typ.as_str();
    let limit = (l.cfg.max_connections > 0).then(|| Arc::new(Semaphore::new(l.cfg.max_connections)));
    let upgrades = TaskTracker::new();

    loop {
        let accept = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = l.accept() => match res {
                Ok(accept) => accept,
                Err(e) => {
                    log::info!("{typ} listener error: {e:?}");
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    continue;
                }
            },
        };

        let permit = match limit.as_ref().map(|sem| sem.clone().try_acquire_owned()) {
            None => None,
            Some(Ok(permit)) => Some(permit),
            Some(Err(_)) => {
                log::warn!(
                    "{typ} connection from {} refused, limit of {} reached",
                    accept.remote_addr,
                    l.cfg.max_connections
                );
                continue;
            }
        };

        let scx = scx.clone();
        log::debug!("{typ} connection from {}", accept.remote_addr);
        match l.typ {
            ListenerType::TCP => {
                tokio::spawn(async move {
                    let _permit = permit;
                    match accept.tcp() {
                        Ok(d) => connection::serve(scx, d).await,
                        Err(e) => log::warn!("TCP accept error: {e:?}"),
                    }
                });
            }
            #[cfg(feature = "tls")]
            ListenerType::TLS => {
                tokio::spawn(async move {
                    let _permit = permit;
                    match accept.tls().await {
                        Ok(d) => connection::serve(scx, d).await,
                        Err(e) => log::warn!("TLS accept error: {e:?}"),
                    }
                });
            }
            #[cfg(feature = "ws")]
            ListenerType::WS => {
                upgrades.spawn(async move {
                    match accept.ws().await {
                        Ok(d) => {
                            tokio::spawn(async move {
                                let _permit = permit;
                                connection::serve(scx, d).await
                            });
                        }
                        Err(e) => log::warn!("WebSocket accept error: {e:?}"),
                    }
                });
            }
            #[cfg(feature = "tls")]
            #[cfg(feature = "ws")]
            ListenerType::WSS => {
                upgrades.spawn(async move {
                    match accept.wss().await {
                        Ok(d) => {
                            tokio::spawn(async move {
                                let _permit = permit;
                                connection::serve(scx, d).await
                            });
                        }
                        Err(e) => log::warn!("WSS accept error: {e:?}"),
                    }
                });
            }
        }
    }

    let local_addr = l.local_addr;
    drop(l);
    upgrades.close();
    if tokio::time::timeout(grace, upgrades.wait()).await.is_err() {
        log::warn!("{typ} listener on {local_addr}, {} upgrades still running after {grace:?}", upgrades.len());
    }
    log::info!("{typ} listener on {local_addr} stopped");
}
