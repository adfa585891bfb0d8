//! Per client connection state machine.
//!
//! ```text
//! Handshaking -> Established -> Draining -> Closed
//! ```
//!
//! [`serve`] reads the CONNECT, registers the connection and then runs two loops: the
//! receive loop on the calling task and the send loop on a spawned one. The send loop owns
//! the write half of the transport, every outgoing packet goes through it. Draining is
//! triggered by cancelling the connection's token, whoever notices the terminal event
//! first records the reason.

use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::v5::ToReasonCode;
use crate::codec::MqttPacket;
use crate::context::ServerContext;
use crate::net::{Connect, Dispatcher, MqttError, MqttSink, MqttSource, MqttStream};
use crate::packet::{self, Inbound};
use crate::persist::{delivery_key, packet_id_of, PendingPacket, StoreOutcome};
use crate::registry::ConnectionHandle;
use crate::router::{is_valid_filter, is_valid_topic, SubOpts};
use crate::session::{Session, SessionParams};
use crate::types::{ClientId, ConnState, ProtocolVersion, Publish, QoS, Reason, TopicFilter};

/// Serves one accepted transport until the connection is closed.
pub async fn serve<Io>(scx: ServerContext, dispatcher: Dispatcher<Io>)
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_addr = dispatcher.remote_addr;
    let mut stream = match dispatcher.mqtt().await {
        Ok(stream) => stream,
        Err(e) => {
            log::debug!("{remote_addr} mqtt handshake failed, {e}");
            return;
        }
    };

    let connect = match stream.recv_connect(stream.cfg.handshake_timeout).await {
        Ok(connect) => connect,
        Err(e) => {
            log::debug!("{remote_addr} invalid CONNECT, {e}");
            let _ = stream.close().await;
            return;
        }
    };

    let version = connect.version();
    if !scx.version_allowed(version) {
        log::info!("{remote_addr} protocol version {version:?} is not accepted");
        refuse(&mut stream, version, MqttError::UnsupportedProtocolVersion).await;
        return;
    }

    let (client_id, assigned) = match client_id_of(&connect) {
        Ok(ids) => ids,
        Err(e) => {
            log::info!("{remote_addr} refused, {e}");
            refuse(&mut stream, version, e).await;
            return;
        }
    };

    let queue_len = stream.cfg.max_mqueue_len.max(1);
    let (deliver_tx, deliver_rx) = mpsc::channel(queue_len);
    let (reply_tx, reply_rx) = mpsc::channel(queue_len);

    let handle = ConnectionHandle::new(scx.registry.next_id(), client_id.clone(), remote_addr, deliver_tx);
    scx.registry.register(handle.clone());

    let params = SessionParams { version, keep_alive: connect.keep_alive(), clean_start: connect.clean_start() };
    let opened = scx.sessions.open(&client_id, params);
    let mut conn = Connection {
        scx,
        handle,
        session: opened.session,
        version,
        reply_tx,
        will: last_will(&connect),
        by_client: Arc::new(AtomicBool::new(false)),
    };

    let redelivery = if params.clean_start {
        match opened.discarded {
            Some(discarded) => conn.scx.clear_session(&discarded).await,
            None => conn.scx.clear_pending(&client_id).await,
        }
        Vec::new()
    } else {
        conn.pending_deliveries().await
    };
    let session_present = opened.present || !redelivery.is_empty();

    if let Err(e) = stream.send(packet::connack(version, session_present, assigned)).await {
        log::debug!("{client_id} sending CONNACK failed, {e}");
        conn.drain(Reason::UnspecifiedError);
        let _ = stream.close().await;
        conn.close(None).await;
        return;
    }
    conn.handle.set_state(ConnState::Established);
    log::info!(
        "{client_id} connected from {remote_addr}, {version:?}, keepalive {}s, session present {session_present}",
        params.keep_alive
    );

    let keepalive = stream.cfg.keepalive_window(params.keep_alive);
    let (sink, mut source) = stream.split();
    let sender = Sender {
        sink,
        scx: conn.scx.clone(),
        handle: conn.handle.clone(),
        session: conn.session.clone(),
        version,
        by_client: conn.by_client.clone(),
    };
    let send_task = tokio::spawn(sender.run(reply_rx, deliver_rx));

    for p in redelivery {
        if conn.reply_tx.send(p).await.is_err() {
            break;
        }
    }

    conn.recv_loop(&mut source, keepalive).await;
    conn.close(Some(send_task)).await;
}

/// Answers a refused handshake with CONNACK and closes the link.
async fn refuse<Io>(stream: &mut MqttStream<Io>, version: ProtocolVersion, err: MqttError)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.send(packet::connack_refused(version, &err)).await {
        log::debug!("{} sending CONNACK failed, {e}", stream.remote_addr);
    }
    let _ = stream.close().await;
}

/// The effective client id, and the id to report back when the broker assigned it.
fn client_id_of(connect: &Connect) -> Result<(ClientId, Option<ClientId>), MqttError> {
    if !connect.client_id().is_empty() {
        return Ok((ClientId::from(connect.client_id()), None));
    }
    match connect {
        Connect::V3(c) if !c.clean_session => Err(MqttError::IdentifierRejected),
        Connect::V3(_) => Ok((ClientId::from(Uuid::new_v4().simple().to_string()), None)),
        Connect::V5(_) => {
            let id = ClientId::from(Uuid::new_v4().simple().to_string());
            Ok((id.clone(), Some(id)))
        }
    }
}

fn last_will(connect: &Connect) -> Option<Publish> {
    let (qos, retain, topic, payload) = match connect {
        Connect::V3(c) => c.last_will.as_ref().map(|w| (w.qos, w.retain, w.topic.clone(), w.message.clone()))?,
        Connect::V5(c) => c.last_will.as_ref().map(|w| (w.qos, w.retain, w.topic.clone(), w.message.clone()))?,
    };
    Some(Publish {
        dup: false,
        retain,
        qos,
        topic,
        packet_id: None,
        payload,
        properties: None,
        delay_interval: None,
        create_time: None,
    })
}

/// Whether the client is told why the server is closing the link.
#[inline]
fn notify_client(reason: Reason) -> bool {
    !matches!(reason, Reason::UnspecifiedError | Reason::NormalDisconnection | Reason::DisconnectWithWillMessage)
}

struct Connection {
    scx: ServerContext,
    handle: ConnectionHandle,
    session: Arc<Session>,
    version: ProtocolVersion,
    reply_tx: mpsc::Sender<MqttPacket>,
    will: Option<Publish>,
    //set when the client ended the connection with DISCONNECT
    by_client: Arc<AtomicBool>,
}

impl Connection {
    #[inline]
    fn client_id(&self) -> &ClientId {
        self.handle.client_id()
    }

    fn drain(&self, reason: Reason) {
        if self.handle.drain(reason) {
            log::info!("{} draining, reason: {reason:?}", self.client_id());
        }
    }

    /// Outbound records left by a previous connection of this client, in packet id order.
    async fn pending_deliveries(&self) -> Vec<MqttPacket> {
        let client_id = self.client_id().clone();
        let mut pending: Vec<(NonZeroU16, PendingPacket)> = Vec::new();
        let res = self
            .scx
            .outbound
            .for_each(&mut |key: &str, p: &PendingPacket| {
                if let Some(packet_id) = packet_id_of(key, &client_id) {
                    pending.push((packet_id, p.clone()));
                }
                true
            })
            .await;
        if let Err(e) = res {
            log::warn!("{client_id} loading pending deliveries failed, {e}");
        }

        pending.sort_by_key(|(packet_id, _)| *packet_id);
        self.session.reset_inflight();
        log::debug!("{client_id} redelivering {} pending packets", pending.len());
        pending
            .into_iter()
            .map(|(packet_id, p)| {
                self.session.mark_inflight(packet_id);
                match p {
                    PendingPacket::Publish(mut p) => {
                        p.dup = true;
                        p.packet_id = Some(packet_id);
                        packet::publish(self.version, *p)
                    }
                    PendingPacket::Release(_) => packet::pubrel(self.version, packet_id),
                }
            })
            .collect()
    }

    async fn recv_loop<Io>(&mut self, source: &mut MqttSource<Io>, keepalive: Option<Duration>)
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.handle.cancel_token().clone();
        let window = keepalive.unwrap_or_default();
        let expiry = tokio::time::sleep(window);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut expiry, if keepalive.is_some() => {
                    log::debug!("{} no packet within {:?}", self.client_id(), window);
                    self.drain(Reason::KeepAliveTimeout);
                    break;
                }
                item = source.next() => match item {
                    Some(Ok(packet)) => {
                        if keepalive.is_some() {
                            expiry.as_mut().reset(Instant::now() + window);
                        }
                        if let Err(reason) = self.handle_packet(Inbound::from(packet)).await {
                            self.drain(reason);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("{} read error, {e}", self.client_id());
                        self.drain(e.to_reason_code());
                        break;
                    }
                    None => {
                        log::debug!("{} closed by peer", self.client_id());
                        self.drain(Reason::UnspecifiedError);
                        break;
                    }
                }
            }
        }
    }

    #[inline]
    async fn reply(&self, packet: MqttPacket) -> Result<(), Reason> {
        self.reply_tx.send(packet).await.map_err(|_| Reason::UnspecifiedError)
    }

    /// Handles one inbound packet, an error ends the connection with that reason.
    async fn handle_packet(&mut self, packet: Inbound) -> Result<(), Reason> {
        match packet {
            Inbound::Publish(p) => self.on_publish(*p).await,
            Inbound::PublishAck(packet_id) | Inbound::PublishComplete(packet_id) => {
                self.delete_outbound(packet_id).await;
                self.session.release_packet_id(packet_id);
                Ok(())
            }
            Inbound::PublishReceived(packet_id) => {
                if self.session.is_inflight(packet_id) {
                    self.delete_outbound(packet_id).await;
                    let key = delivery_key(self.client_id(), packet_id);
                    match self.scx.outbound.store(&key, PendingPacket::Release(packet_id)).await {
                        Ok(StoreOutcome::Stored) => {}
                        Ok(StoreOutcome::Dropped) => log::warn!("{} PUBREL {key} not persisted, store full", self.client_id()),
                        Err(e) => log::warn!("{} storing PUBREL {key} failed, {e}", self.client_id()),
                    }
                }
                self.reply(packet::pubrel(self.version, packet_id)).await
            }
            Inbound::PublishRelease(packet_id) => {
                let key = delivery_key(self.client_id(), packet_id);
                if let Err(e) = self.scx.inbound.delete(&key).await {
                    log::warn!("{} deleting {key} failed, {e}", self.client_id());
                }
                self.reply(packet::pubcomp(self.version, packet_id)).await
            }
            Inbound::Subscribe { packet_id, topic_filters } => {
                let granted = topic_filters.into_iter().map(|(filter, opts)| self.subscribe(filter, opts)).collect();
                self.reply(packet::suback(self.version, packet_id, granted)).await
            }
            Inbound::Unsubscribe { packet_id, topic_filters } => {
                let existed = topic_filters.iter().map(|filter| self.unsubscribe(filter)).collect();
                self.reply(packet::unsuback(self.version, packet_id, existed)).await
            }
            Inbound::PingRequest => self.reply(packet::pingresp(self.version)).await,
            Inbound::Disconnect(reason) => {
                if reason == Reason::NormalDisconnection {
                    self.will = None;
                }
                self.by_client.store(true, Ordering::SeqCst);
                Err(reason)
            }
            Inbound::Connect => {
                log::info!("{} sent a second CONNECT", self.client_id());
                Err(Reason::ProtocolError)
            }
            Inbound::Auth => Err(Reason::BadAuthenticationMethod),
            Inbound::Unexpected(name) => {
                log::info!("{} sent unexpected packet {name}", self.client_id());
                Err(Reason::ProtocolError)
            }
        }
    }

    async fn on_publish(&self, p: Publish) -> Result<(), Reason> {
        if !is_valid_topic(&p.topic) {
            log::info!("{} publish to invalid topic {:?}", self.client_id(), p.topic);
            return Err(Reason::TopicNameInvalid);
        }

        match p.qos {
            QoS::AtMostOnce => {
                self.scx.publish(self.client_id(), &p).await;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = p.packet_id.ok_or(Reason::ProtocolError)?;
                self.scx.publish(self.client_id(), &p).await;
                self.reply(packet::puback(self.version, packet_id)).await
            }
            QoS::ExactlyOnce => {
                let packet_id = p.packet_id.ok_or(Reason::ProtocolError)?;
                let key = delivery_key(self.client_id(), packet_id);
                let pending = match self.scx.inbound.load(&key).await {
                    Ok(pending) => pending.is_some(),
                    Err(e) => {
                        log::warn!("{} loading {key} failed, {e}", self.client_id());
                        false
                    }
                };
                if pending {
                    log::debug!("{} duplicate QoS2 publish {key}", self.client_id());
                } else {
                    match self.scx.inbound.store(&key, PendingPacket::Publish(Box::new(p.clone()))).await {
                        Ok(StoreOutcome::Stored) => {}
                        Ok(StoreOutcome::Dropped) => {
                            log::warn!("{} QoS2 publish {key} not persisted, store full", self.client_id())
                        }
                        Err(e) => log::warn!("{} storing {key} failed, {e}", self.client_id()),
                    }
                    self.scx.publish(self.client_id(), &p).await;
                }
                self.reply(packet::pubrec(self.version, packet_id)).await
            }
        }
    }

    async fn delete_outbound(&self, packet_id: NonZeroU16) {
        let key = delivery_key(self.client_id(), packet_id);
        if let Err(e) = self.scx.outbound.delete(&key).await {
            log::warn!("{} deleting {key} failed, {e}", self.client_id());
        }
    }

    fn subscribe(&self, filter: TopicFilter, opts: SubOpts) -> Option<QoS> {
        if !is_valid_filter(&filter) {
            log::debug!("{} invalid topic filter {filter:?}", self.client_id());
            return None;
        }
        self.scx.router.add(&filter, self.client_id(), opts);
        self.session.subscribe(filter, opts.qos);
        Some(opts.qos)
    }

    fn unsubscribe(&self, filter: &TopicFilter) -> bool {
        self.session.unsubscribe(filter);
        self.scx.router.remove(filter, self.client_id())
    }

    /// Tears the connection down once both loops are stopping.
    async fn close(self, send_task: Option<JoinHandle<()>>) {
        self.drain(Reason::UnspecifiedError);
        if let Some(send_task) = send_task {
            if let Err(e) = send_task.await {
                log::warn!("{} send loop failed, {e}", self.client_id());
            }
        }

        let current = self.scx.registry.remove_if_current(self.client_id(), self.handle.id());
        if current && self.session.params().clean_start && self.scx.sessions.remove_if_current(&self.session) {
            self.scx.clear_session(&self.session).await;
        }

        if let Some(will) = self.will.as_ref() {
            if is_valid_topic(&will.topic) {
                let n = self.scx.publish(self.client_id(), will).await;
                log::debug!("{} last will on {:?} delivered to {n} clients", self.client_id(), will.topic);
            }
        }

        self.handle.set_state(ConnState::Closed);
        log::info!(
            "{} disconnected from {}, reason: {:?}",
            self.client_id(),
            self.handle.remote_addr(),
            self.handle.reason()
        );
    }
}

/// Owner of the write half, the single writer of the transport.
struct Sender<Io> {
    sink: MqttSink<Io>,
    scx: ServerContext,
    handle: ConnectionHandle,
    session: Arc<Session>,
    version: ProtocolVersion,
    by_client: Arc<AtomicBool>,
}

impl<Io> Sender<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, mut reply_rx: mpsc::Receiver<MqttPacket>, mut deliver_rx: mpsc::Receiver<Publish>) {
        let cancel = self.handle.cancel_token().clone();
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(packet) = reply_rx.recv() => packet,
                Some(p) = deliver_rx.recv() => match self.deliver(p).await {
                    Some(packet) => packet,
                    None => continue,
                },
                else => break,
            };
            if let Err(e) = self.sink.send(packet).await {
                log::debug!("{} write error, {e}", self.handle.client_id());
                if self.handle.drain(Reason::UnspecifiedError) {
                    log::info!("{} draining, reason: {:?}", self.handle.client_id(), Reason::UnspecifiedError);
                }
                break;
            }
        }
        self.keep_undelivered(&mut deliver_rx).await;

        if let Some(reason) = self.handle.reason() {
            if notify_client(reason) && !self.by_client.load(Ordering::SeqCst) {
                if let Some(p) = packet::disconnect(self.version, reason) {
                    let _ = self.sink.send(p).await;
                }
            }
        }
        if let Err(e) = self.sink.close().await {
            log::debug!("{} close error, {e}", self.handle.client_id());
        }
    }

    /// Assigns a packet id to a QoS 1/2 delivery and records it before it is written.
    ///
    /// The id is released again when the record could not be stored.
    async fn deliver(&self, mut p: Publish) -> Option<MqttPacket> {
        if p.qos != QoS::AtMostOnce {
            let Some(packet_id) = self.session.next_packet_id() else {
                log::warn!("{} no free packet id, message on {:?} dropped", self.handle.client_id(), p.topic);
                return None;
            };
            p.packet_id = Some(packet_id);
            let key = delivery_key(self.handle.client_id(), packet_id);
            match self.scx.outbound.store(&key, PendingPacket::Publish(Box::new(p.clone()))).await {
                Ok(StoreOutcome::Stored) => {}
                Ok(StoreOutcome::Dropped) => {
                    log::warn!("{} delivery {key} not persisted, store full", self.handle.client_id());
                    self.session.release_packet_id(packet_id);
                }
                Err(e) => {
                    log::warn!("{} storing {key} failed, {e}", self.handle.client_id());
                    self.session.release_packet_id(packet_id);
                }
            }
        }
        Some(packet::publish(self.version, p))
    }

    /// Records the QoS 1/2 messages still queued when the connection ends, so a resumed
    /// session gets them.
    async fn keep_undelivered(&self, deliver_rx: &mut mpsc::Receiver<Publish>) {
        deliver_rx.close();
        let client_id = self.handle.client_id();
        let current = self.scx.sessions.get(client_id).is_some_and(|s| Arc::ptr_eq(&s, &self.session));
        if !current || self.session.params().clean_start {
            return;
        }
        let mut kept = 0;
        while let Ok(p) = deliver_rx.try_recv() {
            if p.qos != QoS::AtMostOnce && self.deliver(p).await.is_some() {
                kept += 1;
            }
        }
        if kept > 0 {
            log::debug!("{client_id} kept {kept} undelivered messages for its session");
        }
    }
}
