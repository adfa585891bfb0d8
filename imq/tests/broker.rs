use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use imq::codec::types::{Publish, QoS};
use imq::codec::v3::{
    Codec as CodecV3, Connect as ConnectV3, ConnectAckReason as ConnectAckReasonV3, LastWill as LastWillV3,
    Packet as PacketV3, SubscribeReturnCode,
};
use imq::codec::v5::{
    Codec as CodecV5, Connect as ConnectV5, Disconnect as DisconnectV5, DisconnectReasonCode, Packet as PacketV5,
};
use imq::codec::version::ProtocolVersion;
use imq::codec::{MqttCodec, MqttPacket};
use imq::net::Builder;
use imq::persist::{MemPersist, PendingPacket, PersistHandle, PersistStrategy};
use imq::{ConnState, ServerContext, Supervisor};

type Client = Framed<TcpStream, MqttCodec>;

const MAX_PACKET: u32 = 1024 * 1024;

struct Broker {
    scx: ServerContext,
    sup: Supervisor,
    addr: SocketAddr,
    task: JoinHandle<imq::Result<()>>,
}

fn mem_store() -> PersistHandle {
    Arc::new(MemPersist::new(PersistStrategy::default()))
}

fn mem_context() -> ServerContext {
    ServerContext::new().inbound(mem_store()).outbound(mem_store()).build()
}

async fn start_with(scx: ServerContext, builder: Builder) -> Broker {
    let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Info).init();
    let listener = builder.bind().unwrap().tcp().unwrap();
    let addr = listener.local_addr;
    let sup = Supervisor::new(scx.clone()).listener(listener).grace(Duration::from_secs(1)).build();
    let s = sup.clone();
    let task = tokio::spawn(async move { s.run().await });
    Broker { scx, sup, addr, task }
}

async fn start(scx: ServerContext) -> Broker {
    start_with(scx, builder()).await
}

fn builder() -> Builder {
    Builder::new()
        .name("test/tcp")
        .laddr(([127, 0, 0, 1], 0).into())
        .handshake_timeout(Duration::from_secs(2))
        .send_timeout(Duration::from_secs(2))
        .max_mqueue_len(16)
}

fn pid(id: u16) -> NonZeroU16 {
    NonZeroU16::new(id).unwrap()
}

fn message(topic: &str, qos: QoS, packet_id: Option<u16>, payload: &'static [u8]) -> Publish {
    Publish {
        dup: false,
        retain: false,
        qos,
        topic: topic.into(),
        packet_id: packet_id.and_then(NonZeroU16::new),
        payload: Bytes::from_static(payload),
        properties: None,
        delay_interval: None,
        create_time: None,
    }
}

async fn recv(client: &mut Client) -> MqttPacket {
    match tokio::time::timeout(Duration::from_secs(3), client.next()).await {
        Ok(Some(Ok((packet, _)))) => packet,
        other => panic!("no packet, {other:?}"),
    }
}

/// Whether the server closed the link without sending anything more.
async fn closed(client: &mut Client) -> bool {
    matches!(tokio::time::timeout(Duration::from_secs(3), client.next()).await, Ok(None) | Ok(Some(Err(_))))
}

async fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn connect_v3_with(addr: SocketAddr, connect: ConnectV3) -> (Client, ConnectAckReasonV3, bool) {
    let io = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(io, MqttCodec::V3(CodecV3::new(MAX_PACKET)));
    client.send(MqttPacket::V3(PacketV3::Connect(Box::new(connect)))).await.unwrap();
    match recv(&mut client).await {
        MqttPacket::V3(PacketV3::ConnectAck(ack)) => (client, ack.return_code, ack.session_present),
        other => panic!("expected CONNACK, {other:?}"),
    }
}

async fn connect_v3(addr: SocketAddr, client_id: &str, clean_session: bool) -> (Client, bool) {
    let connect = ConnectV3 { client_id: client_id.into(), keep_alive: 10, clean_session, ..Default::default() };
    let (client, code, session_present) = connect_v3_with(addr, connect).await;
    assert_eq!(code, ConnectAckReasonV3::ConnectionAccepted);
    (client, session_present)
}

async fn connect_v5(addr: SocketAddr, client_id: &str, keep_alive: u16) -> Client {
    let io = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(io, MqttCodec::V5(CodecV5::new(MAX_PACKET, MAX_PACKET)));
    let connect =
        ConnectV5 { client_id: client_id.into(), keep_alive, clean_start: true, ..Default::default() };
    client.send(MqttPacket::V5(PacketV5::Connect(Box::new(connect)))).await.unwrap();
    match recv(&mut client).await {
        MqttPacket::V5(PacketV5::ConnectAck(ack)) => {
            assert_eq!(ack.reason_code, imq::codec::v5::ConnectAckReason::Success)
        }
        other => panic!("expected CONNACK, {other:?}"),
    }
    client
}

async fn subscribe_v3(client: &mut Client, filters: Vec<(&str, QoS)>) -> Vec<SubscribeReturnCode> {
    let topic_filters = filters.into_iter().map(|(f, qos)| (f.into(), qos)).collect();
    client.send(MqttPacket::V3(PacketV3::Subscribe { packet_id: pid(1), topic_filters })).await.unwrap();
    match recv(client).await {
        MqttPacket::V3(PacketV3::SubscribeAck { packet_id, status }) => {
            assert_eq!(packet_id, pid(1));
            status
        }
        other => panic!("expected SUBACK, {other:?}"),
    }
}

#[tokio::test]
async fn handshake_registers_connection() {
    let broker = start(mem_context()).await;
    let (_client, session_present) = connect_v3(broker.addr, "c1", true).await;
    assert!(!session_present);

    let scx = broker.scx.clone();
    wait_until(|| scx.registry.get("c1").map(|h| h.state() == ConnState::Established).unwrap_or(false)).await;
    assert_eq!(broker.scx.registry.len(), 1);
    assert_eq!(broker.scx.sessions.get("c1").unwrap().params().keep_alive, 10);
}

#[tokio::test]
async fn qos2_inbound_record_lives_until_pubrel() {
    let broker = start(mem_context()).await;
    let (mut client, _) = connect_v3(broker.addr, "c1", true).await;

    client.send(MqttPacket::V3(PacketV3::from(message("a/b", QoS::ExactlyOnce, Some(42), b"m")))).await.unwrap();
    assert!(matches!(recv(&mut client).await, MqttPacket::V3(PacketV3::PublishReceived { packet_id }) if packet_id == pid(42)));
    assert!(broker.scx.inbound.load("c1:42").await.unwrap().is_some());

    client.send(MqttPacket::V3(PacketV3::PublishRelease { packet_id: pid(42) })).await.unwrap();
    assert!(matches!(recv(&mut client).await, MqttPacket::V3(PacketV3::PublishComplete { packet_id }) if packet_id == pid(42)));
    assert!(broker.scx.inbound.load("c1:42").await.unwrap().is_none());
}

#[tokio::test]
async fn outbound_records_follow_acknowledgments() {
    let broker = start(mem_context()).await;
    let (mut sub, _) = connect_v3(broker.addr, "sub", true).await;
    let status = subscribe_v3(&mut sub, vec![("q/1", QoS::AtLeastOnce), ("q/2", QoS::ExactlyOnce)]).await;
    assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce), SubscribeReturnCode::Success(QoS::ExactlyOnce)]);
    let (mut publisher, _) = connect_v3(broker.addr, "pub", true).await;

    //QoS1, deleted on PUBACK
    publisher.send(MqttPacket::V3(PacketV3::from(message("q/1", QoS::AtLeastOnce, Some(1), b"one")))).await.unwrap();
    assert!(matches!(recv(&mut publisher).await, MqttPacket::V3(PacketV3::PublishAck { .. })));
    let packet_id = match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert_eq!(p.qos, QoS::AtLeastOnce);
            assert_eq!(p.payload, Bytes::from_static(b"one"));
            p.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, {other:?}"),
    };
    let key = format!("sub:{packet_id}");
    assert!(broker.scx.outbound.load(&key).await.unwrap().is_some());
    sub.send(MqttPacket::V3(PacketV3::PublishAck { packet_id })).await.unwrap();
    for _ in 0..300 {
        if broker.scx.outbound.load(&key).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(broker.scx.outbound.load(&key).await.unwrap().is_none());

    //QoS0 is never recorded
    publisher.send(MqttPacket::V3(PacketV3::from(message("q/2", QoS::AtMostOnce, None, b"two")))).await.unwrap();
    match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert_eq!(p.qos, QoS::AtMostOnce);
            assert!(p.packet_id.is_none());
        }
        other => panic!("expected PUBLISH, {other:?}"),
    }

    //QoS2, replaced by a release on PUBREC, deleted on PUBCOMP
    publisher.send(MqttPacket::V3(PacketV3::from(message("q/2", QoS::ExactlyOnce, Some(2), b"two")))).await.unwrap();
    assert!(matches!(recv(&mut publisher).await, MqttPacket::V3(PacketV3::PublishReceived { .. })));
    let packet_id = match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert_eq!(p.qos, QoS::ExactlyOnce);
            p.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, {other:?}"),
    };
    let key = format!("sub:{packet_id}");
    sub.send(MqttPacket::V3(PacketV3::PublishReceived { packet_id })).await.unwrap();
    assert!(matches!(recv(&mut sub).await, MqttPacket::V3(PacketV3::PublishRelease { packet_id: id }) if id == packet_id));
    assert_eq!(broker.scx.outbound.load(&key).await.unwrap(), Some(PendingPacket::Release(packet_id)));
    sub.send(MqttPacket::V3(PacketV3::PublishComplete { packet_id })).await.unwrap();
    sub.send(MqttPacket::V3(PacketV3::PingRequest)).await.unwrap();
    assert!(matches!(recv(&mut sub).await, MqttPacket::V3(PacketV3::PingResponse)));
    assert!(broker.scx.outbound.load(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_stops_accepting_only() {
    let broker = start(mem_context()).await;
    let (mut client, _) = connect_v3(broker.addr, "c1", true).await;

    broker.sup.shutdown();
    tokio::time::timeout(Duration::from_secs(2), broker.task).await.unwrap().unwrap().unwrap();
    assert!(broker.sup.run().await.is_err());
    assert!(TcpStream::connect(broker.addr).await.is_err());

    client.send(MqttPacket::V3(PacketV3::PingRequest)).await.unwrap();
    assert!(matches!(recv(&mut client).await, MqttPacket::V3(PacketV3::PingResponse)));
    assert_eq!(broker.scx.registry.get("c1").unwrap().state(), ConnState::Established);
}

#[tokio::test]
async fn external_token_stops_every_listener() {
    let token = CancellationToken::new();
    let scx = mem_context();
    let first = builder().bind().unwrap().tcp().unwrap();
    let second = builder().bind().unwrap().tcp().unwrap();
    let addrs = [first.local_addr, second.local_addr];
    let sup = Supervisor::new(scx).listener(first).listener(second).shutdown(token.clone()).build();
    let task = tokio::spawn(async move { sup.run().await });

    for addr in addrs {
        let (_client, _) = connect_v3(addr, "probe", true).await;
    }
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    for addr in addrs {
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

#[tokio::test]
async fn shutdown_connections_notifies_v5_clients() {
    let broker = start(mem_context()).await;
    let mut client = connect_v5(broker.addr, "c5", 0).await;
    let scx = broker.scx.clone();
    wait_until(|| scx.registry.contains("c5")).await;

    assert_eq!(broker.sup.shutdown_connections(), 1);
    match recv(&mut client).await {
        MqttPacket::V5(PacketV5::Disconnect(d)) => assert_eq!(d.reason_code, DisconnectReasonCode::ServerShuttingDown),
        other => panic!("expected DISCONNECT, {other:?}"),
    }
    assert!(closed(&mut client).await);
    wait_until(|| !scx.registry.contains("c5")).await;
}

#[tokio::test]
async fn keepalive_expiry_drains_connection() {
    let broker = start(mem_context()).await;
    let mut client = connect_v5(broker.addr, "idle", 1).await;
    let handle = {
        let scx = broker.scx.clone();
        wait_until(|| scx.registry.contains("idle")).await;
        broker.scx.registry.get("idle").unwrap()
    };

    match recv(&mut client).await {
        MqttPacket::V5(PacketV5::Disconnect(d)) => assert_eq!(d.reason_code, DisconnectReasonCode::KeepAliveTimeout),
        other => panic!("expected DISCONNECT, {other:?}"),
    }
    assert!(closed(&mut client).await);
    wait_until(|| handle.state() == ConnState::Closed).await;
    assert_eq!(handle.reason(), Some(DisconnectReasonCode::KeepAliveTimeout));
    assert!(!broker.scx.registry.contains("idle"));
}

#[tokio::test]
async fn keepalive_is_reset_by_traffic() {
    let broker = start(mem_context()).await;
    let mut client = connect_v5(broker.addr, "busy", 1).await;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        client.send(MqttPacket::V5(PacketV5::PingRequest)).await.unwrap();
        assert!(matches!(recv(&mut client).await, MqttPacket::V5(PacketV5::PingResponse)));
    }
    assert_eq!(broker.scx.registry.get("busy").unwrap().state(), ConnState::Established);
}

#[tokio::test]
async fn second_handshake_takes_over() {
    let broker = start(mem_context()).await;
    let mut first = connect_v5(broker.addr, "dup", 0).await;
    let scx = broker.scx.clone();
    wait_until(|| scx.registry.contains("dup")).await;
    let first_handle = broker.scx.registry.get("dup").unwrap();

    let mut second = connect_v5(broker.addr, "dup", 0).await;
    match recv(&mut first).await {
        MqttPacket::V5(PacketV5::Disconnect(d)) => assert_eq!(d.reason_code, DisconnectReasonCode::SessionTakenOver),
        other => panic!("expected DISCONNECT, {other:?}"),
    }
    wait_until(|| first_handle.state() == ConnState::Closed).await;

    let current = broker.scx.registry.get("dup").unwrap();
    assert_ne!(current.id(), first_handle.id());
    assert_eq!(broker.scx.registry.len(), 1);
    second.send(MqttPacket::V5(PacketV5::PingRequest)).await.unwrap();
    assert!(matches!(recv(&mut second).await, MqttPacket::V5(PacketV5::PingResponse)));
}

#[tokio::test]
async fn fan_out_across_versions() {
    let broker = start(mem_context()).await;
    let (mut sub, _) = connect_v3(broker.addr, "sub", true).await;
    let status = subscribe_v3(&mut sub, vec![("sensors/+/temp", QoS::AtLeastOnce), ("bad/#/filter", QoS::AtMostOnce)]).await;
    assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce), SubscribeReturnCode::Failure]);

    let mut publisher = connect_v5(broker.addr, "pub5", 0).await;
    publisher.send(MqttPacket::V5(PacketV5::from(message("sensors/1/temp", QoS::AtMostOnce, None, b"21")))).await.unwrap();
    match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert_eq!(p.topic, "sensors/1/temp");
            assert_eq!(p.qos, QoS::AtMostOnce);
            assert_eq!(p.payload, Bytes::from_static(b"21"));
        }
        other => panic!("expected PUBLISH, {other:?}"),
    }

    sub.send(MqttPacket::V3(PacketV3::Unsubscribe { packet_id: pid(2), topic_filters: vec!["sensors/+/temp".into()] }))
        .await
        .unwrap();
    assert!(matches!(recv(&mut sub).await, MqttPacket::V3(PacketV3::UnsubscribeAck { packet_id }) if packet_id == pid(2)));
    assert!(broker.scx.router.is_empty());
}

#[tokio::test]
async fn pending_deliveries_resume_with_session() {
    let broker = start(mem_context()).await;
    let (mut sub, _) = connect_v3(broker.addr, "keeper", false).await;
    subscribe_v3(&mut sub, vec![("news", QoS::AtLeastOnce)]).await;

    let (mut publisher, _) = connect_v3(broker.addr, "pub", true).await;
    publisher.send(MqttPacket::V3(PacketV3::from(message("news", QoS::AtLeastOnce, Some(9), b"hot")))).await.unwrap();
    assert!(matches!(recv(&mut publisher).await, MqttPacket::V3(PacketV3::PublishAck { .. })));

    let packet_id = match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert!(!p.dup);
            p.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, {other:?}"),
    };
    drop(sub);
    let scx = broker.scx.clone();
    wait_until(|| !scx.registry.contains("keeper")).await;

    let (mut sub, session_present) = connect_v3(broker.addr, "keeper", false).await;
    assert!(session_present);
    match recv(&mut sub).await {
        MqttPacket::V3(PacketV3::Publish(p)) => {
            assert!(p.dup);
            assert_eq!(p.packet_id, Some(packet_id));
            assert_eq!(p.payload, Bytes::from_static(b"hot"));
        }
        other => panic!("expected PUBLISH, {other:?}"),
    }
    sub.send(MqttPacket::V3(PacketV3::PublishAck { packet_id })).await.unwrap();
    sub.send(MqttPacket::V3(PacketV3::PingRequest)).await.unwrap();
    assert!(matches!(recv(&mut sub).await, MqttPacket::V3(PacketV3::PingResponse)));
    assert!(broker.scx.outbound.load(&format!("keeper:{packet_id}")).await.unwrap().is_none());

    //the subscription survived as well
    publisher.send(MqttPacket::V3(PacketV3::from(message("news", QoS::AtMostOnce, None, b"later")))).await.unwrap();
    assert!(matches!(recv(&mut sub).await, MqttPacket::V3(PacketV3::Publish(_))));

    //a clean session drops everything
    drop(sub);
    wait_until(|| !scx.registry.contains("keeper")).await;
    let (_sub, session_present) = connect_v3(broker.addr, "keeper", true).await;
    assert!(!session_present);
    assert!(broker.scx.router.is_empty());
}

#[tokio::test]
async fn queued_deliveries_survive_disconnect() {
    const N: u16 = 12;
    let broker = start(mem_context()).await;
    let (mut sub, _) = connect_v3(broker.addr, "slow", false).await;
    subscribe_v3(&mut sub, vec![("big", QoS::AtLeastOnce)]).await;
    let (mut publisher, _) = connect_v3(broker.addr, "pub", true).await;

    //large enough that the subscriber, which never reads, stalls the send loop
    for i in 1..=N {
        let p = Publish { payload: Bytes::from(vec![i as u8; 512 * 1024]), ..message("big", QoS::AtLeastOnce, Some(i), b"") };
        publisher.send(MqttPacket::V3(PacketV3::from(p))).await.unwrap();
        assert!(matches!(recv(&mut publisher).await, MqttPacket::V3(PacketV3::PublishAck { packet_id }) if packet_id == pid(i)));
    }
    drop(sub);
    let scx = broker.scx.clone();
    wait_until(|| !scx.registry.contains("slow")).await;

    let (mut sub, session_present) = connect_v3(broker.addr, "slow", false).await;
    assert!(session_present);
    let mut received = Vec::new();
    for _ in 0..N {
        match recv(&mut sub).await {
            MqttPacket::V3(PacketV3::Publish(p)) => {
                received.push(p.payload[0] as u16);
                sub.send(MqttPacket::V3(PacketV3::PublishAck { packet_id: p.packet_id.unwrap() })).await.unwrap();
            }
            other => panic!("expected PUBLISH, {other:?}"),
        }
    }
    received.sort_unstable();
    assert_eq!(received, (1..=N).collect::<Vec<_>>());
}

#[tokio::test]
async fn unacked_ids_are_not_held_across_resumes() {
    //nothing is persisted, so no delivery survives a reconnect
    let broker = start(ServerContext::new().build()).await;
    let (mut publisher, _) = connect_v3(broker.addr, "pub", true).await;
    let scx = broker.scx.clone();

    for round in 1..=3u16 {
        let (mut keeper, session_present) = connect_v3(broker.addr, "keeper", false).await;
        if round == 1 {
            subscribe_v3(&mut keeper, vec![("k", QoS::AtLeastOnce)]).await;
        } else {
            assert!(session_present);
        }
        assert_eq!(scx.sessions.get("keeper").unwrap().inflight_len(), 0);

        publisher.send(MqttPacket::V3(PacketV3::from(message("k", QoS::AtLeastOnce, Some(round), b"m")))).await.unwrap();
        assert!(matches!(recv(&mut publisher).await, MqttPacket::V3(PacketV3::PublishAck { .. })));
        assert!(matches!(recv(&mut keeper).await, MqttPacket::V3(PacketV3::Publish(_))));
        assert_eq!(scx.sessions.get("keeper").unwrap().inflight_len(), 1);

        drop(keeper);
        wait_until(|| !scx.registry.contains("keeper")).await;
    }
}

#[tokio::test]
async fn last_will_unless_normal_disconnect() {
    let broker = start(mem_context()).await;
    let (mut watcher, _) = connect_v3(broker.addr, "watcher", true).await;
    subscribe_v3(&mut watcher, vec![("will/#", QoS::AtMostOnce)]).await;

    let with_will = |client_id: &str| ConnectV3 {
        client_id: client_id.into(),
        clean_session: true,
        last_will: Some(LastWillV3 {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: format!("will/{client_id}").into(),
            message: Bytes::from_static(b"bye"),
        }),
        ..Default::default()
    };

    let (mut polite, _, _) = connect_v3_with(broker.addr, with_will("polite")).await;
    polite.send(MqttPacket::V3(PacketV3::Disconnect)).await.unwrap();
    assert!(closed(&mut polite).await);

    let (crashed, _, _) = connect_v3_with(broker.addr, with_will("crashed")).await;
    drop(crashed);

    match recv(&mut watcher).await {
        MqttPacket::V3(PacketV3::Publish(p)) => assert_eq!(p.topic, "will/crashed"),
        other => panic!("expected PUBLISH, {other:?}"),
    }
}

#[tokio::test]
async fn refused_handshakes() {
    let scx = ServerContext::new().version(ProtocolVersion::MQTT5).compatible(false).build();
    let broker = start(scx).await;
    let connect = ConnectV3 { client_id: "old".into(), clean_session: true, ..Default::default() };
    let (mut client, code, _) = connect_v3_with(broker.addr, connect).await;
    assert_eq!(code, ConnectAckReasonV3::UnacceptableProtocolVersion);
    assert!(closed(&mut client).await);

    let broker = start(mem_context()).await;
    let connect = ConnectV3 { client_id: "".into(), clean_session: false, ..Default::default() };
    let (mut client, code, _) = connect_v3_with(broker.addr, connect).await;
    assert_eq!(code, ConnectAckReasonV3::IdentifierRejected);
    assert!(closed(&mut client).await);
    assert!(broker.scx.registry.is_empty());
}

#[tokio::test]
async fn malformed_handshake_closes_silently() {
    let broker = start(mem_context()).await;
    let io = TcpStream::connect(broker.addr).await.unwrap();
    let mut client = Framed::new(io, MqttCodec::V3(CodecV3::new(MAX_PACKET)));
    client.send(MqttPacket::V3(PacketV3::PingRequest)).await.unwrap();
    assert!(closed(&mut client).await);
    assert!(broker.scx.registry.is_empty());
}

#[tokio::test]
async fn second_connect_is_a_protocol_error() {
    let broker = start(mem_context()).await;
    let mut client = connect_v5(broker.addr, "twice", 0).await;
    let connect = ConnectV5 { client_id: "twice".into(), ..Default::default() };
    client.send(MqttPacket::V5(PacketV5::Connect(Box::new(connect)))).await.unwrap();
    match recv(&mut client).await {
        MqttPacket::V5(PacketV5::Disconnect(d)) => assert_eq!(d.reason_code, DisconnectReasonCode::ProtocolError),
        other => panic!("expected DISCONNECT, {other:?}"),
    }
}

#[tokio::test]
async fn client_disconnect_gets_no_reply() {
    let broker = start(mem_context()).await;
    let mut client = connect_v5(broker.addr, "bye5", 0).await;
    let scx = broker.scx.clone();
    wait_until(|| scx.registry.contains("bye5")).await;
    let handle = broker.scx.registry.get("bye5").unwrap();

    client
        .send(MqttPacket::V5(PacketV5::Disconnect(DisconnectV5::new(DisconnectReasonCode::NormalDisconnection))))
        .await
        .unwrap();
    assert!(closed(&mut client).await);
    wait_until(|| handle.state() == ConnState::Closed).await;
    assert_eq!(handle.reason(), Some(DisconnectReasonCode::NormalDisconnection));
}

#[tokio::test]
async fn connection_cap_rejects_extra_clients() {
    let broker = start_with(mem_context(), builder().max_connections(1)).await;
    let (mut first, _) = connect_v3(broker.addr, "first", true).await;

    let io = TcpStream::connect(broker.addr).await.unwrap();
    let mut second = Framed::new(io, MqttCodec::V3(CodecV3::new(MAX_PACKET)));
    let connect = ConnectV3 { client_id: "second".into(), clean_session: true, ..Default::default() };
    let _ = second.send(MqttPacket::V3(PacketV3::Connect(Box::new(connect)))).await;
    assert!(closed(&mut second).await);

    first.send(MqttPacket::V3(PacketV3::PingRequest)).await.unwrap();
    assert!(matches!(recv(&mut first).await, MqttPacket::V3(PacketV3::PingResponse)));
    assert!(!broker.scx.registry.contains("second"));
}
