//! Version neutral view of the packets the connection state machine handles.
//!
//! Decoded packets are folded into [`Inbound`], replies are built per protocol version by
//! the constructors below, so the state machine itself never matches on codec versions.

use std::num::NonZeroU16;

use rmqtt_codec::v3::{
    ConnectAck as ConnectAckV3, ConnectAckReason as ConnectAckReasonV3, Packet as PacketV3,
    SubscribeReturnCode,
};
use rmqtt_codec::v5::{
    ConnectAck as ConnectAckV5, ConnectAckReason as ConnectAckReasonV5, Disconnect as DisconnectV5,
    Packet as PacketV5, PublishAck, PublishAck2, SubscribeAck, SubscribeAckReason,
    UnsubscribeAck, UnsubscribeAckReason,
};
use rmqtt_codec::MqttPacket;

use crate::net::MqttError;
use crate::router::SubOpts;
use crate::types::{ClientId, ProtocolVersion, Publish, QoS, Reason, TopicFilter};

/// A packet received on an established connection.
#[derive(Debug)]
pub enum Inbound {
    Publish(Box<Publish>),
    PublishAck(NonZeroU16),
    PublishReceived(NonZeroU16),
    PublishRelease(NonZeroU16),
    PublishComplete(NonZeroU16),
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(TopicFilter, SubOpts)> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<TopicFilter> },
    PingRequest,
    Disconnect(Reason),
    Connect,
    Auth,
    /// A packet only a server may send.
    Unexpected(&'static str),
}

impl From<MqttPacket> for Inbound {
    fn from(packet: MqttPacket) -> Self {
        match packet {
            MqttPacket::V3(p) => from_v3(p),
            MqttPacket::V5(p) => from_v5(p),
            MqttPacket::Version(_) => Inbound::Unexpected("CONNECT"),
        }
    }
}

fn from_v3(packet: PacketV3) -> Inbound {
    match packet {
        PacketV3::Publish(p) => Inbound::Publish(p.into()),
        PacketV3::PublishAck { packet_id } => Inbound::PublishAck(packet_id),
        PacketV3::PublishReceived { packet_id } => Inbound::PublishReceived(packet_id),
        PacketV3::PublishRelease { packet_id } => Inbound::PublishRelease(packet_id),
        PacketV3::PublishComplete { packet_id } => Inbound::PublishComplete(packet_id),
        PacketV3::Subscribe { packet_id, topic_filters } => Inbound::Subscribe {
            packet_id,
            topic_filters: topic_filters.into_iter().map(|(tf, qos)| (tf, SubOpts::new(qos))).collect(),
        },
        PacketV3::Unsubscribe { packet_id, topic_filters } => Inbound::Unsubscribe { packet_id, topic_filters },
        PacketV3::PingRequest => Inbound::PingRequest,
        PacketV3::Disconnect => Inbound::Disconnect(Reason::NormalDisconnection),
        PacketV3::Connect(_) => Inbound::Connect,
        PacketV3::ConnectAck(_) => Inbound::Unexpected("CONNACK"),
        PacketV3::SubscribeAck { .. } => Inbound::Unexpected("SUBACK"),
        PacketV3::UnsubscribeAck { .. } => Inbound::Unexpected("UNSUBACK"),
        PacketV3::PingResponse => Inbound::Unexpected("PINGRESP"),
    }
}

fn from_v5(packet: PacketV5) -> Inbound {
    match packet {
        PacketV5::Publish(p) => Inbound::Publish(p),
        PacketV5::PublishAck(ack) => Inbound::PublishAck(ack.packet_id),
        PacketV5::PublishReceived(ack) => Inbound::PublishReceived(ack.packet_id),
        PacketV5::PublishRelease(ack) => Inbound::PublishRelease(ack.packet_id),
        PacketV5::PublishComplete(ack) => Inbound::PublishComplete(ack.packet_id),
        PacketV5::Subscribe(sub) => Inbound::Subscribe {
            packet_id: sub.packet_id,
            topic_filters: sub
                .topic_filters
                .into_iter()
                .map(|(tf, opts)| (tf, SubOpts { qos: opts.qos, no_local: opts.no_local }))
                .collect(),
        },
        PacketV5::Unsubscribe(unsub) => {
            Inbound::Unsubscribe { packet_id: unsub.packet_id, topic_filters: unsub.topic_filters }
        }
        PacketV5::PingRequest => Inbound::PingRequest,
        PacketV5::Disconnect(d) => Inbound::Disconnect(d.reason_code),
        PacketV5::Connect(_) => Inbound::Connect,
        PacketV5::Auth(_) => Inbound::Auth,
        PacketV5::ConnectAck(_) => Inbound::Unexpected("CONNACK"),
        PacketV5::SubscribeAck(_) => Inbound::Unexpected("SUBACK"),
        PacketV5::UnsubscribeAck(_) => Inbound::Unexpected("UNSUBACK"),
        PacketV5::PingResponse => Inbound::Unexpected("PINGRESP"),
    }
}

#[inline]
fn is_v5(version: ProtocolVersion) -> bool {
    matches!(version, ProtocolVersion::MQTT5)
}

/// Successful CONNACK. Features the broker does not offer are switched off for v5 clients.
pub fn connack(version: ProtocolVersion, session_present: bool, assigned_client_id: Option<ClientId>) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::from(ConnectAckV5 {
            session_present,
            assigned_client_id,
            retain_available: false,
            subscription_identifiers_available: false,
            shared_subscription_available: false,
            ..Default::default()
        }))
    } else {
        MqttPacket::V3(PacketV3::ConnectAck(ConnectAckV3 {
            return_code: ConnectAckReasonV3::ConnectionAccepted,
            session_present,
        }))
    }
}

/// CONNACK refusing the handshake because of `err`.
pub fn connack_refused(version: ProtocolVersion, err: &MqttError) -> MqttPacket {
    if is_v5(version) {
        let reason_code = match err {
            MqttError::UnsupportedProtocolVersion => ConnectAckReasonV5::UnsupportedProtocolVersion,
            MqttError::IdentifierRejected => ConnectAckReasonV5::ClientIdentifierNotValid,
            MqttError::ServiceUnavailable => ConnectAckReasonV5::ServerUnavailable,
            _ => ConnectAckReasonV5::UnspecifiedError,
        };
        MqttPacket::V5(PacketV5::from(ConnectAckV5 { reason_code, ..Default::default() }))
    } else {
        let return_code = match err {
            MqttError::UnsupportedProtocolVersion => ConnectAckReasonV3::UnacceptableProtocolVersion,
            MqttError::IdentifierRejected => ConnectAckReasonV3::IdentifierRejected,
            _ => ConnectAckReasonV3::ServiceUnavailable,
        };
        MqttPacket::V3(PacketV3::ConnectAck(ConnectAckV3 { return_code, session_present: false }))
    }
}

pub fn publish(version: ProtocolVersion, p: Publish) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::from(p))
    } else {
        MqttPacket::V3(PacketV3::from(p))
    }
}

pub fn puback(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::PublishAck(PublishAck { packet_id, ..Default::default() }))
    } else {
        MqttPacket::V3(PacketV3::PublishAck { packet_id })
    }
}

pub fn pubrec(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::PublishReceived(PublishAck { packet_id, ..Default::default() }))
    } else {
        MqttPacket::V3(PacketV3::PublishReceived { packet_id })
    }
}

pub fn pubrel(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::PublishRelease(PublishAck2 { packet_id, ..Default::default() }))
    } else {
        MqttPacket::V3(PacketV3::PublishRelease { packet_id })
    }
}

pub fn pubcomp(version: ProtocolVersion, packet_id: NonZeroU16) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::PublishComplete(PublishAck2 { packet_id, ..Default::default() }))
    } else {
        MqttPacket::V3(PacketV3::PublishComplete { packet_id })
    }
}

/// SUBACK, `None` marks a refused filter.
pub fn suback(version: ProtocolVersion, packet_id: NonZeroU16, granted: Vec<Option<QoS>>) -> MqttPacket {
    if is_v5(version) {
        let status = granted
            .into_iter()
            .map(|g| match g {
                Some(QoS::AtMostOnce) => SubscribeAckReason::GrantedQos0,
                Some(QoS::AtLeastOnce) => SubscribeAckReason::GrantedQos1,
                Some(QoS::ExactlyOnce) => SubscribeAckReason::GrantedQos2,
                None => SubscribeAckReason::TopicFilterInvalid,
            })
            .collect();
        MqttPacket::V5(PacketV5::SubscribeAck(SubscribeAck {
            packet_id,
            properties: Default::default(),
            reason_string: None,
            status,
        }))
    } else {
        let status = granted
            .into_iter()
            .map(|g| g.map(SubscribeReturnCode::Success).unwrap_or(SubscribeReturnCode::Failure))
            .collect();
        MqttPacket::V3(PacketV3::SubscribeAck { packet_id, status })
    }
}

/// UNSUBACK, `existed` holds one flag per filter and only reaches v5 clients.
pub fn unsuback(version: ProtocolVersion, packet_id: NonZeroU16, existed: Vec<bool>) -> MqttPacket {
    if is_v5(version) {
        let status = existed
            .into_iter()
            .map(|e| if e { UnsubscribeAckReason::Success } else { UnsubscribeAckReason::NoSubscriptionExisted })
            .collect();
        MqttPacket::V5(PacketV5::UnsubscribeAck(UnsubscribeAck {
            packet_id,
            properties: Default::default(),
            reason_string: None,
            status,
        }))
    } else {
        MqttPacket::V3(PacketV3::UnsubscribeAck { packet_id })
    }
}

pub fn pingresp(version: ProtocolVersion) -> MqttPacket {
    if is_v5(version) {
        MqttPacket::V5(PacketV5::PingResponse)
    } else {
        MqttPacket::V3(PacketV3::PingResponse)
    }
}

/// Server initiated DISCONNECT, v3 has no such packet.
pub fn disconnect(version: ProtocolVersion, reason: Reason) -> Option<MqttPacket> {
    if is_v5(version) {
        Some(MqttPacket::V5(PacketV5::Disconnect(DisconnectV5::new(reason))))
    } else {
        None
    }
}
