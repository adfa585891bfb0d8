use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use rmqtt_codec::error::DecodeError;
use rmqtt_codec::v3::{Codec as CodecV3, Packet as PacketV3};
use rmqtt_codec::v5::{Codec as CodecV5, Packet as PacketV5};
use rmqtt_codec::version::{ProtocolVersion, VersionCodec};
use rmqtt_codec::{MqttCodec, MqttPacket};

use crate::error::MqttError;
use crate::Builder;

/// A CONNECT packet of either protocol version.
#[derive(Debug, Clone)]
pub enum Connect {
    V3(Box<rmqtt_codec::v3::Connect>),
    V5(Box<rmqtt_codec::v5::Connect>),
}

impl Connect {
    #[inline]
    pub fn client_id(&self) -> &str {
        match self {
            Connect::V3(c) => &c.client_id,
            Connect::V5(c) => &c.client_id,
        }
    }

    #[inline]
    pub fn keep_alive(&self) -> u16 {
        match self {
            Connect::V3(c) => c.keep_alive,
            Connect::V5(c) => c.keep_alive,
        }
    }

    #[inline]
    pub fn clean_start(&self) -> bool {
        match self {
            Connect::V3(c) => c.clean_session,
            Connect::V5(c) => c.clean_start,
        }
    }

    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        match self {
            Connect::V3(_) => ProtocolVersion::MQTT3,
            Connect::V5(_) => ProtocolVersion::MQTT5,
        }
    }
}

pub struct Dispatcher<Io> {
    pub(crate) io: Framed<Io, MqttCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io: Framed::new(io, MqttCodec::Version(VersionCodec)), remote_addr, cfg }
    }

    /// Peeks the protocol level of the first CONNECT and installs the matching codec.
    ///
    /// Fails when the first packet is not a CONNECT, the level is unknown, the peer hangs up,
    /// or nothing arrives within the handshake timeout.
    #[inline]
    pub async fn mqtt(mut self) -> Result<MqttStream<Io>, MqttError> {
        let version = self.probe_version().await?;
        Ok(MqttStream { io: self.io, version, remote_addr: self.remote_addr, cfg: self.cfg })
    }

    #[inline]
    async fn probe_version(&mut self) -> Result<ProtocolVersion, MqttError> {
        let ver = match tokio::time::timeout(self.cfg.handshake_timeout, self.io.next()).await {
            Ok(Some(Ok((MqttPacket::Version(ver), _)))) => ver,
            Ok(Some(Ok(_))) | Ok(None) => return Err(MqttError::InvalidProtocol),
            Ok(Some(Err(e))) => return Err(MqttError::Decode(e)),
            Err(_) => return Err(MqttError::ReadTimeout),
        };

        let codec = match ver {
            ProtocolVersion::MQTT3 => MqttCodec::V3(CodecV3::new(self.cfg.max_packet_size)),
            ProtocolVersion::MQTT5 => {
                MqttCodec::V5(CodecV5::new(self.cfg.max_packet_size, self.cfg.max_packet_size))
            }
        };

        *self.io.codec_mut() = codec;
        Ok(ver)
    }
}

/// A framed MQTT byte stream, whatever transport sits below it.
pub struct MqttStream<Io> {
    io: Framed<Io, MqttCodec>,
    pub version: ProtocolVersion,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub fn is_v5(&self) -> bool {
        matches!(self.version, ProtocolVersion::MQTT5)
    }

    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<MqttPacket>, MqttError> {
        match tokio::time::timeout(tm, self.io.next()).await {
            Ok(Some(Ok((packet, _)))) => Ok(Some(packet)),
            Ok(Some(Err(e))) => Err(MqttError::Decode(e)),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout),
        }
    }

    /// Reads the handshake packet, anything other than a CONNECT is a protocol violation.
    #[inline]
    pub async fn recv_connect(&mut self, tm: Duration) -> Result<Connect, MqttError> {
        match self.recv(tm).await? {
            Some(MqttPacket::V3(PacketV3::Connect(c))) => Ok(Connect::V3(c)),
            Some(MqttPacket::V5(PacketV5::Connect(c))) => Ok(Connect::V5(c)),
            _ => Err(MqttError::InvalidProtocol),
        }
    }

    #[inline]
    pub async fn send(&mut self, packet: MqttPacket) -> Result<(), MqttError> {
        send(&mut self.io, packet, self.cfg.send_timeout).await
    }

    #[inline]
    pub async fn close(&mut self) -> Result<(), MqttError> {
        close(&mut self.io, self.cfg.send_timeout).await
    }

    /// Splits into independently owned write and read halves, for the send and receive loops.
    pub fn split(self) -> (MqttSink<Io>, MqttSource<Io>) {
        let (sink, stream) = self.io.split();
        (
            MqttSink { sink, send_timeout: self.cfg.send_timeout },
            MqttSource { stream, version: self.version },
        )
    }
}

pub struct MqttSink<Io> {
    sink: SplitSink<Framed<Io, MqttCodec>, MqttPacket>,
    send_timeout: Duration,
}

impl<Io> MqttSink<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub async fn send(&mut self, packet: MqttPacket) -> Result<(), MqttError> {
        send(&mut self.sink, packet, self.send_timeout).await
    }

    #[inline]
    pub async fn close(&mut self) -> Result<(), MqttError> {
        close(&mut self.sink, self.send_timeout).await
    }
}

pub struct MqttSource<Io> {
    stream: SplitStream<Framed<Io, MqttCodec>>,
    version: ProtocolVersion,
}

impl<Io> MqttSource<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Next decoded packet, `None` once the peer has closed the stream.
    #[inline]
    pub async fn next(&mut self) -> Option<Result<MqttPacket, MqttError>> {
        Some(match self.stream.next().await? {
            Ok((p @ MqttPacket::V3(_), _)) if self.version == ProtocolVersion::MQTT3 => Ok(p),
            Ok((p @ MqttPacket::V5(_), _)) if self.version == ProtocolVersion::MQTT5 => Ok(p),
            Ok(_) => Err(MqttError::Decode(DecodeError::MalformedPacket)),
            Err(e) => Err(MqttError::Decode(e)),
        })
    }
}

#[inline]
async fn send<S>(io: &mut S, packet: MqttPacket, send_timeout: Duration) -> Result<(), MqttError>
where
    S: futures::Sink<MqttPacket, Error = rmqtt_codec::error::EncodeError> + Unpin,
{
    if send_timeout.is_zero() {
        io.send(packet).await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::WriteTimeout),
        }
    }
}

#[inline]
async fn close<S>(io: &mut S, send_timeout: Duration) -> Result<(), MqttError>
where
    S: futures::Sink<MqttPacket, Error = rmqtt_codec::error::EncodeError> + Unpin,
{
    if send_timeout.is_zero() {
        io.close().await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::CloseTimeout),
        }
    }
}
