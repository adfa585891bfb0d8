use rmqtt_codec::error::{DecodeError, EncodeError};
use rmqtt_codec::v5::{DisconnectReasonCode, ToReasonCode};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    /// The first packet was not CONNECT, or CONNECT arrived twice
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("unexpected packet, {0}")]
    UnexpectedPacket(&'static str),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,
}

impl ToReasonCode for MqttError {
    fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            MqttError::Decode(DecodeError::MaxSizeExceeded) => DisconnectReasonCode::PacketTooLarge,
            MqttError::Decode(_) => DisconnectReasonCode::MalformedPacket,
            MqttError::Encode(_) => DisconnectReasonCode::ImplementationSpecificError,
            MqttError::ReadTimeout | MqttError::WriteTimeout | MqttError::CloseTimeout => {
                DisconnectReasonCode::KeepAliveTimeout
            }
            MqttError::InvalidProtocol | MqttError::UnexpectedPacket(_) => DisconnectReasonCode::ProtocolError,
            MqttError::ServiceUnavailable => DisconnectReasonCode::ServerBusy,
            MqttError::IdentifierRejected => DisconnectReasonCode::NotAuthorized,
            MqttError::UnsupportedProtocolVersion => DisconnectReasonCode::ProtocolError,
        }
    }
}
