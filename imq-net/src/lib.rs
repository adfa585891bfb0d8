#![deny(unsafe_code)]

//! Transport layer of the broker.
//!
//! A [`Builder`] binds a listening socket and turns it into a [`Listener`] of one of four
//! kinds (tcp, tls, ws, wss). Each accepted socket becomes an [`Acceptor`], which performs
//! the TLS and/or WebSocket handshakes and yields a [`Dispatcher`]. The dispatcher probes
//! the MQTT protocol version from the first CONNECT and returns an [`MqttStream`], the
//! single framed byte stream every transport converges on.

mod builder;
mod error;
mod stream;
#[cfg(feature = "ws")]
mod ws;

pub use builder::{Acceptor, Builder, Listener, ListenerType, WS_PATH, WS_SUBPROTOCOLS};
pub use error::MqttError;
pub use stream::{Connect, Dispatcher, MqttSink, MqttSource, MqttStream};
#[cfg(feature = "ws")]
pub use ws::WsStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
