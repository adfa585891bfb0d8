use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
#[cfg(not(target_os = "windows"))]
#[cfg(feature = "tls")]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(feature = "tls")]
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
#[cfg(feature = "tls")]
use rustls::{pki_types::pem::PemObject, server::WebPkiClientVerifier, ServerConfig};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(feature = "tls")]
use tokio_rustls::{server::TlsStream, TlsAcceptor};
#[cfg(feature = "ws")]
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::http::{HeaderValue, StatusCode},
};

use crate::stream::Dispatcher;
#[cfg(feature = "ws")]
use crate::ws::WsStream;
use crate::Result;

/// The only HTTP path upgraded to an MQTT WebSocket.
pub const WS_PATH: &str = "/mqtt";

/// WebSocket subprotocols accepted during the upgrade, plain and TLS flavoured.
pub const WS_SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqtts"];

/// Listener settings, also handed to every connection accepted on it.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Listener name, shows up in logs.
    pub name: String,
    pub laddr: SocketAddr,
    pub backlog: i32,
    /// TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
    /// SO_REUSEADDR on the listening socket, left untouched when `None`.
    pub reuseaddr: Option<bool>,
    /// Connection cap, 0 is unlimited.
    pub max_connections: usize,
    /// Codec frame limit in bytes.
    pub max_packet_size: u32,
    /// Keepalive multiplier, the server window is keepalive * backoff * 2. Values not above 0.5
    /// fall back to 0.75.
    pub keepalive_backoff: f32,
    /// Bound on the transport upgrade plus the first packet.
    pub handshake_timeout: Duration,
    /// Bound on a single write, zero disables it.
    pub send_timeout: Duration,
    /// Capacity of each connection's reply and delivery queues.
    pub max_mqueue_len: usize,
    /// PEM certificate chain for TLS and WSS.
    pub tls_cert: Option<String>,
    /// PEM private key for TLS and WSS.
    pub tls_key: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 1883)),
            backlog: 1024,
            nodelay: false,
            reuseaddr: Some(true),
            max_connections: 0,
            max_packet_size: 1024 * 1024,
            keepalive_backoff: 0.75,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_mqueue_len: 1000,
            tls_cert: None,
            tls_key: None,
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn keepalive_backoff(mut self, keepalive_backoff: f32) -> Self {
        self.keepalive_backoff = keepalive_backoff;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn max_mqueue_len(mut self, max_mqueue_len: usize) -> Self {
        self.max_mqueue_len = max_mqueue_len;
        self
    }

    pub fn tls_cert<N: Into<String>>(mut self, tls_cert: Option<N>) -> Self {
        self.tls_cert = tls_cert.map(|c| c.into());
        self
    }

    pub fn tls_key<N: Into<String>>(mut self, tls_key: Option<N>) -> Self {
        self.tls_key = tls_key.map(|c| c.into());
        self
    }

    /// Server side inactivity window for a client declared keepalive, `None` when disabled.
    #[inline]
    pub fn keepalive_window(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            return None;
        }
        let backoff = if self.keepalive_backoff > 0.5 { self.keepalive_backoff } else { 0.75 };
        Some(Duration::from_secs_f64(keep_alive as f64 * backoff as f64 * 2.0))
    }

    /// Binds the listening socket. Every listener starts out as plain TCP.
    pub fn bind(self) -> Result<Listener> {
        let domain = if self.laddr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        if let Some(reuse) = self.reuseaddr {
            socket.set_reuse_address(reuse)?;
        }
        socket.bind(&SockAddr::from(self.laddr)).map_err(|e| anyhow!("bind {} failed, {}", self.laddr, e))?;
        socket.listen(self.backlog)?;

        let tcp_listener = TcpListener::from_std(socket.into())?;
        let local_addr = tcp_listener.local_addr()?;
        log::debug!("{} bound to {local_addr}", self.name);
        Ok(Listener {
            typ: ListenerType::TCP,
            cfg: Arc::new(self),
            local_addr,
            tcp_listener,
            #[cfg(feature = "tls")]
            tls_acceptor: None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerType {
    TCP,
    #[cfg(feature = "tls")]
    TLS,
    #[cfg(feature = "ws")]
    WS,
    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    WSS,
}

impl ListenerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerType::TCP => "tcp",
            #[cfg(feature = "tls")]
            ListenerType::TLS => "tls",
            #[cfg(feature = "ws")]
            ListenerType::WS => "ws",
            #[cfg(feature = "tls")]
            #[cfg(feature = "ws")]
            ListenerType::WSS => "wss",
        }
    }
}

pub struct Listener {
    pub typ: ListenerType,
    pub cfg: Arc<Builder>,
    pub local_addr: SocketAddr,
    tcp_listener: TcpListener,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
}

impl Listener {
    pub fn tcp(mut self) -> Result<Self> {
        if !matches!(self.typ, ListenerType::TCP) {
            return Err(anyhow!("Converting a {} listener to tcp is not allowed.", self.typ.as_str()));
        }
        self.typ = ListenerType::TCP;
        Ok(self)
    }

    #[cfg(feature = "ws")]
    pub fn ws(mut self) -> Result<Self> {
        if matches!(self.typ, ListenerType::TCP | ListenerType::WS) {
            self.typ = ListenerType::WS;
        } else {
            return Err(anyhow!("Converting a {} listener to ws is not allowed.", self.typ.as_str()));
        }
        Ok(self)
    }

    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    pub fn wss(mut self) -> Result<Self> {
        if matches!(self.typ, ListenerType::TCP | ListenerType::WS) {
            self.typ = ListenerType::TCP;
            self = self.tls()?;
        }
        self.typ = ListenerType::WSS;
        Ok(self)
    }

    /// Loads the certificate chain and key; bad material fails here, at startup.
    #[cfg(feature = "tls")]
    pub fn tls(mut self) -> Result<Listener> {
        match self.typ {
            #[cfg(feature = "ws")]
            ListenerType::WS | ListenerType::WSS => {
                return Err(anyhow!("Converting a {} listener to tls is not allowed.", self.typ.as_str()));
            }
            ListenerType::TLS => return Ok(self),
            ListenerType::TCP => {}
        }

        let cert_file = self.cfg.tls_cert.as_ref().ok_or(anyhow!("tls cert filename is None"))?;
        let key_file = self.cfg.tls_key.as_ref().ok_or(anyhow!("tls key filename is None"))?;

        let cert_chain = rustls::pki_types::CertificateDer::pem_file_iter(cert_file)
            .map_err(|e| anyhow!("tls cert {}, {}", cert_file, e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("tls cert {}, {}", cert_file, e))?;
        let key = rustls::pki_types::PrivateKeyDer::from_pem_file(key_file)
            .map_err(|e| anyhow!("tls key {}, {}", key_file, e))?;

        let provider = Arc::new(provider::default_provider());
        let tls_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!(e))?
            .with_client_cert_verifier(WebPkiClientVerifier::no_client_auth())
            .with_single_cert(cert_chain, key)
            .map_err(|e| anyhow!(format!("bad certs/private key, {}", e)))?;

        self.tls_acceptor = Some(TlsAcceptor::from(Arc::new(tls_config)));
        self.typ = ListenerType::TLS;
        Ok(self)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        socket.set_nodelay(self.cfg.nodelay)?;
        Ok(Acceptor {
            socket,
            remote_addr,
            #[cfg(feature = "tls")]
            acceptor: self.tls_acceptor.clone(),
            cfg: self.cfg.clone(),
            typ: self.typ,
        })
    }
}

pub struct Acceptor<S> {
    pub(crate) socket: S,
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub typ: ListenerType,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub fn tcp(self) -> Result<Dispatcher<S>> {
        if matches!(self.typ, ListenerType::TCP) {
            Ok(Dispatcher::new(self.socket, self.remote_addr, self.cfg))
        } else {
            Err(anyhow!("{} listener can not accept plain tcp", self.typ.as_str()))
        }
    }

    #[inline]
    #[cfg(feature = "tls")]
    pub async fn tls(self) -> Result<Dispatcher<TlsStream<S>>> {
        if !matches!(self.typ, ListenerType::TLS) {
            return Err(anyhow!("Mismatched ListenerType"));
        }
        let remote_addr = self.remote_addr;
        let cfg = self.cfg.clone();
        let tls_s = self.tls_handshake().await?;
        Ok(Dispatcher::new(tls_s, remote_addr, cfg))
    }

    #[inline]
    #[cfg(feature = "ws")]
    pub async fn ws(self) -> Result<Dispatcher<WsStream<S>>> {
        if !matches!(self.typ, ListenerType::WS) {
            return Err(anyhow!("Mismatched ListenerType"));
        }
        let ws_s = ws_handshake(self.socket, self.cfg.handshake_timeout).await?;
        Ok(Dispatcher::new(ws_s, self.remote_addr, self.cfg))
    }

    #[inline]
    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    pub async fn wss(self) -> Result<Dispatcher<WsStream<TlsStream<S>>>> {
        if !matches!(self.typ, ListenerType::WSS) {
            return Err(anyhow!("Mismatched ListenerType"));
        }
        let remote_addr = self.remote_addr;
        let cfg = self.cfg.clone();
        let tls_s = self.tls_handshake().await?;
        let ws_s = ws_handshake(tls_s, cfg.handshake_timeout).await?;
        Ok(Dispatcher::new(ws_s, remote_addr, cfg))
    }

    #[cfg(feature = "tls")]
    async fn tls_handshake(self) -> Result<TlsStream<S>> {
        let acceptor = self.acceptor.ok_or(crate::MqttError::ServiceUnavailable)?;
        match tokio::time::timeout(self.cfg.handshake_timeout, acceptor.accept(self.socket)).await {
            Ok(Ok(tls_s)) => Ok(tls_s),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(crate::MqttError::ReadTimeout.into()),
        }
    }
}

#[cfg(feature = "ws")]
async fn ws_handshake<S>(socket: S, timeout: Duration) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, accept_hdr_async(socket, on_handshake)).await {
        Ok(Ok(ws_stream)) => Ok(WsStream::new(ws_stream)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(crate::MqttError::ReadTimeout.into()),
    }
}

#[allow(clippy::result_large_err)]
#[cfg(feature = "ws")]
fn on_handshake(req: &Request, mut response: Response) -> std::result::Result<Response, ErrorResponse> {
    if req.uri().path() != WS_PATH {
        return Err(error_response(StatusCode::NOT_FOUND, format!("No MQTT endpoint at {}", req.uri().path())));
    }

    let protocol = negotiate_subprotocol(req).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("No \"Sec-WebSocket-Protocol: {}\" in client request", WS_SUBPROTOCOLS.join("|")),
        )
    })?;
    response.headers_mut().append("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    Ok(response)
}

/// Picks the first client offered subprotocol that the broker speaks.
#[cfg(feature = "ws")]
fn negotiate_subprotocol(req: &Request) -> Option<&'static str> {
    req.headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find_map(|offered| WS_SUBPROTOCOLS.iter().find(|p| p.eq_ignore_ascii_case(offered)).copied())
}

#[cfg(feature = "ws")]
fn error_response(status: StatusCode, msg: String) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(msg));
    *resp.status_mut() = status;
    resp
}
