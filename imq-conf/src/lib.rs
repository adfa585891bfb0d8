#![deny(unsafe_code)]

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use imq_persist::PersistStrategy;
use imq_utils::deserialize_duration;
use rmqtt_codec::version::ProtocolVersion;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub persist: Persist,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/imq/imq").required(false))
            .add_source(File::with_name("imq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("IMQ").prefix_separator("_").separator("__").try_parsing(true),
        );

        Self::build(builder, opts)
    }

    fn build(builder: ConfigBuilder<DefaultState>, opts: Options) -> Result<Self> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(version) = opts.mqtt_version.as_ref() {
            inner.mqtt.version.clone_from(version);
        }
        if let Some(method) = opts.persist_method {
            inner.persist.method = method;
        }
        if let Some(level) = opts.log_level {
            inner.log.level = level;
        }
        if let Some(port) = opts.tcp {
            inner.listener.tcp = port;
        }
        if let Some(port) = opts.tcps {
            inner.listener.tcps = port;
        }
        if let Some(port) = opts.ws {
            inner.listener.ws = port;
        }
        if let Some(port) = opts.wss {
            inner.listener.wss = port;
        }

        inner.mqtt.protocol_version()?;

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("mqtt version is {}, compatible: {}", cfg.mqtt.version, cfg.mqtt.compatible);
        log::info!(
            "listen on {}, tcp: {}, tcps: {}, ws: {}, wss: {}",
            cfg.listener.listen,
            cfg.listener.tcp,
            cfg.listener.tcps,
            cfg.listener.ws,
            cfg.listener.wss
        );
        log::info!("grace shutdown time is {:?}", cfg.listener.grace_shutdown_time);
        log::info!("persist method is {:?}, strategy: {:?}", cfg.persist.method, cfg.persist.strategy());
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    //Preferred protocol version, "3.1.1" or "5".
    #[serde(default = "Mqtt::version_default")]
    pub version: String,
    //Accept clients of the other protocol version too.
    #[serde(default = "Mqtt::compatible_default")]
    pub compatible: bool,
    #[serde(default = "Mqtt::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "Mqtt::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    #[serde(default = "Mqtt::max_packet_size_default")]
    pub max_packet_size: u32,
    //Server side keepalive window is keepalive * backoff * 2.
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            version: Self::version_default(),
            compatible: Self::compatible_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            max_packet_size: Self::max_packet_size_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_mqueue_len: Self::max_mqueue_len_default(),
        }
    }
}

impl Mqtt {
    fn version_default() -> String {
        "5".into()
    }
    fn compatible_default() -> bool {
        true
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn max_packet_size_default() -> u32 {
        1024 * 1024
    }
    fn keepalive_backoff_default() -> f32 {
        0.75
    }
    fn max_mqueue_len_default() -> usize {
        1000
    }

    #[inline]
    pub fn protocol_version(&self) -> Result<ProtocolVersion> {
        match self.version.trim() {
            "3.1.1" => Ok(ProtocolVersion::MQTT3),
            "5" => Ok(ProtocolVersion::MQTT5),
            other => Err(anyhow!("not supported mqtt version: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::listen_default")]
    pub listen: IpAddr,
    #[serde(default = "Listener::tcp_default")]
    pub tcp: u16,
    #[serde(default)]
    pub tcps: u16,
    #[serde(default = "Listener::ws_default")]
    pub ws: u16,
    #[serde(default)]
    pub wss: u16,
    //Connection caps per listener, 0 is unlimited.
    #[serde(default)]
    pub max_tcp: usize,
    #[serde(default)]
    pub max_tcps: usize,
    #[serde(default)]
    pub max_ws: usize,
    #[serde(default)]
    pub max_wss: usize,
    #[serde(default = "Listener::tls_cert_default")]
    pub tls_cert: String,
    #[serde(default = "Listener::tls_key_default")]
    pub tls_key: String,
    #[serde(default = "Listener::grace_shutdown_time_default", deserialize_with = "deserialize_duration")]
    pub grace_shutdown_time: Duration,
    #[serde(default = "Listener::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(default = "Listener::reuseaddr_default")]
    pub reuseaddr: bool,
}

impl Default for Listener {
    #[inline]
    fn default() -> Self {
        Self {
            listen: Self::listen_default(),
            tcp: Self::tcp_default(),
            tcps: 0,
            ws: Self::ws_default(),
            wss: 0,
            max_tcp: 0,
            max_tcps: 0,
            max_ws: 0,
            max_wss: 0,
            tls_cert: Self::tls_cert_default(),
            tls_key: Self::tls_key_default(),
            grace_shutdown_time: Self::grace_shutdown_time_default(),
            backlog: Self::backlog_default(),
            nodelay: false,
            reuseaddr: Self::reuseaddr_default(),
        }
    }
}

impl Listener {
    fn listen_default() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
    fn tcp_default() -> u16 {
        1883
    }
    fn ws_default() -> u16 {
        8083
    }
    fn tls_cert_default() -> String {
        "cred/cert".into()
    }
    fn tls_key_default() -> String {
        "cred/key".into()
    }
    fn grace_shutdown_time_default() -> Duration {
        Duration::from_secs(10)
    }
    fn backlog_default() -> i32 {
        1024
    }
    fn reuseaddr_default() -> bool {
        true
    }

    #[inline]
    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.listen, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMethod {
    #[default]
    None,
    Memory,
    File,
    Redis,
    Etcd,
}

impl FromStr for PersistMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PersistMethod::None),
            "memory" => Ok(PersistMethod::Memory),
            "file" => Ok(PersistMethod::File),
            "redis" => Ok(PersistMethod::Redis),
            "etcd" => Ok(PersistMethod::Etcd),
            _ => Err(format!("unknown persist method: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Persist {
    #[serde(default)]
    pub method: PersistMethod,
    #[serde(default = "Persist::max_count_default")]
    pub max_count: usize,
    #[serde(default)]
    pub drop_on_exceed: bool,
    #[serde(default)]
    pub duplicate_replace: bool,
    //Flush interval of the file backend, 0 writes synchronously.
    #[serde(default = "Persist::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub redis_addr: String,
    #[serde(default)]
    pub redis_auth: String,
    #[serde(default)]
    pub redis_db: u32,
    #[serde(default)]
    pub etcd_addr: String,
}

impl Default for Persist {
    #[inline]
    fn default() -> Self {
        Self {
            method: PersistMethod::None,
            max_count: Self::max_count_default(),
            drop_on_exceed: false,
            duplicate_replace: false,
            interval: Self::interval_default(),
            file_path: String::new(),
            redis_addr: String::new(),
            redis_auth: String::new(),
            redis_db: 0,
            etcd_addr: String::new(),
        }
    }
}

impl Persist {
    fn max_count_default() -> usize {
        1000
    }
    fn interval_default() -> Duration {
        Duration::from_secs(60)
    }

    #[inline]
    pub fn strategy(&self) -> PersistStrategy {
        PersistStrategy {
            max_count: self.max_count,
            drop_on_exceed: self.drop_on_exceed,
            duplicate_replace: self.duplicate_replace,
            interval: self.interval,
        }
    }
}
