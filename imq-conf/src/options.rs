use structopt::StructOpt;

use crate::logging::Level;
use crate::PersistMethod;

/// Command line values, each one overrides the matching configuration key.
#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "imq", about = "Message queue for IoT, an MQTT v3.1.1/v5 broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long = "cfg")]
    pub cfg_name: Option<String>,

    /// Preferred MQTT version, "3.1.1" or "5"
    #[structopt(name = "mqtt-version", long)]
    pub mqtt_version: Option<String>,

    /// Persistence backend, none|memory|file
    #[structopt(name = "persist-method", long)]
    pub persist_method: Option<PersistMethod>,

    /// Log level, trace|debug|info|warn|error|critical
    #[structopt(name = "log-level", long)]
    pub log_level: Option<Level>,

    /// Plain TCP port, 0 disables it
    #[structopt(name = "tcp", long)]
    pub tcp: Option<u16>,

    /// TLS TCP port, 0 disables it
    #[structopt(name = "tcps", long)]
    pub tcps: Option<u16>,

    /// WebSocket port, 0 disables it
    #[structopt(name = "ws", long)]
    pub ws: Option<u16>,

    /// TLS WebSocket port, 0 disables it
    #[structopt(name = "wss", long)]
    pub wss: Option<u16>,
}
