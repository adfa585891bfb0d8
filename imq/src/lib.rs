#![deny(unsafe_code)]

//! MQTT v3.1.1/v5 broker core.
//!
//! A [`Supervisor`] runs one accept loop per configured [`net::Listener`]. Every accepted
//! link is served by the connection state machine in [`connection`], which shares the
//! broker wide [`ServerContext`]: the connection [`Registry`], the session store, the topic
//! router and the two in-flight persistence stores.
//!
//! ```rust,no_run
//! use imq::net::Builder;
//! use imq::{ServerContext, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> imq::Result<()> {
//!     let scx = ServerContext::new().build();
//!     let tcp = Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()).bind()?.tcp()?;
//!     Supervisor::new(scx).listener(tcp).build().run().await
//! }
//! ```

pub use imq_conf as conf;
pub use imq_net as net;
pub use imq_persist as persist;
pub use rmqtt_codec as codec;

pub use crate::context::{ServerContext, ServerContextBuilder};
pub use crate::registry::{ConnectionHandle, Registry};
pub use crate::server::{Supervisor, SupervisorBuilder};
pub use crate::types::{ConnState, Reason};

pub mod connection;
pub mod context;
pub mod logger;
pub mod packet;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod types;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
