//! # epics-ca
//!
//! Client library core for the EPICS Channel Access network protocol: UDP
//! broadcast name resolution, per-server TCP transports, an I/O-ID request
//! multiplexer, and a pluggable monitor notification subsystem, composed
//! behind a single [`Context`](context::Context).
//!
//! Applications acquire a `Context`, create `Channel`s from it by name, and
//! drive them through `connect`/`get`/`put`/`add_value_monitor`. Everything
//! below `Context` is an implementation detail these docs describe for
//! maintainers, not application code.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod iomux;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod search;
pub mod transport;
pub mod utils;

pub use codec::{Bundle, MetaKind, Metadata, Value, ValueKind};
pub use config::Config;
pub use context::Context;
pub use error::{CaResult, Status};
pub use monitor::{Consumer, EventMask, Monitor, NotifierSpec, NotifierStrategy, QosReport};
pub use registry::{AccessRights, Channel, ChannelProperties, ConnectionState, ListenerHandle};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
