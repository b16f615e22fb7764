//! Meshframe node runtime.
//!
//! Runs [`meshframe_core`]'s mesh coordinator under Tokio against a pluggable
//! point-to-point transport, with system time and OS randomness.
//!
//! # Architecture
//!
//! This crate is the "glue" around the Sans-IO core. The
//! [`meshframe_core::MeshCoordinator`] decides; [`Node`] executes its actions
//! (dials, sends, session setup) and feeds transport events back in. Inbound
//! frames are serialized per peer by the [`InboundDispatcher`] because they
//! mutate that peer's ratchet session; outbound fan-out goes through the
//! [`Broadcaster`], which applies per-channel backpressure.
//!
//! # Components
//!
//! - [`Node`]: Production runtime executing coordinator actions
//! - [`Channel`], [`Connector`], [`Endpoint`]: Transport boundary
//! - [`MemoryNetwork`]: In-process transport for demos and tests
//! - [`KeyDirectory`]: Identity key publication and lookup
//! - [`SystemEnv`]: Production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod config;
mod directory;
mod dispatch;
mod error;
mod memory;
mod node;
mod system_env;
mod transport;

pub use broadcast::{Broadcaster, Prepared, SendOutcome, Target, wait_for_drain};
pub use config::{
    BroadcastConfig, DEFAULT_BACKPRESSURE_LIMIT, DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_MAX_BACKLOG,
    DEFAULT_TICK_INTERVAL, NodeConfig,
};
pub use directory::{KeyDirectory, MemoryDirectory};
pub use dispatch::InboundDispatcher;
pub use error::{NodeError, TransportError};
pub use memory::MemoryNetwork;
pub use node::{Node, Notification};
pub use system_env::SystemEnv;
pub use transport::{Channel, Connector, Endpoint, IncomingLink, Link, LinkSignal};
