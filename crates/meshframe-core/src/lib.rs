//! Meshframe Core
//!
//! Sans-IO state machines for an encrypted peer mesh: link lifecycle, gossip
//! membership, per-peer ratchet sessions, inbound routing and attachment
//! reassembly.
//!
//! # Architecture
//!
//! Nothing here performs I/O. Time and randomness come from an
//! [`Environment`]; the [`MeshCoordinator`] consumes [`MeshEvent`]s and
//! returns [`MeshAction`]s for a runtime to execute. The same code runs
//! under tokio in production and under a virtual clock in tests.
//!
//! ```text
//!            frames                       actions
//! runtime ───────────► route_inbound ───► MeshCoordinator ───► runtime
//!                           │
//!                  SessionRegistry (per-peer ratchet)
//!                           │
//!                   ChunkReassembler (attachments)
//! ```
//!
//! # Components
//!
//! - [`MeshCoordinator`]: dialing, gossip, tie-break, backoff, failure
//! - [`ConnectionRecord`]: one link, open timeout and ping liveness
//! - [`SessionRegistry`]: peer id → ratchet session
//! - [`route_inbound`]: decode, unwrap one envelope, classify
//! - [`ChunkReassembler`]: buffers chunks until complete and linked
//! - [`Roster`]: member table merged by device id

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod connection;
pub mod env;
pub mod error;
pub mod mesh;
pub mod metrics;
pub mod reassembly;
pub mod registry;
pub mod roster;
pub mod router;

pub use backoff::{AnchorTimeoutSchedule, BackoffConfig, ReconnectBackoff};
pub use connection::{ConnectionConfig, ConnectionRecord, LinkId};
pub use env::{EnvRng, Environment};
pub use error::{ConnectionError, ReassemblyError, RouteError, SessionError};
pub use mesh::{
    ConnectionStatus, LocalPeer, MeshAction, MeshConfig, MeshCoordinator, MeshEvent,
    should_initiate,
};
pub use metrics::{LinkMetrics, LinkQuality};
pub use reassembly::{ChunkReassembler, Reassembled};
pub use registry::{Role, SessionLookup, SessionRegistry};
pub use roster::{Member, Roster};
pub use router::{Routed, route_inbound};
