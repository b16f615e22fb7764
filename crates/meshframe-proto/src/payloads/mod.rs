//! Payload structs carried by [`crate::WireMessage`] variants.
//!
//! Field names are camelCase on the wire.

pub mod chat;
pub mod control;
pub mod envelope;
