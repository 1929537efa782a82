//! Wire types for the sprite execution protocol.
//!
//! This crate contains the serde-serializable types and codecs used for
//! communication with a sprite runtime: the binary data framing that carries
//! stdin/stdout/stderr/exit over an exec connection, the `control:` JSON
//! envelope that multiplexes operations over a shared connection, the
//! normalized stream events produced by NDJSON endpoints, and the structured
//! API error shape.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No I/O, no behavior beyond encoding/decoding
//! * 1:1 with protocol: Match the shapes as they appear on the wire
//! * Total on decode: any inbound bytes map to a value, never an error
//!
//! Higher-level ergonomic APIs are built on top of these types in
//! `sprite-rs`.

pub mod api_error;
pub mod control;
pub mod event;
pub mod frame;
pub mod rest;

pub use api_error::*;
pub use control::*;
pub use event::*;
pub use frame::*;
pub use rest::*;
