//! Rust client for the sprite remote execution service.
//!
//! A sprite is a remote container that runs commands on demand. This crate
//! covers the execution surface: start commands over WebSocket exec
//! sessions (dedicated or multiplexed over pooled control connections),
//! stream their output, attach to detached sessions, and consume the
//! service's NDJSON streaming REST endpoints.
//!
//! ```ignore
//! use sprite::{ExecCommand, Sprite};
//!
//! let sprite = Sprite::new("https://api.sprites.dev", token, "my-sprite")?;
//! let output = sprite.run(ExecCommand::shell("echo hello")).await?;
//! assert_eq!(output.stdout_utf8(), "hello\n");
//! ```
//!
//! Wire-level types live in [`protocol`]; connection management (transport,
//! pooling, the per-process registry) lives in [`runtime`].

pub mod client;
pub mod error;
pub mod session;
pub mod stream;

pub use client::{ExecOutput, Sprite};
pub use error::{Error, Result};
pub use session::{ExecCommand, ExecEvent, ExecMode, ExecSession};
pub use stream::{EventParser, EventStream};

pub use sprite_protocol as protocol;
pub use sprite_protocol::{ApiError, ExecResponse, Frame, StreamEvent, TextSignal};
pub use sprite_runtime as runtime;
pub use sprite_runtime::{PoolRegistry, Target};
