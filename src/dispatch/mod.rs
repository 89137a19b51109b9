//! Model dispatch layer.
//!
//! Program execution never runs inference itself. Every perception or
//! language call becomes a [`ModelRequest`] on one shared request channel,
//! consumed by a pool of model server threads ([`ModelServerPool`]). Each
//! worker owns exactly one reply channel, so a reply can only ever reach the
//! worker that asked for it.

pub mod breaker;
pub mod client;
pub mod message;
pub mod server;

pub use breaker::{BreakerState, CircuitBreakers};
pub use client::{DispatchClient, Dispatcher, ReplyChannel, ReplyChannelPool};
pub use message::{ModelCall, ModelId, ModelOutput, ModelReply, ModelRequest, Payload, ServerMsg};
pub use server::{FnBackend, ModelBackend, ModelRegistry, ModelServerPool};
