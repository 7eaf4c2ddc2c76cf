//! # hola-common
//!
//! Shared types for the HoLA host agent.
//!
//! This crate holds the parts of the agent that clients and the daemon agree on:
//! - The WebSocket message envelope and payload shapes
//! - Stream kinds and their subscription keys
//! - Container identifiers
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod protocol;

pub use error::{HolaError, HolaResult};
pub use id::ContainerId;
pub use protocol::{Envelope, ErrorCode, MessageType, StreamKind};
