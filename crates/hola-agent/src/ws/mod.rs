//! WebSocket subscription endpoint.
//!
//! Each upgraded socket gets a [`ConnectionHandle`] (the single outbound
//! queue), a [`Session`] (the subscription registry) and a writer task. The
//! read loop in [`serve_socket`] feeds client frames to the session.

mod connection;
mod session;
mod socket;

pub use connection::{ConnectionHandle, SendError};
pub use session::{Finished, Session};
pub use socket::{OUTBOUND_CAPACITY, serve_socket};
