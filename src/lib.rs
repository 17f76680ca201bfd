//! wsmux: correlated request/response multiplexing over a single WebSocket.
//!
//! This crate provides:
//! - The multiplexer handle ([`WsMux`]): issue a request with [`WsMux::send`]
//!   and await the correlated response, receive unsolicited notifications
//!   through a registered sink
//! - Envelope types for the JSON wire protocol ([`Envelope`], [`Notification`])
//! - Session-URL resolution ([`session_socket_url`])
//!
//! One driver task owns the socket; the handle is cheap to clone and safe to
//! share. Responses are matched to requests solely by identifier, never by
//! arrival order.

mod addr;
mod envelope;
mod error;
mod mux;

pub use addr::{session_socket_url, AddrError};
pub use envelope::{Envelope, Notification, Response};
pub use error::MuxError;
pub use mux::{ConnState, WsMux};
