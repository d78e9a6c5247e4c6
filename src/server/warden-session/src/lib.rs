//! # Warden Session
//!
//! The agent ↔ core channel: persistent, mutually authenticated,
//! full-duplex sessions carrying length-delimited CBOR frames.
//!
//! Agents bootstrap over a server-authenticated listener (AppRole login,
//! then CSR submission under the session token), then reconnect to the
//! mTLS listener with their issued client certificate. Requests are
//! handled in parallel and matched to responses by correlation reference;
//! the server pushes rotation, policy, certificate-expiry and lease
//! notifications over the same stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod notify;
pub mod proto;
pub mod server;
pub mod tls;

pub use error::SessionError;
pub use notify::{Notification, NotificationHub};
pub use server::{
    start, ListenerTls, RunningSessionServer, SessionConfig, SessionEngines,
};
