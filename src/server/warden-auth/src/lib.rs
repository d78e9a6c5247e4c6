//! # Warden Auth
//!
//! Authentication for machine entities.
//!
//! ## Backends
//!
//! - **AppRole**: bootstrap identity for agents and applications. A public
//!   `role_id` plus an optional single-use `secret_id` exchange for an
//!   opaque session token carrying a policy snapshot.
//! - **Root token**: single operator token minted at initialization,
//!   validated against its stored Argon2id hash.
//!
//! All login failures collapse into one `InvalidCredentials` error so a
//! caller cannot learn which credential component failed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod approle;
pub mod backend;
pub mod context;
pub mod error;
pub mod root_token;
pub mod tokens;

pub use approle::{AppRoleBackend, RoleOptions};
pub use backend::AuthBackend;
pub use context::{AuthContext, AuthMethod};
pub use error::AuthError;
pub use root_token::RootTokenBackend;
pub use tokens::TokenStore;
