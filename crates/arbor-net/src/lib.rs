//! Authenticated transport for the Arbor overlay.
//!
//! A broker owns at most one [`Router`] (bind side, child-facing) and at
//! most one [`Dealer`] (connect side, parent-facing). Sessions are
//! admitted by mutual challenge/response over long-term curve keypairs
//! ([`Certificate`]); the bind side additionally consults the
//! per-context [`Authorizer`], which owns the in-memory certificate
//! store.
//!
//! Receive semantics mirror the routing-socket model: a message read
//! from a [`Router`] has the peer's identity prepended to its route
//! stack (a routing hop, not a cryptographic signature); a message read
//! from a [`Dealer`] is untouched. A [`Router`] send pops the top route
//! frame to select the outbound peer and fails with
//! [`NetError::HostUnreachable`] when the peer is unknown or its queue
//! is full (mandatory routing).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cert;
pub mod dealer;
pub mod error;
pub mod router;
mod wire;

pub use auth::{Authorizer, Context, Verdict};
pub use cert::Certificate;
pub use dealer::Dealer;
pub use error::NetError;
pub use router::Router;
