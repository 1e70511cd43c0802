//! Arbor overlay core logic
//!
//! This crate contains the pure state machine logic for the Arbor overlay:
//! topology arithmetic, the routing engine, message dispatch, the LL/SC
//! scratchpad service, and the small utilities they share. It is
//! completely decoupled from I/O, enabling deterministic testing.
//!
//! # Architecture
//!
//! State machines here never touch a socket and never read the clock:
//!
//! - Time is passed in as `std::time::Instant` parameters.
//! - Methods return lists of actions ([`overlay::Delivery`] and response
//!   messages) that a driver executes against real sockets.
//! - Send failures are reported back in (e.g.
//!   [`overlay::Overlay::child_send_failed`]) rather than observed
//!   directly.
//!
//! The driver lives in `arbor-broker`; everything below it can be
//! exercised in plain unit tests with a fake clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatch;
pub mod error;
pub mod fsd;
pub mod hostlist;
pub mod idset;
pub mod overlay;
pub mod scratchpad;
pub mod sync;
pub mod topology;

pub use dispatch::{MatchtagPool, Registry};
pub use error::errno;
pub use overlay::{Delivery, Overlay, OverlayConfig, SendWhere};
pub use scratchpad::Scratchpad;
pub use sync::SyncTimer;
pub use topology::Topology;
