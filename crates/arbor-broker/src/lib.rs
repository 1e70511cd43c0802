//! The Arbor broker: the driver that binds the transport to the core
//! state machines.
//!
//! One [`Broker`] runs one event loop task. Socket readers and the
//! sync tick feed it; all overlay,
//! dispatch, and scratchpad state is touched only from that task, so
//! the core stays single-threaded cooperative.
//!
//! Local clients talk to the broker through a [`Handle`]:
//!
//! ```no_run
//! # use arbor_broker::{Broker, BrokerConfig};
//! # use serde_json::json;
//! # async fn demo(broker: Broker) -> Result<(), Box<dyn std::error::Error>> {
//! let handle = broker.handle();
//! let mut rpc = handle
//!     .rpc("scratchpad.ll", 0, Some(json!({"key": "jobs"})))
//!     .await?;
//! let entry = rpc.recv().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod config;
mod error;
mod handle;

pub use broker::Broker;
pub use config::{AuthorizedPeer, BrokerConfig};
pub use error::BrokerError;
pub use handle::{Handle, Rpc};
