//! Broker error types.

use thiserror::Error;

use arbor_core::error::OverlayError;
use arbor_net::NetError;
use arbor_proto::ProtocolError;

/// Errors surfaced by the broker and its local handle.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Configuration is incomplete or inconsistent
    #[error("broker config: {0}")]
    Config(&'static str),

    /// Transport failure
    #[error(transparent)]
    Net(#[from] NetError),

    /// Routing failure
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// Message construction failure
    #[error(transparent)]
    Proto(#[from] ProtocolError),

    /// A service answered with an error response
    #[error("rpc error {errnum}: {message}")]
    Rpc {
        /// errno-style code from the response
        errnum: u32,
        /// free-form text, possibly empty
        message: String,
    },

    /// The broker (or the RPC response stream) has gone away
    #[error("broker is shut down")]
    Closed,

    /// The matchtag space is exhausted
    #[error("matchtag space exhausted")]
    TagsExhausted,
}

impl BrokerError {
    /// The errnum of an error response, if this is one.
    #[must_use]
    pub fn errnum(&self) -> Option<u32> {
        match self {
            BrokerError::Rpc { errnum, .. } => Some(*errnum),
            _ => None,
        }
    }
}
