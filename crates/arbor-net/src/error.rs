//! Transport error types.

use std::path::PathBuf;

use thiserror::Error;

use arbor_proto::ProtocolError;

/// Errors produced by the transport layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// Peer identity is unknown or its outbound queue is unavailable
    #[error("no route to host")]
    HostUnreachable,

    /// Session handshake failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer was not admitted by the authorizer
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The per-context authorizer was already enabled
    #[error("authorizer is already enabled for this context")]
    AuthAlreadyEnabled,

    /// Certificate file could not be parsed
    #[error("{path}: invalid certificate: {reason}")]
    CertFormat {
        /// Offending file
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Private certificate file is readable by group or other
    #[error("{0}: readable by group/other")]
    CertPermissions(PathBuf),

    /// Certificate file does not exist
    #[error("{0}: not found (have you run keygen?)")]
    CertMissing(PathBuf),

    /// Refusing to overwrite an existing certificate without force
    #[error("{0}: already exists (use force to overwrite)")]
    CertExists(PathBuf),

    /// Operation requires the secret key but the certificate is
    /// public-only
    #[error("certificate has no secret key")]
    CertNoSecret,

    /// The session is closed
    #[error("connection closed")]
    Closed,

    /// Wire message codec failure
    #[error(transparent)]
    Proto(#[from] ProtocolError),

    /// Underlying socket failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
