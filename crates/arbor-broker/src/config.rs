//! Broker configuration.

use arbor_core::overlay::OverlayConfig;
use arbor_net::Certificate;

/// A peer admitted to connect: role name plus public key text.
#[derive(Debug, Clone)]
pub struct AuthorizedPeer {
    /// Role name recorded in the certificate store
    pub name: String,
    /// Public key text
    pub pubkey: String,
}

/// Everything a broker is handed at startup.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// This broker's rank in `[0, size)`
    pub rank: u32,
    /// Total number of ranks
    pub size: u32,
    /// Tree arity
    pub arity: u32,
    /// Long-term keypair (must carry the secret half)
    pub cert: Certificate,
    /// Bind address for the child-facing socket; required when the
    /// topology gives this rank children
    pub bind_addr: Option<String>,
    /// Parent address; required when rank > 0
    pub parent_addr: Option<String>,
    /// Parent public key text; required when rank > 0
    pub parent_pubkey: Option<String>,
    /// Peers allowed to establish inbound sessions
    pub authorized_peers: Vec<AuthorizedPeer>,
    /// Keepalive and idle-detection timing
    pub overlay: OverlayConfig,
    /// Attempts to reach the parent before giving up (the parent may
    /// still be binding)
    pub connect_attempts: u32,
    /// Shut down on SIGINT (off by default; tests run many brokers per
    /// process)
    pub catch_sigint: bool,
}

impl BrokerConfig {
    /// A configuration with standard timing for `rank` of `size` with
    /// the given arity.
    #[must_use]
    pub fn new(rank: u32, size: u32, arity: u32, cert: Certificate) -> Self {
        Self {
            rank,
            size,
            arity,
            cert,
            bind_addr: None,
            parent_addr: None,
            parent_pubkey: None,
            authorized_peers: Vec::new(),
            overlay: OverlayConfig::default(),
            connect_attempts: 20,
            catch_sigint: false,
        }
    }
}
