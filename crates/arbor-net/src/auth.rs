//! Session authorization: the certificate store and its single
//! per-context responder.
//!
//! The transport library underneath the original design permits exactly
//! one authentication responder per context, so [`Context`] models that
//! lifecycle explicitly: the [`Authorizer`] is created lazily by the
//! first bind and a second enable fails cleanly instead of trampling
//! the first.
//!
//! Peers are admitted by explicit [`Authorizer::authorize`] calls made
//! before inbound sessions arrive. Verdicts keep the classic status
//! shape: `200 OK` with user id = public key text, or `400 No access`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::cert::pubkey_from_txt;
use crate::error::NetError;

/// The authentication mechanism this fabric speaks.
pub const MECHANISM: &str = "CURVE";

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Was the peer admitted?
    pub allowed: bool,
    /// Status code, `"200"` or `"400"`
    pub status: &'static str,
    /// Status text, `"OK"` or `"No access"`
    pub text: &'static str,
    /// User id assigned to the session (public key text when allowed)
    pub user_id: String,
    /// Role name recorded at authorization time
    pub name: Option<String>,
}

#[derive(Debug, Default)]
struct CertStore {
    // public key text -> role name
    by_key: HashMap<String, String>,
}

/// A transport context: owner of the one-per-context authorizer.
#[derive(Debug, Default)]
pub struct Context {
    auth: Mutex<Option<Authorizer>>,
}

impl Context {
    /// A fresh context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enable the authorizer. Fails if it is already enabled.
    pub fn enable_auth(&self) -> Result<Authorizer, NetError> {
        let mut slot = self.auth.lock().expect("authorizer lock poisoned");
        if slot.is_some() {
            return Err(NetError::AuthAlreadyEnabled);
        }
        let auth = Authorizer {
            store: Arc::new(RwLock::new(CertStore::default())),
        };
        *slot = Some(auth.clone());
        Ok(auth)
    }

    /// The enabled authorizer, if any.
    #[must_use]
    pub fn authorizer(&self) -> Option<Authorizer> {
        self.auth.lock().expect("authorizer lock poisoned").clone()
    }
}

/// Handle to the per-context certificate store and verdict logic.
#[derive(Debug, Clone)]
pub struct Authorizer {
    store: Arc<RwLock<CertStore>>,
}

impl Authorizer {
    /// Insert a peer's public key into the store under a role name.
    /// Must happen before that peer's session arrives.
    pub fn authorize(&self, name: &str, pubkey_txt: &str) -> Result<(), NetError> {
        pubkey_from_txt(pubkey_txt)?;
        let mut store = self.store.write().expect("cert store lock poisoned");
        store.by_key.insert(pubkey_txt.to_string(), name.to_string());
        Ok(())
    }

    /// Remove a peer's public key; returns whether it was present.
    pub fn deauthorize(&self, pubkey_txt: &str) -> bool {
        let mut store = self.store.write().expect("cert store lock poisoned");
        store.by_key.remove(pubkey_txt).is_some()
    }

    /// Decide whether a session presenting `pubkey_txt` via `mechanism`
    /// may proceed.
    #[must_use]
    pub fn check(&self, mechanism: &str, pubkey_txt: &str) -> Verdict {
        if mechanism != MECHANISM {
            warn!(mechanism, "auth request with unexpected mechanism");
            return Verdict {
                allowed: false,
                status: "400",
                text: "No access",
                user_id: String::new(),
                name: None,
            };
        }
        let store = self.store.read().expect("cert store lock poisoned");
        let verdict = match store.by_key.get(pubkey_txt) {
            Some(name) => Verdict {
                allowed: true,
                status: "200",
                text: "OK",
                user_id: pubkey_txt.to_string(),
                name: Some(name.clone()),
            },
            None => Verdict {
                allowed: false,
                status: "400",
                text: "No access",
                user_id: String::new(),
                name: None,
            },
        };
        info!(
            name = verdict.name.as_deref().unwrap_or("unknown"),
            status = verdict.text,
            "overlay auth"
        );
        verdict
    }
}
