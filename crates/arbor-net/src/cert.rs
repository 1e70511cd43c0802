//! Long-term curve certificates.
//!
//! A certificate is an ed25519 keypair with a `name` metadata field.
//! On disk it is a small key = value text file in two flavors per role:
//! `<role>` holds the public half only (world-readable is fine) and
//! `<role>_private` holds both halves and must not be group- or
//! world-readable.
//!
//! ```text
//! #   **** generated by arbor keygen ****
//! metadata
//!     name = "broker-3"
//! curve
//!     public-key = "mm...base64...="
//!     secret-key = "qq...base64...="
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::NetError;

/// An ed25519 keypair (or public half) with a name.
#[derive(Debug, Clone)]
pub struct Certificate {
    name: String,
    public: VerifyingKey,
    secret: Option<SigningKey>,
}

impl Certificate {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate(name: &str) -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        Self {
            name: name.to_string(),
            public: secret.verifying_key(),
            secret: Some(secret),
        }
    }

    /// Certificate name metadata.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The public key.
    #[must_use]
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public
    }

    /// The public key as text.
    #[must_use]
    pub fn public_txt(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// True when the secret half is present.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Sign `data` with the secret key.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, NetError> {
        let secret = self.secret.as_ref().ok_or(NetError::CertNoSecret)?;
        Ok(secret.sign(data))
    }

    /// Write `<role>` (public, 0644) and `<role>_private` (public +
    /// secret, 0600) under `dir`. Existing files are refused unless
    /// `force` is set.
    pub fn save(&self, dir: &Path, role: &str, force: bool) -> Result<(PathBuf, PathBuf), NetError> {
        let secret = self.secret.as_ref().ok_or(NetError::CertNoSecret)?;
        let public_path = dir.join(role);
        let private_path = dir.join(format!("{role}_private"));
        for path in [&public_path, &private_path] {
            if !force && path.exists() {
                return Err(NetError::CertExists(path.clone()));
            }
        }
        let public_body = format!(
            "#   **** generated by arbor keygen ****\n\
             metadata\n    name = \"{}\"\ncurve\n    public-key = \"{}\"\n",
            self.name,
            self.public_txt(),
        );
        let private_body = format!(
            "#   **** generated by arbor keygen ****\n\
             metadata\n    name = \"{}\"\ncurve\n    public-key = \"{}\"\n    secret-key = \"{}\"\n",
            self.name,
            self.public_txt(),
            BASE64.encode(secret.to_bytes()),
        );
        write_with_mode(&public_path, &public_body, 0o644, force)?;
        write_with_mode(&private_path, &private_body, 0o600, force)?;
        Ok((public_path, private_path))
    }

    /// Load a certificate file. A file carrying a secret key is refused
    /// when readable by group or other.
    pub fn load(path: &Path) -> Result<Self, NetError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NetError::CertMissing(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let body = fs::read_to_string(path)?;
        let parsed = parse_cert(path, &body)?;
        if parsed.secret.is_some() && meta.permissions().mode() & 0o044 != 0 {
            return Err(NetError::CertPermissions(path.to_path_buf()));
        }
        Ok(parsed)
    }
}

fn write_with_mode(path: &Path, body: &str, mode: u32, force: bool) -> Result<(), NetError> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).mode(mode);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    let mut file = opts.open(path)?;
    // create() does not chmod an existing file
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

fn parse_cert(path: &Path, body: &str) -> Result<Certificate, NetError> {
    let bad = |reason: &str| NetError::CertFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let mut name = None;
    let mut public = None;
    let mut secret = None;
    let mut section = "";
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            section = trimmed;
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| bad("expected key = \"value\""))?;
        let value = value.trim().trim_matches('"');
        match (section, key.trim()) {
            ("metadata", "name") => name = Some(value.to_string()),
            ("curve", "public-key") => public = Some(decode_key(path, value)?),
            ("curve", "secret-key") => secret = Some(decode_key(path, value)?),
            _ => {} // unknown fields are ignored for forward compatibility
        }
    }
    let public_bytes = public.ok_or_else(|| bad("missing public-key"))?;
    let public = VerifyingKey::from_bytes(&public_bytes)
        .map_err(|_| bad("public-key is not a valid curve point"))?;
    let secret = secret.map(|bytes| SigningKey::from_bytes(&bytes));
    if let Some(sk) = &secret {
        if sk.verifying_key() != public {
            return Err(bad("secret-key does not match public-key"));
        }
    }
    Ok(Certificate {
        name: name.unwrap_or_default(),
        public,
        secret,
    })
}

fn decode_key(path: &Path, txt: &str) -> Result<[u8; 32], NetError> {
    let bytes = BASE64.decode(txt).map_err(|_| NetError::CertFormat {
        path: path.to_path_buf(),
        reason: "key is not valid base64".to_string(),
    })?;
    bytes.try_into().map_err(|_| NetError::CertFormat {
        path: path.to_path_buf(),
        reason: "key is not 32 bytes".to_string(),
    })
}

/// Decode a public key from its text form.
pub fn pubkey_from_txt(txt: &str) -> Result<VerifyingKey, NetError> {
    let bytes = BASE64
        .decode(txt)
        .map_err(|_| NetError::AuthFailed("public key is not valid base64".to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| NetError::AuthFailed("public key is not 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| NetError::AuthFailed("public key is not a valid curve point".to_string()))
}

/// Encode a raw public key to its text form.
#[must_use]
pub fn pubkey_to_txt(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Verify a detached signature.
#[must_use]
pub fn verify(key: &VerifyingKey, data: &[u8], sig: &[u8; 64]) -> bool {
    key.verify(data, &Signature::from_bytes(sig)).is_ok()
}
