//! Session wire plumbing: length-prefixed frames and the mutual
//! challenge/response handshake.
//!
//! Handshake sequence (all frames length-prefixed):
//!
//! ```text
//! both:    greeting = [magic "ARBR", version, nonce(32)]
//! client:  auth     = [id_len, identity, pubkey(32), sig(64)]
//! server:  status   = [0x00] | [0x01, reason...]
//! server:  auth     = [id_len, identity, pubkey(32), sig(64)]
//! ```
//!
//! Each side signs the *peer's* nonce under a fixed domain string, so a
//! signature cannot be replayed into another session. The server admits
//! the client by authorizer verdict; the client requires the server key
//! to equal the configured parent key. A greeting with the wrong magic
//! or version closes the connection.

use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::auth::{Authorizer, MECHANISM};
use crate::cert::{pubkey_to_txt, verify, Certificate};
use crate::error::NetError;

pub(crate) const FRAME_MAX: usize = 16 * 1024 * 1024;

const GREETING_MAGIC: &[u8; 4] = b"ARBR";
const GREETING_VERSION: u8 = 1;
const AUTH_DOMAIN: &[u8] = b"arbor-curve-v1:";

const STATUS_OK: u8 = 0x00;
const STATUS_DENIED: u8 = 0x01;

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    body: &[u8],
) -> Result<(), NetError> {
    if body.len() > FRAME_MAX {
        return Err(NetError::Handshake("frame too large".to_string()));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>, NetError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => NetError::Closed,
        _ => NetError::Io(e),
    })?;
    let len = u32::from_be_bytes(len) as usize;
    if len > FRAME_MAX {
        return Err(NetError::Handshake("oversized frame".to_string()));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

/// The authenticated peer at the other end of a session.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub identity: String,
    pub pubkey_txt: String,
    pub name: Option<String>,
}

fn greeting(nonce: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 32);
    out.extend_from_slice(GREETING_MAGIC);
    out.push(GREETING_VERSION);
    out.extend_from_slice(nonce);
    out
}

fn parse_greeting(frame: &[u8]) -> Result<[u8; 32], NetError> {
    if frame.len() != 4 + 1 + 32 || &frame[..4] != GREETING_MAGIC {
        return Err(NetError::Handshake("bad greeting magic".to_string()));
    }
    if frame[4] != GREETING_VERSION {
        return Err(NetError::Handshake(format!(
            "unsupported session version {}",
            frame[4]
        )));
    }
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&frame[5..]);
    Ok(nonce)
}

fn auth_frame(cert: &Certificate, identity: &str, peer_nonce: &[u8; 32]) -> Result<Vec<u8>, NetError> {
    if identity.is_empty() || identity.len() > u8::MAX as usize {
        return Err(NetError::Handshake("bad identity length".to_string()));
    }
    let mut challenge = AUTH_DOMAIN.to_vec();
    challenge.extend_from_slice(peer_nonce);
    let sig = cert.sign(&challenge)?;
    let mut out = Vec::with_capacity(1 + identity.len() + 32 + 64);
    out.push(identity.len() as u8);
    out.extend_from_slice(identity.as_bytes());
    out.extend_from_slice(cert.public_key().as_bytes());
    out.extend_from_slice(&sig.to_bytes());
    Ok(out)
}

fn parse_auth_frame(
    frame: &[u8],
    own_nonce: &[u8; 32],
) -> Result<(String, VerifyingKey), NetError> {
    let bad = |m: &str| NetError::Handshake(m.to_string());
    let id_len = *frame.first().ok_or_else(|| bad("empty auth frame"))? as usize;
    if frame.len() != 1 + id_len + 32 + 64 || id_len == 0 {
        return Err(bad("malformed auth frame"));
    }
    let identity = std::str::from_utf8(&frame[1..1 + id_len])
        .map_err(|_| bad("identity is not utf8"))?
        .to_string();
    let key_bytes: [u8; 32] = frame[1 + id_len..1 + id_len + 32]
        .try_into()
        .expect("slice length checked");
    let sig: [u8; 64] = frame[1 + id_len + 32..]
        .try_into()
        .expect("slice length checked");
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| bad("peer key is not a valid curve point"))?;
    let mut challenge = AUTH_DOMAIN.to_vec();
    challenge.extend_from_slice(own_nonce);
    if !verify(&key, &challenge, &sig) {
        return Err(NetError::AuthFailed("bad signature".to_string()));
    }
    Ok((identity, key))
}

/// Server side of the session handshake (bind socket).
pub(crate) async fn server_handshake(
    stream: &mut TcpStream,
    cert: &Certificate,
    identity: &str,
    auth: &Authorizer,
) -> Result<PeerInfo, NetError> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    write_frame(stream, &greeting(&nonce)).await?;
    let peer_nonce = parse_greeting(&read_frame(stream).await?)?;

    let (peer_identity, peer_key) = parse_auth_frame(&read_frame(stream).await?, &nonce)?;
    let verdict = auth.check(MECHANISM, &pubkey_to_txt(&peer_key));
    if !verdict.allowed {
        let mut status = vec![STATUS_DENIED];
        status.extend_from_slice(verdict.text.as_bytes());
        write_frame(stream, &status).await?;
        return Err(NetError::AuthFailed(format!(
            "{} {}",
            verdict.status, verdict.text
        )));
    }
    write_frame(stream, &[STATUS_OK]).await?;
    write_frame(stream, &auth_frame(cert, identity, &peer_nonce)?).await?;
    Ok(PeerInfo {
        identity: peer_identity,
        pubkey_txt: verdict.user_id,
        name: verdict.name,
    })
}

/// Client side of the session handshake (connect socket).
pub(crate) async fn client_handshake(
    stream: &mut TcpStream,
    cert: &Certificate,
    identity: &str,
    server_key: &VerifyingKey,
) -> Result<PeerInfo, NetError> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    write_frame(stream, &greeting(&nonce)).await?;
    let peer_nonce = parse_greeting(&read_frame(stream).await?)?;

    write_frame(stream, &auth_frame(cert, identity, &peer_nonce)?).await?;
    let status = read_frame(stream).await?;
    match status.first() {
        Some(&STATUS_OK) => {}
        Some(&STATUS_DENIED) => {
            let reason = String::from_utf8_lossy(&status[1..]).to_string();
            return Err(NetError::AuthFailed(reason));
        }
        _ => return Err(NetError::Handshake("bad status frame".to_string())),
    }
    let (server_identity, presented_key) = parse_auth_frame(&read_frame(stream).await?, &nonce)?;
    if &presented_key != server_key {
        return Err(NetError::AuthFailed("server key mismatch".to_string()));
    }
    Ok(PeerInfo {
        identity: server_identity,
        pubkey_txt: pubkey_to_txt(&presented_key),
        name: None,
    })
}
