//! The bind-side routing socket.
//!
//! One [`Router`] serves every child session. Each admitted session gets
//! a bounded outbound queue and a reader task; inbound messages from all
//! sessions merge into one ordered-per-peer stream with the peer
//! identity prepended to the route stack.
//!
//! Sends are *mandatory*: a send whose top route frame names an unknown
//! peer, or a peer whose queue is full or closed, fails with
//! [`NetError::HostUnreachable`] so the overlay can mark the child
//! disconnected instead of buffering without bound.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use arbor_proto::Message;

use crate::auth::Authorizer;
use crate::cert::Certificate;
use crate::error::NetError;
use crate::wire::{read_frame, server_handshake, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 1024;
const INBOUND_QUEUE: usize = 1024;

type PeerMap = Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// Child-facing routing socket.
pub struct Router {
    local_addr: SocketAddr,
    peers: PeerMap,
    inbound: mpsc::Receiver<Message>,
    accept_task: JoinHandle<()>,
}

impl Router {
    /// Bind and start accepting authenticated sessions. `identity` is
    /// the route identifier this broker presents to its children.
    pub async fn bind(
        addr: &str,
        cert: Certificate,
        identity: String,
        auth: Authorizer,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);

        let accept_peers = peers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tokio::spawn(session(
                    stream,
                    addr,
                    cert.clone(),
                    identity.clone(),
                    auth.clone(),
                    accept_peers.clone(),
                    inbound_tx.clone(),
                ));
            }
        });

        Ok(Self { local_addr, peers, inbound, accept_task })
    }

    /// The bound address (with wildcard ports resolved).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message: the top route frame is popped to select the
    /// outbound peer, the rest of the message travels.
    pub fn send(&self, msg: Message) -> Result<(), NetError> {
        let mut msg = msg;
        let next = msg
            .route_pop()
            .ok()
            .flatten()
            .ok_or(NetError::HostUnreachable)?;
        let peers = self.peers.read().expect("peer map lock poisoned");
        let tx = peers.get(&next).ok_or(NetError::HostUnreachable)?;
        tx.try_send(msg.encode())
            .map_err(|_| NetError::HostUnreachable)
    }

    /// Receive the next inbound message; `None` once the socket is
    /// closed. The sending peer's identity is the top route frame.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Identities of currently established sessions.
    #[must_use]
    pub fn peer_identities(&self) -> Vec<String> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn session(
    mut stream: TcpStream,
    addr: SocketAddr,
    cert: Certificate,
    identity: String,
    auth: Authorizer,
    peers: PeerMap,
    inbound: mpsc::Sender<Message>,
) {
    stream.set_nodelay(true).ok();
    let peer = match timeout(
        HANDSHAKE_TIMEOUT,
        server_handshake(&mut stream, &cert, &identity, &auth),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "session rejected");
            return;
        }
        Err(_) => {
            warn!(%addr, "session handshake timed out");
            return;
        }
    };
    debug!(%addr, identity = %peer.identity, name = peer.name.as_deref(), "session established");

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    // A reconnecting peer replaces its previous session.
    peers
        .write()
        .expect("peer map lock poisoned")
        .insert(peer.identity.clone(), tx.clone());
    let writer = tokio::spawn(writer_loop(write_half, rx));

    reader_loop(read_half, &peer.identity, &inbound).await;

    // Only unregister if a replacement session has not taken the slot.
    let mut map = peers.write().expect("peer map lock poisoned");
    if map
        .get(&peer.identity)
        .is_some_and(|cur| cur.same_channel(&tx))
    {
        map.remove(&peer.identity);
    }
    drop(map);
    writer.abort();
    debug!(identity = %peer.identity, "session ended");
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    identity: &str,
    inbound: &mpsc::Sender<Message>,
) {
    loop {
        let body = match read_frame(&mut read_half).await {
            Ok(body) => body,
            Err(NetError::Closed) => break,
            Err(e) => {
                warn!(identity, error = %e, "session read failed");
                break;
            }
        };
        // The routing hop: prepend this peer's identity.
        let mut msg = match Message::decode(&body) {
            Ok(msg) => msg,
            Err(e) => {
                // Framing keeps the stream in sync, so a malformed
                // message is dropped without dropping the peer.
                warn!(identity, error = %e, "DROP malformed message");
                continue;
            }
        };
        msg.route_enable();
        if msg.route_push(identity.to_string()).is_err() {
            continue;
        }
        if inbound.send(msg).await.is_err() {
            break; // socket owner is gone
        }
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(body) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &body).await {
            warn!(error = %e, "session write failed");
            break;
        }
    }
}
