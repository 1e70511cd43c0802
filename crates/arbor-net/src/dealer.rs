//! The connect-side socket: one authenticated session to the parent.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use arbor_proto::Message;

use crate::cert::{pubkey_from_txt, Certificate};
use crate::error::NetError;
use crate::wire::{client_handshake, read_frame, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE: usize = 1024;

/// Parent-facing socket.
#[derive(Debug)]
pub struct Dealer {
    tx: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Message>,
    server_identity: String,
    reader_task: JoinHandle<()>,
}

impl Dealer {
    /// Connect to the parent, authenticate, and expect the parent to
    /// present `server_pubkey_txt`.
    pub async fn connect(
        addr: &str,
        cert: Certificate,
        identity: String,
        server_pubkey_txt: &str,
    ) -> Result<Self, NetError> {
        let server_key = pubkey_from_txt(server_pubkey_txt)?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let server = timeout(
            HANDSHAKE_TIMEOUT,
            client_handshake(&mut stream, &cert, &identity, &server_key),
        )
        .await
        .map_err(|_| NetError::Handshake("handshake timed out".to_string()))??;
        debug!(addr, server = %server.identity, "parent session established");

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut out_rx) = mpsc::channel::<Vec<u8>>(QUEUE);
        let (inbound_tx, inbound) = mpsc::channel::<Message>(QUEUE);

        tokio::spawn(async move {
            while let Some(body) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &body).await {
                    warn!(error = %e, "parent write failed");
                    break;
                }
            }
        });
        let reader_task = tokio::spawn(async move {
            loop {
                let body = match read_frame(&mut read_half).await {
                    Ok(body) => body,
                    Err(NetError::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "parent read failed");
                        break;
                    }
                };
                match Message::decode(&body) {
                    Ok(msg) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "DROP malformed message"),
                }
            }
        });

        Ok(Self {
            tx,
            inbound,
            server_identity: server.identity,
            reader_task,
        })
    }

    /// The parent's route identifier, as presented during the handshake.
    #[must_use]
    pub fn server_identity(&self) -> &str {
        &self.server_identity
    }

    /// Send a message to the parent. Waits for queue capacity; fails
    /// once the session is gone.
    pub async fn send(&self, msg: &Message) -> Result<(), NetError> {
        self.tx
            .send(msg.encode())
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Receive the next message from the parent; `None` once the
    /// session is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }
}

impl Drop for Dealer {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use arbor_proto::MsgType;

    use crate::auth::Context;
    use crate::router::Router;

    use super::*;

    async fn bound_router(parent: &Certificate) -> (Router, crate::auth::Authorizer) {
        let ctx = Context::new();
        let auth = ctx.enable_auth().unwrap();
        let router = Router::bind("127.0.0.1:0", parent.clone(), "0".to_string(), auth.clone())
            .await
            .unwrap();
        (router, auth)
    }

    #[tokio::test]
    async fn authenticated_round_trip() {
        let parent = Certificate::generate("rank0");
        let child = Certificate::generate("rank1");
        let (mut router, auth) = bound_router(&parent).await;
        auth.authorize("rank1", &child.public_txt()).unwrap();

        let addr = router.local_addr().to_string();
        let mut dealer = Dealer::connect(&addr, child, "1".to_string(), &parent.public_txt())
            .await
            .unwrap();
        assert_eq!(dealer.server_identity(), "0");

        // Upstream: the router prepends the sender identity.
        let mut req = Message::request("svc.ping");
        req.set_matchtag(7).unwrap();
        dealer.send(&req).await.unwrap();
        let got = router.recv().await.unwrap();
        assert_eq!(got.route_last(), Some("1"));
        assert_eq!(got.topic().unwrap(), "svc.ping");

        // Downstream: the top route frame selects the peer and is
        // stripped in transit.
        let mut resp = Message::response_to(&got).unwrap();
        resp.set_errnum(0).unwrap();
        router.send(resp).unwrap();
        let got = dealer.recv().await.unwrap();
        assert_eq!(got.msg_type(), MsgType::Response);
        assert_eq!(got.matchtag().unwrap(), 7);
        assert_eq!(got.route_count(), 0);
    }

    #[tokio::test]
    async fn unauthorized_peer_rejected() {
        let parent = Certificate::generate("rank0");
        let stranger = Certificate::generate("stranger");
        let (router, _auth) = bound_router(&parent).await;

        let addr = router.local_addr().to_string();
        let err = Dealer::connect(&addr, stranger, "9".to_string(), &parent.public_txt())
            .await
            .unwrap_err();
        match err {
            NetError::AuthFailed(reason) => assert!(reason.contains("No access")),
            other => panic!("expected auth failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn server_key_mismatch_rejected() {
        let parent = Certificate::generate("rank0");
        let child = Certificate::generate("rank1");
        let imposter = Certificate::generate("imposter");
        let (router, auth) = bound_router(&parent).await;
        auth.authorize("rank1", &child.public_txt()).unwrap();

        let addr = router.local_addr().to_string();
        let err = Dealer::connect(&addr, child, "1".to_string(), &imposter.public_txt())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn mandatory_send_to_unknown_peer_fails() {
        let parent = Certificate::generate("rank0");
        let (router, _auth) = bound_router(&parent).await;

        let mut msg = Message::request("x.y");
        msg.route_enable();
        msg.route_push("99").unwrap();
        assert!(matches!(router.send(msg), Err(NetError::HostUnreachable)));

        // No route stack at all is just as unreachable.
        let msg = Message::request("x.y");
        assert!(matches!(router.send(msg), Err(NetError::HostUnreachable)));
    }
}
