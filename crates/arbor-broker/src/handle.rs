//! The local client handle: request/response and streaming RPC over the
//! broker's matchtag domain.
//!
//! Handles on one broker share the broker's sender identity and matchtag
//! pool; correlation is by matchtag, which stays unique across handles.
//! Dropping a handle sends a `<service>.disconnect` to every service it
//! talked to, so retained streaming requests are cleaned up without an
//! explicit cancel.

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use arbor_proto::{Message, RoleMask};

use crate::error::BrokerError;

/// Requests from handles into the broker loop.
pub(crate) enum ApiMsg {
    /// Fire-and-forget send (NORESPONSE requests, events)
    Send(Message),
    /// Correlated request
    Rpc {
        /// The request (matchtag assigned by the loop)
        msg: Message,
        /// Retain the correlation until a terminal error response
        streaming: bool,
        /// Receives the assigned matchtag
        tag_tx: oneshot::Sender<Result<u32, BrokerError>>,
        /// Receives each response
        resp_tx: mpsc::Sender<Message>,
    },
    /// Register an event sink
    SubscribeEvents(mpsc::Sender<Message>),
    /// A handle went away; disconnect it from these (service, nodeid)
    /// pairs
    Disconnect(Vec<(String, u32)>),
    /// Stop the broker
    Shutdown(oneshot::Sender<()>),
}

/// A local client of one broker.
pub struct Handle {
    rank: u32,
    api_tx: mpsc::Sender<ApiMsg>,
    services: Mutex<HashSet<(String, u32)>>,
}

impl Handle {
    pub(crate) fn new(rank: u32, api_tx: mpsc::Sender<ApiMsg>) -> Self {
        Self { rank, api_tx, services: Mutex::new(HashSet::new()) }
    }

    /// The local broker's rank.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Issue a request expecting a single response.
    pub async fn rpc(
        &self,
        topic: &str,
        nodeid: u32,
        payload: Option<Value>,
    ) -> Result<Rpc, BrokerError> {
        self.rpc_inner(topic, nodeid, payload, false).await
    }

    /// Issue a streaming request: responses keep arriving until a
    /// terminal error (ENODATA on success).
    pub async fn rpc_streaming(
        &self,
        topic: &str,
        nodeid: u32,
        payload: Option<Value>,
    ) -> Result<Rpc, BrokerError> {
        self.rpc_inner(topic, nodeid, payload, true).await
    }

    async fn rpc_inner(
        &self,
        topic: &str,
        nodeid: u32,
        payload: Option<Value>,
        streaming: bool,
    ) -> Result<Rpc, BrokerError> {
        let mut msg = Message::request(topic);
        msg.set_nodeid(nodeid)?;
        msg.set_rolemask(RoleMask::OWNER);
        if streaming {
            msg.set_streaming();
        }
        if let Some(payload) = &payload {
            msg.pack(payload)?;
        }
        self.track_service(topic, nodeid);

        let (tag_tx, tag_rx) = oneshot::channel();
        let (resp_tx, resp_rx) = mpsc::channel(64);
        self.api_tx
            .send(ApiMsg::Rpc { msg, streaming, tag_tx, resp_tx })
            .await
            .map_err(|_| BrokerError::Closed)?;
        let matchtag = tag_rx.await.map_err(|_| BrokerError::Closed)??;
        Ok(Rpc { matchtag, rx: resp_rx })
    }

    /// Send a request that must not be answered (NORESPONSE flag), e.g.
    /// `scratchpad.sc-retry`, `scratchpad.delete`, `overlay.cancel`.
    pub async fn send_noresponse(
        &self,
        topic: &str,
        nodeid: u32,
        payload: Option<Value>,
    ) -> Result<(), BrokerError> {
        let mut msg = Message::request(topic);
        msg.set_nodeid(nodeid)?;
        msg.set_rolemask(RoleMask::OWNER);
        msg.set_noresponse();
        if let Some(payload) = &payload {
            msg.pack(payload)?;
        }
        self.track_service(topic, nodeid);
        self.api_tx
            .send(ApiMsg::Send(msg))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Publish an event into the overlay.
    pub async fn publish(&self, topic: &str, payload: Option<Value>) -> Result<(), BrokerError> {
        let mut msg = Message::event(topic);
        msg.set_rolemask(RoleMask::OWNER);
        if let Some(payload) = &payload {
            msg.pack(payload)?;
        }
        self.api_tx
            .send(ApiMsg::Send(msg))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Subscribe to events delivered to this broker.
    pub async fn events(&self) -> Result<mpsc::Receiver<Message>, BrokerError> {
        let (tx, rx) = mpsc::channel(64);
        self.api_tx
            .send(ApiMsg::SubscribeEvents(tx))
            .await
            .map_err(|_| BrokerError::Closed)?;
        Ok(rx)
    }

    fn track_service(&self, topic: &str, nodeid: u32) {
        let service = topic.split('.').next().unwrap_or(topic).to_string();
        self.services
            .lock()
            .expect("service set lock poisoned")
            .insert((service, nodeid));
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let services: Vec<_> = self
            .services
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if !services.is_empty() {
            // Best effort; the loop may already be gone.
            let _ = self.api_tx.try_send(ApiMsg::Disconnect(services));
        }
    }
}

/// One in-flight RPC: a stream of responses correlated by matchtag.
pub struct Rpc {
    matchtag: u32,
    rx: mpsc::Receiver<Message>,
}

impl Rpc {
    /// The matchtag correlating this RPC (needed by retry protocols
    /// like `scratchpad.sc-retry`).
    #[must_use]
    pub fn matchtag(&self) -> u32 {
        self.matchtag
    }

    /// Await the next response. Success responses yield their payload
    /// (`None` for an empty response). Error responses, including the
    /// ENODATA stream terminator, come back as [`BrokerError::Rpc`].
    pub async fn recv(&mut self) -> Result<Option<Value>, BrokerError> {
        let msg = self.rx.recv().await.ok_or(BrokerError::Closed)?;
        let errnum = msg.errnum()?;
        if errnum != 0 {
            let message = msg.get_string().unwrap_or_default().to_string();
            return Err(BrokerError::Rpc { errnum, message });
        }
        if msg.has_payload() {
            Ok(Some(msg.unpack()?))
        } else {
            Ok(None)
        }
    }
}
