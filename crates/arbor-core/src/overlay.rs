//! The overlay routing engine: per-peer state, the upstream/downstream
//! decision table, keepalives, idle tracking, and the monitor/pause
//! services.
//!
//! # Architecture
//!
//! [`Overlay`] is a pure state machine. It owns the peer table and the
//! routing decisions but never touches a socket:
//!
//! - Methods take the current time as a parameter and return
//!   [`Delivery`] actions for the driver to execute.
//! - A failed mandatory send is reported back via
//!   [`Overlay::child_send_failed`], which is what turns transport
//!   backpressure into a disconnect.
//!
//! # Peer state machine
//!
//! ```text
//! init ──first message──> connected <──activity──> idle
//!                             │
//!        keepalive(disconnect) | mandatory-send failure | teardown
//!                             ↓
//!                        disconnected
//! ```
//!
//! A disconnected peer reconnects only by being heard from again.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use arbor_proto::{KeepaliveStatus, Message, MsgType};

use crate::{
    dispatch::RequestList,
    error::{errno, OverlayError},
    fsd,
    topology::Topology,
};

/// Where a message should travel, when the caller knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWhere {
    /// Let the overlay decide from the message contents
    Any,
    /// Toward the parent
    Upstream,
    /// Toward a child (or every child, for events)
    Downstream,
}

/// An action the driver must execute against a socket or the local
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Write to the parent (dealer) socket
    Parent(Message),
    /// Write via the bind-side routing table; the top route frame names
    /// the peer
    Child(Message),
    /// Hand to local dispatch (requests/events) or matchtag correlation
    /// (responses with an exhausted route stack)
    Local(Message),
}

/// Timing knobs for keepalives and idle detection.
#[derive(Debug, Clone, Copy)]
pub struct OverlayConfig {
    /// Soft interval of the sync tick
    pub sync_min: Duration,
    /// Hard upper bound on the sync tick interval
    pub sync_max: Duration,
    /// Send a keepalive upstream when nothing was sent for this long
    pub idle_min: Duration,
    /// Mark a child idle when nothing was heard for this long
    pub idle_max: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            sync_min: Duration::from_secs(1),
            sync_max: Duration::from_secs(5),
            idle_min: Duration::from_secs(5),
            idle_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Child {
    rank: u32,
    uuid: String,
    last_seen: Option<Instant>,
    connected: bool,
    idle: bool,
    test_pause: bool,
}

/// A snapshot of one child's liveness, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildStatus {
    /// Child rank
    pub rank: u32,
    /// Has the child been heard from (and not disconnected)?
    pub connected: bool,
    /// Is the child marked idle?
    pub idle: bool,
}

/// The routing engine for one broker.
#[derive(Debug)]
pub struct Overlay {
    topo: Topology,
    uuid: String,
    parent_uuid: Option<String>,
    cfg: OverlayConfig,
    children: Vec<Child>,
    parent_last_sent: Option<Instant>,
    monitor_requests: RequestList,
    test_backlog: Option<Vec<Message>>,
}

impl Overlay {
    /// Build the overlay for a position in the tree.
    #[must_use]
    pub fn new(topo: Topology, cfg: OverlayConfig) -> Self {
        let children = topo
            .children()
            .map(|rank| Child {
                rank,
                uuid: Topology::uuid(rank),
                last_seen: None,
                connected: false,
                idle: false,
                test_pause: false,
            })
            .collect();
        Self {
            uuid: Topology::uuid(topo.rank()),
            parent_uuid: topo.parent().map(Topology::uuid),
            topo,
            cfg,
            children,
            parent_last_sent: None,
            monitor_requests: RequestList::new(),
            test_backlog: None,
        }
    }

    /// This broker's rank.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.topo.rank()
    }

    /// This broker's route identifier.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The topology view.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Number of children in the topology.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Number of children currently connected.
    #[must_use]
    pub fn connected_child_count(&self) -> usize {
        self.children.iter().filter(|c| c.connected).count()
    }

    /// Liveness snapshot of every child.
    #[must_use]
    pub fn children_status(&self) -> Vec<ChildStatus> {
        self.children
            .iter()
            .map(|c| ChildStatus { rank: c.rank, connected: c.connected, idle: c.idle })
            .collect()
    }

    /// Number of retained streaming monitor requests.
    #[must_use]
    pub fn monitor_request_count(&self) -> usize {
        self.monitor_requests.len()
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Route a message. Returns the deliveries the driver must execute.
    pub fn sendmsg(
        &mut self,
        msg: Message,
        where_: SendWhere,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        match msg.msg_type() {
            MsgType::Request => self.send_request(msg, where_, now),
            MsgType::Response => self.send_response(msg, where_, now),
            MsgType::Event => self.send_event(msg, where_, now),
            // Keepalives travel on the parent link only.
            MsgType::Keepalive => self.send_parent(msg, now),
        }
    }

    fn send_request(
        &mut self,
        msg: Message,
        where_: SendWhere,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut msg = msg;
        let mut where_ = where_;
        if where_ == SendWhere::Any {
            let nodeid = msg.nodeid()?;
            if msg.is_upstream() && nodeid == self.rank() {
                where_ = SendWhere::Upstream;
            } else if let Some(route) = self.topo.child_route(nodeid) {
                // Push the local uuid, then the next hop, so the routing
                // socket pops the hop to pick the peer and the local uuid
                // remains as part of the source path.
                let mut cpy = msg.copy(true);
                cpy.route_enable();
                cpy.route_push(self.uuid.clone())?;
                cpy.route_push(Topology::uuid(route))?;
                msg = cpy;
                where_ = SendWhere::Downstream;
            } else {
                where_ = SendWhere::Upstream;
            }
        }
        match where_ {
            SendWhere::Upstream => self.send_parent(msg, now),
            _ => Ok(vec![Delivery::Child(msg)]),
        }
    }

    fn send_response(
        &mut self,
        msg: Message,
        where_: SendWhere,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut where_ = where_;
        if where_ == SendWhere::Any {
            if msg.route_count() == 0 {
                // The route stack is exhausted: the requester is local.
                return Ok(vec![Delivery::Local(msg)]);
            }
            let to_parent = self.rank() > 0
                && self.parent_uuid.as_deref() == msg.route_last();
            where_ = if to_parent { SendWhere::Upstream } else { SendWhere::Downstream };
        }
        match where_ {
            SendWhere::Upstream => self.send_parent(msg, now),
            _ => Ok(vec![Delivery::Child(msg)]),
        }
    }

    fn send_event(
        &mut self,
        msg: Message,
        where_: SendWhere,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        match where_ {
            SendWhere::Downstream | SendWhere::Any => Ok(self.mcast_children(&msg)),
            SendWhere::Upstream => {
                let mut msg = msg;
                if !msg.has_route() {
                    // Routing sockets require the delimiter frame.
                    msg.route_enable();
                }
                self.send_parent(msg, now)
            }
        }
    }

    fn send_parent(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        if self.parent_uuid.is_none() {
            return Err(OverlayError::HostUnreachable);
        }
        if let Some(backlog) = &mut self.test_backlog {
            backlog.push(msg);
            return Ok(Vec::new());
        }
        self.parent_last_sent = Some(now);
        Ok(vec![Delivery::Parent(msg)])
    }

    fn mcast_children(&self, msg: &Message) -> Vec<Delivery> {
        let mut out = Vec::new();
        for child in self.children.iter().filter(|c| c.connected) {
            let mut cpy = msg.copy(true);
            cpy.route_enable();
            if cpy.route_push(child.uuid.clone()).is_ok() {
                out.push(Delivery::Child(cpy));
            }
        }
        out
    }

    /// Build and send a keepalive to the parent. A root broker has no
    /// parent link and sends nothing.
    pub fn keepalive_parent(
        &mut self,
        status: KeepaliveStatus,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        if self.parent_uuid.is_none() {
            return Ok(Vec::new());
        }
        let mut msg = Message::keepalive(0, status);
        msg.route_enable();
        self.send_parent(msg, now)
    }

    /// Record a mandatory-send failure toward a child peer. The peer is
    /// marked disconnected and monitor subscribers are told.
    pub fn child_send_failed(
        &mut self,
        uuid: &str,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let Some(idx) = self.children.iter().position(|c| c.uuid == uuid) else {
            return Ok(Vec::new());
        };
        if !self.children[idx].connected {
            return Ok(Vec::new());
        }
        warn!(rank = self.children[idx].rank, "child unreachable, marking disconnected");
        self.children[idx].connected = false;
        self.monitor_update(idx, "disconnected", now)
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process a message read from the bind (child-facing) socket. The
    /// routing socket has already prepended the peer identifier.
    pub fn recv_child(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut msg = msg;
        let uuid = msg
            .route_last()
            .ok_or_else(|| OverlayError::UnknownPeer("<no route>".to_string()))?
            .to_string();
        let Some(idx) = self.children.iter().position(|c| c.uuid == uuid) else {
            return Err(OverlayError::UnknownPeer(uuid));
        };

        let mut connected = true;
        let mut test_pause = false;
        match msg.msg_type() {
            MsgType::Keepalive => {
                if let Ok((_errnum, status)) = msg.keepalive_decode() {
                    match status {
                        KeepaliveStatus::Disconnect => connected = false,
                        KeepaliveStatus::TestPause => test_pause = true,
                        KeepaliveStatus::Normal => {}
                    }
                }
            }
            MsgType::Response => {
                // The routing socket pushed the peer uuid as if this were
                // a request; a response wants the inverse: pop that hop
                // and the local uuid recorded on the way down.
                msg.route_pop()?;
                msg.route_pop()?;
            }
            _ => {}
        }

        let mut deliveries = Vec::new();
        self.children[idx].last_seen = Some(now);
        if self.children[idx].connected != connected {
            self.children[idx].connected = connected;
            let reason = if connected { "connected" } else { "disconnected" };
            debug!(rank = self.children[idx].rank, reason, "child state change");
            deliveries.extend(self.monitor_update(idx, reason, now)?);
        }
        // A test-pause notification marks the child idle immediately
        // instead of waiting for the next sync tick.
        if self.children[idx].test_pause != test_pause {
            self.children[idx].test_pause = test_pause;
            deliveries.extend(self.log_idle_children(now)?);
        }
        if msg.msg_type() != MsgType::Keepalive {
            deliveries.push(Delivery::Local(msg));
        }
        Ok(deliveries)
    }

    /// Process a message read from the parent (dealer) socket.
    pub fn recv_parent(&mut self, msg: Message) -> Vec<Delivery> {
        let mut msg = msg;
        if msg.msg_type() == MsgType::Event {
            // Hop identifiers accumulated above this broker are stale.
            msg.route_clear();
        }
        vec![Delivery::Local(msg)]
    }

    // ------------------------------------------------------------------
    // Sync tick
    // ------------------------------------------------------------------

    /// Periodic maintenance: keepalive upstream when the parent link has
    /// been quiet, and idle transitions for children.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Delivery>, OverlayError> {
        let mut out = Vec::new();
        if self.parent_uuid.is_some() {
            let quiet = match self.parent_last_sent {
                Some(t) => now.saturating_duration_since(t) > self.cfg.idle_min,
                None => true,
            };
            if quiet {
                out.extend(self.keepalive_parent(KeepaliveStatus::Normal, now)?);
            }
        }
        out.extend(self.log_idle_children(now)?);
        Ok(out)
    }

    fn log_idle_children(&mut self, now: Instant) -> Result<Vec<Delivery>, OverlayError> {
        let mut transitions: Vec<(usize, String)> = Vec::new();
        for (idx, child) in self.children.iter_mut().enumerate() {
            if !child.connected {
                continue;
            }
            let quiet = child
                .last_seen
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if quiet >= self.cfg.idle_max || child.test_pause {
                if !child.idle {
                    child.idle = true;
                    warn!(rank = child.rank, "child idle for {}", fsd::format_duration(quiet));
                    transitions
                        .push((idx, format!("idle for {}", fsd::format_duration(quiet))));
                }
            } else if child.idle {
                child.idle = false;
                warn!(rank = child.rank, "child no longer idle");
                transitions.push((idx, "no longer idle".to_string()));
            }
        }
        let mut out = Vec::new();
        for (idx, reason) in transitions {
            out.extend(self.monitor_update(idx, &reason, now)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// `overlay.monitor`: one response mirroring the child table; when
    /// the request is streaming, it is retained and receives one delta
    /// response per state transition.
    pub fn monitor_request(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        if self.children.is_empty() {
            return self.respond_error(&msg, errno::ENODATA, "no children", now);
        }
        let mut resp = Message::response_to(&msg)?;
        resp.pack(&json!({ "children": self.children_status() }))?;
        let out = self.sendmsg(resp, SendWhere::Any, now)?;
        if msg.is_streaming() {
            self.monitor_requests.push(msg);
        }
        Ok(out)
    }

    /// `overlay.pause`: test-only toggle. First call intercepts upstream
    /// sends into a backlog and tells the parent via a test-pause
    /// keepalive; second call drains the backlog in order.
    pub fn pause_request(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut out = Vec::new();
        if let Some(backlog) = self.test_backlog.take() {
            for queued in backlog {
                match self.send_parent(queued, now) {
                    Ok(d) => out.extend(d),
                    Err(e) => warn!(error = %e, "error sending a backlog message"),
                }
            }
            let resp = Message::response_to(&msg)?;
            out.extend(self.sendmsg(resp, SendWhere::Any, now)?);
        } else {
            // Tell the parent before intercepting sends, so it can mark
            // this broker idle right away.
            out.extend(self.keepalive_parent(KeepaliveStatus::TestPause, now)?);
            let resp = Message::response_to(&msg)?;
            out.extend(self.sendmsg(resp, SendWhere::Any, now)?);
            self.test_backlog = Some(Vec::new());
        }
        Ok(out)
    }

    /// `overlay.stats.get`: pending-request accounting.
    pub fn stats_request(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut resp = Message::response_to(&msg)?;
        resp.pack(&json!({"monitor-requests": self.monitor_requests.len()}))?;
        self.sendmsg(resp, SendWhere::Any, now)
    }

    /// `overlay.lspeer`: seconds since each child was heard from
    /// (`null` for a child never heard from).
    pub fn lspeer_request(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let mut peers = serde_json::Map::new();
        for child in &self.children {
            let idle = child
                .last_seen
                .map(|t| json!(now.saturating_duration_since(t).as_secs_f64()))
                .unwrap_or(serde_json::Value::Null);
            peers.insert(child.uuid.clone(), json!({ "idle": idle }));
        }
        let mut resp = Message::response_to(&msg)?;
        resp.pack(&serde_json::Value::Object(peers))?;
        self.sendmsg(resp, SendWhere::Any, now)
    }

    /// `overlay.disconnect`: drop retained monitor requests from the
    /// departing sender.
    pub fn disconnect_request(&mut self, msg: &Message) {
        let dropped = self.monitor_requests.disconnect(msg);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped monitor requests on disconnect");
        }
    }

    /// `overlay.cancel`: terminate one streaming monitor request,
    /// matched by matchtag and sender, with an ENODATA response.
    pub fn cancel_request(
        &mut self,
        msg: &Message,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        match self.monitor_requests.take_cancel(msg) {
            Some(orig) => self.respond_error(&orig, errno::ENODATA, "", now),
            None => Ok(Vec::new()),
        }
    }

    /// Service teardown: fail retained monitor requests and say goodbye
    /// to the parent.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for req in self.monitor_requests.drain() {
            if let Ok(d) = self.respond_error(&req, errno::ENOSYS, "overlay is shutting down", now)
            {
                out.extend(d);
            }
        }
        if let Ok(d) = self.keepalive_parent(KeepaliveStatus::Disconnect, now) {
            out.extend(d);
        }
        for child in &mut self.children {
            child.connected = false;
        }
        out
    }

    /// Build an error response (errnum plus optional text) and route it.
    /// NORESPONSE requests are dropped instead.
    pub fn respond_error(
        &mut self,
        req: &Message,
        errnum: u32,
        errstr: &str,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        if req.is_noresponse() {
            return Ok(Vec::new());
        }
        let mut resp = Message::response_to(req)?;
        resp.set_errnum(errnum)?;
        if !errstr.is_empty() {
            resp.set_string(errstr)?;
        }
        self.sendmsg(resp, SendWhere::Any, now)
    }

    /// Send one delta response per retained monitor request for a child
    /// state transition.
    fn monitor_update(
        &mut self,
        idx: usize,
        reason: &str,
        now: Instant,
    ) -> Result<Vec<Delivery>, OverlayError> {
        let (rank, connected, idle) = {
            let c = &self.children[idx];
            (c.rank, c.connected, c.idle)
        };
        let payload =
            json!({"rank": rank, "connected": connected, "idle": idle, "reason": reason});
        let requests: Vec<Message> = self.monitor_requests.iter().cloned().collect();
        let mut out = Vec::new();
        for req in requests {
            let mut resp = Message::response_to(&req)?;
            resp.pack(&payload)?;
            out.extend(self.sendmsg(resp, SendWhere::Any, now)?);
        }
        Ok(out)
    }
}
