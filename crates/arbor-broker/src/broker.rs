//! The broker: startup wiring and the event loop.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use arbor_core::{
    dispatch::{MatchtagPool, Registry, RouteOutcome},
    error::errno,
    overlay::{Delivery, Overlay, SendWhere},
    scratchpad::Scratchpad,
    sync::SyncTimer,
    topology::Topology,
};
use arbor_net::{Certificate, Context, Dealer, NetError, Router};
use arbor_proto::{Message, MsgType, RoleMask, TypeMask, NODEID_ANY};

use crate::{
    config::BrokerConfig,
    error::BrokerError,
    handle::{ApiMsg, Handle},
};

/// Handlers wired into the dispatch registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Svc {
    OverlayMonitor,
    OverlayPause,
    OverlayStats,
    OverlayLspeer,
    OverlayDisconnect,
    OverlayCancel,
    SpLl,
    SpSc,
    SpScStream,
    SpScRetry,
    SpDelete,
    SpDisconnect,
}

fn build_registry() -> Registry<Svc> {
    let mut reg = Registry::new();
    let req = TypeMask::REQUEST;
    reg.add(req, "overlay.monitor", RoleMask::NONE, Svc::OverlayMonitor);
    reg.add(req, "overlay.pause", RoleMask::NONE, Svc::OverlayPause);
    reg.add(req, "overlay.stats.get", RoleMask::NONE, Svc::OverlayStats);
    reg.add(req, "overlay.lspeer", RoleMask::NONE, Svc::OverlayLspeer);
    reg.add(req, "overlay.disconnect", RoleMask::NONE, Svc::OverlayDisconnect);
    reg.add(req, "overlay.cancel", RoleMask::NONE, Svc::OverlayCancel);
    reg.add(req, "scratchpad.ll", RoleMask::USER, Svc::SpLl);
    reg.add(req, "scratchpad.sc", RoleMask::NONE, Svc::SpSc);
    reg.add(req, "scratchpad.sc-stream", RoleMask::NONE, Svc::SpScStream);
    reg.add(req, "scratchpad.sc-retry", RoleMask::NONE, Svc::SpScRetry);
    reg.add(req, "scratchpad.delete", RoleMask::NONE, Svc::SpDelete);
    reg.add(req, "scratchpad.disconnect", RoleMask::NONE, Svc::SpDisconnect);
    reg
}

/// One broker process: sockets, core state machines, and the loop task.
pub struct Broker {
    rank: u32,
    pubkey: String,
    bind_addr: Option<SocketAddr>,
    api_tx: mpsc::Sender<ApiMsg>,
    loop_task: JoinHandle<()>,
}

impl Broker {
    /// Bind, connect, authorize, and start the event loop.
    pub async fn start(cfg: BrokerConfig) -> Result<Self, BrokerError> {
        if !cfg.cert.has_secret() {
            return Err(BrokerError::Config("certificate must include the secret key"));
        }
        let topo = Topology::new(cfg.arity, cfg.size, cfg.rank)?;
        let uuid = Topology::uuid(cfg.rank);
        let ctx = Context::new();

        let mut router = None;
        let mut bind_addr = None;
        if topo.children_count() > 0 {
            let addr = cfg
                .bind_addr
                .as_deref()
                .ok_or(BrokerError::Config("bind_addr required for a broker with children"))?;
            let auth = ctx.enable_auth()?;
            for peer in &cfg.authorized_peers {
                auth.authorize(&peer.name, &peer.pubkey)?;
            }
            let r = Router::bind(addr, cfg.cert.clone(), uuid.clone(), auth).await?;
            bind_addr = Some(r.local_addr());
            router = Some(r);
        }

        let dealer = if cfg.rank > 0 {
            let addr = cfg
                .parent_addr
                .as_deref()
                .ok_or(BrokerError::Config("parent_addr required when rank > 0"))?;
            let key = cfg
                .parent_pubkey
                .as_deref()
                .ok_or(BrokerError::Config("parent_pubkey required when rank > 0"))?;
            Some(
                connect_with_retry(addr, &cfg.cert, &uuid, key, cfg.connect_attempts)
                    .await?,
            )
        } else {
            None
        };

        info!(
            rank = cfg.rank,
            size = cfg.size,
            arity = cfg.arity,
            level = topo.level(),
            descendants = topo.descendants(),
            "broker starting"
        );

        let (api_tx, api_rx) = mpsc::channel(256);
        let state = Loop {
            rank: cfg.rank,
            overlay: Overlay::new(topo, cfg.overlay),
            scratchpad: Scratchpad::new(),
            registry: build_registry(),
            tags: MatchtagPool::new(),
            pending: HashMap::new(),
            event_subs: Vec::new(),
            event_seq: 0,
            router,
            dealer,
            sync: SyncTimer::new(cfg.overlay.sync_min, cfg.overlay.sync_max),
            catch_sigint: cfg.catch_sigint,
        };
        let loop_task = tokio::spawn(state.run(api_rx));

        Ok(Self {
            rank: cfg.rank,
            pubkey: cfg.cert.public_txt(),
            bind_addr,
            api_tx,
            loop_task,
        })
    }

    /// This broker's rank.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// This broker's public key text.
    #[must_use]
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// The child-facing bind address, if this broker has children
    /// (wildcard ports resolved).
    #[must_use]
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.bind_addr
    }

    /// A new local client handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle::new(self.rank, self.api_tx.clone())
    }

    /// Orderly shutdown: pending streams get their terminal error, the
    /// parent gets a disconnect keepalive, then the loop stops.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.api_tx.send(ApiMsg::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let _ = self.loop_task.await;
    }
}

async fn connect_with_retry(
    addr: &str,
    cert: &Certificate,
    identity: &str,
    server_pubkey: &str,
    attempts: u32,
) -> Result<Dealer, BrokerError> {
    let mut last = NetError::HostUnreachable;
    for attempt in 0..attempts.max(1) {
        match Dealer::connect(addr, cert.clone(), identity.to_string(), server_pubkey).await {
            Ok(dealer) => return Ok(dealer),
            // The parent may still be binding; only socket-level
            // failures are worth retrying.
            Err(NetError::Io(e)) => {
                debug!(addr, attempt, error = %e, "parent connect failed, retrying");
                last = NetError::Io(e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last.into())
}

struct PendingRpc {
    tx: mpsc::Sender<Message>,
    streaming: bool,
}

struct Loop {
    rank: u32,
    overlay: Overlay,
    scratchpad: Scratchpad,
    registry: Registry<Svc>,
    tags: MatchtagPool,
    pending: HashMap<u32, PendingRpc>,
    event_subs: Vec<mpsc::Sender<Message>>,
    event_seq: u32,
    router: Option<Router>,
    dealer: Option<Dealer>,
    sync: SyncTimer,
    catch_sigint: bool,
}

async fn recv_router(router: &mut Option<Router>) -> Option<Message> {
    match router {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_dealer(dealer: &mut Option<Dealer>) -> Option<Message> {
    match dealer {
        Some(d) => d.recv().await,
        None => std::future::pending().await,
    }
}

async fn sigint(enabled: bool) {
    if enabled {
        let _ = tokio::signal::ctrl_c().await;
    } else {
        std::future::pending::<()>().await;
    }
}

impl Loop {
    async fn run(mut self, mut api_rx: mpsc::Receiver<ApiMsg>) {
        loop {
            let deadline =
                tokio::time::Instant::from_std(self.sync.deadline(Instant::now()));
            tokio::select! {
                api = api_rx.recv() => match api {
                    Some(ApiMsg::Shutdown(ack)) => {
                        self.shutdown_all(Instant::now()).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(api) => self.on_api(api, Instant::now()).await,
                    None => {
                        // Broker and every handle are gone.
                        self.shutdown_all(Instant::now()).await;
                        break;
                    }
                },
                Some(msg) = recv_router(&mut self.router) => {
                    self.on_child_msg(msg, Instant::now()).await;
                }
                msg = recv_dealer(&mut self.dealer) => match msg {
                    Some(msg) => self.on_parent_msg(msg, Instant::now()).await,
                    None => {
                        warn!("parent connection closed");
                        self.dealer = None;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    self.sync.fire(now);
                    match self.overlay.tick(now) {
                        Ok(ds) => self.execute(ds, now).await,
                        Err(e) => warn!(error = %e, "sync tick failed"),
                    }
                }
                _ = sigint(self.catch_sigint) => {
                    self.shutdown_all(Instant::now()).await;
                    break;
                }
            }
        }
    }

    async fn on_api(&mut self, api: ApiMsg, now: Instant) {
        match api {
            ApiMsg::Send(msg) => self.route_from_local(msg, now).await,
            ApiMsg::Rpc { mut msg, streaming, tag_tx, resp_tx } => {
                let Some(tag) = self.tags.alloc() else {
                    let _ = tag_tx.send(Err(BrokerError::TagsExhausted));
                    return;
                };
                if let Err(e) = msg.set_matchtag(tag) {
                    let _ = tag_tx.send(Err(e.into()));
                    let _ = self.tags.free(tag);
                    return;
                }
                self.pending.insert(tag, PendingRpc { tx: resp_tx, streaming });
                let _ = tag_tx.send(Ok(tag));
                self.route_from_local(msg, now).await;
            }
            ApiMsg::SubscribeEvents(tx) => self.event_subs.push(tx),
            ApiMsg::Disconnect(services) => {
                for (service, nodeid) in services {
                    let mut msg = Message::request(format!("{service}.disconnect"));
                    let _ = msg.set_nodeid(nodeid);
                    msg.set_noresponse();
                    msg.set_rolemask(RoleMask::OWNER);
                    self.route_from_local(msg, now).await;
                }
                self.prune_pending();
            }
            ApiMsg::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    async fn route_from_local(&mut self, msg: Message, now: Instant) {
        let ds = match msg.msg_type() {
            MsgType::Request => self.route_request(msg, now),
            MsgType::Event => self.route_event_from_below(msg, now),
            other => {
                warn!(%other, "unexpected message type from local handle");
                Vec::new()
            }
        };
        self.execute(ds, now).await;
    }

    /// Requests dispatch locally when the nodeid names this rank (or
    /// any-rank), except that the upstream hint inverts the rule: the
    /// origin forwards and the first other broker handles it.
    fn route_request(&mut self, msg: Message, now: Instant) -> Vec<Delivery> {
        let Ok(nodeid) = msg.nodeid() else {
            warn!("DROP request without nodeid");
            return Vec::new();
        };
        let local = if msg.is_upstream() {
            nodeid != self.rank
        } else {
            nodeid == self.rank || nodeid == NODEID_ANY
        };
        if local {
            return self.dispatch_request(msg, now);
        }
        match self.overlay.sendmsg(msg.clone(), SendWhere::Any, now) {
            Ok(ds) => ds,
            Err(e) => self
                .overlay
                .respond_error(&msg, e.errnum(), &e.to_string(), now)
                .unwrap_or_default(),
        }
    }

    /// Events published below the root climb to rank 0, which assigns
    /// the sequence number and multicasts.
    fn route_event_from_below(&mut self, msg: Message, now: Instant) -> Vec<Delivery> {
        if self.rank == 0 {
            return self.publish_event(msg, now);
        }
        match self.overlay.sendmsg(msg, SendWhere::Upstream, now) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(error = %e, "event publish failed");
                Vec::new()
            }
        }
    }

    fn publish_event(&mut self, mut msg: Message, now: Instant) -> Vec<Delivery> {
        self.event_seq = self.event_seq.wrapping_add(1);
        let _ = msg.set_seq(self.event_seq);
        self.deliver_event_subs(&msg);
        match self.overlay.sendmsg(msg, SendWhere::Downstream, now) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(error = %e, "event multicast failed");
                Vec::new()
            }
        }
    }

    fn dispatch_request(&mut self, msg: Message, now: Instant) -> Vec<Delivery> {
        match self.registry.route(&msg) {
            RouteOutcome::Handler(svc) => self.call_service(svc, msg, now),
            RouteOutcome::PermissionDenied => self
                .overlay
                .respond_error(&msg, errno::EPERM, "", now)
                .unwrap_or_default(),
            RouteOutcome::NoMatch => self
                .overlay
                .respond_error(&msg, errno::ENOSYS, "no such service", now)
                .unwrap_or_default(),
        }
    }

    fn call_service(&mut self, svc: Svc, msg: Message, now: Instant) -> Vec<Delivery> {
        let result = match svc {
            Svc::OverlayMonitor => self.overlay.monitor_request(msg, now),
            Svc::OverlayPause => self.overlay.pause_request(msg, now),
            Svc::OverlayStats => self.overlay.stats_request(msg, now),
            Svc::OverlayLspeer => self.overlay.lspeer_request(msg, now),
            Svc::OverlayCancel => self.overlay.cancel_request(&msg, now),
            Svc::OverlayDisconnect => {
                self.overlay.disconnect_request(&msg);
                Ok(Vec::new())
            }
            Svc::SpLl => {
                let out = self.scratchpad.ll(&msg);
                Ok(self.responses_to_deliveries(out, now))
            }
            Svc::SpSc => {
                let out = self.scratchpad.sc(&msg);
                Ok(self.responses_to_deliveries(out, now))
            }
            Svc::SpScStream => {
                let out = self.scratchpad.sc_stream(&msg);
                Ok(self.responses_to_deliveries(out, now))
            }
            Svc::SpScRetry => {
                let out = self.scratchpad.sc_retry(&msg);
                Ok(self.responses_to_deliveries(out, now))
            }
            Svc::SpDelete => {
                let out = self.scratchpad.delete(&msg);
                Ok(self.responses_to_deliveries(out, now))
            }
            Svc::SpDisconnect => {
                self.scratchpad.disconnect(&msg);
                Ok(Vec::new())
            }
        };
        match result {
            Ok(ds) => ds,
            Err(e) => {
                warn!(error = %e, "service handler failed");
                Vec::new()
            }
        }
    }

    fn responses_to_deliveries(&mut self, resps: Vec<Message>, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for resp in resps {
            match self.overlay.sendmsg(resp, SendWhere::Any, now) {
                Ok(ds) => out.extend(ds),
                Err(e) => warn!(error = %e, "error routing response"),
            }
        }
        out
    }

    async fn on_child_msg(&mut self, msg: Message, now: Instant) {
        let deliveries = match self.overlay.recv_child(msg, now) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(error = %e, "DROP downstream message");
                return;
            }
        };
        let mut work = Vec::new();
        for d in deliveries {
            match d {
                Delivery::Local(m) if m.msg_type() == MsgType::Event => {
                    work.extend(self.route_event_from_below(m, now));
                }
                other => work.push(other),
            }
        }
        self.execute(work, now).await;
    }

    async fn on_parent_msg(&mut self, msg: Message, now: Instant) {
        let mut work = Vec::new();
        for d in self.overlay.recv_parent(msg) {
            match d {
                Delivery::Local(m) if m.msg_type() == MsgType::Event => {
                    // Deliver here and keep flooding down the tree.
                    self.deliver_event_subs(&m);
                    match self.overlay.sendmsg(m, SendWhere::Downstream, now) {
                        Ok(ds) => work.extend(ds),
                        Err(e) => warn!(error = %e, "event re-multicast failed"),
                    }
                }
                other => work.push(other),
            }
        }
        self.execute(work, now).await;
    }

    /// The single delivery executor. Service handlers and routing
    /// decisions feed this worklist; only socket writes and response
    /// correlation actually suspend.
    async fn execute(&mut self, deliveries: Vec<Delivery>, now: Instant) {
        let mut work: VecDeque<Delivery> = deliveries.into();
        while let Some(d) = work.pop_front() {
            match d {
                Delivery::Parent(msg) => match &self.dealer {
                    Some(dealer) => {
                        if let Err(e) = dealer.send(&msg).await {
                            warn!(error = %e, "parent send failed");
                        }
                    }
                    None => warn!("no parent link for upstream send"),
                },
                Delivery::Child(msg) => {
                    let peer = msg.route_last().map(str::to_string);
                    let result = match &self.router {
                        Some(router) => router.send(msg),
                        None => Err(NetError::HostUnreachable),
                    };
                    if result.is_err() {
                        if let Some(uuid) = peer {
                            match self.overlay.child_send_failed(&uuid, now) {
                                Ok(ds) => work.extend(ds),
                                Err(e) => warn!(error = %e, "disconnect handling failed"),
                            }
                        }
                    }
                }
                Delivery::Local(msg) => self.deliver_local(msg, now, &mut work).await,
            }
        }
    }

    async fn deliver_local(
        &mut self,
        msg: Message,
        now: Instant,
        work: &mut VecDeque<Delivery>,
    ) {
        match msg.msg_type() {
            MsgType::Response => {
                if msg.route_count() > 0 {
                    // Not ours: keep walking the route stack.
                    match self.overlay.sendmsg(msg, SendWhere::Any, now) {
                        Ok(ds) => work.extend(ds),
                        Err(e) => warn!(error = %e, "error forwarding response"),
                    }
                } else {
                    self.correlate_response(msg).await;
                }
            }
            MsgType::Request => {
                let ds = self.route_request(msg, now);
                work.extend(ds);
            }
            MsgType::Event => self.deliver_event_subs(&msg),
            MsgType::Keepalive => {} // absorbed by the overlay
        }
    }

    async fn correlate_response(&mut self, msg: Message) {
        let Ok(tag) = msg.matchtag() else {
            return;
        };
        let Some((tx, streaming)) = self
            .pending
            .get(&tag)
            .map(|p| (p.tx.clone(), p.streaming))
        else {
            debug!(tag, "DROP unmatched response");
            return;
        };
        let errnum = msg.errnum().unwrap_or(0);
        let terminal = !streaming || errnum != 0;
        let delivered = tx.send(msg).await.is_ok();
        if terminal || !delivered {
            self.pending.remove(&tag);
            let _ = self.tags.free(tag);
        }
    }

    fn deliver_event_subs(&mut self, msg: &Message) {
        self.event_subs.retain(|tx| {
            match tx.try_send(msg.clone()) {
                Ok(()) => true,
                // A slow subscriber loses this event but stays
                // subscribed; a gone subscriber is dropped.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn prune_pending(&mut self) {
        let dead: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.tx.is_closed())
            .map(|(tag, _)| *tag)
            .collect();
        for tag in dead {
            self.pending.remove(&tag);
            let _ = self.tags.free(tag);
        }
    }

    async fn shutdown_all(&mut self, now: Instant) {
        debug!(rank = self.rank, "broker shutting down");
        let resps = self.scratchpad.shutdown();
        let mut ds = self.responses_to_deliveries(resps, now);
        ds.extend(self.overlay.shutdown(now));
        self.execute(ds, now).await;
        // Grace period so the goodbye keepalive reaches the parent
        // before the sockets drop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.router = None;
        self.dealer = None;
        self.pending.clear();
    }
}
