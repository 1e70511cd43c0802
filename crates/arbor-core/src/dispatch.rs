//! Topic-based handler registry, matchtag allocation, and pending-request
//! bookkeeping.
//!
//! Handlers register `(type mask, topic glob, extra roles)` in order;
//! the first matching registration wins. The owner role is always
//! allowed; registrations name the additional roles they admit.

use std::collections::HashSet;

use serde_json::Value;

use arbor_proto::{matcher::glob_match, Message, RoleMask, TypeMask, MATCHTAG_NONE};

use crate::error::MatchtagError;

/// One handler registration.
#[derive(Debug, Clone)]
pub struct HandlerSpec<T> {
    /// Message types this handler accepts
    pub typemask: TypeMask,
    /// Topic glob (`*`, `?`, `[…]`, or exact; empty matches all)
    pub topic_glob: String,
    /// Roles admitted in addition to the owner
    pub rolemask: RoleMask,
    /// Caller-side handler identifier
    pub id: T,
}

/// Result of routing a message through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome<T> {
    /// A handler matched and the sender is authorized
    Handler(T),
    /// A handler matched but the sender's roles do not intersect
    PermissionDenied,
    /// No registration matched
    NoMatch,
}

/// Ordered handler registry; first match wins.
#[derive(Debug, Clone, Default)]
pub struct Registry<T> {
    specs: Vec<HandlerSpec<T>>,
}

impl<T: Copy> Registry<T> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { specs: Vec::new() }
    }

    /// Append a registration. Insertion order is consultation order.
    pub fn add(
        &mut self,
        typemask: TypeMask,
        topic_glob: impl Into<String>,
        rolemask: RoleMask,
        id: T,
    ) {
        self.specs.push(HandlerSpec {
            typemask,
            topic_glob: topic_glob.into(),
            rolemask,
            id,
        });
    }

    /// Find the handler for `msg` and check sender authorization.
    pub fn route(&self, msg: &Message) -> RouteOutcome<T> {
        for spec in &self.specs {
            if !spec.typemask.accepts(msg.msg_type()) {
                continue;
            }
            if !spec.topic_glob.is_empty() && spec.topic_glob != "*" {
                let Ok(topic) = msg.topic() else {
                    continue;
                };
                if !glob_match(&spec.topic_glob, topic) {
                    continue;
                }
            }
            let allowed = RoleMask::OWNER | spec.rolemask;
            if !msg.rolemask().intersects(allowed) {
                return RouteOutcome::PermissionDenied;
            }
            return RouteOutcome::Handler(spec.id);
        }
        RouteOutcome::NoMatch
    }
}

/// Matchtag allocator drawn from a free list.
///
/// Tag 0 is reserved and never allocated; an allocated tag stays unique
/// until returned; returning a tag that is not outstanding is refused.
#[derive(Debug, Default)]
pub struct MatchtagPool {
    next: u32,
    free: Vec<u32>,
    outstanding: HashSet<u32>,
}

impl MatchtagPool {
    /// A fresh pool.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1, free: Vec::new(), outstanding: HashSet::new() }
    }

    /// Allocate a tag; `None` when the 32-bit space is exhausted.
    pub fn alloc(&mut self) -> Option<u32> {
        let tag = match self.free.pop() {
            Some(tag) => tag,
            None => {
                if self.next == u32::MAX {
                    return None;
                }
                let tag = self.next;
                self.next += 1;
                tag
            }
        };
        self.outstanding.insert(tag);
        Some(tag)
    }

    /// Return a tag to the pool. Refuses tags that are not outstanding,
    /// so a double free is an error rather than silent reuse corruption.
    pub fn free(&mut self, tag: u32) -> Result<(), MatchtagError> {
        if tag == MATCHTAG_NONE {
            return Err(MatchtagError::Reserved);
        }
        if !self.outstanding.remove(&tag) {
            return Err(MatchtagError::NotOutstanding(tag));
        }
        self.free.push(tag);
        Ok(())
    }

    /// Is `tag` currently allocated?
    #[must_use]
    pub fn is_outstanding(&self, tag: u32) -> bool {
        self.outstanding.contains(&tag)
    }

    /// Number of currently allocated tags.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// A list of retained request messages (streaming RPCs awaiting more
/// responses), with the disconnect and cancel matching rules services
/// share.
#[derive(Debug, Clone, Default)]
pub struct RequestList {
    msgs: Vec<Message>,
}

impl RequestList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain a request.
    pub fn push(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    /// Number of retained requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// True when nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Iterate retained requests in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.msgs.iter()
    }

    /// Remove and return every request from the same sender as `msg`
    /// (matched by originator route identifier).
    pub fn disconnect(&mut self, msg: &Message) -> Vec<Message> {
        let mut removed = Vec::new();
        self.msgs.retain(|m| {
            if m.route_match_first(msg) {
                removed.push(m.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Find the retained request a cancel (or retry) message refers to:
    /// the cancel payload carries `{"matchtag": n}` and must come from
    /// the same sender.
    #[must_use]
    pub fn find_cancel(&self, cancel: &Message) -> Option<&Message> {
        let tag = cancel_matchtag(cancel)?;
        self.msgs
            .iter()
            .find(|m| m.matchtag() == Ok(tag) && m.route_match_first(cancel))
    }

    /// Remove and return the request a cancel message refers to.
    pub fn take_cancel(&mut self, cancel: &Message) -> Option<Message> {
        let tag = cancel_matchtag(cancel)?;
        let idx = self
            .msgs
            .iter()
            .position(|m| m.matchtag() == Ok(tag) && m.route_match_first(cancel))?;
        Some(self.msgs.remove(idx))
    }

    /// Remove and return the request carrying `matchtag` from the same
    /// sender as `from`.
    pub fn take_matching(&mut self, matchtag: u32, from: &Message) -> Option<Message> {
        let idx = self
            .msgs
            .iter()
            .position(|m| m.matchtag() == Ok(matchtag) && m.route_match_first(from))?;
        Some(self.msgs.remove(idx))
    }

    /// Drain every retained request (service shutdown).
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.msgs)
    }
}

fn cancel_matchtag(cancel: &Message) -> Option<u32> {
    let payload = cancel.unpack().ok()?;
    match payload.get("matchtag") {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use arbor_proto::MsgType;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Svc {
        Monitor,
        Ll,
        CatchAll,
    }

    fn registry() -> Registry<Svc> {
        let mut reg = Registry::new();
        reg.add(TypeMask::REQUEST, "overlay.monitor", RoleMask::NONE, Svc::Monitor);
        reg.add(TypeMask::REQUEST, "scratchpad.ll", RoleMask::USER, Svc::Ll);
        reg.add(TypeMask::REQUEST, "scratchpad.*", RoleMask::NONE, Svc::CatchAll);
        reg
    }

    fn owner_request(topic: &str) -> Message {
        let mut msg = Message::request(topic);
        msg.set_rolemask(RoleMask::OWNER);
        msg
    }

    #[test]
    fn first_match_wins() {
        let reg = registry();
        assert_eq!(reg.route(&owner_request("scratchpad.ll")), RouteOutcome::Handler(Svc::Ll));
        assert_eq!(
            reg.route(&owner_request("scratchpad.sc")),
            RouteOutcome::Handler(Svc::CatchAll)
        );
        assert_eq!(
            reg.route(&owner_request("overlay.monitor")),
            RouteOutcome::Handler(Svc::Monitor)
        );
    }

    #[test]
    fn no_match() {
        let reg = registry();
        assert_eq!(reg.route(&owner_request("job.submit")), RouteOutcome::NoMatch);
        // Registered for requests only.
        let mut resp = Message::new(MsgType::Response);
        resp.set_topic(Some("overlay.monitor".to_string()));
        assert_eq!(reg.route(&resp), RouteOutcome::NoMatch);
    }

    #[test]
    fn rolemask_enforcement() {
        let reg = registry();
        let mut user = Message::request("scratchpad.ll");
        user.set_rolemask(RoleMask::USER);
        assert_eq!(reg.route(&user), RouteOutcome::Handler(Svc::Ll));

        // The user role does not open owner-only handlers.
        let mut denied = Message::request("overlay.monitor");
        denied.set_rolemask(RoleMask::USER);
        assert_eq!(reg.route(&denied), RouteOutcome::PermissionDenied);

        let mut none = Message::request("scratchpad.ll");
        none.set_rolemask(RoleMask::NONE);
        assert_eq!(reg.route(&none), RouteOutcome::PermissionDenied);
    }

    #[test]
    fn matchtag_allocation_unique() {
        let mut pool = MatchtagPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert!(a != b && b != c && a != c);
        assert!(a != MATCHTAG_NONE && b != MATCHTAG_NONE);
        assert_eq!(pool.outstanding_count(), 3);
    }

    #[test]
    fn matchtag_reuse_after_free() {
        let mut pool = MatchtagPool::new();
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn matchtag_double_free_refused() {
        let mut pool = MatchtagPool::new();
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(MatchtagError::NotOutstanding(a)));
        assert_eq!(pool.free(0), Err(MatchtagError::Reserved));
        assert_eq!(pool.free(999), Err(MatchtagError::NotOutstanding(999)));
    }

    fn streaming_request(tag: u32, sender: Option<&str>) -> Message {
        let mut msg = Message::request("overlay.monitor");
        msg.set_matchtag(tag).unwrap();
        msg.set_streaming();
        if let Some(id) = sender {
            msg.route_enable();
            msg.route_push(id).unwrap();
        }
        msg
    }

    #[test]
    fn request_list_disconnect_by_sender() {
        let mut list = RequestList::new();
        list.push(streaming_request(1, Some("3")));
        list.push(streaming_request(2, Some("4")));
        list.push(streaming_request(3, Some("3")));

        let mut goodbye = Message::request("overlay.disconnect");
        goodbye.route_enable();
        goodbye.route_push("3").unwrap();
        let removed = list.disconnect(&goodbye);
        assert_eq!(removed.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().matchtag().unwrap(), 2);
    }

    #[test]
    fn request_list_cancel_by_matchtag_and_sender() {
        let mut list = RequestList::new();
        list.push(streaming_request(7, Some("3")));

        let mut cancel = Message::request("overlay.cancel");
        cancel.pack(&json!({"matchtag": 7})).unwrap();
        cancel.route_enable();
        cancel.route_push("4").unwrap();
        // Wrong sender: no match.
        assert!(list.find_cancel(&cancel).is_none());

        let mut cancel = Message::request("overlay.cancel");
        cancel.pack(&json!({"matchtag": 7})).unwrap();
        cancel.route_enable();
        cancel.route_push("3").unwrap();
        assert!(list.find_cancel(&cancel).is_some());
        let taken = list.take_cancel(&cancel).unwrap();
        assert_eq!(taken.matchtag().unwrap(), 7);
        assert!(list.is_empty());
    }

    #[test]
    fn request_list_local_senders_share_identity() {
        let mut list = RequestList::new();
        list.push(streaming_request(5, None));
        let mut cancel = Message::request("overlay.cancel");
        cancel.pack(&json!({"matchtag": 5})).unwrap();
        assert!(list.find_cancel(&cancel).is_some());
    }
}
