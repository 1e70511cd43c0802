//! The universal message unit and its wire codec.
//!
//! A [`Message`] is cheap to clone: the payload lives behind
//! [`bytes::Bytes`], so multicast copies share storage. Contents are
//! treated as immutable once a message has been handed to a socket;
//! routing layers only manipulate the route stack of copies they own.

use bytes::Bytes;
use serde_json::Value;

use crate::{
    errors::{ProtocolError, Result},
    flags::{MsgFlags, RoleMask},
    proto::ProtoFrame,
    route::RouteStack,
    types::{KeepaliveStatus, MsgType},
    MATCHTAG_NONE, NODEID_ANY, USERID_UNKNOWN,
};

/// One message: type, flags, credentials, two type-specific words, and the
/// optional topic / payload / route stack frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MsgType,
    flags: MsgFlags,
    userid: u32,
    rolemask: RoleMask,
    aux1: u32,
    aux2: u32,
    topic: Option<String>,
    payload: Bytes,
    routes: RouteStack,
}

impl Message {
    /// Create an empty message of the given type.
    #[must_use]
    pub fn new(msg_type: MsgType) -> Self {
        let mut msg = Self {
            msg_type,
            flags: MsgFlags::empty(),
            userid: USERID_UNKNOWN,
            rolemask: RoleMask::NONE,
            aux1: 0,
            aux2: 0,
            topic: None,
            payload: Bytes::new(),
            routes: RouteStack::new(),
        };
        msg.setup_type();
        msg
    }

    /// Create a request with a topic.
    #[must_use]
    pub fn request(topic: impl Into<String>) -> Self {
        let mut msg = Self::new(MsgType::Request);
        msg.set_topic(Some(topic.into()));
        msg
    }

    /// Create an event with a topic.
    #[must_use]
    pub fn event(topic: impl Into<String>) -> Self {
        let mut msg = Self::new(MsgType::Event);
        msg.set_topic(Some(topic.into()));
        msg
    }

    /// Create a keepalive carrying an errnum and a status word.
    #[must_use]
    pub fn keepalive(errnum: u32, status: KeepaliveStatus) -> Self {
        let mut msg = Self::new(MsgType::Keepalive);
        msg.aux1 = errnum;
        msg.aux2 = status as u32;
        msg
    }

    /// Derive a response from a request: same topic, matchtag, credentials
    /// and route stack, so the response retraces the request's path.
    ///
    /// Fails on non-request messages and on requests that carry the
    /// NORESPONSE flag.
    pub fn response_to(request: &Message) -> Result<Self> {
        if request.msg_type != MsgType::Request {
            return Err(ProtocolError::WrongType {
                field: "response_to",
                msg_type: request.msg_type,
            });
        }
        if request.flags.contains(MsgFlags::NORESPONSE) {
            return Err(ProtocolError::Malformed("cannot respond to a noresponse request"));
        }
        let mut msg = Self::new(MsgType::Response);
        msg.userid = request.userid;
        msg.rolemask = request.rolemask;
        msg.aux2 = request.aux2; // matchtag
        msg.topic = request.topic.clone();
        if msg.topic.is_some() {
            msg.flags |= MsgFlags::TOPIC;
        }
        if request.flags.contains(MsgFlags::ROUTE) {
            msg.flags |= MsgFlags::ROUTE;
            msg.routes = request.routes.clone();
        }
        Ok(msg)
    }

    /// Decode the errnum and status of a keepalive.
    pub fn keepalive_decode(&self) -> Result<(u32, KeepaliveStatus)> {
        if self.msg_type != MsgType::Keepalive {
            return Err(ProtocolError::WrongType { field: "status", msg_type: self.msg_type });
        }
        Ok((self.aux1, KeepaliveStatus::from_u32(self.aux2)?))
    }

    // ------------------------------------------------------------------
    // Proto fields
    // ------------------------------------------------------------------

    /// Message type.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Change the type, resetting the type-specific words the way a fresh
    /// message of that type starts out. A response keeps the matchtag so a
    /// request can be turned into its response in place.
    pub fn set_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
        self.setup_type();
    }

    fn setup_type(&mut self) {
        match self.msg_type {
            MsgType::Request => {
                self.aux1 = NODEID_ANY;
                self.aux2 = MATCHTAG_NONE;
            }
            MsgType::Response => {
                self.aux1 = 0; // errnum; matchtag survives
            }
            MsgType::Event | MsgType::Keepalive => {
                self.aux1 = 0;
                self.aux2 = 0;
            }
        }
    }

    /// Current flag set.
    #[must_use]
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    /// Replace the flag set, enforcing flag validity.
    pub fn set_flags(&mut self, flags: MsgFlags) -> Result<()> {
        flags.validate()?;
        self.flags = flags;
        Ok(())
    }

    /// Mark the request as streaming (clears NORESPONSE).
    pub fn set_streaming(&mut self) {
        self.flags.remove(MsgFlags::NORESPONSE);
        self.flags |= MsgFlags::STREAMING;
    }

    /// True when the STREAMING flag is set.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.flags.contains(MsgFlags::STREAMING)
    }

    /// Mark the request as expecting no response (clears STREAMING).
    pub fn set_noresponse(&mut self) {
        self.flags.remove(MsgFlags::STREAMING);
        self.flags |= MsgFlags::NORESPONSE;
    }

    /// True when the NORESPONSE flag is set.
    #[must_use]
    pub fn is_noresponse(&self) -> bool {
        self.flags.contains(MsgFlags::NORESPONSE)
    }

    /// Mark the message private.
    pub fn set_private(&mut self) {
        self.flags |= MsgFlags::PRIVATE;
    }

    /// True when the PRIVATE flag is set.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.flags.contains(MsgFlags::PRIVATE)
    }

    /// Set the upstream-routing hint (requests only on the wire, but the
    /// flag itself is freely settable like any other).
    pub fn set_upstream(&mut self) {
        self.flags |= MsgFlags::UPSTREAM;
    }

    /// True when the UPSTREAM hint is set.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        self.flags.contains(MsgFlags::UPSTREAM)
    }

    /// Sender userid.
    #[must_use]
    pub fn userid(&self) -> u32 {
        self.userid
    }

    /// Set the sender userid.
    pub fn set_userid(&mut self, userid: u32) {
        self.userid = userid;
    }

    /// Sender rolemask.
    #[must_use]
    pub fn rolemask(&self) -> RoleMask {
        self.rolemask
    }

    /// Set the sender rolemask.
    pub fn set_rolemask(&mut self, rolemask: RoleMask) {
        self.rolemask = rolemask;
    }

    /// Target nodeid (requests only).
    pub fn nodeid(&self) -> Result<u32> {
        if self.msg_type != MsgType::Request {
            return Err(ProtocolError::WrongType { field: "nodeid", msg_type: self.msg_type });
        }
        Ok(self.aux1)
    }

    /// Set the target nodeid (requests only).
    pub fn set_nodeid(&mut self, nodeid: u32) -> Result<()> {
        if self.msg_type != MsgType::Request {
            return Err(ProtocolError::WrongType { field: "nodeid", msg_type: self.msg_type });
        }
        self.aux1 = nodeid;
        Ok(())
    }

    /// Matchtag (requests and responses only).
    pub fn matchtag(&self) -> Result<u32> {
        match self.msg_type {
            MsgType::Request | MsgType::Response => Ok(self.aux2),
            other => Err(ProtocolError::WrongType { field: "matchtag", msg_type: other }),
        }
    }

    /// Set the matchtag (requests and responses only).
    pub fn set_matchtag(&mut self, tag: u32) -> Result<()> {
        match self.msg_type {
            MsgType::Request | MsgType::Response => {
                self.aux2 = tag;
                Ok(())
            }
            other => Err(ProtocolError::WrongType { field: "matchtag", msg_type: other }),
        }
    }

    /// Error number (responses and keepalives only).
    pub fn errnum(&self) -> Result<u32> {
        match self.msg_type {
            MsgType::Response | MsgType::Keepalive => Ok(self.aux1),
            other => Err(ProtocolError::WrongType { field: "errnum", msg_type: other }),
        }
    }

    /// Set the error number (responses and keepalives only).
    pub fn set_errnum(&mut self, errnum: u32) -> Result<()> {
        match self.msg_type {
            MsgType::Response | MsgType::Keepalive => {
                self.aux1 = errnum;
                Ok(())
            }
            other => Err(ProtocolError::WrongType { field: "errnum", msg_type: other }),
        }
    }

    /// Event sequence number (events only).
    pub fn seq(&self) -> Result<u32> {
        if self.msg_type != MsgType::Event {
            return Err(ProtocolError::WrongType { field: "seq", msg_type: self.msg_type });
        }
        Ok(self.aux1)
    }

    /// Set the event sequence number (events only).
    pub fn set_seq(&mut self, seq: u32) -> Result<()> {
        if self.msg_type != MsgType::Event {
            return Err(ProtocolError::WrongType { field: "seq", msg_type: self.msg_type });
        }
        self.aux1 = seq;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Topic
    // ------------------------------------------------------------------

    /// Topic string, if present.
    pub fn topic(&self) -> Result<&str> {
        self.topic
            .as_deref()
            .ok_or(ProtocolError::Malformed("message has no topic"))
    }

    /// Set, replace, or (with `None`) remove the topic.
    pub fn set_topic(&mut self, topic: Option<String>) {
        match topic {
            Some(t) => {
                self.topic = Some(t);
                self.flags |= MsgFlags::TOPIC;
            }
            None => {
                self.topic = None;
                self.flags.remove(MsgFlags::TOPIC);
            }
        }
    }

    // ------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------

    /// True when a payload frame is present.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.flags.contains(MsgFlags::PAYLOAD)
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> Result<&[u8]> {
        if !self.has_payload() {
            return Err(ProtocolError::Malformed("message has no payload"));
        }
        Ok(&self.payload)
    }

    /// Replace the payload. A zero-length buffer removes the payload and
    /// clears the flag. A source slice that aliases part of the current
    /// payload storage is rejected (replacing in place would read from
    /// memory being overwritten).
    pub fn set_payload(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            self.payload = Bytes::new();
            self.flags.remove(MsgFlags::PAYLOAD);
            return Ok(());
        }
        let cur = self.payload.as_ref();
        if !cur.is_empty() {
            let cur_start = cur.as_ptr() as usize;
            let cur_end = cur_start + cur.len();
            let buf_start = buf.as_ptr() as usize;
            let buf_end = buf_start + buf.len();
            let identical = buf_start == cur_start && buf.len() == cur.len();
            if !identical && buf_start < cur_end && cur_start < buf_end {
                return Err(ProtocolError::PayloadOverlap);
            }
        }
        self.payload = Bytes::copy_from_slice(buf);
        self.flags |= MsgFlags::PAYLOAD;
        Ok(())
    }

    /// Set a NUL-terminated string payload.
    pub fn set_string(&mut self, s: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(s.len() + 1);
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
        self.set_payload(&buf)
    }

    /// Get the payload as a string. The payload must be NUL-terminated
    /// valid UTF-8; the terminator is not part of the returned slice.
    pub fn get_string(&self) -> Result<&str> {
        let buf = self.payload()?;
        match buf.split_last() {
            Some((0, body)) => {
                std::str::from_utf8(body).map_err(|_| ProtocolError::PayloadNotString)
            }
            _ => Err(ProtocolError::PayloadNotString),
        }
    }

    /// Set a JSON object payload (compact encoding, NUL-terminated).
    pub fn pack(&mut self, value: &Value) -> Result<()> {
        if !value.is_object() {
            return Err(ProtocolError::PayloadNotObject);
        }
        let s = serde_json::to_string(value).map_err(|e| ProtocolError::Json(e.to_string()))?;
        self.set_string(&s)
    }

    /// Parse the payload as a JSON object.
    pub fn unpack(&self) -> Result<Value> {
        let s = self.get_string()?;
        let value: Value =
            serde_json::from_str(s).map_err(|e| ProtocolError::Json(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::PayloadNotObject);
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Route stack
    // ------------------------------------------------------------------

    /// True when the route stack is enabled (delimiter travels on the
    /// wire), regardless of content.
    #[must_use]
    pub fn has_route(&self) -> bool {
        self.flags.contains(MsgFlags::ROUTE)
    }

    /// Enable the route stack. No-op when already enabled.
    pub fn route_enable(&mut self) {
        self.flags |= MsgFlags::ROUTE;
    }

    /// Disable the route stack, clearing its content.
    pub fn route_disable(&mut self) {
        self.routes.clear();
        self.flags.remove(MsgFlags::ROUTE);
    }

    /// Drop all recorded hops, keeping the stack enabled if it was.
    pub fn route_clear(&mut self) {
        self.routes.clear();
    }

    /// Push a hop identifier. The stack must be enabled and the id
    /// non-empty (an empty id is indistinguishable from the delimiter on
    /// the wire).
    pub fn route_push(&mut self, id: impl Into<String>) -> Result<()> {
        if !self.has_route() {
            return Err(ProtocolError::RouteDisabled);
        }
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolError::Malformed("empty route id"));
        }
        self.routes.push(id);
        Ok(())
    }

    /// Pop the top hop identifier.
    pub fn route_pop(&mut self) -> Result<Option<String>> {
        if !self.has_route() {
            return Err(ProtocolError::RouteDisabled);
        }
        Ok(self.routes.pop())
    }

    /// Originator identifier (bottom of the stack).
    #[must_use]
    pub fn route_first(&self) -> Option<&str> {
        if !self.has_route() {
            return None;
        }
        self.routes.first()
    }

    /// Most recent hop identifier (top of the stack).
    #[must_use]
    pub fn route_last(&self) -> Option<&str> {
        if !self.has_route() {
            return None;
        }
        self.routes.last()
    }

    /// Number of recorded hops (zero when the stack is disabled).
    #[must_use]
    pub fn route_count(&self) -> usize {
        if !self.has_route() {
            return 0;
        }
        self.routes.len()
    }

    /// Diagnostic rendering of the route stack.
    #[must_use]
    pub fn route_string(&self) -> String {
        self.routes.to_string_abbrev()
    }

    /// True when both messages record the same originator.
    #[must_use]
    pub fn route_match_first(&self, other: &Message) -> bool {
        match (self.route_first(), other.route_first()) {
            (Some(a), Some(b)) => a == b,
            // Local senders carry no route; they share one identity.
            (None, None) => true,
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Matchtag comparison for response correlation. Messages that still
    /// carry route hops belong to a foreign matchtag domain and never
    /// match.
    #[must_use]
    pub fn cmp_matchtag(&self, tag: u32) -> bool {
        if self.route_count() > 0 {
            return false;
        }
        matches!(self.matchtag(), Ok(t) if t == tag)
    }

    // ------------------------------------------------------------------
    // Wire codec
    // ------------------------------------------------------------------

    /// Exact number of bytes [`Message::encode`] will produce.
    #[must_use]
    pub fn encode_size(&self) -> usize {
        let mut size = frame_size(ProtoFrame::SIZE);
        if self.flags.contains(MsgFlags::ROUTE) {
            for id in self.routes.iter() {
                size += frame_size(id.len());
            }
            size += frame_size(0); // delimiter
        }
        if let Some(topic) = &self.topic {
            size += frame_size(topic.len());
        }
        if self.flags.contains(MsgFlags::PAYLOAD) {
            size += frame_size(self.payload.len());
        }
        size
    }

    /// Encode into a caller-supplied buffer, returning the bytes written.
    /// Fails without touching the buffer when it is too short.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.encode_size();
        if buf.len() < need {
            return Err(ProtocolError::ShortBuffer { need, have: buf.len() });
        }
        let mut out = Vec::with_capacity(need);
        self.encode_frames(&mut out);
        debug_assert_eq!(out.len(), need);
        buf[..need].copy_from_slice(&out);
        Ok(need)
    }

    /// Encode to a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encode_size());
        self.encode_frames(&mut out);
        out
    }

    fn encode_frames(&self, out: &mut Vec<u8>) {
        if self.flags.contains(MsgFlags::ROUTE) {
            for id in self.routes.iter() {
                put_frame(out, id.as_bytes());
            }
            put_frame(out, &[]); // delimiter
        }
        if let Some(topic) = &self.topic {
            put_frame(out, topic.as_bytes());
        }
        if self.flags.contains(MsgFlags::PAYLOAD) {
            put_frame(out, &self.payload);
        }
        let proto = ProtoFrame::new(
            self.msg_type,
            self.flags,
            self.userid,
            self.rolemask.bits(),
            self.aux1,
            self.aux2,
        );
        put_frame(out, &proto.to_bytes());
    }

    /// Decode a message from its encoded byte stream. The stream must
    /// contain exactly one proto frame, as the final frame, and the frames
    /// preceding it must account for exactly what the flag byte claims.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let frames = split_frames(buf)?;
        let (&proto_bytes, head) = frames
            .split_last()
            .ok_or(ProtocolError::Malformed("no frames"))?;
        if proto_bytes.len() != ProtoFrame::SIZE {
            return Err(ProtocolError::Malformed("final frame is not a proto frame"));
        }
        let (msg_type, flags, proto) = ProtoFrame::parse(proto_bytes)?;

        let mut idx = 0;
        let mut routes = RouteStack::new();
        if flags.contains(MsgFlags::ROUTE) {
            loop {
                let frame = *head
                    .get(idx)
                    .ok_or(ProtocolError::Malformed("missing route delimiter"))?;
                idx += 1;
                if frame.is_empty() {
                    break;
                }
                let id = std::str::from_utf8(frame)
                    .map_err(|_| ProtocolError::Malformed("route id is not utf8"))?;
                routes.push(id);
            }
        }
        let mut topic = None;
        if flags.contains(MsgFlags::TOPIC) {
            let frame = *head
                .get(idx)
                .ok_or(ProtocolError::Malformed("missing topic frame"))?;
            idx += 1;
            let s = std::str::from_utf8(frame)
                .map_err(|_| ProtocolError::Malformed("topic is not utf8"))?;
            topic = Some(s.to_string());
        }
        let mut payload = Bytes::new();
        if flags.contains(MsgFlags::PAYLOAD) {
            let frame = *head
                .get(idx)
                .ok_or(ProtocolError::Malformed("missing payload frame"))?;
            idx += 1;
            if frame.is_empty() {
                return Err(ProtocolError::Malformed("empty payload frame"));
            }
            payload = Bytes::copy_from_slice(frame);
        }
        if idx != head.len() {
            return Err(ProtocolError::Malformed("unexpected extra frames"));
        }

        Ok(Self {
            msg_type,
            flags,
            userid: proto.userid(),
            rolemask: RoleMask::from_u32(proto.rolemask()),
            aux1: proto.aux1(),
            aux2: proto.aux2(),
            topic,
            payload,
            routes,
        })
    }

    /// Number of frames this message occupies on the wire.
    #[must_use]
    pub fn frames(&self) -> usize {
        let mut n = 1; // proto
        if self.flags.contains(MsgFlags::PAYLOAD) {
            n += 1;
        }
        if self.flags.contains(MsgFlags::TOPIC) {
            n += 1;
        }
        if self.flags.contains(MsgFlags::ROUTE) {
            n += self.routes.len() + 1; // +1 for the delimiter
        }
        n
    }

    /// Copy the message, optionally leaving the payload behind.
    #[must_use]
    pub fn copy(&self, payload: bool) -> Self {
        let mut cpy = self.clone();
        if !payload {
            cpy.payload = Bytes::new();
            cpy.flags.remove(MsgFlags::PAYLOAD);
        }
        cpy
    }
}

fn frame_size(body: usize) -> usize {
    if body < 0xff {
        1 + body
    } else {
        1 + 4 + body
    }
}

fn put_frame(out: &mut Vec<u8>, body: &[u8]) {
    if body.len() < 0xff {
        out.push(body.len() as u8);
    } else {
        out.push(0xff);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(body);
}

fn split_frames(buf: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let mut n = buf[pos] as usize;
        pos += 1;
        if n == 0xff {
            let tail = buf
                .get(pos..pos + 4)
                .ok_or(ProtocolError::Malformed("truncated length prefix"))?;
            n = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
            pos += 4;
        }
        let body = buf
            .get(pos..pos + n)
            .ok_or(ProtocolError::Malformed("frame extends past end of buffer"))?;
        pos += n;
        frames.push(body);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_defaults() {
        let msg = Message::request("kvs.lookup");
        assert_eq!(msg.msg_type(), MsgType::Request);
        assert_eq!(msg.nodeid().unwrap(), NODEID_ANY);
        assert_eq!(msg.matchtag().unwrap(), MATCHTAG_NONE);
        assert_eq!(msg.topic().unwrap(), "kvs.lookup");
        assert_eq!(msg.userid(), USERID_UNKNOWN);
    }

    #[test]
    fn type_guards() {
        let msg = Message::request("a.b");
        assert!(msg.errnum().is_err());
        assert!(msg.seq().is_err());
        let resp = Message::new(MsgType::Response);
        assert!(resp.nodeid().is_err());
        assert!(matches!(
            resp.nodeid(),
            Err(ProtocolError::WrongType { field: "nodeid", .. })
        ));
    }

    #[test]
    fn set_type_resets_aux() {
        let mut msg = Message::new(MsgType::Request);
        msg.set_matchtag(55).unwrap();
        msg.set_type(MsgType::Response);
        // matchtag survives the request -> response conversion
        assert_eq!(msg.matchtag().unwrap(), 55);
        assert_eq!(msg.errnum().unwrap(), 0);
        msg.set_type(MsgType::Event);
        assert_eq!(msg.seq().unwrap(), 0);
    }

    #[test]
    fn payload_zero_bytes_clears_flag() {
        let mut msg = Message::new(MsgType::Request);
        msg.set_payload(b"hello").unwrap();
        assert!(msg.has_payload());
        msg.set_payload(&[]).unwrap();
        assert!(!msg.has_payload());
        assert!(msg.payload().is_err());
    }

    #[test]
    fn payload_overlap_rejected() {
        let mut msg = Message::new(MsgType::Request);
        msg.set_payload(b"abcdefgh").unwrap();
        let alias: &[u8] = &msg.payload.clone();
        // partial alias of the live storage
        let err = msg.set_payload(&alias[2..5]).unwrap_err();
        assert_eq!(err, ProtocolError::PayloadOverlap);
    }

    #[test]
    fn string_payload_requires_nul() {
        let mut msg = Message::new(MsgType::Request);
        msg.set_payload(b"not terminated").unwrap();
        assert_eq!(msg.get_string(), Err(ProtocolError::PayloadNotString));
        msg.set_string("terminated").unwrap();
        assert_eq!(msg.get_string().unwrap(), "terminated");
    }

    #[test]
    fn json_pack_unpack() {
        let mut msg = Message::request("scratchpad.ll");
        msg.pack(&json!({"key": "x", "version": 3})).unwrap();
        let v = msg.unpack().unwrap();
        assert_eq!(v["key"], "x");
        assert_eq!(v["version"], 3);
    }

    #[test]
    fn json_pack_rejects_non_object() {
        let mut msg = Message::request("a.b");
        assert_eq!(msg.pack(&json!([1, 2])), Err(ProtocolError::PayloadNotObject));
        assert_eq!(msg.pack(&json!(42)), Err(ProtocolError::PayloadNotObject));
    }

    #[test]
    fn route_ops_require_enable() {
        let mut msg = Message::new(MsgType::Request);
        assert_eq!(msg.route_push("1"), Err(ProtocolError::RouteDisabled));
        msg.route_enable();
        msg.route_push("0").unwrap();
        msg.route_push("2").unwrap();
        assert_eq!(msg.route_first(), Some("0"));
        assert_eq!(msg.route_last(), Some("2"));
        assert_eq!(msg.route_count(), 2);
        msg.route_disable();
        assert_eq!(msg.route_count(), 0);
        assert!(!msg.has_route());
    }

    #[test]
    fn route_disable_clears_content() {
        let mut msg = Message::new(MsgType::Request);
        msg.route_enable();
        msg.route_push("7").unwrap();
        msg.route_disable();
        msg.route_enable();
        assert_eq!(msg.route_count(), 0);
    }

    #[test]
    fn response_derivation() {
        let mut req = Message::request("overlay.monitor");
        req.set_matchtag(9).unwrap();
        req.set_rolemask(RoleMask::OWNER);
        req.route_enable();
        req.route_push("3").unwrap();
        let resp = Message::response_to(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::Response);
        assert_eq!(resp.matchtag().unwrap(), 9);
        assert_eq!(resp.topic().unwrap(), "overlay.monitor");
        assert_eq!(resp.route_last(), Some("3"));
        assert_eq!(resp.errnum().unwrap(), 0);
    }

    #[test]
    fn response_to_noresponse_fails() {
        let mut req = Message::request("scratchpad.delete");
        req.set_noresponse();
        assert!(Message::response_to(&req).is_err());
    }

    #[test]
    fn streaming_noresponse_exclusion() {
        let mut msg = Message::request("a.b");
        msg.set_streaming();
        msg.set_noresponse();
        assert!(!msg.is_streaming());
        assert!(msg.is_noresponse());
        msg.set_streaming();
        assert!(msg.is_streaming());
        assert!(!msg.is_noresponse());
        assert!(msg.set_flags(MsgFlags::STREAMING | MsgFlags::NORESPONSE).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut msg = Message::request("service.method");
        msg.set_nodeid(5).unwrap();
        msg.set_matchtag(17).unwrap();
        msg.set_userid(1000);
        msg.set_rolemask(RoleMask::OWNER);
        msg.pack(&json!({"k": [1, 2, 3]})).unwrap();
        msg.route_enable();
        msg.route_push("0").unwrap();
        msg.route_push("2").unwrap();

        let wire = msg.encode();
        assert_eq!(wire.len(), msg.encode_size());
        let back = Message::decode(&wire).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.route_first(), Some("0"));
        assert_eq!(back.route_last(), Some("2"));
    }

    #[test]
    fn encode_into_short_buffer_fails() {
        let mut msg = Message::request("x.y");
        msg.set_payload(b"payload").unwrap();
        let mut small = [0u8; 4];
        assert!(matches!(
            msg.encode_into(&mut small),
            Err(ProtocolError::ShortBuffer { .. })
        ));
        let mut big = vec![0u8; msg.encode_size()];
        let n = msg.encode_into(&mut big).unwrap();
        assert_eq!(n, msg.encode_size());
        assert_eq!(Message::decode(&big[..n]).unwrap(), msg);
    }

    #[test]
    fn decode_requires_final_proto_frame() {
        // A single empty frame: not a proto frame.
        assert!(Message::decode(&[0]).is_err());
        // Valid message with trailing garbage frame after proto.
        let msg = Message::keepalive(0, KeepaliveStatus::Normal);
        let mut wire = msg.encode();
        wire.push(1);
        wire.push(0xaa);
        assert!(Message::decode(&wire).is_err());
        // Truncated length prefix.
        assert!(Message::decode(&[0xff, 0, 0]).is_err());
    }

    #[test]
    fn large_frame_length_prefix() {
        let mut msg = Message::new(MsgType::Request);
        msg.set_topic(Some("t".repeat(300)));
        let wire = msg.encode();
        assert_eq!(wire.len(), msg.encode_size());
        let back = Message::decode(&wire).unwrap();
        assert_eq!(back.topic().unwrap().len(), 300);
    }

    #[test]
    fn frames_count() {
        let mut msg = Message::request("a.b");
        assert_eq!(msg.frames(), 2); // topic + proto
        msg.set_payload(b"p").unwrap();
        assert_eq!(msg.frames(), 3);
        msg.route_enable();
        assert_eq!(msg.frames(), 4); // + delimiter
        msg.route_push("1").unwrap();
        msg.route_push("2").unwrap();
        assert_eq!(msg.frames(), 6);
    }

    #[test]
    fn copy_without_payload() {
        let mut msg = Message::request("a.b");
        msg.set_payload(b"data").unwrap();
        let cpy = msg.copy(false);
        assert!(!cpy.has_payload());
        let full = msg.copy(true);
        assert_eq!(full.payload().unwrap(), b"data");
    }

    #[test]
    fn keepalive_round_trip() {
        let msg = Message::keepalive(0, KeepaliveStatus::TestPause);
        let wire = msg.encode();
        let back = Message::decode(&wire).unwrap();
        let (errnum, status) = back.keepalive_decode().unwrap();
        assert_eq!(errnum, 0);
        assert_eq!(status, KeepaliveStatus::TestPause);
    }

    #[test]
    fn matchtag_foreign_domain() {
        let mut resp = Message::new(MsgType::Response);
        resp.set_matchtag(5).unwrap();
        assert!(resp.cmp_matchtag(5));
        resp.route_enable();
        resp.route_push("9").unwrap();
        assert!(!resp.cmp_matchtag(5));
    }

    fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(1u8..=255, 1..200)
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            topic in prop::option::of("[a-z.]{1,40}"),
            payload in prop::option::of(arb_payload()),
            routes in prop::collection::vec("[0-9]{1,6}", 0..5),
            route_enabled in any::<bool>(),
            userid in any::<u32>(),
            aux1 in any::<u32>(),
            aux2 in any::<u32>(),
        ) {
            let mut msg = Message::new(MsgType::Request);
            msg.set_topic(topic);
            if let Some(p) = payload {
                msg.set_payload(&p).unwrap();
            }
            if route_enabled || !routes.is_empty() {
                msg.route_enable();
                for id in &routes {
                    msg.route_push(id.clone()).unwrap();
                }
            }
            msg.set_userid(userid);
            msg.set_nodeid(aux1).unwrap();
            msg.set_matchtag(aux2).unwrap();

            let wire = msg.encode();
            prop_assert_eq!(wire.len(), msg.encode_size());
            let back = Message::decode(&wire).unwrap();
            prop_assert_eq!(back, msg);
        }
    }
}
