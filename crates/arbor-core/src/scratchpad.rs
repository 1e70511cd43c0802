//! Broker-scope scratchpad with load-link/store-conditional atomicity.
//!
//! The store is a JSON dictionary; each entry is `{"version": n, "data": v}`
//! and a missing key reads as `{"version": 0, "data": null}`. A
//! store-conditional succeeds only when it names the version it read,
//! so concurrent writers detect races instead of losing updates. The
//! data stays opaque to the service.
//!
//! Two write paths exist:
//!
//! - `sc`: one-shot; a version race fails with EDEADLK and the caller
//!   re-reads and retries.
//! - `sc-stream` + `sc-retry`: the streaming variant. A losing
//!   store-conditional gets the current `{version, data}` as a stream
//!   response; the caller retries with `sc-retry` (NORESPONSE) naming
//!   the stream's matchtag; the winning update terminates the stream
//!   with ENODATA. This saves a lock-step load-link round trip per race.
//!
//! The synthetic key `"."` reads the whole store with the global version
//! and is never writable.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use arbor_proto::Message;

use crate::{dispatch::RequestList, error::errno};

/// The LL/SC scratchpad service state.
#[derive(Debug, Default)]
pub struct Scratchpad {
    data: Map<String, Value>,
    version: u32,
    requests: RequestList,
}

impl Scratchpad {
    /// An empty scratchpad.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Global version: incremented by every successful update or delete.
    #[must_use]
    pub fn global_version(&self) -> u32 {
        self.version
    }

    /// Number of retained `sc-stream` requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    fn lookup(&self, key: &str) -> (u32, Value) {
        if key == "." {
            let data = if self.version == 0 {
                Value::Null
            } else {
                Value::Object(self.data.clone())
            };
            return (self.version, data);
        }
        match self.data.get(key) {
            Some(entry) => {
                let version = entry
                    .get("version")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let data = entry.get("data").cloned().unwrap_or(Value::Null);
                (version, data)
            }
            None => (0, Value::Null),
        }
    }

    fn update(&mut self, key: &str, version: u32, data: Value) -> Result<(), u32> {
        if key == "." {
            return Err(errno::EROFS);
        }
        self.data
            .insert(key.to_string(), json!({"version": version, "data": data}));
        self.version += 1;
        Ok(())
    }

    /// `scratchpad.ll`: fetch an entry by key.
    pub fn ll(&mut self, msg: &Message) -> Vec<Message> {
        let Some(key) = unpack_key(msg) else {
            return error_response(msg, errno::EPROTO, "");
        };
        let (version, data) = self.lookup(&key);
        respond_pack(msg, &json!({"version": version, "data": data}))
    }

    /// `scratchpad.sc`: conditionally update an entry. A version race
    /// fails with EDEADLK and is retryable.
    pub fn sc(&mut self, msg: &Message) -> Vec<Message> {
        let Some((key, version, data)) = unpack_sc(msg) else {
            return error_response(msg, errno::EPROTO, "");
        };
        let (cur_version, _) = self.lookup(&key);
        if cur_version != version {
            return error_response(msg, errno::EDEADLK, "");
        }
        if let Err(e) = self.update(&key, version + 1, data) {
            return error_response(msg, e, "");
        }
        respond_empty(msg)
    }

    /// `scratchpad.sc-stream`: streaming store-conditional. The winning
    /// update terminates with ENODATA; a race returns the current entry
    /// as a load-link response and retains the request for retries.
    pub fn sc_stream(&mut self, msg: &Message) -> Vec<Message> {
        let Some((key, version, data)) = unpack_sc(msg) else {
            return error_response(msg, errno::EPROTO, "");
        };
        if !msg.is_streaming() {
            return error_response(msg, errno::EINVAL, "");
        }
        let (cur_version, cur_data) = self.lookup(&key);
        if cur_version == version {
            if let Err(e) = self.update(&key, version + 1, data) {
                return error_response(msg, e, "");
            }
            return error_response(msg, errno::ENODATA, "");
        }
        self.requests.push(msg.clone());
        respond_pack(msg, &json!({"version": cur_version, "data": cur_data}))
    }

    /// `scratchpad.sc-retry`: retry an active `sc-stream`, located by
    /// matchtag and sender. The retry itself is never answered; a retry
    /// naming an expired matchtag is dropped (the originator already
    /// gave up).
    pub fn sc_retry(&mut self, msg: &Message) -> Vec<Message> {
        let Some((matchtag, version, data)) = unpack_retry(msg) else {
            return Vec::new();
        };
        if !msg.is_noresponse() {
            return error_response(msg, errno::EPROTO, "NORESPONSE flag is missing from request");
        }
        let Some(request) = self.requests.find_cancel(msg).cloned() else {
            debug!(matchtag, "sc-retry for expired matchtag dropped");
            return Vec::new();
        };
        let Some(key) = unpack_key(&request) else {
            return Vec::new();
        };
        let (cur_version, cur_data) = self.lookup(&key);
        if cur_version == version {
            if let Err(e) = self.update(&key, version + 1, data) {
                return error_response(&request, e, "");
            }
            // Terminal response: the stream is finished, drop it.
            self.requests.take_matching(matchtag, msg);
            return error_response(&request, errno::ENODATA, "");
        }
        respond_pack(&request, &json!({"version": cur_version, "data": cur_data}))
    }

    /// `scratchpad.delete`: remove an entry, bumping the global version.
    /// Never answered; the request must carry NORESPONSE.
    pub fn delete(&mut self, msg: &Message) -> Vec<Message> {
        if !msg.is_noresponse() {
            return error_response(msg, errno::EPROTO, "NORESPONSE flag is missing from request");
        }
        let Some(key) = unpack_key(msg) else {
            return Vec::new();
        };
        if self.data.remove(&key).is_some() {
            self.version += 1;
        }
        Vec::new()
    }

    /// `scratchpad.disconnect`: drop retained streams from a departing
    /// sender.
    pub fn disconnect(&mut self, msg: &Message) {
        let dropped = self.requests.disconnect(msg);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped sc-stream requests on disconnect");
        }
    }

    /// Service teardown: answer every retained stream with ENOSYS before
    /// the request list goes away.
    pub fn shutdown(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        for req in self.requests.drain() {
            out.extend(error_response(&req, errno::ENOSYS, ""));
        }
        out
    }
}

fn unpack_key(msg: &Message) -> Option<String> {
    let payload = msg.unpack().ok()?;
    payload.get("key")?.as_str().map(str::to_string)
}

fn unpack_sc(msg: &Message) -> Option<(String, u32, Value)> {
    let payload = msg.unpack().ok()?;
    let key = payload.get("key")?.as_str()?.to_string();
    let version = u32::try_from(payload.get("version")?.as_u64()?).ok()?;
    let data = payload.get("data")?.clone();
    Some((key, version, data))
}

fn unpack_retry(msg: &Message) -> Option<(u32, u32, Value)> {
    let payload = msg.unpack().ok()?;
    let matchtag = u32::try_from(payload.get("matchtag")?.as_u64()?).ok()?;
    let version = u32::try_from(payload.get("version")?.as_u64()?).ok()?;
    let data = payload.get("data")?.clone();
    Some((matchtag, version, data))
}

fn respond_pack(req: &Message, payload: &Value) -> Vec<Message> {
    match Message::response_to(req) {
        Ok(mut resp) => match resp.pack(payload) {
            Ok(()) => vec![resp],
            Err(e) => {
                warn!(error = %e, "error packing scratchpad response");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

fn respond_empty(req: &Message) -> Vec<Message> {
    match Message::response_to(req) {
        Ok(resp) => vec![resp],
        Err(_) => Vec::new(),
    }
}

fn error_response(req: &Message, errnum: u32, errstr: &str) -> Vec<Message> {
    if req.is_noresponse() {
        return Vec::new();
    }
    let Ok(mut resp) = Message::response_to(req) else {
        return Vec::new();
    };
    if resp.set_errnum(errnum).is_err() {
        return Vec::new();
    }
    if !errstr.is_empty() && resp.set_string(errstr).is_err() {
        return Vec::new();
    }
    vec![resp]
}
