//! In-memory transport that replays canned replies. Used for dry runs and tests.

use super::transport::{Body, Request, Response, Transport, TransportFactory, TransportOptions};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    network_error: Option<String>,
    repeat: bool,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            network_error: None,
            repeat: false,
        }
    }

    pub fn ok_json(body: serde_json::Value) -> Self {
        Self::status(200)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    pub fn network_error(message: &str) -> Self {
        Self {
            network_error: Some(message.to_string()),
            ..Self::status(0)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Keep answering with this reply once it is the last one queued.
    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    log: Mutex<Vec<(Instant, Request)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, method: &str, url: &str, reply: Reply) {
        let mut replies = match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        replies
            .entry((method.to_uppercase(), url.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.timed_requests().into_iter().map(|(_, r)| r).collect()
    }

    pub fn timed_requests(&self) -> Vec<(Instant, Request)> {
        match self.log.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, method: &str, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method.as_str().eq_ignore_ascii_case(method) && r.url == url)
            .count()
    }

    fn next_reply(&self, request: &Request) -> Option<Reply> {
        let mut replies = match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = replies.get_mut(&(request.method.as_str().to_string(), request.url.clone()))?;
        match queue.len() {
            0 => None,
            1 if queue.front().map(|r| r.repeat).unwrap_or(false) => queue.front().cloned(),
            _ => queue.pop_front(),
        }
    }
}

/// Hands out the same scripted transport for every client a run builds.
#[derive(Clone, Default)]
pub struct ScriptedFactory(pub Arc<ScriptedTransport>);

impl TransportFactory for ScriptedFactory {
    fn build(&self, _options: &TransportOptions) -> Result<Arc<dyn Transport>> {
        Ok(self.0.clone())
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        match self.log.lock() {
            Ok(mut guard) => guard.push((Instant::now(), request.clone())),
            Err(poisoned) => poisoned.into_inner().push((Instant::now(), request.clone())),
        }

        let Some(reply) = self.next_reply(request) else {
            let body = format!("no scripted reply for {} {}", request.method, request.url);
            return Ok(Response::new(404, Vec::new(), Body::new(Cursor::new(body.into_bytes()))));
        };

        if let Some(message) = reply.network_error {
            return Err(Error::http_transport(
                request.method.as_str(),
                request.url.as_str(),
                message,
                1,
            ));
        }
        Ok(Response::new(
            reply.status,
            reply.headers,
            Body::new(Cursor::new(reply.body)),
        ))
    }
}
