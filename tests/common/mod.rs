//! Shared helpers for integration tests: a scripted HTTP transport and log setup

#![allow(dead_code)]

use s2pipe::io::HttpTransport;
use s2pipe::{S2Error, S2Result};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Bytes(Vec<u8>),
    Status(u16),
}

struct Route {
    pattern: String,
    exact: bool,
    replies: VecDeque<Reply>,
}

/// Answers requests from scripted routes.
///
/// Exact routes win over substring routes. Each route plays its replies in
/// order and repeats the last one. Unknown URLs get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_exact(self, url: &str, replies: Vec<Reply>) -> Self {
        self.push(url, true, replies)
    }

    pub fn on_contains(self, pattern: &str, replies: Vec<Reply>) -> Self {
        self.push(pattern, false, replies)
    }

    fn push(self, pattern: &str, exact: bool, replies: Vec<Reply>) -> Self {
        self.routes.lock().unwrap().push(Route {
            pattern: pattern.to_string(),
            exact,
            replies: replies.into(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn reply(&self, url: &str) -> Reply {
        self.calls.lock().unwrap().push(url.to_string());
        let mut routes = self.routes.lock().unwrap();
        let idx = routes
            .iter()
            .position(|r| r.exact && r.pattern == url)
            .or_else(|| routes.iter().position(|r| !r.exact && url.contains(&r.pattern)));
        match idx {
            Some(i) => {
                let route = &mut routes[i];
                if route.replies.len() > 1 {
                    route.replies.pop_front().unwrap()
                } else {
                    route.replies.front().cloned().unwrap_or(Reply::Status(404))
                }
            }
            None => Reply::Status(404),
        }
    }
}

fn status_error(url: &str, status: u16) -> S2Error {
    S2Error::Http {
        status: Some(status),
        url: url.to_string(),
        message: format!("HTTP {}", status),
    }
}

impl HttpTransport for MockTransport {
    fn get_json(&self, url: &str) -> S2Result<Value> {
        match self.reply(url) {
            Reply::Json(v) => Ok(v),
            Reply::Bytes(b) => Ok(serde_json::from_slice(&b)?),
            Reply::Status(s) => Err(status_error(url, s)),
        }
    }

    fn download_to(&self, url: &str, sink: &mut dyn Write) -> S2Result<u64> {
        match self.reply(url) {
            Reply::Bytes(b) => {
                sink.write_all(&b)?;
                Ok(b.len() as u64)
            }
            Reply::Json(v) => {
                let b = serde_json::to_vec(&v)?;
                sink.write_all(&b)?;
                Ok(b.len() as u64)
            }
            Reply::Status(s) => Err(status_error(url, s)),
        }
    }
}

/// OData catalogue entry
pub fn product(id: &str, name: &str, start: &str) -> Value {
    json!({
        "Id": id,
        "Name": name,
        "ContentDate": {"Start": start, "End": start},
        "Footprint": "geography'SRID=4326;POLYGON ((-150 67, -148 67, -148 69, -150 69, -150 67))'",
        "ContentLength": 1000
    })
}

/// One catalogue page, optionally pointing at the next
pub fn page(items: Vec<Value>, next: Option<&str>) -> Value {
    match next {
        Some(next) => json!({"value": items, "@odata.nextLink": next}),
        None => json!({"value": items}),
    }
}

/// Node listing with `(name, content_length)` children
pub fn listing(children: &[(&str, Option<u64>)]) -> Value {
    let result: Vec<Value> = children
        .iter()
        .map(|(name, len)| match len {
            Some(len) => json!({"Name": name, "ContentLength": len}),
            None => json!({"Name": name}),
        })
        .collect();
    json!({ "result": result })
}
