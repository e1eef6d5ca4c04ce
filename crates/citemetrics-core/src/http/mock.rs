//! Scripted transport for tests. Never touches the network.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{HttpError, HttpRequest, HttpResponse, HttpTransport, Method};
use crate::resilience::ProxyEndpoint;

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum MockReply {
    Response(HttpResponse),
    Error(HttpError),
}

impl MockReply {
    pub fn html(body: impl Into<String>) -> Self {
        Self::Response(
            HttpResponse::new(200, "", body.into().into_bytes())
                .with_content_type("text/html; charset=utf-8"),
        )
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Response(
            HttpResponse::new(200, "", value.to_string().into_bytes())
                .with_content_type("application/json"),
        )
    }

    pub fn status(status: u16) -> Self {
        Self::Response(HttpResponse::new(status, "", Vec::new()))
    }

    pub fn timeout() -> Self {
        Self::Error(HttpError::Timeout { url: String::new() })
    }

    /// Pretend redirects ended at `final_url`.
    pub fn landed_at(self, final_url: &str) -> Self {
        match self {
            Self::Response(mut resp) => {
                resp.final_url = final_url.to_string();
                Self::Response(resp)
            }
            other => other,
        }
    }

    pub fn with_content_type(self, content_type: &str) -> Self {
        match self {
            Self::Response(resp) => Self::Response(resp.with_content_type(content_type)),
            other => other,
        }
    }
}

/// A request as seen by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub proxy: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Replies are scripted per exact URL. A sequence is consumed one reply
/// per call, and its last reply repeats once exhausted. Unscripted URLs
/// get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Vec<MockReply>>>,
    log: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always answer `url` with `reply`.
    pub fn on(&self, url: &str, reply: MockReply) -> &Self {
        self.on_sequence(url, vec![reply])
    }

    /// Answer `url` with `replies` in order, repeating the last one.
    pub fn on_sequence(&self, url: &str, mut replies: Vec<MockReply>) -> &Self {
        // Reversed so pop() yields the next reply.
        replies.reverse();
        lock(&self.routes).insert(url.to_string(), replies);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.log).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.log).len()
    }

    /// Requests whose URL starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> usize {
        lock(&self.log)
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }

    fn next_reply(&self, url: &str) -> Option<MockReply> {
        let mut routes = lock(&self.routes);
        let replies = routes.get_mut(url)?;
        if replies.len() > 1 {
            replies.pop()
        } else {
            replies.first().cloned()
        }
    }
}

impl HttpTransport for MockTransport {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
        proxy: &'a ProxyEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        lock(&self.log).push(RecordedRequest {
            method: request.method,
            url: request.url.clone(),
            proxy: proxy.label().to_string(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });
        let reply = self.next_reply(&request.url);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match reply {
                Some(MockReply::Response(mut resp)) => {
                    if resp.final_url.is_empty() {
                        resp.final_url = request.url.clone();
                    }
                    Ok(resp)
                }
                Some(MockReply::Error(mut err)) => {
                    if let HttpError::Timeout { url } | HttpError::Connect { url, .. } = &mut err
                        && url.is_empty()
                    {
                        *url = request.url.clone();
                    }
                    Err(err)
                }
                None => Ok(HttpResponse::new(404, request.url.clone(), Vec::new())),
            }
        })
    }
}
