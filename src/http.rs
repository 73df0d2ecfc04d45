use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::SourceError;

const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            json: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Connection-level failure (timeout, DNS, reset). Always treated as transient.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// One HTTP exchange. Non-2xx statuses are responses, not errors.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(req).await
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        };
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &req.json {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// Bounded retry with exponential backoff: `base * 2^attempt` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Politeness pause before every attempt.
    pub request_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            request_delay: Duration::ZERO,
        }
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }

    pub async fn send<T: Transport>(
        &self,
        transport: &T,
        req: &HttpRequest,
    ) -> Result<HttpResponse, SourceError> {
        let attempts = self.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            match transport.send(req).await {
                Ok(resp) if resp.is_success() => return Ok(resp),
                Ok(resp) if RETRY_STATUSES.contains(&resp.status) => {
                    last = format!("HTTP {}", resp.status);
                }
                Ok(resp) => {
                    return Err(SourceError::Permanent(format!(
                        "HTTP {} from {}: {}",
                        resp.status,
                        req.url,
                        snippet(&resp.body)
                    )));
                }
                Err(e) => last = e.to_string(),
            }

            if attempt + 1 < attempts {
                let backoff = self.backoff(attempt);
                warn!(
                    "{} on {} (attempt {}/{}), backing off {:.1}s",
                    last,
                    req.url,
                    attempt + 1,
                    attempts,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SourceError::Unavailable { attempts, last })
    }
}

fn snippet(body: &str) -> String {
    let s: String = body.chars().take(200).collect();
    s.replace('\n', " ")
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    type Scripted = Result<HttpResponse, TransportError>;

    /// Canned responses keyed by URL substring. The last response of a route
    /// repeats once the queue is down to one.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<(String, VecDeque<Scripted>)>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, pattern: &str, status: u16, body: impl Into<String>) -> Self {
            self.push(
                pattern,
                Ok(HttpResponse {
                    status,
                    body: body.into(),
                }),
            )
        }

        pub fn fail(self, pattern: &str, message: &str) -> Self {
            self.push(pattern, Err(TransportError(message.to_string())))
        }

        fn push(self, pattern: &str, item: Scripted) -> Self {
            {
                let mut routes = self.routes.lock().unwrap();
                match routes.iter_mut().find(|(p, _)| p == pattern) {
                    Some((_, queue)) => queue.push_back(item),
                    None => routes.push((pattern.to_string(), VecDeque::from([item]))),
                }
            }
            self
        }

        pub fn calls_to(&self, pattern: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.contains(pattern))
                .count()
        }
    }

    fn clone_scripted(item: &Scripted) -> Scripted {
        match item {
            Ok(r) => Ok(r.clone()),
            Err(e) => Err(TransportError(e.0.clone())),
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(req.clone());
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .iter_mut()
                .find(|(p, _)| req.url.contains(p.as_str()))
                .map(|(_, q)| q)
                .ok_or_else(|| TransportError(format!("no route for {}", req.url)))?;
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue
                    .front()
                    .map(clone_scripted)
                    .unwrap_or_else(|| Err(TransportError("empty route".into())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::ZERO)
    }

    #[tokio::test]
    async fn recovers_after_three_503s() {
        let t = ScriptedTransport::new()
            .on("example.com", 503, "")
            .on("example.com", 503, "")
            .on("example.com", 503, "")
            .on("example.com", 200, "ok");
        let resp = policy()
            .send(&t, &HttpRequest::get("https://example.com/x"))
            .await
            .unwrap();
        assert_eq!(resp.body, "ok");
        assert_eq!(t.calls_to("example.com"), 4);
    }

    #[tokio::test]
    async fn exhausted_budget_is_unavailable() {
        let t = ScriptedTransport::new().on("example.com", 503, "");
        let err = policy()
            .send(&t, &HttpRequest::get("https://example.com/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { attempts: 4, .. }));
        assert_eq!(t.calls_to("example.com"), 4);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let t = ScriptedTransport::new()
            .on("example.com", 404, "nope")
            .on("example.com", 200, "ok");
        let err = policy()
            .send(&t, &HttpRequest::get("https://example.com/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
        assert_eq!(t.calls_to("example.com"), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_transient() {
        let t = ScriptedTransport::new()
            .fail("example.com", "timed out")
            .on("example.com", 429, "")
            .on("example.com", 200, "ok");
        let resp = policy()
            .send(&t, &HttpRequest::get("https://example.com/x"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(t.calls_to("example.com"), 3);
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::new(4, Duration::from_millis(1000));
        assert_eq!(p.backoff(0), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(4000));
    }
}
