use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::error::AcquireError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/93.0.4577.63 Safari/537.36";

/// Attempts per network fetch before the failure escalates.
pub const FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_owned(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeatable header, e.g. `Set-Cookie`.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Seam between acquisition logic and the HTTP client, so tests can count or
/// script fetches without touching the network.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("invalid method: {}", request.method))?;

        let mut builder = self.client.request(method, &request.url);
        let mut has_user_agent = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            builder = builder.header(name, value);
        }
        if !has_user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {}", request.method, request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read body: {}", request.url))?
            .to_vec();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Fetch with the local retry policy: transport errors and 5xx responses are
/// retried up to [`FETCH_ATTEMPTS`] times, then escalate as a typed failure.
/// Non-5xx responses (including 4xx) are returned as-is; the caller decides
/// what a 404 means for its request.
pub async fn fetch_with_retry(
    fetcher: &dyn HttpFetcher,
    request: &FetchRequest,
) -> Result<FetchResponse, AcquireError> {
    let started = std::time::Instant::now();
    for attempt in 1..=FETCH_ATTEMPTS {
        match fetcher.fetch(request).await {
            Ok(response) if response.status < 500 => {
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    bytes = response.body.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "fetch ok"
                );
                return Ok(response);
            }
            Ok(response) => {
                tracing::warn!(
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    attempt,
                    "fetch returned server error"
                );
            }
            Err(err) => {
                tracing::warn!(
                    method = %request.method,
                    url = %request.url,
                    attempt,
                    ?err,
                    "fetch failed"
                );
            }
        }
    }

    Err(AcquireError::FetchFailed {
        url: request.url.clone(),
        attempts: FETCH_ATTEMPTS,
    })
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted fetcher: pops one canned response per call and records every
    /// request it saw, so tests can assert exactly which fetches happened.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        responses: Mutex<std::collections::VecDeque<anyhow::Result<FetchResponse>>>,
        pub requests: Mutex<Vec<FetchRequest>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_ok(&self, status: u16, headers: Vec<(String, String)>, body: &[u8]) {
            self.responses.lock().unwrap().push_back(Ok(FetchResponse {
                status,
                headers,
                body: body.to_vec(),
            }));
        }

        pub fn push_json(&self, json: &str) {
            self.push_ok(
                200,
                vec![("content-type".to_owned(), "application/json".to_owned())],
                json.as_bytes(),
            );
        }

        pub fn push_err(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(anyhow::anyhow!("{message}")));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted response left")))
        }
    }
}
