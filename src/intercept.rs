use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use url::Url;

use crate::book::BookHandle;
use crate::cache::ResourceCache;
use crate::error::AcquireError;
use crate::fetch::{FetchRequest, FetchResponse, HttpFetcher, fetch_with_retry};
use crate::session::SessionManager;

/// Script served in place of the hook URL and injected into reader pages.
/// It decorates the in-page canvas renderer to expose a markdown buffer and a
/// rendering-complete flag.
pub const HOOK_SCRIPT: &str = include_str!("../assets/hook.js");

/// Synthetic URL the injected `<script>` tag points at. Must load before the
/// app script it decorates, so the tag goes at the end of `<head>`.
pub const HOOK_SCRIPT_URL: &str = "https://weread.qq.com/web/hook.js";

/// Endpoints that exist only to feed anti-automation telemetry. Answered
/// synthetically so nothing reaches the origin.
const TELEMETRY_PATH_FRAGMENTS: &[&str] = &["/web/report", "/wlog/", "/mplog", "/collect", "/beacon"];

const CSP_REPORT_PATH_FRAGMENT: &str = "/csp-report";

/// Hosts whose responses get permissive CORS headers so the reader page can
/// consume them cross-origin.
const ASSET_HOSTS: &[&str] = &["res.weread.qq.com", "cdn.weread.qq.com", "rescdn.qqmail.com"];

/// Request headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["traceparent", "tracestate", "x-request-id", "cookie"];

const STATIC_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2", ".ttf",
];

/// One intercepted browser request; lives only for one decision. The
/// classification is method/URL driven, so request bodies are not captured.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl InterceptedRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_owned(),
            url: url.into(),
            headers: HashMap::new(),
        }
    }
}

/// What to do with one intercepted request. Computed once from URL/method
/// pattern matching; fully determines the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    /// Let the browser issue the request untouched.
    Continue,
    /// Serve the local hook script byte-for-byte; no network.
    ScriptInject,
    /// Canned synthetic response; no network.
    Mock {
        status: u16,
        content_type: &'static str,
        body: &'static str,
    },
    /// Static sub-resource: cache lookup, fetch-and-persist on miss.
    CacheOrFetch,
    /// Fetch the app script and patch its copyright guard before serving.
    RewriteBody,
    /// Drop with no response at all.
    Drop,
    /// Forward with rewritten cookie/headers, then post-process the response.
    PassThroughFetch,
}

/// Classify one request. First match wins; the ordering is a contract.
pub fn classify(request: &InterceptedRequest) -> InterceptDecision {
    let url = &request.url;

    // 1. The browser's own machinery is none of our business.
    if url.starts_with("chrome-extension://") || url.starts_with("devtools://") {
        return InterceptDecision::Continue;
    }

    // 2. The hook script never comes from the network.
    if url == HOOK_SCRIPT_URL || url.starts_with(&format!("{HOOK_SCRIPT_URL}?")) {
        return InterceptDecision::ScriptInject;
    }

    // 3. Preflights get a permissive canned answer.
    if request.method.eq_ignore_ascii_case("OPTIONS") {
        return InterceptDecision::Mock {
            status: 200,
            content_type: "text/plain",
            body: "",
        };
    }

    let path = url_path(url);

    // 4. The app bundle is a static script, but it must be patched, so it is
    //    matched ahead of the generic static-resource rule.
    if path.contains("/app.") && path.ends_with(".js") {
        return InterceptDecision::RewriteBody;
    }

    // 5. Static sub-resources come from the idempotent disk cache.
    if request.method.eq_ignore_ascii_case("GET")
        && STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    {
        return InterceptDecision::CacheOrFetch;
    }

    // 6. Telemetry is answered locally so the origin never sees it.
    if TELEMETRY_PATH_FRAGMENTS
        .iter()
        .any(|fragment| path.contains(fragment))
    {
        return InterceptDecision::Mock {
            status: 200,
            content_type: "application/json",
            body: "{}",
        };
    }

    // 7. CSP violation reports are dropped silently.
    if path.contains(CSP_REPORT_PATH_FRAGMENT) {
        return InterceptDecision::Drop;
    }

    InterceptDecision::PassThroughFetch
}

/// The response handed back to the browser for a serviced request.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum InterceptOutcome {
    Continue,
    Drop,
    Respond(ServedResponse),
}

/// Executes interception decisions: answers from the cache or canned bodies,
/// or proxies through the retrying fetcher with header/cookie rewriting.
pub struct Interceptor {
    book: BookHandle,
    session: Arc<SessionManager>,
    cache: ResourceCache,
    fetcher: Arc<dyn HttpFetcher>,
}

impl Interceptor {
    pub fn new(
        book: BookHandle,
        session: Arc<SessionManager>,
        cache: ResourceCache,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Self {
            book,
            session,
            cache,
            fetcher,
        }
    }

    /// Produce exactly one outcome for one intercepted request.
    ///
    /// This is the only window into why scraped content might be wrong, so
    /// every decision and every real fetch is logged with timing and size.
    pub async fn handle(
        &self,
        request: &InterceptedRequest,
    ) -> Result<InterceptOutcome, AcquireError> {
        let started = Instant::now();
        let decision = classify(request);
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            ?decision,
            "intercept"
        );

        let outcome = match &decision {
            InterceptDecision::Continue => InterceptOutcome::Continue,
            InterceptDecision::Drop => InterceptOutcome::Drop,
            InterceptDecision::ScriptInject => InterceptOutcome::Respond(ServedResponse {
                status: 200,
                headers: vec![(
                    "content-type".to_owned(),
                    "text/javascript; charset=utf-8".to_owned(),
                )],
                body: HOOK_SCRIPT.as_bytes().to_vec(),
            }),
            InterceptDecision::Mock {
                status,
                content_type,
                body,
            } => {
                let mut headers = cors_headers();
                if !content_type.is_empty() {
                    headers.push(("content-type".to_owned(), (*content_type).to_owned()));
                }
                InterceptOutcome::Respond(ServedResponse {
                    status: *status,
                    headers,
                    body: body.as_bytes().to_vec(),
                })
            }
            InterceptDecision::CacheOrFetch => self.cache_or_fetch(request).await?,
            InterceptDecision::RewriteBody => self.rewrite_app_script(request).await?,
            InterceptDecision::PassThroughFetch => self.proxy_fetch(request).await?,
        };

        if let InterceptOutcome::Respond(response) = &outcome {
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                status = response.status,
                bytes = response.body.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "intercept served"
            );
        }
        Ok(outcome)
    }

    async fn cache_or_fetch(
        &self,
        request: &InterceptedRequest,
    ) -> Result<InterceptOutcome, AcquireError> {
        let path = url_path(&request.url);
        if let Some(bytes) = self
            .cache
            .load(&path)
            .with_context(|| format!("cache lookup: {path}"))?
        {
            tracing::debug!(url = %request.url, bytes = bytes.len(), "cache hit");
            return Ok(InterceptOutcome::Respond(ServedResponse {
                status: 200,
                headers: vec![("content-type".to_owned(), content_type_for(&path).to_owned())],
                body: bytes,
            }));
        }

        let fetched = fetch_with_retry(self.fetcher.as_ref(), &forwarded(request)).await?;
        if (200..300).contains(&fetched.status) {
            self.cache
                .store(&path, &fetched.body)
                .with_context(|| format!("cache store: {path}"))?;
        }
        Ok(InterceptOutcome::Respond(ServedResponse {
            status: fetched.status,
            headers: vec![("content-type".to_owned(), content_type_for(&path).to_owned())],
            body: fetched.body,
        }))
    }

    async fn rewrite_app_script(
        &self,
        request: &InterceptedRequest,
    ) -> Result<InterceptOutcome, AcquireError> {
        let fetched = fetch_with_retry(self.fetcher.as_ref(), &forwarded(request)).await?;
        let body = match patch_copyright_guard(&fetched.body) {
            Some(patched) => {
                tracing::info!(url = %request.url, "patched app script copyright guard");
                patched
            }
            None => {
                tracing::warn!(url = %request.url, "copyright guard not found in app script");
                fetched.body
            }
        };
        Ok(InterceptOutcome::Respond(ServedResponse {
            status: fetched.status,
            headers: vec![(
                "content-type".to_owned(),
                "text/javascript; charset=utf-8".to_owned(),
            )],
            body,
        }))
    }

    async fn proxy_fetch(
        &self,
        request: &InterceptedRequest,
    ) -> Result<InterceptOutcome, AcquireError> {
        let mut upstream = FetchRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: Vec::new(),
        };
        for (name, value) in &request.headers {
            if STRIPPED_REQUEST_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
            {
                continue;
            }
            upstream.headers.push((name.clone(), value.clone()));
        }
        // The session owns cookies; whatever the browser sent is replaced.
        upstream
            .headers
            .push(("Cookie".to_owned(), self.session.cookie_header()));

        let fetched = fetch_with_retry(self.fetcher.as_ref(), &upstream).await?;
        let response = self.post_process(&request.url, fetched);
        Ok(InterceptOutcome::Respond(response))
    }

    fn post_process(&self, url: &str, fetched: FetchResponse) -> ServedResponse {
        let mut headers: Vec<(String, String)> = fetched
            .headers
            .into_iter()
            // Injected scripts must not be blocked by the origin's policy.
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-security-policy")
                    && !name.eq_ignore_ascii_case("content-security-policy-report-only")
            })
            .collect();

        if is_asset_host(url) {
            headers.extend(cors_headers());
        }

        let mut body = fetched.body;
        if url.starts_with(self.book.reader_root_url()) {
            body = patch_reader_page(&body);
        }

        ServedResponse {
            status: fetched.status,
            headers,
            body,
        }
    }
}

fn forwarded(request: &InterceptedRequest) -> FetchRequest {
    let mut out = FetchRequest {
        method: request.method.clone(),
        url: request.url.clone(),
        headers: Vec::new(),
    };
    for (name, value) in &request.headers {
        out.headers.push((name.clone(), value.clone()));
    }
    out
}

fn cors_headers() -> Vec<(String, String)> {
    vec![
        ("access-control-allow-origin".to_owned(), "*".to_owned()),
        (
            "access-control-allow-methods".to_owned(),
            "GET, POST, OPTIONS".to_owned(),
        ),
        ("access-control-allow-headers".to_owned(), "*".to_owned()),
    ]
}

fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url.to_owned(),
    }
}

fn is_asset_host(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    match parsed.host_str() {
        Some(host) => ASSET_HOSTS.iter().any(|asset| host.eq_ignore_ascii_case(asset)),
        None => false,
    }
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default();
    match ext {
        "js" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Neutralize the in-bundle copyright gate: replace the body of the
/// `isCopyRightForbiddenRead` function with `return false;`.
pub fn patch_copyright_guard(script: &[u8]) -> Option<Vec<u8>> {
    let marker = find_subslice(script, b"'isCopyRightForbiddenRead':function")?;
    let open = marker + find_subslice(&script[marker..], b"{")?;
    let close = open + find_subslice(&script[open..], b"}")?;

    let mut patched = Vec::with_capacity(script.len());
    patched.extend_from_slice(&script[..=open]);
    patched.extend_from_slice(b"return false;");
    patched.extend_from_slice(&script[close..]);
    Some(patched)
}

/// Reader-page rewrite: un-mark the book as sold out and inject the hook
/// script tag immediately before `</head>` so it runs ahead of the app.
pub fn patch_reader_page(body: &[u8]) -> Vec<u8> {
    let mut out = replace_subslice(body, b"\"soldout\":1", b"\"soldout\":0");
    let tag = format!("<script src=\"{HOOK_SCRIPT_URL}\"></script>");
    if let Some(pos) = find_subslice(&out, b"</head>") {
        out.splice(pos..pos, tag.into_bytes());
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn replace_subslice(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    match find_subslice(haystack, needle) {
        Some(pos) => {
            let mut out = Vec::with_capacity(haystack.len());
            out.extend_from_slice(&haystack[..pos]);
            out.extend_from_slice(replacement);
            out.extend_from_slice(&haystack[pos + needle.len()..]);
            out
        }
        None => haystack.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::ScriptedFetcher;

    fn book() -> BookHandle {
        BookHandle::new("abc123")
    }

    fn interceptor(
        fetcher: Arc<ScriptedFetcher>,
        cache_dir: &std::path::Path,
    ) -> anyhow::Result<Interceptor> {
        let session = Arc::new(SessionManager::load(None)?);
        session.merge_set_cookie_headers(&["wr_vid=42", "wr_skey=abc"]);
        Ok(Interceptor::new(
            book(),
            session,
            ResourceCache::new(cache_dir),
            fetcher,
        ))
    }

    #[test]
    fn classification_order_is_a_contract() {
        let ext = InterceptedRequest::get("chrome-extension://abcdef/page.js");
        assert_eq!(classify(&ext), InterceptDecision::Continue);

        let hook = InterceptedRequest::get(HOOK_SCRIPT_URL);
        assert_eq!(classify(&hook), InterceptDecision::ScriptInject);

        let mut preflight = InterceptedRequest::get("https://weread.qq.com/web/book/read");
        preflight.method = "OPTIONS".to_owned();
        assert!(matches!(
            classify(&preflight),
            InterceptDecision::Mock { status: 200, .. }
        ));

        let app = InterceptedRequest::get("https://res.weread.qq.com/web/app.7f3a2b.js");
        assert_eq!(classify(&app), InterceptDecision::RewriteBody);

        let style = InterceptedRequest::get("https://res.weread.qq.com/web/style.css");
        assert_eq!(classify(&style), InterceptDecision::CacheOrFetch);

        let telemetry = InterceptedRequest::get("https://weread.qq.com/web/report?type=read");
        assert!(matches!(classify(&telemetry), InterceptDecision::Mock { .. }));

        let csp = InterceptedRequest::get("https://weread.qq.com/csp-report");
        assert_eq!(classify(&csp), InterceptDecision::Drop);

        let api = InterceptedRequest::get("https://weread.qq.com/web/book/chapterInfos");
        assert_eq!(classify(&api), InterceptDecision::PassThroughFetch);
    }

    #[test]
    fn post_to_static_path_is_not_cached() {
        let mut req = InterceptedRequest::get("https://weread.qq.com/web/submit.js");
        req.method = "POST".to_owned();
        assert_eq!(classify(&req), InterceptDecision::PassThroughFetch);
    }

    #[tokio::test]
    async fn second_static_request_hits_cache_not_network() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_ok(200, Vec::new(), b"body{color:red}");
        let interceptor = interceptor(fetcher.clone(), dir.path())?;

        let request = InterceptedRequest::get("https://res.weread.qq.com/web/style.css");
        let first = interceptor.handle(&request).await?;
        let second = interceptor.handle(&request).await?;

        assert_eq!(fetcher.call_count(), 1);
        let (InterceptOutcome::Respond(first), InterceptOutcome::Respond(second)) = (first, second)
        else {
            panic!("expected served responses");
        };
        assert_eq!(first.body, second.body);
        assert_eq!(second.body, b"body{color:red}");
        Ok(())
    }

    #[tokio::test]
    async fn telemetry_never_reaches_the_network() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = Arc::new(ScriptedFetcher::new());
        let interceptor = interceptor(fetcher.clone(), dir.path())?;

        for url in [
            "https://weread.qq.com/web/report?kind=read",
            "https://weread.qq.com/wlog/web",
            "https://weread.qq.com/mplog",
        ] {
            let outcome = interceptor.handle(&InterceptedRequest::get(url)).await?;
            let InterceptOutcome::Respond(response) = outcome else {
                panic!("telemetry should be answered synthetically");
            };
            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"{}");
        }
        assert_eq!(fetcher.call_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn hook_script_is_served_locally() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = Arc::new(ScriptedFetcher::new());
        let interceptor = interceptor(fetcher.clone(), dir.path())?;

        let outcome = interceptor
            .handle(&InterceptedRequest::get(HOOK_SCRIPT_URL))
            .await?;
        let InterceptOutcome::Respond(response) = outcome else {
            panic!("hook script should be served");
        };
        assert_eq!(response.body, HOOK_SCRIPT.as_bytes());
        assert_eq!(fetcher.call_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn proxy_rewrites_cookies_and_strips_csp() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_ok(
            200,
            vec![
                (
                    "content-security-policy".to_owned(),
                    "script-src 'self'".to_owned(),
                ),
                ("content-type".to_owned(), "text/html".to_owned()),
            ],
            b"<html><head></head><body>\"soldout\":1</body></html>",
        );
        let interceptor = interceptor(fetcher.clone(), dir.path())?;

        let mut request =
            InterceptedRequest::get(format!("{}abc123kdeadbeef", book().reader_root_url()));
        request
            .headers
            .insert("Cookie".to_owned(), "stale=1".to_owned());
        request
            .headers
            .insert("traceparent".to_owned(), "00-aa-bb-01".to_owned());

        let outcome = interceptor.handle(&request).await?;
        let InterceptOutcome::Respond(response) = outcome else {
            panic!("proxy should respond");
        };

        let sent = fetcher.requests.lock().unwrap();
        let upstream = &sent[0];
        let cookie = upstream
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
            .map(|(_, value)| value.clone());
        assert_eq!(cookie.as_deref(), Some("wr_skey=abc; wr_vid=42"));
        assert!(
            !upstream
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("traceparent"))
        );

        assert!(
            !response
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-security-policy"))
        );
        let body = String::from_utf8(response.body)?;
        assert!(body.contains(&format!("<script src=\"{HOOK_SCRIPT_URL}\"></script></head>")));
        assert!(body.contains("\"soldout\":0"));
        assert!(!body.contains("\"soldout\":1"));
        Ok(())
    }

    #[tokio::test]
    async fn asset_host_responses_gain_cors_headers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_ok(200, Vec::new(), b"{}");
        let interceptor = interceptor(fetcher.clone(), dir.path())?;

        let outcome = interceptor
            .handle(&InterceptedRequest::get(
                "https://res.weread.qq.com/api/font-config",
            ))
            .await?;
        let InterceptOutcome::Respond(response) = outcome else {
            panic!("expected response");
        };
        assert!(
            response
                .headers
                .iter()
                .any(|(name, value)| name == "access-control-allow-origin" && value == "*")
        );
        Ok(())
    }

    #[test]
    fn copyright_guard_is_neutralized() {
        let script = b"var x = {'isCopyRightForbiddenRead':function(){return this.check();}};";
        let patched = patch_copyright_guard(script).expect("marker present");
        let patched = String::from_utf8(patched).unwrap();
        assert!(patched.contains("'isCopyRightForbiddenRead':function(){return false;}"));
    }

    #[test]
    fn copyright_patch_without_marker_is_none() {
        assert!(patch_copyright_guard(b"var x = 1;").is_none());
    }
}
