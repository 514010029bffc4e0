use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch as cdp_fetch;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, ErrorReason};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt as _;

use crate::error::AcquireError;
use crate::intercept::{InterceptOutcome, InterceptedRequest, Interceptor};

/// Fixed diagnostics paths written when a DOM wait times out. Offline
/// inspection of these two files is the only observability surface.
pub const DIAGNOSTIC_HTML_PATH: &str = "webpage.html";
pub const DIAGNOSTIC_SCREENSHOT_PATH: &str = "screenshot.jpg";

const SELECTOR_POLL: Duration = Duration::from_millis(500);

pub const DEFAULT_WINDOW_SIZE: (u32, u32) = (1920, 1080);

/// Masks the automation fingerprints the reader checks for.
const WEBDRIVER_MASK_JS: &str = r#"() => {
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    var hasOwnProperty = Object.prototype.hasOwnProperty;
    Object.prototype.hasOwnProperty = function (key) {
        if (key === 'webdriver') {
            return false;
        }
        return hasOwnProperty.call(this, key);
    };
}"#;

/// The controllable-browser collaborator. Acquisition logic only ever talks
/// to this trait; tests drive it with scripted fakes.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AcquireError>;

    /// Evaluate a script in the page, returning its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AcquireError>;

    async fn click(&self, selector: &str) -> Result<(), AcquireError>;

    /// Wait for a selector to appear. `Ok(false)` means the bounded wait
    /// elapsed; diagnostics have already been persisted in that case.
    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, AcquireError>;

    async fn set_cookie(&self, name: &str, value: &str, url: &str) -> Result<(), AcquireError>;

    async fn cookies(&self) -> Result<Vec<(String, String)>, AcquireError>;

    /// Ensure every request the page issues flows through the interceptor.
    /// Idempotent; called before each navigation and each pagination click.
    async fn arm_interception(&self) -> Result<(), AcquireError>;

    async fn page_html(&self) -> Result<String, AcquireError>;

    async fn screenshot(&self, path: &Path) -> Result<(), AcquireError>;
}

/// Locate a usable chrome executable, PATH first, then the macOS app bundle.
pub fn find_chrome_executable() -> Result<PathBuf, AcquireError> {
    const NAMES: &[&str] = &["chrome", "google-chrome", "chromium", "chromium-browser"];

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    let mac_chrome = Path::new("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
    if mac_chrome.is_file() {
        return Ok(mac_chrome.to_path_buf());
    }

    Err(AcquireError::BrowserUnavailable)
}

pub struct BrowserLaunchOptions {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserLaunchOptions {
    fn default() -> Self {
        Self {
            headless: false,
            window_size: DEFAULT_WINDOW_SIZE,
            chrome_path: None,
        }
    }
}

/// Owns the launched chrome process and its CDP event loop.
pub struct ChromeBrowser {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
}

impl ChromeBrowser {
    pub async fn launch(options: BrowserLaunchOptions) -> Result<Self, AcquireError> {
        let chrome_path = match options.chrome_path {
            Some(path) => path,
            None => find_chrome_executable()?,
        };
        tracing::info!(chrome = %chrome_path.display(), "launch browser");

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&chrome_path)
            .window_size(options.window_size.0, options.window_size.1);
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|err| AcquireError::Other(anyhow::anyhow!("browser config: {err}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launch chrome over cdp")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::debug!(?err, "cdp handler stopped");
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
        })
    }

    pub async fn new_page(&self, interceptor: Arc<Interceptor>) -> Result<ChromePage, AcquireError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("open page")?;

        let mask = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(WEBDRIVER_MASK_JS)
            .build()
            .map_err(|err| anyhow::anyhow!("build mask script params: {err}"))?;
        page.execute(mask).await.context("install webdriver mask")?;

        Ok(ChromePage {
            page,
            interceptor,
            armed: AtomicBool::new(false),
        })
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.browser.close().await.context("close browser")?;
        self.handler_task.abort();
        Ok(())
    }
}

pub struct ChromePage {
    page: Page,
    interceptor: Arc<Interceptor>,
    armed: AtomicBool,
}

impl ChromePage {
    async fn dump_diagnostics(&self) {
        match self.page_html().await {
            Ok(html) => {
                if let Err(err) = std::fs::write(DIAGNOSTIC_HTML_PATH, html) {
                    tracing::warn!(?err, "write diagnostic html failed");
                } else {
                    tracing::info!(path = DIAGNOSTIC_HTML_PATH, "saved rendered html");
                }
            }
            Err(err) => tracing::warn!(?err, "read page html failed"),
        }
        if let Err(err) = self.screenshot(Path::new(DIAGNOSTIC_SCREENSHOT_PATH)).await {
            tracing::warn!(?err, "save diagnostic screenshot failed");
        } else {
            tracing::info!(path = DIAGNOSTIC_SCREENSHOT_PATH, "saved screenshot");
        }
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AcquireError> {
        tracing::info!(url, "navigate");
        let navigation = async {
            self.page.goto(url).await.context("goto")?;
            self.page
                .wait_for_navigation()
                .await
                .context("wait for navigation")?;
            Ok::<_, anyhow::Error>(())
        };
        match tokio::time::timeout(timeout, navigation).await {
            Ok(result) => result.map_err(AcquireError::Other),
            Err(_) => Err(AcquireError::NavigationTimeout {
                url: url.to_owned(),
            }),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AcquireError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .with_context(|| format!("evaluate: {script}"))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn click(&self, selector: &str) -> Result<(), AcquireError> {
        let script = format!("var e = document.querySelector('{selector}'); e && e.click();");
        self.evaluate(&script).await?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, AcquireError> {
        let script = format!("document.querySelector('{selector}') !== null;");
        let mut waited = Duration::ZERO;
        loop {
            let present = self.evaluate(&script).await?;
            if present.as_bool() == Some(true) {
                return Ok(true);
            }
            if waited >= timeout {
                tracing::warn!(selector, ?timeout, "selector wait timed out");
                self.dump_diagnostics().await;
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL).await;
            waited += SELECTOR_POLL;
        }
    }

    async fn set_cookie(&self, name: &str, value: &str, url: &str) -> Result<(), AcquireError> {
        let cookie = CookieParam::builder()
            .name(name)
            .value(value)
            .url(url)
            .build()
            .map_err(|err| anyhow::anyhow!("build cookie param: {err}"))?;
        self.page
            .set_cookie(cookie)
            .await
            .with_context(|| format!("set cookie: {name}"))?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>, AcquireError> {
        let cookies = self.page.get_cookies().await.context("read cookies")?;
        Ok(cookies
            .into_iter()
            .map(|cookie| (cookie.name, cookie.value))
            .collect())
    }

    async fn arm_interception(&self) -> Result<(), AcquireError> {
        if self.armed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut paused = self
            .page
            .event_listener::<cdp_fetch::EventRequestPaused>()
            .await
            .context("listen for paused requests")?;

        self.page
            .execute(cdp_fetch::EnableParams::builder().build())
            .await
            .context("enable fetch interception")?;

        let page = self.page.clone();
        let interceptor = self.interceptor.clone();
        tokio::spawn(async move {
            // Sub-resource requests arrive in bursts and in no particular
            // order; each one is serviced independently.
            while let Some(event) = paused.next().await {
                let page = page.clone();
                let interceptor = interceptor.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_paused_request(&page, &interceptor, &event).await {
                        tracing::warn!(url = %event.request.url, ?err, "intercept failed");
                    }
                });
            }
        });

        Ok(())
    }

    async fn page_html(&self) -> Result<String, AcquireError> {
        let html = self.evaluate("document.documentElement.outerHTML;").await?;
        Ok(html.as_str().unwrap_or_default().to_owned())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), AcquireError> {
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().build())
            .await
            .context("capture screenshot")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("write screenshot: {}", path.display()))?;
        Ok(())
    }
}

async fn serve_paused_request(
    page: &Page,
    interceptor: &Interceptor,
    event: &cdp_fetch::EventRequestPaused,
) -> anyhow::Result<()> {
    let request = InterceptedRequest {
        method: event.request.method.clone(),
        url: event.request.url.clone(),
        headers: headers_to_map(&event.request.headers),
    };

    match interceptor.handle(&request).await? {
        InterceptOutcome::Continue => {
            page.execute(cdp_fetch::ContinueRequestParams::new(
                event.request_id.clone(),
            ))
            .await
            .context("continue request")?;
        }
        InterceptOutcome::Drop => {
            let fail = cdp_fetch::FailRequestParams::new(
                event.request_id.clone(),
                ErrorReason::Aborted,
            );
            page.execute(fail).await.context("drop request")?;
        }
        InterceptOutcome::Respond(response) => {
            let headers = response
                .headers
                .iter()
                .map(|(name, value)| cdp_fetch::HeaderEntry {
                    name: name.clone().into(),
                    value: value.clone().into(),
                })
                .collect::<Vec<_>>();
            let mut fulfill = cdp_fetch::FulfillRequestParams::new(
                event.request_id.clone(),
                i64::from(response.status),
            );
            fulfill.response_headers = Some(headers);
            fulfill.body =
                Some(base64::engine::general_purpose::STANDARD.encode(&response.body).into());
            page.execute(fulfill).await.context("fulfill request")?;
        }
    }
    Ok(())
}

fn headers_to_map(
    headers: &chromiumoxide::cdp::browser_protocol::network::Headers,
) -> HashMap<String, String> {
    let Ok(value) = serde_json::to_value(headers) else {
        return HashMap::new();
    };
    let Some(object) = value.as_object() else {
        return HashMap::new();
    };
    object
        .iter()
        .filter_map(|(name, value)| Some((name.clone(), value.as_str()?.to_owned())))
        .collect()
}
