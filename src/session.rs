use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::book::ROOT_URL;
use crate::browser::PageDriver;
use crate::error::AcquireError;
use crate::fetch::{FetchRequest, HttpFetcher, fetch_with_retry};

/// Cookie that carries the reader identity; without it there is no session.
pub const IDENTITY_COOKIE: &str = "wr_vid";

/// Site error code for an expired session token (recoverable by refresh).
const ERR_SESSION_EXPIRED: i64 = -2012;
/// Site error code for an unknown user id (session is corrupt).
const ERR_USER_NOT_FOUND: i64 = -2010;

/// Bounded wait for the interactive login flow.
pub const LOGIN_WAIT: Duration = Duration::from_secs(300);
const LOGIN_POLL: Duration = Duration::from_secs(10);

/// Login controls, checked in order. The click only happens when the visible
/// label shows a logged-out state.
const LOGIN_CONTROL_SELECTORS: &[&str] = &[
    "button.navBar_link_Login",
    "div.readerTopBar_right button.actionItem",
];
const LOGGED_OUT_LABEL: &str = "登录";
const LOGIN_DONE_JS: &str =
    "document.querySelector('div.menu_container img.wr_avatar_img') !== null;";

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "userVid", default)]
    pub user_vid: u64,
}

/// Owns the authentication cookie set for the one active session.
///
/// Readers (the interceptor) take the formatted header string; only the
/// manager itself mutates the mapping, and every mutation is persisted.
pub struct SessionManager {
    path: Option<PathBuf>,
    cookies: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    /// Restore the cookie mapping from disk. Accepts a JSON object or a flat
    /// `"k=v; k=v"` string; malformed entries are skipped, a missing file
    /// yields an empty session.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cookies = HashMap::new();
        if let Some(path) = path.as_deref()
            && path.is_file()
        {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read cookie file: {}", path.display()))?;
            cookies = parse_cookie_text(&text);
        }
        Ok(Self {
            path,
            cookies: RwLock::new(cookies),
        })
    }

    /// Write the mapping back, atomically replacing the file. No-op when no
    /// storage path is configured.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let cookies = self.cookies.read().expect("cookie lock");
        let json = serde_json::to_string(&*cookies).context("serialize cookies")?;
        drop(cookies);

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("create cookie dir: {}", parent.display()))?;

        let mut staged = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("stage cookie file: {}", path.display()))?;
        staged
            .write_all(json.as_bytes())
            .with_context(|| format!("write staged cookie file: {}", path.display()))?;
        staged
            .persist(path)
            .with_context(|| format!("persist cookie file: {}", path.display()))?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.read().expect("cookie lock").is_empty()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies.read().expect("cookie lock").get(name).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.cookies.read().expect("cookie lock").clone()
    }

    /// `Cookie:` header value for outgoing requests.
    pub fn cookie_header(&self) -> String {
        let cookies = self.cookies.read().expect("cookie lock");
        let mut pairs: Vec<String> = cookies.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs.join("; ")
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.cookies.write().expect("cookie lock").clear();
        self.save()
    }

    /// Merge `Set-Cookie` response headers into the mapping. Headers without
    /// an `=` are ignored with a warning. Returns how many cookies changed.
    pub fn merge_set_cookie_headers(&self, values: &[&str]) -> usize {
        let mut merged = 0usize;
        let mut cookies = self.cookies.write().expect("cookie lock");
        for value in values {
            let pair = value.split("; ").next().unwrap_or(value);
            let Some((name, value)) = pair.split_once('=') else {
                tracing::warn!(cookie = %pair, "ignore set-cookie without '='");
                continue;
            };
            cookies.insert(name.trim().to_owned(), value.to_owned());
            tracing::info!(cookie = %name.trim(), "update cookie");
            merged += 1;
        }
        merged
    }

    /// Issue the authenticated identity request.
    ///
    /// On the expired-session error code the manager re-fetches the site root,
    /// harvests `Set-Cookie` headers, persists, and retries exactly once. On
    /// user-not-found the session is cleared and reported invalid.
    pub async fn current_user(&self, fetcher: &dyn HttpFetcher) -> Result<UserInfo, AcquireError> {
        let Some(vid) = self.get(IDENTITY_COOKIE) else {
            return Err(AcquireError::InvalidSession);
        };
        let url = format!("{ROOT_URL}/web/user?userVid={vid}");

        let response = self.identity_request(fetcher, &url).await?;
        match identity_error_code(&response) {
            None => Ok(response_user(&response)?),
            Some(ERR_SESSION_EXPIRED) => {
                tracing::info!("session expired; refreshing cookies from site root");
                self.refresh_cookies(fetcher).await?;
                let retried = self.identity_request(fetcher, &url).await?;
                match identity_error_code(&retried) {
                    None => Ok(response_user(&retried)?),
                    Some(code) => {
                        Err(anyhow::anyhow!("identity request failed after refresh: {code}").into())
                    }
                }
            }
            Some(ERR_USER_NOT_FOUND) => {
                tracing::warn!(user_vid = %vid, "user not found; clearing session");
                self.clear().map_err(AcquireError::Other)?;
                Err(AcquireError::InvalidSession)
            }
            Some(code) => Err(anyhow::anyhow!("identity request failed: {code}").into()),
        }
    }

    async fn identity_request(
        &self,
        fetcher: &dyn HttpFetcher,
        url: &str,
    ) -> Result<serde_json::Value, AcquireError> {
        let request = FetchRequest::get(url)
            .header("Referer", ROOT_URL)
            .header("Cookie", self.cookie_header());
        let response = fetch_with_retry(fetcher, &request).await?;
        let value = serde_json::from_slice(&response.body)
            .with_context(|| format!("parse identity response: {url}"))?;
        Ok(value)
    }

    async fn refresh_cookies(&self, fetcher: &dyn HttpFetcher) -> Result<(), AcquireError> {
        let request = FetchRequest::get(ROOT_URL)
            .header("Referer", ROOT_URL)
            .header("Cookie", self.cookie_header());
        let response = fetch_with_retry(fetcher, &request).await?;
        self.merge_set_cookie_headers(&response.header_values("set-cookie"));
        self.save().map_err(AcquireError::Other)?;
        Ok(())
    }

    /// Push every cookie into the live browser context.
    pub async fn inject_into_browser(&self, driver: &dyn PageDriver) -> Result<(), AcquireError> {
        for (name, value) in self.snapshot() {
            tracing::debug!(cookie = %name, "inject cookie into browser");
            driver.set_cookie(&name, &value, ROOT_URL).await?;
        }
        Ok(())
    }

    /// Read the browser's cookies back into the mapping and persist.
    pub async fn read_back_from_browser(
        &self,
        driver: &dyn PageDriver,
    ) -> Result<(), AcquireError> {
        let browser_cookies = driver.cookies().await?;
        {
            let mut cookies = self.cookies.write().expect("cookie lock");
            cookies.clear();
            for (name, value) in browser_cookies {
                cookies.insert(name, value);
            }
        }
        self.save().map_err(AcquireError::Other)?;
        Ok(())
    }

    /// Interactive login: click a login control only when its visible label
    /// shows a logged-out state, then poll for the logged-in DOM signal.
    ///
    /// Returns `false` when no logged-out control was found (already logged
    /// in); `LoginTimeout` when the bounded wait elapses.
    pub async fn login(&self, driver: &dyn PageDriver) -> Result<bool, AcquireError> {
        for selector in LOGIN_CONTROL_SELECTORS {
            let script =
                format!("var elem = document.querySelector('{selector}'); elem && elem.innerText;");
            let label = driver.evaluate(&script).await?;
            let Some(label) = label.as_str() else {
                continue;
            };
            if !label.contains(LOGGED_OUT_LABEL) {
                continue;
            }

            driver.click(selector).await?;

            let mut waited = Duration::ZERO;
            while waited < LOGIN_WAIT {
                tracing::info!(?waited, "waiting for login");
                tokio::time::sleep(LOGIN_POLL).await;
                waited += LOGIN_POLL;

                let done = driver.evaluate(LOGIN_DONE_JS).await?;
                if done.as_bool() == Some(true) {
                    tracing::info!("login success");
                    self.read_back_from_browser(driver).await?;
                    return Ok(true);
                }
            }
            return Err(AcquireError::LoginTimeout(LOGIN_WAIT));
        }
        Ok(false)
    }
}

fn parse_cookie_text(text: &str) -> HashMap<String, String> {
    if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(text) {
        return map;
    }

    let mut cookies = HashMap::new();
    for entry in text.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((name, value)) = entry.split_once('=') else {
            tracing::warn!(entry = %entry, "skip malformed cookie entry");
            continue;
        };
        cookies.insert(name.trim().to_owned(), value.trim().to_owned());
    }
    cookies
}

fn identity_error_code(response: &serde_json::Value) -> Option<i64> {
    match response.get("errCode").and_then(|v| v.as_i64()) {
        Some(0) | None => None,
        Some(code) => Some(code),
    }
}

fn response_user(response: &serde_json::Value) -> Result<UserInfo, AcquireError> {
    let user: UserInfo = serde_json::from_value(response.clone())
        .context("parse identity response user fields")?;
    Ok(user)
}
