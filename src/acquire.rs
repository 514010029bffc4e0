use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::book::{self, BookHandle, BookInfo, ChapterTarget};
use crate::browser::{BrowserLaunchOptions, ChromeBrowser, PageDriver};
use crate::cache::ResourceCache;
use crate::cli::ExportArgs;
use crate::error::AcquireError;
use crate::fetch::{HttpFetcher, ReqwestFetcher};
use crate::intercept::Interceptor;
use crate::pagination::PaginationEngine;
use crate::session::SessionManager;

/// Wipes any text accumulated by a previous chapter when the reader routes
/// in-place instead of loading a fresh document.
const CLEAR_BUFFER_JS: &str =
    "window.canvasContextHandler && canvasContextHandler.clearCanvasCache();";

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub nav_timeout: Duration,
    /// Lower bound on chapter turnaround, measured from navigation start, so
    /// a fast cache-served chapter still leaves a human-looking gap.
    pub min_chapter_interval: Duration,
    pub max_attempts: u32,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            nav_timeout: Duration::from_secs(60),
            min_chapter_interval: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// On-disk layout for acquired chapters and the book metadata snapshot.
/// Chapter files are keyed by position and id, so a re-run can resume.
pub struct ChapterStore {
    dir: PathBuf,
}

impl ChapterStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("chapters"))
            .with_context(|| format!("create chapter dir under: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn chapter_path(&self, index: usize, chapter_id: u64) -> PathBuf {
        self.dir
            .join("chapters")
            .join(format!("{:04}-{chapter_id}.md", index + 1))
    }

    pub fn has_chapter(&self, index: usize, chapter_id: u64) -> bool {
        self.chapter_path(index, chapter_id).is_file()
    }

    pub fn write_chapter(
        &self,
        index: usize,
        chapter_id: u64,
        text: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self.chapter_path(index, chapter_id);
        let parent = path.parent().context("chapter path has no parent")?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("stage chapter file: {}", path.display()))?;
        staged
            .write_all(text.as_bytes())
            .with_context(|| format!("write staged chapter: {}", path.display()))?;
        staged
            .persist(&path)
            .with_context(|| format!("persist chapter: {}", path.display()))?;
        Ok(path)
    }

    pub fn load_meta(&self) -> anyhow::Result<Option<BookInfo>> {
        let path = self.dir.join(META_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("read book metadata: {}", path.display()))?;
        let info = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse book metadata: {}", path.display()))?;
        Ok(Some(info))
    }

    pub fn save_meta(&self, info: &BookInfo) -> anyhow::Result<()> {
        let path = self.dir.join(META_FILE);
        let json = serde_json::to_vec_pretty(info).context("serialize book metadata")?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("stage book metadata: {}", path.display()))?;
        staged
            .write_all(&json)
            .with_context(|| format!("write staged metadata: {}", path.display()))?;
        staged
            .persist(&path)
            .with_context(|| format!("persist book metadata: {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum ChapterOutcome {
    Acquired { path: PathBuf },
    Skipped,
}

#[derive(Debug, Default)]
pub struct AcquireSummary {
    pub acquired: usize,
    pub skipped: usize,
}

/// Drives the whole acquisition: one chapter at a time, bounded retries,
/// paced turnaround, login recovery mid-run.
pub struct Orchestrator {
    driver: Arc<dyn PageDriver>,
    session: Arc<SessionManager>,
    book: BookHandle,
    store: ChapterStore,
    config: AcquireConfig,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        session: Arc<SessionManager>,
        book: BookHandle,
        store: ChapterStore,
        config: AcquireConfig,
    ) -> Self {
        Self {
            driver,
            session,
            book,
            store,
            config,
        }
    }

    pub async fn acquire_book(&self, info: &BookInfo) -> Result<AcquireSummary, AcquireError> {
        let total = info.chapters.len();
        let mut summary = AcquireSummary::default();
        for (index, chapter) in info.chapters.iter().enumerate() {
            tracing::info!(
                position = index + 1,
                total,
                chapter_id = chapter.id,
                title = %chapter.title,
                "acquire chapter"
            );
            match self.acquire_chapter(index, chapter).await? {
                ChapterOutcome::Acquired { .. } => summary.acquired += 1,
                ChapterOutcome::Skipped => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    /// Acquire one chapter with a bounded retry budget. A mid-chapter login
    /// demand triggers one interactive login without consuming a retry.
    pub async fn acquire_chapter(
        &self,
        index: usize,
        chapter: &ChapterTarget,
    ) -> Result<ChapterOutcome, AcquireError> {
        if self.store.has_chapter(index, chapter.id) {
            tracing::info!(chapter_id = chapter.id, "chapter already stored; skipping");
            return Ok(ChapterOutcome::Skipped);
        }

        let url = self.book.chapter_url(chapter.id);
        let mut login_used = false;
        let mut attempt = 0u32;
        while attempt < self.config.max_attempts {
            attempt += 1;
            let started = tokio::time::Instant::now();
            match self.try_chapter(&url, chapter).await {
                Ok(text) => {
                    let path = self
                        .store
                        .write_chapter(index, chapter.id, &text)
                        .map_err(AcquireError::Other)?;
                    tracing::info!(
                        chapter_id = chapter.id,
                        bytes = text.len(),
                        attempt,
                        "chapter acquired"
                    );
                    self.pace(started).await;
                    return Ok(ChapterOutcome::Acquired { path });
                }
                Err(AcquireError::LoginRequired) if !login_used => {
                    login_used = true;
                    tracing::info!(chapter_id = chapter.id, "login demanded mid-chapter");
                    if !self.session.login(self.driver.as_ref()).await? {
                        return Err(AcquireError::LoginRequired);
                    }
                    // The login pass does not consume a retry.
                    attempt -= 1;
                }
                Err(err) if err.is_chapter_retryable() => {
                    tracing::warn!(
                        chapter_id = chapter.id,
                        attempt,
                        error = %err,
                        "chapter attempt failed"
                    );
                    self.pace(started).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(AcquireError::ChapterLoadFailed {
            chapter_id: chapter.id,
            attempts: self.config.max_attempts,
        })
    }

    async fn try_chapter(&self, url: &str, chapter: &ChapterTarget) -> Result<String, AcquireError> {
        self.driver.arm_interception().await?;
        self.driver.navigate(url, self.config.nav_timeout).await?;
        self.driver.evaluate(CLEAR_BUFFER_JS).await?;

        let engine = PaginationEngine::new(self.driver.as_ref());
        // A control that never appears means the page has no further
        // pagination; both that and the next-chapter label end the chapter.
        let state = engine.drive().await?;
        tracing::debug!(?state, "chapter pagination finished");
        engine.extract(chapter.id).await
    }

    async fn pace(&self, started: tokio::time::Instant) {
        let elapsed = started.elapsed();
        if let Some(rest) = self.config.min_chapter_interval.checked_sub(elapsed)
            && !rest.is_zero()
        {
            tracing::debug!(?rest, "pacing before next chapter");
            tokio::time::sleep(rest).await;
        }
    }
}

pub async fn run(args: ExportArgs) -> anyhow::Result<()> {
    let config = AcquireConfig {
        nav_timeout: Duration::from_secs(args.nav_timeout_secs),
        min_chapter_interval: Duration::from_millis(args.min_interval_ms),
        max_attempts: args.max_attempts,
    };
    let book = BookHandle::new(&args.book_id);
    let store = ChapterStore::new(&args.out).context("prepare output directory")?;
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new().context("build fetcher")?);

    let info = match store.load_meta().context("load stored book metadata")? {
        Some(info) => info,
        None => {
            let info = book::fetch_book_info(fetcher.as_ref(), &book)
                .await
                .context("fetch book info")?;
            store.save_meta(&info).context("store book metadata")?;
            info
        }
    };
    tracing::info!(title = %info.title, chapters = info.chapters.len(), "book resolved");

    let session = Arc::new(
        SessionManager::load(Some(args.cookie.clone())).context("load session cookies")?,
    );
    if args.force_login {
        session.clear().context("clear session for forced login")?;
    }

    let cache = ResourceCache::new(&args.cache_dir);
    let interceptor = Arc::new(Interceptor::new(
        book.clone(),
        session.clone(),
        cache,
        fetcher.clone(),
    ));

    let browser = ChromeBrowser::launch(BrowserLaunchOptions {
        headless: args.headless,
        ..Default::default()
    })
    .await?;
    let page = browser.new_page(interceptor).await?;
    let driver: Arc<dyn PageDriver> = Arc::new(page);

    driver.arm_interception().await?;
    driver.navigate(book.home_url(), config.nav_timeout).await?;

    match session.current_user(fetcher.as_ref()).await {
        Ok(user) => {
            tracing::info!(user = %user.name, "session valid");
            session.inject_into_browser(driver.as_ref()).await?;
            // Injected cookies only take effect on a fresh document.
            driver.navigate(book.home_url(), config.nav_timeout).await?;
        }
        Err(AcquireError::InvalidSession) => {
            tracing::info!("no valid session; interactive login may be required");
        }
        Err(err) => return Err(err.into()),
    }

    if session.login(driver.as_ref()).await? {
        tracing::info!("logged in interactively");
    }

    let orchestrator = Orchestrator::new(driver, session, book, store, config);
    let summary = orchestrator.acquire_book(&info).await?;
    tracing::info!(
        acquired = summary.acquired,
        skipped = summary.skipped,
        "book acquisition finished"
    );

    browser.close().await.context("shut down browser")?;
    Ok(())
}
