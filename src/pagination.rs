use std::time::Duration;

use crate::browser::PageDriver;
use crate::error::AcquireError;

/// The reader's single footer control; its label is the only signal for
/// where the chapter currently stands.
pub const NEXT_CONTROL_SELECTOR: &str = "button.readerFooter_button";

const NEXT_CONTROL_LABEL_JS: &str =
    "var e = document.querySelector('button.readerFooter_button'); e ? e.innerText : null;";

/// Appended between in-chapter pages so paragraphs from different pages do
/// not run together in the extracted text.
const PARAGRAPH_BREAK_JS: &str = "canvasContextHandler.data.markdown += '\\n\\n';";

const RENDER_COMPLETE_JS: &str = "canvasContextHandler.data.complete;";
const FORCE_RENDER_JS: &str = "canvasContextHandler.updateMarkdown();";
const READ_MARKDOWN_JS: &str = "canvasContextHandler.data.markdown;";

/// Label prefixes that classify the footer control.
const LABEL_NEXT_PAGE: &str = "下一页";
const LABEL_NEXT_CHAPTER: &str = "下一章";
const LABEL_LOGIN: &str = "登录";

pub const CONTROL_WAIT: Duration = Duration::from_secs(60);
pub const RENDER_WAIT: Duration = Duration::from_secs(10);
pub const RENDER_POLL: Duration = Duration::from_secs(1);

/// Time given to the renderer after a page flip before the control is
/// consulted again.
pub const PAGE_SETTLE: Duration = Duration::from_millis(1200);

/// Where a loaded chapter currently stands, as read off the footer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    /// The control has not appeared yet.
    AwaitingControl,
    /// More pages remain in this chapter.
    HasNextPage,
    /// Chapter exhausted; the control would move to the next chapter.
    HasNextChapter,
    /// The control demands authentication before any more content.
    LoginRequired,
    /// The control never appeared within the bounded wait.
    Timeout,
}

/// Map a footer label to a pagination state. Labels carry chapter titles and
/// decorations after the prefix, so only the prefix is significant.
pub fn classify_label(label: &str) -> Result<PaginationState, AcquireError> {
    let label = label.trim();
    if label.starts_with(LABEL_NEXT_PAGE) {
        Ok(PaginationState::HasNextPage)
    } else if label.starts_with(LABEL_NEXT_CHAPTER) {
        Ok(PaginationState::HasNextChapter)
    } else if label.starts_with(LABEL_LOGIN) {
        Ok(PaginationState::LoginRequired)
    } else {
        Err(AcquireError::UnrecognizedPaginationState(label.to_owned()))
    }
}

/// Walks one chapter through all of its in-chapter pages and extracts the
/// accumulated text. Owns no browser state beyond the driver handle.
pub struct PaginationEngine<'a> {
    driver: &'a dyn PageDriver,
}

impl<'a> PaginationEngine<'a> {
    pub fn new(driver: &'a dyn PageDriver) -> Self {
        Self { driver }
    }

    /// Advance through every in-chapter page until the footer control points
    /// past the chapter. Each flip re-arms interception first, because a
    /// navigation can replace the target and silently drop the fetch hooks.
    pub async fn drive(&self) -> Result<PaginationState, AcquireError> {
        loop {
            let state = self.observe().await?;
            tracing::debug!(?state, "pagination state");
            match state {
                PaginationState::HasNextPage => {
                    self.driver.evaluate(PARAGRAPH_BREAK_JS).await?;
                    self.driver.arm_interception().await?;
                    self.driver.click(NEXT_CONTROL_SELECTOR).await?;
                    tokio::time::sleep(PAGE_SETTLE).await;
                }
                PaginationState::HasNextChapter | PaginationState::Timeout => {
                    return Ok(state);
                }
                PaginationState::LoginRequired => {
                    return Err(AcquireError::LoginRequired);
                }
                PaginationState::AwaitingControl => {
                    // observe() only returns this transiently; treat a
                    // missing label with a present control as not yet settled.
                    tokio::time::sleep(RENDER_POLL).await;
                }
            }
        }
    }

    /// Read the current state off the footer control, waiting for it to
    /// appear first.
    async fn observe(&self) -> Result<PaginationState, AcquireError> {
        if !self
            .driver
            .wait_for_selector(NEXT_CONTROL_SELECTOR, CONTROL_WAIT)
            .await?
        {
            return Ok(PaginationState::Timeout);
        }
        match self.driver.evaluate(NEXT_CONTROL_LABEL_JS).await? {
            serde_json::Value::String(label) => classify_label(&label),
            _ => Ok(PaginationState::AwaitingControl),
        }
    }

    /// Pull the accumulated chapter text out of the page. Rendering is
    /// asynchronous; poll the completion flag and, if it never fires within
    /// the bounded wait, force one buffer flush before reading. Reading
    /// without the flush would silently return only the pages rendered so
    /// far.
    pub async fn extract(&self, chapter_id: u64) -> Result<String, AcquireError> {
        let mut waited = Duration::ZERO;
        let mut completed = false;
        while waited < RENDER_WAIT {
            if self.driver.evaluate(RENDER_COMPLETE_JS).await?.as_bool() == Some(true) {
                completed = true;
                break;
            }
            tokio::time::sleep(RENDER_POLL).await;
            waited += RENDER_POLL;
        }

        if !completed {
            tracing::warn!(chapter_id, "render never completed, forcing buffer flush");
            self.driver.evaluate(FORCE_RENDER_JS).await?;
        }

        let text = self.read_markdown().await?;
        if text.trim().is_empty() {
            return Err(AcquireError::ExtractionFailed { chapter_id });
        }
        Ok(text)
    }

    async fn read_markdown(&self) -> Result<String, AcquireError> {
        match self.driver.evaluate(READ_MARKDOWN_JS).await? {
            serde_json::Value::String(text) => Ok(text),
            _ => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::browser::testing::ScriptedPage;

    #[test]
    fn labels_classify_by_prefix() {
        assert_eq!(
            classify_label("下一页").unwrap(),
            PaginationState::HasNextPage
        );
        assert_eq!(
            classify_label("下一章 第二章").unwrap(),
            PaginationState::HasNextChapter
        );
        assert_eq!(
            classify_label("登录后继续阅读").unwrap(),
            PaginationState::LoginRequired
        );
    }

    #[test]
    fn unknown_label_is_an_error() {
        let err = classify_label("购买本章").unwrap_err();
        assert!(matches!(
            err,
            AcquireError::UnrecognizedPaginationState(label) if label == "购买本章"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn drive_flips_until_chapter_boundary() -> Result<(), AcquireError> {
        let page = ScriptedPage::with_labels(&["下一页", "下一页", "下一章"]);
        let engine = PaginationEngine::new(&page);

        let state = engine.drive().await?;

        assert_eq!(state, PaginationState::HasNextChapter);
        assert_eq!(page.clicks.load(Ordering::SeqCst), 2);
        // One paragraph break per flip, none after the boundary.
        assert_eq!(page.paragraph_breaks.load(Ordering::SeqCst), 2);
        // Interception is re-armed before every flip.
        assert_eq!(page.arms.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn drive_stops_without_flipping_on_single_page_chapter() -> Result<(), AcquireError> {
        let page = ScriptedPage::with_labels(&["下一章"]);
        let engine = PaginationEngine::new(&page);

        assert_eq!(engine.drive().await?, PaginationState::HasNextChapter);
        assert_eq!(page.clicks.load(Ordering::SeqCst), 0);
        assert_eq!(page.paragraph_breaks.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn drive_reports_timeout_when_control_never_appears() -> Result<(), AcquireError> {
        let page = ScriptedPage::new();
        let engine = PaginationEngine::new(&page);

        assert_eq!(engine.drive().await?, PaginationState::Timeout);
        assert_eq!(page.clicks.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn drive_surfaces_login_demand() {
        let page = ScriptedPage::with_labels(&["登录"]);
        let engine = PaginationEngine::new(&page);

        let err = engine.drive().await.unwrap_err();
        assert!(matches!(err, AcquireError::LoginRequired));
        // Nothing was accumulated behind the login wall.
        assert_eq!(page.paragraph_breaks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extract_returns_text_once_render_completes() -> Result<(), AcquireError> {
        let page = ScriptedPage::new();
        page.set_markdown("第一章\n\n正文。");
        page.render_complete.store(true, Ordering::SeqCst);
        let engine = PaginationEngine::new(&page);

        assert_eq!(engine.extract(3).await?, "第一章\n\n正文。");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn extract_flushes_before_reading_an_incomplete_render() -> Result<(), AcquireError> {
        let page = ScriptedPage::new();
        // Earlier pages already sit in the buffer, but the completion flag
        // never fires; the text must only be read after a forced flush.
        page.set_markdown("第一页文本");
        let engine = PaginationEngine::new(&page);

        assert_eq!(engine.extract(3).await?, "第一页文本");
        assert!(page.render_complete.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn extract_forces_flush_when_buffer_stays_empty() {
        let page = ScriptedPage::new();
        // Markdown never materializes even after the forced flush.
        let engine = PaginationEngine::new(&page);

        let err = engine.extract(7).await.unwrap_err();
        assert!(matches!(
            err,
            AcquireError::ExtractionFailed { chapter_id: 7 }
        ));
        // The forced flush marks rendering complete on the way out.
        assert!(page.render_complete.load(Ordering::SeqCst));
    }
}
