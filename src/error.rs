use std::time::Duration;

/// Failure taxonomy for browser-driven acquisition.
///
/// Recoverable variants (`LoginRequired`, navigation/extraction failures) feed
/// the orchestrator's bounded retry; everything else stops the book run.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The persisted session carries no identity cookie, or the site reported
    /// the stored identity as unknown. The session has been cleared; the
    /// caller must re-authenticate interactively.
    #[error("session has no usable identity cookie")]
    InvalidSession,

    /// Interactive login did not complete within the bounded wait.
    #[error("login did not complete within {0:?}")]
    LoginTimeout(Duration),

    /// The pagination control showed a login wall mid-chapter.
    #[error("login required while reading chapter")]
    LoginRequired,

    /// A chapter kept failing after the full retry budget.
    #[error("chapter {chapter_id} failed to load after {attempts} attempts")]
    ChapterLoadFailed { chapter_id: u64, attempts: u32 },

    /// The rendered text never materialized, even after a forced re-render.
    #[error("chapter {chapter_id} text never materialized after forced re-render")]
    ExtractionFailed { chapter_id: u64 },

    /// No controllable browser executable could be located.
    #[error("no chrome executable found on PATH; install chrome or google-chrome")]
    BrowserUnavailable,

    /// The pagination control showed a label this tool does not know.
    /// The site changed shape; continuing would silently corrupt the book.
    #[error("unrecognized pagination control label: {0:?}")]
    UnrecognizedPaginationState(String),

    /// A network fetch failed on every attempt of the local retry policy.
    #[error("fetch failed after {attempts} attempts: {url}")]
    FetchFailed { url: String, attempts: u32 },

    /// Page navigation did not settle within its bound.
    #[error("navigation timed out: {url}")]
    NavigationTimeout { url: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AcquireError {
    /// Whether the orchestrator may spend another attempt of the chapter
    /// retry budget on this failure.
    pub fn is_chapter_retryable(&self) -> bool {
        matches!(
            self,
            AcquireError::NavigationTimeout { .. }
                | AcquireError::ExtractionFailed { .. }
                | AcquireError::FetchFailed { .. }
                | AcquireError::Other(_)
        )
    }
}
