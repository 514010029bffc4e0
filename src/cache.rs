use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Disk-backed store for static sub-resources, keyed by URL path.
///
/// Entries are idempotent: the first write for a path wins and later writes
/// are ignored. Stale entries are deleted out of band, never auto-refreshed.
#[derive(Debug, Clone)]
pub struct ResourceCache {
    dir: PathBuf,
}

impl ResourceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Map a URL path to its on-disk location. Rejects traversal segments.
    pub fn entry_path(&self, url_path: &str) -> anyhow::Result<PathBuf> {
        let mut path = self.dir.clone();
        let mut depth = 0usize;
        for segment in url_path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                anyhow::bail!("cache key must not contain '..': {url_path}");
            }
            path = path.join(segment);
            depth += 1;
        }
        if depth == 0 {
            anyhow::bail!("cache key has no path segments: {url_path}");
        }
        Ok(path)
    }

    pub fn load(&self, url_path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.entry_path(url_path)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes =
            std::fs::read(&path).with_context(|| format!("read cache entry: {}", path.display()))?;
        Ok(Some(bytes))
    }

    /// Persist bytes for a path. No-op if an entry already exists; the write
    /// is staged to a temp file and renamed so a crash cannot leave a
    /// truncated entry behind.
    pub fn store(&self, url_path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.entry_path(url_path)?;
        if path.exists() {
            return Ok(());
        }

        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache path must have parent: {}", path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cache dir: {}", parent.display()))?;

        let staged = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("stage cache entry: {}", path.display()))?;
        std::fs::write(staged.path(), bytes)
            .with_context(|| format!("write staged cache entry: {}", path.display()))?;
        match staged.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            // A concurrent writer got there first; the existing entry wins.
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                Err(anyhow::Error::new(err).context(format!("persist cache entry: {}", path.display())))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
