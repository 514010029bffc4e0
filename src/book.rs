use anyhow::Context as _;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};

use crate::cli::InfoArgs;
use crate::error::AcquireError;
use crate::fetch::{FetchRequest, HttpFetcher, ReqwestFetcher, fetch_with_retry};

pub const ROOT_URL: &str = "https://weread.qq.com";

/// Immutable identity of the book being acquired plus its derived URLs.
#[derive(Debug, Clone)]
pub struct BookHandle {
    id: String,
    home_url: String,
    reader_root_url: String,
}

impl BookHandle {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let home_url = format!("{ROOT_URL}/web/bookDetail/{id}");
        let reader_root_url = format!("{ROOT_URL}/web/reader/");
        Self {
            id,
            home_url,
            reader_root_url,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn home_url(&self) -> &str {
        &self.home_url
    }

    /// Root under which every chapter page lives.
    pub fn reader_root_url(&self) -> &str {
        &self.reader_root_url
    }

    /// Reader entry page for the book (first chapter, no explicit id).
    pub fn reader_entry_url(&self) -> String {
        format!("{}{}", self.reader_root_url, self.id)
    }

    /// Chapter URLs embed a keyed hash of the chapter id; the site rejects
    /// plain numeric ids.
    pub fn chapter_url(&self, chapter_id: u64) -> String {
        format!(
            "{}{}k{}",
            self.reader_root_url,
            self.id,
            reader_hash(chapter_id)
        )
    }
}

/// The reader's reverse-engineered id hash: an md5 prefix/suffix sandwich
/// around hex-encoded 9-digit chunks of the decimal id, finished with a short
/// md5 checksum. Opaque bit-shuffling, not cryptography.
pub fn reader_hash(id: u64) -> String {
    let decimal = id.to_string();
    let digest = md5_hex(decimal.as_bytes());

    let mut result = String::new();
    result.push_str(&digest[..3]);
    result.push_str("32");
    result.push_str(&digest[digest.len() - 2..]);

    let chunks: Vec<String> = decimal
        .as_bytes()
        .chunks(9)
        .map(|chunk| {
            let mut value: u64 = 0;
            for b in chunk {
                value = value * 10 + u64::from(b - b'0');
            }
            format!("{value:x}")
        })
        .collect();

    for (i, chunk) in chunks.iter().enumerate() {
        result.push_str(&format!("{:02x}", chunk.len()));
        result.push_str(chunk);
        if i + 1 < chunks.len() {
            result.push('g');
        }
    }

    if result.len() < 20 {
        let pad = 20 - result.len();
        result.push_str(&digest[..pad]);
    }

    let checksum = md5_hex(result.as_bytes());
    result.push_str(&checksum[..3]);
    result
}

fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub title: String,
    pub level: u32,
}

/// Read-only acquisition target, one per chapter of the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterTarget {
    pub id: u64,
    pub title: String,
    pub level: u32,
    pub words: u64,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookInfo {
    pub title: String,
    pub author: String,
    pub cover: String,
    pub intro: String,
    pub chapters: Vec<ChapterTarget>,
}

/// Fetch the book home page and parse its embedded initial state into the
/// chapter list this core consumes.
pub async fn fetch_book_info(
    fetcher: &dyn HttpFetcher,
    book: &BookHandle,
) -> Result<BookInfo, AcquireError> {
    let response = fetch_with_retry(fetcher, &FetchRequest::get(book.home_url())).await?;
    let html = String::from_utf8_lossy(&response.body);
    let info = parse_book_info(&html).context("parse book home page")?;
    Ok(info)
}

/// The home page ships its model as `window.__INITIAL_STATE__ = {...};`
/// inside a script tag; there is no JSON endpoint for it.
pub fn parse_book_info(html: &str) -> anyhow::Result<BookInfo> {
    let state = extract_initial_state(html)?;
    let value: serde_json::Value =
        serde_json::from_str(state).context("parse __INITIAL_STATE__ json")?;

    let reader = value
        .get("reader")
        .ok_or_else(|| anyhow::anyhow!("initial state has no reader section"))?;
    let book_info = reader
        .get("bookInfo")
        .ok_or_else(|| anyhow::anyhow!("initial state has no bookInfo"))?;

    let chapter_infos = reader
        .get("chapterInfos")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("initial state has no chapterInfos"))?;

    let mut chapters = Vec::with_capacity(chapter_infos.len());
    for chapter in chapter_infos {
        let anchors = chapter
            .get("anchors")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .map(|a| Anchor {
                        title: string_field(a, "title"),
                        level: u32_field(a, "level"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        chapters.push(ChapterTarget {
            id: chapter
                .get("chapterUid")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| anyhow::anyhow!("chapter without chapterUid"))?,
            title: string_field(chapter, "title"),
            level: u32_field(chapter, "level"),
            words: chapter
                .get("wordCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            anchors,
        });
    }

    Ok(BookInfo {
        title: string_field(book_info, "title"),
        author: string_field(book_info, "author"),
        cover: string_field(book_info, "cover"),
        intro: string_field(book_info, "intro"),
        chapters,
    })
}

fn extract_initial_state(html: &str) -> anyhow::Result<&str> {
    let marker = html
        .find("window.__INITIAL_STATE__")
        .ok_or_else(|| anyhow::anyhow!("home page has no __INITIAL_STATE__"))?;
    let eq = html[marker..]
        .find('=')
        .map(|pos| marker + pos)
        .ok_or_else(|| anyhow::anyhow!("__INITIAL_STATE__ has no assignment"))?;
    let end = html[eq..]
        .find("};")
        .map(|pos| eq + pos)
        .ok_or_else(|| anyhow::anyhow!("__INITIAL_STATE__ is not terminated"))?;
    Ok(html[eq + 1..=end].trim())
}

fn string_field(value: &serde_json::Value, name: &str) -> String {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn u32_field(value: &serde_json::Value, name: &str) -> u32 {
    value.get(name).and_then(|v| v.as_u64()).unwrap_or(0) as u32
}

pub async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let fetcher = ReqwestFetcher::new().context("build fetcher")?;
    let book = BookHandle::new(&args.book_id);
    let info = fetch_book_info(&fetcher, &book)
        .await
        .context("fetch book info")?;

    println!("{} — {}", info.title, info.author);
    if !info.intro.is_empty() {
        println!("{}", info.intro);
    }
    println!();
    for (index, chapter) in info.chapters.iter().enumerate() {
        let indent = "  ".repeat(chapter.level.saturating_sub(1) as usize);
        println!(
            "{:>4}. {indent}{} ({} words)",
            index + 1,
            chapter.title,
            chapter.words
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_hash_matches_known_vectors() {
        assert_eq!(reader_hash(3), "ecc32f3013eccbc87e4b62e");
        assert_eq!(reader_hash(42), "a1d32a6022aa1d0c6e83eb4");
        assert_eq!(reader_hash(123456), "e10323e051e240e10adcaa6");
        assert_eq!(reader_hash(32080041), "7a532e6071e980a97a56bbf");
    }

    #[test]
    fn reader_hash_splits_long_ids_into_chunks() {
        // Ids longer than nine digits produce multiple 'g'-joined chunks.
        assert_eq!(reader_hash(1234567890), "e80329f0775bcd15g0109e5");
    }

    #[test]
    fn chapter_url_embeds_book_id_and_hash() {
        let book = BookHandle::new("abc123");
        assert_eq!(
            book.chapter_url(3),
            format!("{ROOT_URL}/web/reader/abc123kecc32f3013eccbc87e4b62e")
        );
    }

    #[test]
    fn parse_book_info_reads_embedded_state() -> anyhow::Result<()> {
        let html = concat!(
            "<html><head><script>\n",
            "window.__INITIAL_STATE__ = {\"reader\":{",
            "\"bookInfo\":{\"title\":\"T\",\"author\":\"A\",\"cover\":\"c.jpg\",\"intro\":\"i\"},",
            "\"chapterInfos\":[",
            "{\"chapterUid\":1,\"title\":\"One\",\"level\":1,\"wordCount\":10,\"anchors\":[]},",
            "{\"chapterUid\":2,\"title\":\"Two\",\"level\":2,\"wordCount\":20,",
            "\"anchors\":[{\"title\":\"a\",\"level\":3}]}",
            "]}};(function(){})();\n",
            "</script></head><body></body></html>"
        );

        let info = parse_book_info(html)?;
        assert_eq!(info.title, "T");
        assert_eq!(info.chapters.len(), 2);
        assert_eq!(info.chapters[1].id, 2);
        assert_eq!(info.chapters[1].anchors.len(), 1);
        Ok(())
    }

    #[test]
    fn parse_book_info_rejects_plain_html() {
        assert!(parse_book_info("<html><body>nope</body></html>").is_err());
    }
}
