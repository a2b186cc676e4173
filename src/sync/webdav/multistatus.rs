//! Multistatus (PROPFIND) response parsing
//!
//! Servers disagree on namespace prefixes (`d:`, `D:`, `lp1:`, none), so
//! elements are matched by local name only. The extractor sits behind a
//! trait so a full XML parser can replace it without touching the client.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::types::{SnapshotFile, SNAPSHOT_EXTENSION};

/// PROPFIND body asking for the three properties the listing needs
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:displayname/>
    <d:getlastmodified/>
    <d:getcontentlength/>
  </d:prop>
</d:propfind>"#;

/// One `<response>` element of a multistatus document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultistatusEntry {
    pub href: String,
    pub display_name: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

/// Pulls listing entries out of a multistatus body
pub trait MultistatusExtractor: Send + Sync {
    fn extract(&self, body: &str) -> Vec<MultistatusEntry>;
}

fn element_pattern(local_name: &str) -> Regex {
    Regex::new(&format!(
        r"(?s)<(?:[A-Za-z_][\w.-]*:)?{0}(?:\s[^>]*)?>(.*?)</(?:[A-Za-z_][\w.-]*:)?{0}\s*>",
        local_name
    ))
    .unwrap()
}

static RESPONSE: Lazy<Regex> = Lazy::new(|| element_pattern("response"));
static HREF: Lazy<Regex> = Lazy::new(|| element_pattern("href"));
static DISPLAY_NAME: Lazy<Regex> = Lazy::new(|| element_pattern("displayname"));
static LAST_MODIFIED: Lazy<Regex> = Lazy::new(|| element_pattern("getlastmodified"));
static CONTENT_LENGTH: Lazy<Regex> = Lazy::new(|| element_pattern("getcontentlength"));

/// Regex-based extractor, tolerant of any namespace prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexExtractor;

impl MultistatusExtractor for RegexExtractor {
    fn extract(&self, body: &str) -> Vec<MultistatusEntry> {
        RESPONSE
            .captures_iter(body)
            .filter_map(|caps| {
                let block = caps.get(1)?.as_str();
                let href = child_text(&HREF, block)?;
                Some(MultistatusEntry {
                    href,
                    display_name: child_text(&DISPLAY_NAME, block),
                    last_modified: child_text(&LAST_MODIFIED, block),
                    content_length: child_text(&CONTENT_LENGTH, block)
                        .and_then(|s| s.parse().ok()),
                })
            })
            .collect()
    }
}

fn child_text(pattern: &Regex, block: &str) -> Option<String> {
    let text = pattern.captures(block)?.get(1)?.as_str().trim();
    if text.is_empty() {
        None
    } else {
        Some(unescape(text))
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Path component of an href, which may be absolute or server-relative
fn href_path(href: &str) -> String {
    let path = match reqwest::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    path.trim_end_matches('/').to_string()
}

fn last_segment(path: &str) -> Option<String> {
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
}

fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Turn raw listing entries into snapshot records.
///
/// The shortest path is the collection itself and is dropped; only names
/// with the snapshot extension survive. Sorted by server mtime, newest first.
pub fn snapshot_files(entries: Vec<MultistatusEntry>) -> Vec<SnapshotFile> {
    let paths: Vec<String> = entries.iter().map(|e| href_path(&e.href)).collect();
    let self_index = paths
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| p.len())
        .map(|(i, _)| i);

    let mut files: Vec<SnapshotFile> = entries
        .into_iter()
        .zip(paths)
        .enumerate()
        .filter(|(i, _)| Some(*i) != self_index)
        .filter_map(|(_, (entry, path))| {
            let name = last_segment(&path).or(entry.display_name)?;
            if !name.ends_with(SNAPSHOT_EXTENSION) {
                return None;
            }
            Some(SnapshotFile {
                name,
                lastmod: entry.last_modified.as_deref().and_then(parse_lastmod),
                size: entry.content_length.unwrap_or(0),
            })
        })
        .collect();

    files.sort_by(|a, b| b.lastmod_ms().cmp(&a.lastmod_ms()));
    files
}
