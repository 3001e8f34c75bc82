//! Shared utility functions for the ingestion service
use sha2::{Digest, Sha256};
use std::path::Path;

/// Reduce a client-supplied filename to a safe final path component
///
/// Browsers and the inbox monitor may hand over paths ("C:\\logs\\a.rld",
/// "../a.txt"). Only the last component is kept; names that are empty or
/// consist only of dots are rejected.
///
/// # Examples
///
/// ```
/// use nrg_datasense::utils::sanitize_filename;
///
/// assert_eq!(sanitize_filename("000110_2024.rld").unwrap(), "000110_2024.rld");
/// assert_eq!(sanitize_filename("../../etc/site.txt").unwrap(), "site.txt");
/// assert_eq!(sanitize_filename("C:\\logs\\site.rld").unwrap(), "site.rld");
/// assert!(sanitize_filename("..").is_none());
/// ```
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if last.is_empty() || last.chars().all(|c| c == '.') {
        return None;
    }

    Path::new(last)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Trim tags, drop empty ones and remove duplicates while keeping order
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Split a comma-separated tag list
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    normalize_tags(raw.split(','))
}

/// SHA-256 of raw bytes as lowercase hex
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
