//! Destination naming.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use url::Url;

/// Name used when nothing better can be derived.
pub const FALLBACK_FILENAME: &str = "download.bin";

/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) with `_`.
///
/// Dot-only names are rewritten so the result is always a single plain path
/// segment.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.trim_matches('_').is_empty() {
        return FALLBACK_FILENAME.to_string();
    }

    let single_segment = Path::new(&sanitized)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if single_segment {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

/// Last non-empty path segment of `url`, percent-decoded and sanitized.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return FALLBACK_FILENAME.to_string();
    };
    parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(|segment| {
            urlencoding::decode(segment)
                .map_or_else(|_| segment.to_string(), std::borrow::Cow::into_owned)
        })
        .map_or_else(|| FALLBACK_FILENAME.to_string(), |name| sanitize_filename(&name))
}

/// Joins `dir` and the sanitized `filename`, adding `_2`, `_3`, ... before the
/// extension while the candidate is in `taken`.
///
/// Only paths claimed by in-flight transfers belong in `taken`; existing
/// files from finished downloads are overwritten by a re-download.
#[must_use]
pub fn unique_destination(dir: &Path, filename: &str, taken: &HashSet<PathBuf>) -> PathBuf {
    let filename = sanitize_filename(filename);
    let candidate = dir.join(&filename);
    if !taken.contains(&candidate) {
        return candidate;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename.as_str(), ""),
    };
    (2..)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|path| !taken.contains(path))
        .unwrap_or(candidate)
}
