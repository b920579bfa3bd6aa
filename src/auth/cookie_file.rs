//! Netscape cookie file import.
//!
//! Browsers and extensions export sessions as 7 TAB-separated fields per
//! line: `domain`, `include_subdomains`, `path`, `secure`, `expires`, `name`,
//! `value`. Lines starting with `#` and blank lines are skipped. Malformed
//! lines are reported as warnings so one bad row does not lose a session.

use std::fmt;
use std::io::BufRead;
use std::time::{Duration, UNIX_EPOCH};

use reqwest::cookie::Jar;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// One cookie row. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieEntry {
    /// Cookie domain, possibly with a leading dot.
    pub domain: String,
    /// Whether subdomains match.
    pub include_subdomains: bool,
    /// Path scope.
    pub path: String,
    /// HTTPS-only flag.
    pub secure: bool,
    /// Expiry as Unix seconds; `0` for a session cookie.
    pub expires: u64,
    /// Cookie name.
    pub name: String,
    value: String,
}

impl CookieEntry {
    /// Returns the cookie value. Never log it.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Renders the entry as a `Set-Cookie` header value.
    fn set_cookie_string(&self) -> String {
        let mut parts = vec![
            format!("{}={}", self.name, self.value),
            format!("Path={}", self.path),
        ];
        if self.include_subdomains {
            parts.push(format!("Domain={}", self.domain));
        }
        if self.secure {
            parts.push("Secure".to_string());
        }
        if self.expires > 0 {
            match UNIX_EPOCH.checked_add(Duration::from_secs(self.expires)) {
                Some(at) => parts.push(format!("Expires={}", httpdate::fmt_http_date(at))),
                None => warn!(
                    domain = %self.domain,
                    name = %self.name,
                    "cookie expiry out of range; treating as session cookie"
                ),
            }
        }
        parts.join("; ")
    }

    /// Origin the cookie is scoped to, for `Jar::add_cookie_str`.
    fn origin(&self) -> Option<url::Url> {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.domain.strip_prefix('.').unwrap_or(&self.domain);
        url::Url::parse(&format!("{scheme}://{host}{}", self.path)).ok()
    }
}

impl fmt::Debug for CookieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieEntry")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Errors reading a cookie file.
#[derive(Debug, Error)]
pub enum CookieError {
    /// The file could not be read.
    #[error("failed to read cookie file: {0}")]
    Io(#[from] std::io::Error),

    /// The file had data lines but none parsed.
    #[error("no valid cookies found ({malformed} malformed lines)")]
    NoCookiesFound {
        /// Count of rejected lines.
        malformed: usize,
    },
}

/// Parsed cookies plus per-line warnings.
#[derive(Debug, Default)]
pub struct CookieFile {
    /// Cookies that parsed.
    pub entries: Vec<CookieEntry>,
    /// `(line number, reason)` for rejected lines.
    pub warnings: Vec<(usize, String)>,
}

impl CookieFile {
    /// Adds every entry to `jar`. Returns how many were accepted.
    #[instrument(level = "debug", skip_all, fields(entries = self.entries.len()))]
    pub fn load_into(&self, jar: &Jar) -> usize {
        let mut loaded = 0;
        for entry in &self.entries {
            let Some(origin) = entry.origin() else {
                warn!(domain = %entry.domain, name = %entry.name, "skipping cookie with unusable domain");
                continue;
            };
            jar.add_cookie_str(&entry.set_cookie_string(), &origin);
            debug!(domain = %entry.domain, name = %entry.name, "cookie loaded");
            loaded += 1;
        }
        loaded
    }
}

/// Parses a Netscape-format cookie file.
///
/// # Errors
///
/// Returns [`CookieError::Io`] on read failure and
/// [`CookieError::NoCookiesFound`] when data lines exist but none parse.
pub fn parse_cookie_file(reader: impl BufRead) -> Result<CookieFile, CookieError> {
    let mut parsed = CookieFile::default();
    let mut data_lines = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        data_lines += 1;
        match parse_line(line) {
            Ok(entry) => parsed.entries.push(entry),
            Err(reason) => {
                warn!(line = index + 1, reason = %reason, "skipping malformed cookie line");
                parsed.warnings.push((index + 1, reason));
            }
        }
    }

    if parsed.entries.is_empty() && data_lines > 0 {
        return Err(CookieError::NoCookiesFound {
            malformed: parsed.warnings.len(),
        });
    }
    Ok(parsed)
}

fn parse_line(line: &str) -> Result<CookieEntry, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [domain, subdomains, path, secure, expires, name, value] = fields.as_slice() else {
        return Err(format!(
            "expected 7 TAB-separated fields, found {}",
            fields.len()
        ));
    };
    if domain.is_empty() {
        return Err("domain field is empty".to_string());
    }
    if name.is_empty() {
        return Err("cookie name field is empty".to_string());
    }
    let expires = expires
        .parse::<u64>()
        .map_err(|_| format!("expires must be a non-negative integer, got '{expires}'"))?;

    Ok(CookieEntry {
        domain: (*domain).to_string(),
        include_subdomains: parse_flag(subdomains, "include_subdomains")?,
        path: if path.is_empty() { "/".to_string() } else { (*path).to_string() },
        secure: parse_flag(secure, "secure")?,
        expires,
        name: (*name).to_string(),
        value: (*value).to_string(),
    })
}

fn parse_flag(raw: &str, field: &str) -> Result<bool, String> {
    match raw {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        other => Err(format!("{field} must be TRUE or FALSE, got '{other}'")),
    }
}
