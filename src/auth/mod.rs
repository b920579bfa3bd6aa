//! Per-request credentials derived from a shared cookie jar.
//!
//! The content-viewing side signs the user in and seeds the jar; the engine
//! asks for a `Cookie` header value per destination URL. Missing credentials
//! are not an error for callers of [`Authenticator::header_for`]: some
//! resources are public, so the request is simply attempted without one.

mod cookie_file;
mod session;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

pub use cookie_file::{CookieEntry, CookieError, CookieFile, parse_cookie_file};
pub use session::SessionCookies;

use crate::store::StoreError;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential is known for the URL. Callers proceed unauthenticated.
    #[error("no credential available for {url}")]
    Unavailable {
        /// URL the credential was requested for.
        url: String,
    },

    /// The URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
    },

    /// Reading or writing the persisted session failed.
    #[error("session storage error: {0}")]
    Storage(#[from] StoreError),

    /// Importing a cookie file failed.
    #[error(transparent)]
    CookieFile(#[from] CookieError),
}

impl AuthError {
    /// Creates an unavailable-credential error.
    pub fn unavailable(url: impl Into<String>) -> Self {
        Self::Unavailable { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

/// A `Cookie` header value, possibly empty. `Debug` never prints it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// The empty credential: send no `Cookie` header.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps a raw header value.
    #[must_use]
    pub fn from_header(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Whether there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The header value. Never log it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential([REDACTED])")
        }
    }
}

/// Derives credentials from a cookie jar keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    jar: Arc<Jar>,
}

impl Authenticator {
    /// Creates an authenticator with an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares an existing jar.
    #[must_use]
    pub fn with_jar(jar: Arc<Jar>) -> Self {
        Self { jar }
    }

    /// Returns the underlying jar.
    #[must_use]
    pub fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// Credential for `url`, or [`AuthError::Unavailable`] when none is known.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidUrl`] for unparseable input and
    /// [`AuthError::Unavailable`] when the jar holds nothing for the URL.
    pub fn try_header_for(&self, url: &str) -> Result<Credential, AuthError> {
        let parsed = Url::parse(url).map_err(|_| AuthError::invalid_url(url))?;
        let header = self
            .jar
            .cookies(&parsed)
            .ok_or_else(|| AuthError::unavailable(url))?;
        let value = header.to_str().map_err(|_| AuthError::unavailable(url))?;
        if value.trim().is_empty() {
            return Err(AuthError::unavailable(url));
        }
        Ok(Credential::from_header(value))
    }

    /// Credential for `url`; empty when none is known.
    #[must_use]
    pub fn header_for(&self, url: &str) -> Credential {
        match self.try_header_for(url) {
            Ok(credential) => credential,
            Err(error) => {
                debug!(error = %error, "proceeding without credential");
                Credential::empty()
            }
        }
    }

    /// Seeds the jar from a `name=value; name2=value2` header obtained for
    /// `url` after sign-in. Cookies apply to the whole host.
    ///
    /// Returns the number of cookies added.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidUrl`] when `url` cannot be parsed.
    #[instrument(skip(self, cookie_header), fields(url = %url))]
    pub fn seed_from_header(&self, url: &str, cookie_header: &str) -> Result<usize, AuthError> {
        let parsed = Url::parse(url).map_err(|_| AuthError::invalid_url(url))?;
        let mut added = 0;
        for pair in cookie_header.split(';').map(str::trim) {
            if pair.is_empty() || !pair.contains('=') {
                continue;
            }
            self.jar.add_cookie_str(&format!("{pair}; Path=/"), &parsed);
            added += 1;
        }
        debug!(cookies = added, "seeded cookie jar");
        Ok(added)
    }

    /// Imports a Netscape cookie file into the jar.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::CookieFile`] when the file cannot be read or
    /// contains no valid cookies.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_cookie_file(&self, path: &Path) -> Result<usize, AuthError> {
        let file = std::fs::File::open(path).map_err(CookieError::from)?;
        let parsed = parse_cookie_file(std::io::BufReader::new(file))?;
        let loaded = parsed.load_into(&self.jar);
        info!(
            cookies = loaded,
            skipped = parsed.warnings.len(),
            "loaded cookie file"
        );
        Ok(loaded)
    }
}
