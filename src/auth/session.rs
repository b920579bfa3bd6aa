//! Persisted sign-in session.
//!
//! The last cookie header obtained after sign-in is stored next to the
//! download history so a restarted process can authenticate without the
//! content viewer.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AuthError, Authenticator};
use crate::store::{AUTH_COOKIES_KEY, KeyValueBackend};

/// Cookie header captured for a server. `Debug` never prints the cookies.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookies {
    /// Server the cookies were issued for.
    pub server_url: String,
    cookie_header: String,
}

impl SessionCookies {
    /// Captures a session.
    #[must_use]
    pub fn new(server_url: impl Into<String>, cookie_header: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            cookie_header: cookie_header.into(),
        }
    }

    /// Raw header value. Never log it.
    #[must_use]
    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    /// Writes the session to `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] when the backend rejects the write.
    pub async fn save(&self, backend: &dyn KeyValueBackend) -> Result<(), AuthError> {
        let raw = serde_json::to_string(self).map_err(crate::store::StoreError::from)?;
        backend.save(AUTH_COOKIES_KEY, &raw).await?;
        Ok(())
    }

    /// Reads the stored session. Undecodable data counts as no session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] when the backend cannot be read.
    pub async fn load(backend: &dyn KeyValueBackend) -> Result<Option<Self>, AuthError> {
        let Some(raw) = backend.load(AUTH_COOKIES_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                warn!(error = %error, "stored session is unreadable; ignoring it");
                Ok(None)
            }
        }
    }

    /// Deletes the stored session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] when the backend rejects the delete.
    pub async fn clear(backend: &dyn KeyValueBackend) -> Result<(), AuthError> {
        backend.remove(AUTH_COOKIES_KEY).await?;
        Ok(())
    }
}

impl fmt::Debug for SessionCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookies")
            .field("server_url", &self.server_url)
            .field("cookie_header", &"[REDACTED]")
            .finish()
    }
}

impl Authenticator {
    /// Seeds the jar from the persisted session, if any. Failures are logged
    /// and reported as `false`.
    pub async fn restore_session(&self, backend: &dyn KeyValueBackend) -> bool {
        let session = match SessionCookies::load(backend).await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(error) => {
                warn!(error = %error, "could not read stored session");
                return false;
            }
        };
        match self.seed_from_header(&session.server_url, session.cookie_header()) {
            Ok(count) => {
                info!(server = %session.server_url, cookies = count, "restored stored session");
                count > 0
            }
            Err(error) => {
                warn!(error = %error, "stored session has an invalid server URL");
                false
            }
        }
    }
}
