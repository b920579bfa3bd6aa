//! User-Agent string sent with every transfer request.

/// Project URL advertised in the User-Agent.
const PROJECT_UA_URL: &str = "https://github.com/fierce/netdisk-downloader";

/// Default User-Agent for transfer requests.
#[must_use]
pub(crate) fn default_transfer_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("netdisk/{version} (+{PROJECT_UA_URL})")
}
