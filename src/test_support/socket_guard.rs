//! Skips wiremock-backed tests in sandboxes that forbid binding localhost.

use std::net::TcpListener;

use wiremock::MockServer;

/// Set to `1`/`true`/`yes` to turn a skipped socket test into a failure.
const REQUIRE_SOCKET_TESTS_ENV: &str = "NETDISK_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_SOCKET_TESTS_ENV)
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` when localhost sockets are blocked.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return Some(MockServer::start().await);
    }
    assert!(
        !socket_tests_required(),
        "cannot bind localhost; unset {REQUIRE_SOCKET_TESTS_ENV} to allow skipping"
    );
    eprintln!("[socket-bound-test] cannot bind localhost; skipping");
    None
}
