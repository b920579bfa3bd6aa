use std::net::TcpListener;

use wiremock::MockServer;

fn socket_tests_required() -> bool {
    std::env::var("NETDISK_REQUIRE_SOCKET_TESTS")
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
        "cannot bind localhost; unset NETDISK_REQUIRE_SOCKET_TESTS to allow skipping"
    );
    eprintln!("[socket-bound-test] cannot bind localhost; skipping");
    None
}

/// Binds a raw localhost listener, or returns `None` when sockets are blocked.
pub async fn bind_local_or_skip() -> Option<tokio::net::TcpListener> {
    match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => Some(listener),
        Err(error) => {
            assert!(
                !socket_tests_required(),
                "cannot bind localhost ({error}); unset NETDISK_REQUIRE_SOCKET_TESTS to allow skipping"
            );
            eprintln!("[socket-bound-test] cannot bind localhost; skipping");
            None
        }
    }
}
