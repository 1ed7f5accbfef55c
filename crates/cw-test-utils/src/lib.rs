// cw-test-utils: Shared test utilities for the watcher suite.
//
// Provides a scripted mock streaming endpoint and a mock of the upstream
// HTTP API so connection, stream and backfill logic can be exercised
// end-to-end against localhost.

pub mod mock_http_server;
pub mod mock_stream_server;

pub use mock_http_server::{Backlog, LoginMode, LoginRecord, MockHttpServer};
pub use mock_stream_server::{Handshake, MockStreamServer, WsStep};

pub const TEST_EMAIL: &str = "watcher@example.com";
pub const TEST_PASSWORD: &str = "hunter2";
pub const STREAM_PATH: &str = "/websocket/2";

/// A full fake upstream: HTTP API whose login advertises the stream server.
pub struct MockUpstream {
    pub http: MockHttpServer,
    pub stream: MockStreamServer,
}

impl MockUpstream {
    /// Start both servers; login accepts `TEST_EMAIL` / `TEST_PASSWORD`.
    pub async fn start() -> std::io::Result<Self> {
        let stream = MockStreamServer::start().await?;
        let http = MockHttpServer::start(
            stream.local_addr().to_string(),
            STREAM_PATH,
            LoginMode::Accept {
                email: TEST_EMAIL.to_owned(),
                password: TEST_PASSWORD.to_owned(),
            },
        )
        .await?;
        Ok(Self { http, stream })
    }
}

/// Render a `buffer_msg` frame as the upstream would send it.
pub fn buffer_msg(chan: &str, from: &str, msg: &str, eid: i64, time_us: i64) -> String {
    serde_json::json!({
        "type": "buffer_msg",
        "chan": chan,
        "from": from,
        "msg": msg,
        "eid": eid,
        "time": time_us,
        "bid": 1,
    })
    .to_string()
}

/// Render an `oob_include` gap-fill frame.
pub fn oob_include(url: &str) -> String {
    serde_json::json!({ "type": "oob_include", "url": url }).to_string()
}
