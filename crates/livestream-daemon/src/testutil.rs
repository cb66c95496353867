//! Local stream server for probe, batch and core tests.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use livestream_proto::config::CheckConfig;

/// Timeouts short enough that stalled routes fail quickly.
pub fn fast_check_config() -> CheckConfig {
    CheckConfig {
        connect_timeout_ms: 500,
        read_timeout_ms: 300,
        concurrency: 4,
    }
}

/// Routes:
/// - `/live`: 200, one audio chunk, then the connection stays open
/// - `/stalled`: 200, headers only, body never arrives
/// - `/empty`: 200 with a zero-length body
/// - `/missing`: 404
/// - `/no-content`: 204
/// - `/slow`: headers withheld for three seconds
pub struct StreamServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StreamServer {
    pub async fn start() -> Self {
        let app = Router::new()
            .route("/live", get(live))
            .route("/stalled", get(stalled))
            .route("/empty", get(|| async { StatusCode::OK }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/no-content", get(|| async { StatusCode::NO_CONTENT }))
            .route("/slow", get(slow));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn live() -> Body {
    let chunks = stream::once(async { Ok::<_, std::io::Error>(b"ID3\x04\x00audio".to_vec()) })
        .chain(stream::pending());
    Body::from_stream(chunks)
}

async fn stalled() -> Body {
    Body::from_stream(stream::pending::<Result<Vec<u8>, std::io::Error>>())
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(3)).await;
    "late"
}
