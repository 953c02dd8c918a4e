#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::TcpListener;

/// Bind an app on an ephemeral port and spawn its accept loop.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Upstream that returns `body` with a 200 on GET / and echoes POST bodies
/// on /echo.
pub async fn start_upstream(body: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/", get(move || async move { body }))
        .route("/echo", post(|payload: axum::body::Bytes| async move { payload }));
    serve(app).await
}

/// Upstream that sleeps `delay` before answering 200.
pub async fn start_slow_upstream(delay: Duration, body: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/",
        get(move || async move {
            tokio::time::sleep(delay).await;
            body
        }),
    );
    serve(app).await
}

/// Upstream that walks a scripted status sequence, repeating the last entry
/// once the script runs out, and counts how many requests actually arrived.
pub struct ScriptedUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl ScriptedUpstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> http::Uri {
        format!("http://{}/", self.addr).parse().unwrap()
    }
}

pub async fn start_scripted_upstream(script: Vec<u16>) -> ScriptedUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let app = Router::new().route(
        "/",
        get(move || {
            let hits = handler_hits.clone();
            let script = script.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                let code = script
                    .get(n)
                    .or_else(|| script.last())
                    .copied()
                    .unwrap_or(200);
                StatusCode::from_u16(code).unwrap()
            }
        }),
    );

    let addr = serve(app).await;
    ScriptedUpstream { addr, hits }
}

pub fn url_for(addr: SocketAddr) -> http::Uri {
    format!("http://{addr}/").parse().unwrap()
}
