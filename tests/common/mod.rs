// Fake Ollama backend and relay harness shared by the integration tests
#![allow(dead_code)]

use axum::body::Body;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use ollamarelay::config::{ModelSource, RelayConfig};
use ollamarelay::{router, AppState};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

pub const WAIT: Duration = Duration::from_secs(5);

/// One `/api/generate` call received by the fake backend.
pub struct BackendCall {
    pub request: Value,
    pub lines: mpsc::Sender<Bytes>,
}

impl BackendCall {
    pub async fn send(&self, line: &str) {
        self.lines
            .send(Bytes::from(format!("{line}\n")))
            .await
            .expect("backend stream closed early");
    }

    pub async fn send_response(&self, text: &str) {
        self.send(&json!({ "model": "m", "response": text, "done": false }).to_string())
            .await;
    }

    /// Keeps writing until the relay has dropped the backend connection.
    pub async fn assert_aborted(self) {
        let aborted = timeout(WAIT, async {
            loop {
                let late = Bytes::from_static(b"{\"response\":\"late\"}\n");
                if self.lines.send(late).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(aborted.is_ok(), "backend request was not aborted");
    }
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    calls: mpsc::UnboundedReceiver<BackendCall>,
}

impl FakeBackend {
    pub async fn spawn() -> Self {
        let (calls_tx, calls) = mpsc::unbounded_channel();

        let app = Router::new()
            .route(
                "/api/generate",
                post(move |Json(request): Json<Value>| {
                    let calls_tx = calls_tx.clone();
                    async move {
                        let (lines, rx) = mpsc::channel::<Bytes>(16);
                        let _ = calls_tx.send(BackendCall { request, lines });
                        Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
                    }
                }),
            )
            .route(
                "/api/tags",
                get(|| async {
                    Json(json!({
                        "models": [{
                            "name": "gemma3:270m",
                            "model": "gemma3:270m",
                            "modified_at": "2025-08-14T10:31:02.123456789+02:00",
                            "size": 291554930u64,
                            "digest": "e7d36fb2c3b3293cfe56d55889867a064b3a2b22e98335f2e6e8a387e081d6be"
                        }]
                    }))
                }),
            );

        Self {
            addr: serve(app).await,
            calls,
        }
    }

    /// A backend whose generate endpoint always fails.
    pub async fn spawn_failing(status: StatusCode) -> SocketAddr {
        Self::spawn_failing_with(status, "model 'm' not found".to_string()).await
    }

    pub async fn spawn_failing_with(status: StatusCode, body: String) -> SocketAddr {
        let app = Router::new().route(
            "/api/generate",
            post(move || {
                let body = body.clone();
                async move { (status, body) }
            }),
        );
        serve(app).await
    }

    /// A backend whose tags endpoint answers 200 with a body that isn't JSON.
    pub async fn spawn_garbled_tags() -> SocketAddr {
        let app = Router::new().route("/api/tags", get(|| async { "<html>proxy login</html>" }));
        serve(app).await
    }

    /// Answers `/api/generate` with one chunked NDJSON line, then closes the
    /// connection without the terminating chunk.
    pub async fn spawn_truncated(line: &'static str) -> SocketAddr {
        spawn_raw(move |mut socket| async move {
            let chunk = format!("{line}\n");
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/x-ndjson\r\n\
                 Transfer-Encoding: chunked\r\n\
                 \r\n\
                 {:x}\r\n{chunk}\r\n",
                chunk.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.flush().await;
        })
        .await
    }

    /// Accepts the request but never sends response headers. The socket is
    /// held until the relay hangs up.
    pub async fn spawn_silent() -> SocketAddr {
        spawn_raw(|mut socket| async move {
            let mut buf = [0u8; 1024];
            while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
        })
        .await
    }

    pub async fn next_call(&mut self) -> BackendCall {
        timeout(WAIT, self.calls.recv())
            .await
            .expect("backend was never called")
            .expect("backend shut down")
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

#[derive(Clone)]
pub struct Relay {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl Relay {
    pub async fn spawn(backend_url: String) -> Self {
        Self::spawn_with(RelayConfig {
            backend_url,
            model_source: ModelSource::Api,
            ..RelayConfig::default()
        })
        .await
    }

    pub async fn spawn_with(config: RelayConfig) -> Self {
        let state = AppState::from_config(&config).expect("relay state");
        let addr = serve(router(state.clone())).await;
        Self {
            addr,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("http://{}{}", self.addr, path))
            .json(&body)
            .send()
            .await
            .expect("relay request failed")
    }

    pub async fn ask(&self, session_id: &str, prompt: &str) -> reqwest::Response {
        self.post(
            "/ask",
            json!({ "prompt": prompt, "sessionId": session_id, "model": "m" }),
        )
        .await
    }

    pub async fn stop(&self, session_id: &str) -> bool {
        let response: Value = self
            .post("/stop", json!({ "sessionId": session_id }))
            .await
            .json()
            .await
            .expect("stop response is json");
        response["stopped"].as_bool().expect("stopped flag")
    }

    pub async fn wait_until_idle(&self) {
        let registry = self.state.registry().clone();
        wait_until(move || registry.is_empty()).await;
    }
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    addr
}

// Raw HTTP/1.1 server: reads one request, then hands the socket to `respond`.
async fn spawn_raw<F, Fut>(respond: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let respond = std::sync::Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_ok() {
                    (*respond)(socket).await;
                }
            });
        }
    });
    addr
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        request.extend_from_slice(&buf[..n]);
        if let Some(at) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break at + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while request.len() < header_end + content_length {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        request.extend_from_slice(&buf[..n]);
    }
    Ok(request.split_off(header_end))
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn next_text(response: &mut reqwest::Response) -> Option<String> {
    timeout(WAIT, response.chunk())
        .await
        .expect("client stream stalled")
        .expect("client stream failed")
        .map(|bytes| String::from_utf8(bytes.to_vec()).expect("utf-8 text"))
}

pub async fn read_rest(response: &mut reqwest::Response) -> String {
    let mut text = String::new();
    while let Some(chunk) = next_text(response).await {
        text.push_str(&chunk);
    }
    text
}
