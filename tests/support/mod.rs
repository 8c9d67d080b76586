//! Shared helpers for integration tests: a range-aware HTTP server with fault
//! injection, deterministic payloads, and polling helpers.
//!
//! The server is a raw `TcpListener` rather than a mock framework because the
//! tests need to cut connections mid-body and pace the stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use download_manager::{DownloadManager, TransferId, TransferRecord, TransferStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Deterministic, non-repeating-looking payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Behaviour knobs for [`RangeServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bytes written per slice.
    pub slice: usize,
    /// Pause between slices.
    pub delay: Duration,
    /// On the first request only, close the connection after this many body
    /// bytes (absolute offset), despite the announced length.
    pub disconnect_first_at: Option<usize>,
    /// Answer every request with this status and an empty body.
    pub always_status: Option<u16>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            slice: 64 * 1024,
            delay: Duration::ZERO,
            disconnect_first_at: None,
            always_status: None,
        }
    }
}

impl ServerOptions {
    /// Streams slowly enough that a transfer stays active for a while.
    pub fn slow() -> Self {
        Self {
            slice: 512,
            delay: Duration::from_millis(15),
            ..Self::default()
        }
    }
}

struct ServerState {
    body: Vec<u8>,
    options: ServerOptions,
    requests: AtomicUsize,
    ranges: Mutex<Vec<Option<String>>>,
}

/// Serves one payload on every path, honouring `Range: bytes=<n>-`.
pub struct RangeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: tokio::task::JoinHandle<()>,
}

impl RangeServer {
    pub async fn start(body: Vec<u8>, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            body,
            options,
            requests: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Number of requests received so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// `Range` header of every request, in arrival order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.state.ranges.lock().expect("ranges lock").clone()
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut buf = [0_u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn range_header(head: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    })
}

fn range_start(range: Option<&str>) -> usize {
    range
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let head = read_request_head(&mut stream).await?;
    let index = state.requests.fetch_add(1, Ordering::SeqCst);
    let range = range_header(&head);
    state
        .ranges
        .lock()
        .expect("ranges lock")
        .push(range.clone());

    if let Some(status) = state.options.always_status {
        let response = format!(
            "HTTP/1.1 {status} Test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).await?;
        return stream.shutdown().await;
    }

    let len = state.body.len();
    let start = range_start(range.as_deref());
    let head = if start == 0 {
        format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n")
    } else if start >= len {
        let response = format!(
            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{len}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).await?;
        return stream.shutdown().await;
    } else {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{}/{len}\r\nConnection: close\r\n\r\n",
            len - start,
            len - 1
        )
    };
    stream.write_all(head.as_bytes()).await?;

    let end = match state.options.disconnect_first_at {
        Some(cut) if index == 0 => cut.clamp(start, len),
        _ => len,
    };
    let mut offset = start;
    while offset < end {
        let next = (offset + state.options.slice.max(1)).min(end);
        stream.write_all(&state.body[offset..next]).await?;
        stream.flush().await?;
        offset = next;
        if !state.options.delay.is_zero() {
            tokio::time::sleep(state.options.delay).await;
        }
    }
    stream.shutdown().await
}

/// Polls `get_info` until `predicate` holds, panicking after `timeout`.
pub async fn wait_for_record(
    manager: &DownloadManager,
    id: &TransferId,
    timeout: Duration,
    predicate: impl Fn(&TransferRecord) -> bool,
) -> TransferRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = manager.get_info(id).await.expect("record exists");
        if predicate(&record) {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {id}: {record:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for `id` to reach `status`.
pub async fn wait_for_status(
    manager: &DownloadManager,
    id: &TransferId,
    status: TransferStatus,
) -> TransferRecord {
    wait_for_record(manager, id, Duration::from_secs(15), |r| r.status == status).await
}

/// `wait_until_settled` bounded by a generous timeout.
pub async fn settle(manager: &DownloadManager) {
    tokio::time::timeout(Duration::from_secs(20), manager.wait_until_settled())
        .await
        .expect("manager did not settle in time");
}
