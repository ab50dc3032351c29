//! Protocol plumbing between a matched request and its backend
//!
//! Plain requests go through the pooled HTTP client. WebSocket upgrades are
//! relayed as raw bytes: the handshake is replayed to the backend over a
//! fresh TCP connection, its answer is handed back to the client, and once
//! hyper releases the upgraded client stream two copy loops shuttle bytes
//! until either side goes away.

use crate::close_watch::ConnectionWatch;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use crate::route::{Route, RouteId, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Read buffer for each tunnel direction
const COPY_BUF_SIZE: usize = 40 * 1024;
/// Largest handshake response head accepted from a backend
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
/// Largest body relayed when a backend refuses an upgrade
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// Terminal state of one proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Backend could not be reached or written to; the route must go
    DeadBackend,
}

pub struct Plumbed {
    pub response: Response<BoxBody<Bytes, hyper::Error>>,
    pub outcome: Outcome,
}

impl Plumbed {
    fn completed(response: Response<BoxBody<Bytes, hyper::Error>>) -> Self {
        Self {
            response,
            outcome: Outcome::Completed,
        }
    }

    fn error(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        let outcome = if code == ProxyErrorCode::DeadBackend {
            Outcome::DeadBackend
        } else {
            Outcome::Completed
        };
        Self {
            response: json_error_response(code, message),
            outcome,
        }
    }
}

/// Check for `Connection: upgrade` together with `Upgrade: websocket`
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

/// Whether hyper will hand over the raw client stream for this request.
/// HTTP/2 requests and connections served without upgrade support never do.
pub fn supports_hijack<B>(req: &Request<B>) -> bool {
    req.extensions().get::<OnUpgrade>().is_some()
}

pub struct Plumber {
    pool: Arc<ConnectionPool>,
    table: Arc<RouteTable>,
    request_timeout: Option<Duration>,
    tunnel_idle_timeout: Option<Duration>,
}

impl Plumber {
    pub fn new(
        pool: Arc<ConnectionPool>,
        table: Arc<RouteTable>,
        request_timeout: Option<Duration>,
        tunnel_idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            table,
            request_timeout,
            tunnel_idle_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Send `req` to the route's backend, picking HTTP forwarding or a raw
    /// tunnel. `watch` is kept alive by any tunnel this spawns.
    pub async fn plumb(
        &self,
        req: Request<Incoming>,
        route: &Route,
        watch: ConnectionWatch,
        request_id: &str,
    ) -> Plumbed {
        if is_websocket_upgrade(&req) {
            self.plumb_websocket(req, route, watch, request_id).await
        } else {
            self.plumb_http(req, route, request_id).await
        }
    }

    async fn plumb_http(&self, req: Request<Incoming>, route: &Route, request_id: &str) -> Plumbed {
        let backend = route.backend_addr.as_str();
        let forward = self.pool.send_request(req, backend);

        let result = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, forward).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(route_id = %route.id, backend, request_id, timeout_secs = limit.as_secs(), "Request timed out");
                    return Plumbed::error(
                        ProxyErrorCode::RequestTimeout,
                        format!("Request timed out after {} seconds", limit.as_secs()),
                    );
                }
            },
            None => forward.await,
        };

        match result {
            Ok(response) => {
                self.table.seen(route.id);
                debug!(route_id = %route.id, backend, request_id, status = %response.status(), "Backend responded");
                Plumbed::completed(response)
            }
            Err(PoolError::RequestBuild(e)) => {
                error!(route_id = %route.id, backend, request_id, error = %e, "Failed to build backend request");
                Plumbed::error(ProxyErrorCode::InternalError, "Failed to build backend request")
            }
            Err(e) => {
                warn!(route_id = %route.id, backend, request_id, error = %e, "Backend unreachable");
                Plumbed::error(ProxyErrorCode::DeadBackend, format!("Error: {}", e))
            }
        }
    }

    async fn plumb_websocket(
        &self,
        mut req: Request<Incoming>,
        route: &Route,
        watch: ConnectionWatch,
        request_id: &str,
    ) -> Plumbed {
        let backend = route.backend_addr.as_str();

        if !supports_hijack(&req) {
            error!(route_id = %route.id, request_id, version = ?req.version(), "Connection cannot be upgraded");
            return Plumbed::error(
                ProxyErrorCode::NoHijackSupport,
                "webserver doesn't support hijacking",
            );
        }

        let raw_request = build_upgrade_request(&req);

        let mut backend_stream = match TcpStream::connect(backend).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(route_id = %route.id, backend, request_id, error = %e, "Failed to connect to backend for upgrade");
                return Plumbed::error(
                    ProxyErrorCode::DeadBackend,
                    format!("couldn't connect to backend server: {}", e),
                );
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            warn!(route_id = %route.id, backend, request_id, error = %e, "Failed to send upgrade request to backend");
            return Plumbed::error(
                ProxyErrorCode::DeadBackend,
                format!("writing WebSocket request to backend server failed: {}", e),
            );
        }

        // The backend is alive from here on; a bad or slow answer leaves the route alone
        let exchange = async {
            let (head, pending) = read_response_head(&mut backend_stream).await?;
            let (status, headers) = parse_upgrade_response(&head)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed response head"))?;
            if status == StatusCode::SWITCHING_PROTOCOLS {
                return Ok((status, headers, pending));
            }
            let body = read_rejection_body(&mut backend_stream, status, &headers, pending).await?;
            Ok::<_, io::Error>((status, headers, body))
        };

        let result = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(route_id = %route.id, backend, request_id, timeout_secs = limit.as_secs(), "Upgrade handshake timed out");
                    return Plumbed::error(
                        ProxyErrorCode::RequestTimeout,
                        format!("Request timed out after {} seconds", limit.as_secs()),
                    );
                }
            },
            None => exchange.await,
        };

        let (status, response_headers, pending) = match result {
            Ok(parts) => parts,
            Err(e) => {
                error!(route_id = %route.id, backend, request_id, error = %e, "Invalid upgrade response from backend");
                return Plumbed::error(
                    ProxyErrorCode::InvalidUpstreamResponse,
                    format!("Invalid upgrade response from backend: {}", e),
                );
            }
        };

        self.table.seen(route.id);

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(route_id = %route.id, backend, status = %status, body_len = pending.len(), "Backend rejected upgrade request");
            return Plumbed::completed(build_response(status, &response_headers, pending));
        }

        info!(route_id = %route.id, backend, request_id, "WebSocket upgrade accepted by backend");

        let on_upgrade = hyper::upgrade::on(&mut req);
        let table = Arc::clone(&self.table);
        let route_id = route.id;
        let idle_timeout = self.tunnel_idle_timeout;
        let request_id = request_id.to_string();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let (to_backend, to_client) = tunnel(
                        TokioIo::new(upgraded),
                        backend_stream,
                        pending,
                        &table,
                        route_id,
                        idle_timeout,
                    )
                    .await;
                    debug!(%route_id, request_id, to_backend, to_client, "WebSocket tunnel closed");
                }
                Err(e) => {
                    error!(%route_id, request_id, error = %e, "Failed to upgrade client connection");
                }
            }
            // The tunnel kept the client connection alive past its service
            drop(watch);
        });

        Plumbed::completed(build_response(
            StatusCode::SWITCHING_PROTOCOLS,
            &response_headers,
            Bytes::new(),
        ))
    }
}

/// Relay bytes between `client` and `backend` until either side closes.
///
/// `pending` holds bytes the backend already sent; they reach the client
/// first. Both directions run concurrently and the first to finish stops
/// the other. Both write halves are shut down before returning. Returns
/// the byte counts (client to backend, backend to client).
pub async fn tunnel<C, B>(
    client: C,
    backend: B,
    pending: Bytes,
    table: &RouteTable,
    route_id: RouteId,
    idle_timeout: Option<Duration>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let (stop_tx, stop_rx) = watch::channel(false);
    let activity = Mutex::new(Instant::now());
    let copy = CopyContext {
        table,
        route_id,
        idle_timeout,
        activity: &activity,
        stop_tx: &stop_tx,
    };

    let (to_backend, to_client) = tokio::join!(
        copy.pump(&mut client_rd, &mut backend_wr, Bytes::new(), stop_rx.clone(), "client->backend"),
        copy.pump(&mut backend_rd, &mut client_wr, pending, stop_rx, "backend->client"),
    );

    let _ = backend_wr.shutdown().await;
    let _ = client_wr.shutdown().await;

    (to_backend, to_client)
}

struct CopyContext<'a> {
    table: &'a RouteTable,
    route_id: RouteId,
    idle_timeout: Option<Duration>,
    /// Last time a byte moved in either direction
    activity: &'a Mutex<Instant>,
    stop_tx: &'a watch::Sender<bool>,
}

impl CopyContext<'_> {
    async fn pump<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        pending: Bytes,
        mut stop_rx: watch::Receiver<bool>,
        direction: &'static str,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;

        if !pending.is_empty() {
            if let Err(e) = self.deliver(writer, &pending).await {
                debug!(route_id = %self.route_id, direction, error = %e, "Write failed");
                self.stop_tx.send_replace(true);
                return total;
            }
            total += pending.len() as u64;
        }

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let read = tokio::select! {
                _ = stop_rx.changed() => break,
                read = self.read_chunk(reader, &mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = self.deliver(writer, &buf[..n]).await {
                        debug!(route_id = %self.route_id, direction, error = %e, "Write failed");
                        break;
                    }
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.activity.lock().elapsed() >= self.idle_timeout.unwrap_or_default() {
                        debug!(route_id = %self.route_id, direction, "Tunnel idle timeout");
                        break;
                    }
                }
                Err(e) => {
                    debug!(route_id = %self.route_id, direction, error = %e, "Read failed");
                    break;
                }
            }
        }

        self.stop_tx.send_replace(true);
        total
    }

    async fn deliver<W: AsyncWrite + Unpin>(&self, writer: &mut W, chunk: &[u8]) -> io::Result<()> {
        writer.write_all(chunk).await?;
        writer.flush().await?;
        *self.activity.lock() = Instant::now();
        self.table.seen(self.route_id);
        Ok(())
    }

    async fn read_chunk<R: AsyncRead + Unpin>(&self, reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel idle"))?,
            None => reader.read(buf).await,
        }
    }
}

/// Serialize the request head for replay on a raw backend connection.
/// Headers go out verbatim, including the client's Host.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Read until the end of the response head. Returns the head and whatever
/// the backend sent after it.
async fn read_response_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(Vec<u8>, Bytes)> {
    let mut data = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        data.extend_from_slice(&buf[..n]);

        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = Bytes::copy_from_slice(&data[end + 4..]);
            data.truncate(end + 4);
            return Ok((data, rest));
        }
        if data.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }
    }
}

/// Read the body of a non-101 handshake answer so it reaches the client
/// whole. Chunked bodies are decoded, `Content-Length` is honored and an
/// unframed body runs until the backend closes.
async fn read_rejection_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    status: StatusCode,
    headers: &[(String, String)],
    pending: Bytes,
) -> io::Result<Bytes> {
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(Bytes::new());
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    let chunked = header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let mut body = pending.to_vec();

    if chunked {
        loop {
            if let Some(decoded) = decode_chunked(&body)? {
                return Ok(Bytes::from(decoded));
            }
            if !read_more(reader, &mut body).await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside chunked body",
                ));
            }
        }
    }

    if let Some(length) = header("content-length") {
        let length: usize = length
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid content-length"))?;
        if length > MAX_REJECTION_BODY {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response body too large"));
        }
        if body.len() < length {
            let start = body.len();
            body.resize(length, 0);
            reader.read_exact(&mut body[start..]).await?;
        }
        body.truncate(length);
        return Ok(Bytes::from(body));
    }

    while read_more(reader, &mut body).await? {}
    Ok(Bytes::from(body))
}

/// Append one read to `body`. Returns false at EOF.
async fn read_more<R: AsyncRead + Unpin>(reader: &mut R, body: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; 4096];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(false);
    }
    body.extend_from_slice(&buf[..n]);
    if body.len() > MAX_REJECTION_BODY {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "response body too large"));
    }
    Ok(true)
}

/// Decode a complete chunked body, `None` while more input is needed.
/// Chunk extensions and trailers are dropped.
fn decode_chunked(data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid chunked body");
    let mut decoded = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&data[pos..pos + line_len]).map_err(|_| invalid())?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|_| invalid())?;
        pos += line_len + 2;

        if size == 0 {
            let trailers = &data[pos..];
            let done = trailers.starts_with(b"\r\n") || trailers.windows(4).any(|w| w == b"\r\n\r\n");
            return Ok(done.then_some(decoded));
        }
        if size > MAX_REJECTION_BODY - decoded.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response body too large"));
        }
        if data.len() < pos + size + 2 {
            return Ok(None);
        }
        decoded.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

/// Parse a status line plus headers, e.g. `HTTP/1.1 101 Switching Protocols`
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn build_response(
    status: StatusCode,
    headers: &[(String, String)],
    body: Bytes,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        // Framing is recomputed by hyper for the body we actually send
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    response
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| json_error_response(ProxyErrorCode::InvalidUpstreamResponse, "Invalid header from backend"))
}
