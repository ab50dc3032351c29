use crate::admin;
use crate::close_watch::ConnectionWatch;
use crate::config::ServerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::plumb::{Outcome, Plumber};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::route::{Route, RouteTable};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Administrative endpoint, served on the proxy listener
pub const API_PATH: &str = "/api";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// What a request must look like to be considered for routing
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    pub path_prefix: String,
    pub cookie_name: String,
    pub api_key: String,
}

impl From<&ServerConfig> for FrontendConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            path_prefix: config.path_prefix.clone(),
            cookie_name: config.cookie_name.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

/// Per-request routing state shared by every connection
pub struct Dispatcher {
    table: Arc<RouteTable>,
    plumber: Plumber,
    frontend: FrontendConfig,
}

impl Dispatcher {
    pub fn new(table: Arc<RouteTable>, plumber: Plumber, frontend: FrontendConfig) -> Self {
        Self {
            table,
            plumber,
            frontend,
        }
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        watch: ConnectionWatch,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if req.uri().path() == API_PATH {
            return admin::handle_api_request(req, &self.table, &self.frontend.api_key).await;
        }

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        append_forwarded_for(headers, client_addr.ip());

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let route = match resolve(&req, &self.frontend, &self.table) {
            Ok(route) => route,
            Err(code) => {
                warn!(uri = %req.uri(), request_id, code = code.as_header_value(), "Request rejected");
                return json_error_response(code, client_message(code));
            }
        };

        watch.register(route.id);

        let plumbed = self.plumber.plumb(req, &route, watch, &request_id).await;

        if plumbed.outcome == Outcome::DeadBackend {
            // Gone from the table now; containers are killed in the background
            if let Some(dead) = self.table.detach(route.id) {
                info!(route_id = %dead.id, backend = %dead.backend_addr, request_id, "Removing route with dead backend");
                let table = Arc::clone(&self.table);
                tokio::spawn(async move {
                    table.teardown(&dead).await;
                });
            }
        }

        plumbed.response
    }
}

/// Match a request against the route table.
///
/// The full request target (path and query, as received) must start with
/// the frontend prefix; what follows the prefix is matched against each
/// route's frontend path together with the session cookie.
pub fn resolve<B>(
    req: &Request<B>,
    frontend: &FrontendConfig,
    table: &RouteTable,
) -> Result<Route, ProxyErrorCode> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path());

    let Some(path) = target.strip_prefix(frontend.path_prefix.as_str()) else {
        return Err(ProxyErrorCode::BadPrefix);
    };

    let cookie = extract_cookie(req, &frontend.cookie_name).ok_or(ProxyErrorCode::MissingCookie)?;

    table
        .find_route(path, &cookie)
        .map_err(|_| ProxyErrorCode::RouteNotFound)
}

fn client_message(code: ProxyErrorCode) -> &'static str {
    match code {
        ProxyErrorCode::MissingCookie => "unknown auth cookie",
        _ => "unknown backend",
    }
}

/// Find a cookie value by name across all `Cookie` headers
pub fn extract_cookie<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get_all(hyper::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| {
            let value = value.trim();
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .to_string()
        })
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, ip: IpAddr) {
    let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// The session proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        config: &ServerConfig,
        table: Arc<RouteTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let ip: IpAddr = config
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.bind, e))?;

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
        }));
        let plumber = Plumber::new(
            pool,
            Arc::clone(&table),
            config.request_timeout(),
            config.tunnel_idle_timeout(),
        );

        Ok(Self {
            bind_addr: SocketAddr::new(ip, config.port),
            dispatcher: Arc::new(Dispatcher::new(table, plumber, FrontendConfig::from(config))),
            shutdown_rx,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.dispatcher.plumber.pool()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            prefix = %self.dispatcher.frontend.path_prefix,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    // Dropped with the service; tunnels spawned from this connection keep their own clone
    let watch = ConnectionWatch::new(Arc::clone(dispatcher.table()), addr);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        let watch = watch.clone();
        async move { Ok::<_, hyper::Error>(dispatcher.handle_request(req, addr, watch).await) }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NoopGateway;
    use crate::route::RouteTableConfig;
    use crate::store::RouteStore;

    fn frontend(prefix: &str) -> FrontendConfig {
        FrontendConfig {
            path_prefix: prefix.to_string(),
            cookie_name: "galaxysession".to_string(),
            api_key: "key".to_string(),
        }
    }

    fn table(dir: &tempfile::TempDir) -> Arc<RouteTable> {
        RouteTable::new(
            RouteStore::new(dir.path().join("sessionMap.json")),
            Arc::new(NoopGateway),
            RouteTableConfig::default(),
        )
    }

    fn request(uri: &str, cookie: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header("Cookie", cookie);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_cookie() {
        let req = request("/", Some("a=1; galaxysession=\"abc\"; b=2"));
        assert_eq!(extract_cookie(&req, "galaxysession"), Some("abc".to_string()));
        assert_eq!(extract_cookie(&req, "b"), Some("2".to_string()));
        assert_eq!(extract_cookie(&req, "missing"), None);

        let multi = Request::builder()
            .header("Cookie", "a=1")
            .header("Cookie", "galaxysession=xyz")
            .body(())
            .unwrap();
        assert_eq!(extract_cookie(&multi, "galaxysession"), Some("xyz".to_string()));
    }

    #[test]
    fn test_resolve_rejects_wrong_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        table.add_route("/ipython", "127.0.0.1:9000", "abc", vec![]);

        let req = request("/other/ipython", Some("galaxysession=abc"));
        assert_eq!(
            resolve(&req, &frontend("/galaxy/gie_proxy"), &table).unwrap_err(),
            ProxyErrorCode::BadPrefix
        );
    }

    #[test]
    fn test_resolve_requires_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        table.add_route("/ipython", "127.0.0.1:9000", "abc", vec![]);

        let req = request("/galaxy/gie_proxy/ipython", Some("other=abc"));
        assert_eq!(
            resolve(&req, &frontend("/galaxy/gie_proxy"), &table).unwrap_err(),
            ProxyErrorCode::MissingCookie
        );
    }

    #[test]
    fn test_resolve_strips_prefix_and_matches_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let route = table.add_route("/ipython", "127.0.0.1:9000", "abc", vec![]);
        let frontend = frontend("/galaxy/gie_proxy");

        let req = request("/galaxy/gie_proxy/ipython/tree?x=1", Some("galaxysession=abc"));
        assert_eq!(resolve(&req, &frontend, &table).unwrap().id, route.id);

        let wrong_cookie = request("/galaxy/gie_proxy/ipython/tree", Some("galaxysession=nope"));
        assert_eq!(
            resolve(&wrong_cookie, &frontend, &table).unwrap_err(),
            ProxyErrorCode::RouteNotFound
        );

        // Unchanged by failed lookups
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_client_messages() {
        assert_eq!(client_message(ProxyErrorCode::BadPrefix), "unknown backend");
        assert_eq!(client_message(ProxyErrorCode::RouteNotFound), "unknown backend");
        assert_eq!(client_message(ProxyErrorCode::MissingCookie), "unknown auth cookie");
    }

    #[test]
    fn test_append_forwarded_for() {
        let mut headers = hyper::HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1".parse().unwrap());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1");

        append_forwarded_for(&mut headers, "::1".parse().unwrap());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, ::1");
    }

    #[test]
    fn test_new_rejects_bad_bind_address() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let config = ServerConfig {
            bind: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(ProxyServer::new(&config, table(&dir), rx).is_err());
    }
}
