//! Administrative API served at `/api` on the proxy listener
//!
//! `GET /api?api_key=K` lists the route table. `POST /api?api_key=K` with a
//! JSON route descriptor adds a route and answers with the updated list.

use crate::route::RouteTable;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

/// Largest route descriptor accepted
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Helper to create a plain text response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Route as submitted by the orchestrator
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    #[serde(default)]
    pub frontend: String,
    #[serde(default)]
    pub backend_addr: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub container_ids: Vec<String>,
}

impl RouteDescriptor {
    pub fn is_complete(&self) -> bool {
        !self.frontend.is_empty() && !self.backend_addr.is_empty() && !self.cookie.is_empty()
    }
}

/// Percent-decoded value of `name` in a query string
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        urlencoding::decode(&s).map(|v| v.into_owned()).ok()
    };

    query?
        .split('&')
        .filter_map(|pair| match pair.split_once('=') {
            Some((key, value)) => Some((key, value)),
            None if !pair.is_empty() => Some((pair, "")),
            None => None,
        })
        .find(|(key, _)| decode(key).as_deref() == Some(name))
        .and_then(|(_, value)| decode(value))
}

pub async fn handle_api_request<B>(
    req: Request<B>,
    table: &RouteTable,
    api_key: &str,
) -> Response<BoxBody<Bytes, hyper::Error>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let received = query_param(req.uri().query(), "api_key").unwrap_or_default();
    if received != api_key {
        warn!(method = %req.method(), "Unauthorized admin API request");
        return response(StatusCode::UNAUTHORIZED, "Invalid API key\n");
    }

    let method = req.method().clone();
    debug!(%method, "Admin API request");

    match method {
        Method::GET => render_routes(table),
        Method::POST => {
            let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "Failed to read route descriptor");
                    return response(StatusCode::BAD_REQUEST, "Invalid Route data\n");
                }
            };

            let descriptor: RouteDescriptor = match serde_json::from_slice(&body) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(error = %e, "Error decoding route descriptor");
                    return response(StatusCode::BAD_REQUEST, "Invalid Route data\n");
                }
            };

            if !descriptor.is_complete() {
                info!(
                    frontend = %descriptor.frontend,
                    backend = %descriptor.backend_addr,
                    containers = ?descriptor.container_ids,
                    "An invalid route was attempted"
                );
                return response(StatusCode::BAD_REQUEST, "Invalid Route data\n");
            }

            table.add_route(
                descriptor.frontend,
                descriptor.backend_addr,
                descriptor.cookie,
                descriptor.container_ids,
            );

            render_routes(table)
        }
        _ => response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"),
    }
}

fn render_routes(table: &RouteTable) -> Response<BoxBody<Bytes, hyper::Error>> {
    match serde_json::to_string_pretty(&table.routes()) {
        Ok(json) => json_response(StatusCode::OK, json),
        Err(e) => {
            error!(error = %e, "Failed to encode route list");
            response(StatusCode::INTERNAL_SERVER_ERROR, "Data encoding error\n")
        }
    }
}
