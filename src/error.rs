//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Route table lookup failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Could not find route")]
    NotFound,
}

/// Route store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access route store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store exists but cannot be trusted; startup must not continue
    #[error("route store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("route store {path} is corrupt: route ids are exhausted")]
    IdExhausted { path: PathBuf },

    #[error("failed to encode routes: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request path outside the frontend prefix
    BadPrefix,
    /// Session cookie absent
    MissingCookie,
    /// No route for this path and cookie
    RouteNotFound,
    /// Backend refused, reset or could not be written to
    DeadBackend,
    /// Client connection cannot be taken over for a raw tunnel
    NoHijackSupport,
    /// Backend answered the upgrade handshake with something unparseable
    InvalidUpstreamResponse,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BadPrefix => StatusCode::BAD_REQUEST,
            ProxyErrorCode::MissingCookie => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::RouteNotFound => StatusCode::BAD_REQUEST,
            ProxyErrorCode::DeadBackend => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NoHijackSupport => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InvalidUpstreamResponse => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BadPrefix => "BAD_PREFIX",
            ProxyErrorCode::MissingCookie => "MISSING_COOKIE",
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::DeadBackend => "DEAD_BACKEND",
            ProxyErrorCode::NoHijackSupport => "NO_HIJACK_SUPPORT",
            ProxyErrorCode::InvalidUpstreamResponse => "INVALID_UPSTREAM_RESPONSE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::BadPrefix.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyErrorCode::MissingCookie.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyErrorCode::RouteNotFound.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyErrorCode::DeadBackend.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::NoHijackSupport.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::DeadBackend, "Error: connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"DEAD_BACKEND\""));
        assert!(json.contains("\"message\":\"Error: connection refused\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::MissingCookie, "unknown auth cookie");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "MISSING_COOKIE"
        );
    }

    #[test]
    fn test_route_error_message() {
        assert_eq!(RouteError::NotFound.to_string(), "Could not find route");
    }
}
