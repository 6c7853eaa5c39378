//! Virtual HTTP adapter: executes a structured [`Request`] against an axum
//! `Router` in memory and captures the full response.
//!
//! No socket is involved. The router's handler runs exactly once per call; a
//! handler panic is caught and reported as a 500 response.

use std::panic::AssertUnwindSafe;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{self, HeaderName, HeaderValue, Method};
use futures::FutureExt;
use metrics::counter;
use tether_core::telemetry::{ADAPTER_PANICS_TOTAL, ADAPTER_REQUESTS_TOTAL};
use tether_core::{Request, Response, TetherError, canonical_header_key};
use tower::ServiceExt;
use tracing::{debug, error, warn};

/// Runs requests through an in-memory router.
#[derive(Clone, Debug)]
pub struct VirtualHttpAdapter {
    router: Router,
}

impl VirtualHttpAdapter {
    /// Wrap an application router.
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// The wrapped router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Execute `request` and capture status, headers (first value per key),
    /// and the complete body.
    ///
    /// Never fails: a request that cannot be built yields 400, a panicking
    /// handler yields 500.
    pub async fn execute(&self, request: &Request) -> Response {
        counter!(ADAPTER_REQUESTS_TOTAL).increment(1);

        let http_request = match build_http_request(request) {
            Ok(req) => req,
            Err(e) => {
                warn!(method = %request.method, url = %request.url, error = %e, "rejecting request");
                return Response::error(400, e.to_string());
            }
        };

        let router = self.router.clone();
        let outcome = AssertUnwindSafe(async move {
            let resp = match router.oneshot(http_request).await {
                Ok(resp) => resp,
                Err(never) => match never {},
            };
            let (parts, body) = resp.into_parts();
            let bytes = to_bytes(body, usize::MAX).await;
            (parts, bytes)
        })
        .catch_unwind()
        .await;

        match outcome {
            Ok((parts, Ok(bytes))) => {
                debug!(
                    method = %request.method,
                    url = %request.url,
                    status = parts.status.as_u16(),
                    "request executed"
                );
                let mut response = Response::new(parts.status.as_u16());
                flatten_headers(&parts.headers, &mut response);
                response.body = bytes.to_vec();
                response
            }
            Ok((_, Err(e))) => {
                error!(url = %request.url, error = %e, "failed to read response body");
                Response::error(500, "Internal Server Error")
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(
                    method = %request.method,
                    url = %request.url,
                    panic = %msg,
                    "handler panicked"
                );
                counter!(ADAPTER_PANICS_TOTAL).increment(1);
                Response::error(500, "Internal Server Error")
            }
        }
    }
}

fn build_http_request(request: &Request) -> Result<http::Request<Body>, TetherError> {
    let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
        TetherError::InvalidRequest {
            message: format!("invalid method '{}'", request.method),
        }
    })?;
    let url = if request.url.is_empty() {
        "/"
    } else {
        request.url.as_str()
    };

    let mut builder = http::Request::builder().method(method).uri(url);
    for (key, value) in &request.headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            TetherError::InvalidRequest {
                message: format!("invalid header name '{key}'"),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| TetherError::InvalidRequest {
            message: format!("invalid value for header '{key}'"),
        })?;
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(request.body.clone()))
        .map_err(|e| TetherError::InvalidRequest {
            message: e.to_string(),
        })
}

/// Copy the first value of every header under its canonical name.
pub(crate) fn flatten_headers(headers: &http::HeaderMap, response: &mut Response) {
    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            let key = canonical_header_key(name.as_str());
            if !response.headers.contains_key(&key) {
                let _ = response.headers.insert(
                    key,
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde::Deserialize;

    use crate::testing::TestClient;

    #[derive(Deserialize)]
    struct HelloQuery {
        name: String,
    }

    fn app(hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/hello",
                get(move |Query(q): Query<HelloQuery>| {
                    let hits = hits.clone();
                    async move {
                        let _ = hits.fetch_add(1, Ordering::SeqCst);
                        (
                            [("content-type", "text/html; charset=utf-8")],
                            format!("Hello, {}", q.name),
                        )
                    }
                }),
            )
            .route(
                "/echo",
                post(|headers: HeaderMap, body: String| async move {
                    let trace = headers
                        .get("x-trace")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_owned();
                    (
                        StatusCode::CREATED,
                        [("x-trace", trace), ("x-echo-len", body.len().to_string())],
                        body,
                    )
                        .into_response()
                }),
            )
            .route(
                "/multi",
                get(|| async {
                    let mut headers = HeaderMap::new();
                    let _ = headers.append("x-tag", HeaderValue::from_static("first"));
                    let _ = headers.append("x-tag", HeaderValue::from_static("second"));
                    (headers, "ok")
                }),
            )
            .route(
                "/fragment",
                get(|| async {
                    (
                        [
                            ("vary", "HX-Request"),
                            ("content-type", "text/html"),
                            ("date", "Tue, 01 Sep 2026 00:00:00 GMT"),
                        ],
                        "<p>partial</p>",
                    )
                }),
            )
            .route("/boom", get(boom))
    }

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    fn adapter() -> (VirtualHttpAdapter, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (VirtualHttpAdapter::new(app(hits.clone())), hits)
    }

    #[tokio::test]
    async fn hello_request_runs_handler_once() {
        let (adapter, hits) = adapter();
        let _ = TestClient::from_adapter(adapter)
            .get("/hello?name=Ada")
            .await
            .assert_ok()
            .assert_body("Hello, Ada")
            .assert_header("Content-Type", "text/html; charset=utf-8");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn headers_and_body_reach_handler() {
        let (adapter, _) = adapter();
        let _ = TestClient::from_adapter(adapter)
            .with_header("X-Trace", "t-42")
            .post("/echo", "payload")
            .await
            .assert_created()
            .assert_body("payload")
            .assert_header("x-trace", "t-42")
            .assert_header("X-Echo-Len", "7");
    }

    #[tokio::test]
    async fn multi_valued_header_keeps_first() {
        let (adapter, _) = adapter();
        let resp = adapter.execute(&Request::new("GET", "/multi")).await;
        assert_eq!(resp.headers.get("X-Tag").map(String::as_str), Some("first"));
    }

    #[tokio::test]
    async fn handler_written_headers_survive() {
        let (adapter, _) = adapter();
        let _ = TestClient::from_adapter(adapter)
            .htmx()
            .get("/fragment")
            .await
            .assert_header("Vary", "HX-Request")
            .assert_html()
            .assert_header("Date", "Tue, 01 Sep 2026 00:00:00 GMT")
            .assert_header("Content-Length", "14");
    }

    #[tokio::test]
    async fn unknown_route_passes_through_404() {
        let (adapter, hits) = adapter();
        let resp = adapter.execute(&Request::new("GET", "/nope")).await;
        assert_eq!(resp.status, 404);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_becomes_500() {
        let (adapter, _) = adapter();
        let resp = adapter.execute(&Request::new("GET", "/boom")).await;
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body_str(), "Internal Server Error");

        // The adapter stays usable afterwards.
        let resp = adapter.execute(&Request::new("GET", "/hello?name=B")).await;
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn invalid_method_is_400() {
        let (adapter, hits) = adapter();
        let resp = adapter.execute(&Request::new("GE T", "/hello?name=x")).await;
        assert_eq!(resp.status, 400);
        assert!(resp.body_str().contains("invalid method"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_header_is_400() {
        let (adapter, _) = adapter();
        let req = Request::new("GET", "/hello?name=x").with_header("X-Bad", "line\nbreak");
        let resp = adapter.execute(&req).await;
        assert_eq!(resp.status, 400);
    }

    #[tokio::test]
    async fn empty_url_targets_root() {
        let router = Router::new().route("/", get(|| async { "root" }));
        let resp = VirtualHttpAdapter::new(router)
            .execute(&Request::new("GET", ""))
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_str(), "root");
    }

    #[test]
    fn panic_message_downcasts() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&owned), "owned");
        assert_eq!(panic_message(&borrowed), "borrowed");
        assert_eq!(panic_message(&other), "unknown panic");
    }
}
