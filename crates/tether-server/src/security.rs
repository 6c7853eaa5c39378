//! Loopback security layer.
//!
//! The loopback listener is reachable by every local process, so each
//! transport instance generates a fresh secret and requires it on every
//! protected request. Layers, outermost first:
//!
//! 1. CORS allow-list ([`cors_layer`])
//! 2. Strict origin check ([`strict_origin`]): 403
//! 3. Secret header check ([`require_secret_header`]): 403, exempt prefixes skip it
//! 4. Upgrade secret check ([`require_upgrade_secret`]): 401, before the upgrade

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use metrics::counter;
use tether_core::telemetry::SECURITY_REJECTIONS_TOTAL;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::TransportConfig;

/// Header carrying the per-launch secret on HTTP requests.
pub const SECRET_HEADER: &str = "X-Tether-Secret";

/// Query parameter carrying the secret on channel upgrades.
pub const SECRET_QUERY_PARAM: &str = "secret";

/// Response header on a successful upgrade naming the new session.
pub const SESSION_HEADER: &str = "X-Tether-Session";

/// 32 random bytes, base64url-encoded.
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE.encode(bytes)
}

/// Compare two secrets without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

fn header_secret_matches(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(SECRET_HEADER)
        .is_some_and(|v| constant_time_eq(v.as_bytes(), secret.as_bytes()))
}

fn query_secret_matches(query: Option<&str>, secret: &str) -> bool {
    query.is_some_and(|q| {
        url::form_urlencoded::parse(q.as_bytes()).any(|(key, value)| {
            key == SECRET_QUERY_PARAM && constant_time_eq(value.as_bytes(), secret.as_bytes())
        })
    })
}

fn reject(status: StatusCode, reason: &'static str, path: &str) -> Response {
    warn!(reason, path, status = status.as_u16(), "request rejected");
    counter!(SECURITY_REJECTIONS_TOTAL, "reason" => reason).increment(1);
    let body = if status == StatusCode::UNAUTHORIZED {
        "Unauthorized"
    } else {
        "Forbidden"
    };
    (status, body).into_response()
}

/// Reject requests whose `Origin` is present and not allow-listed.
///
/// Requests without an `Origin` pass: native bridge calls never send one.
pub async fn strict_origin(
    State(config): State<Arc<TransportConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| config.is_origin_allowed(origin));
        if !allowed {
            return reject(StatusCode::FORBIDDEN, "origin", request.uri().path());
        }
    }
    next.run(request).await
}

/// Require [`SECRET_HEADER`] on every non-exempt, non-upgrade request.
pub async fn require_secret_header(
    State(config): State<Arc<TransportConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = config.secret.as_deref() else {
        return next.run(request).await;
    };
    let path = request.uri().path();
    if config.is_exempt(path) || is_upgrade_request(request.headers()) {
        return next.run(request).await;
    }
    if !header_secret_matches(request.headers(), secret) {
        return reject(StatusCode::FORBIDDEN, "secret_header", path);
    }
    next.run(request).await
}

/// Require the secret on upgrade requests, as a query parameter or header.
///
/// Runs before the upgrade handler, so a bad secret refuses the upgrade
/// outright instead of closing an established socket.
pub async fn require_upgrade_secret(
    State(config): State<Arc<TransportConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = config.secret.as_deref() else {
        return next.run(request).await;
    };
    if !is_upgrade_request(request.headers()) {
        return next.run(request).await;
    }
    let authorized = query_secret_matches(request.uri().query(), secret)
        || header_secret_matches(request.headers(), secret);
    if !authorized {
        return reject(StatusCode::UNAUTHORIZED, "upgrade_secret", request.uri().path());
    }
    next.run(request).await
}

/// CORS layer restricted to the allow-listed origins.
pub fn cors_layer(config: &TransportConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "skipping unparseable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::default().resolved("127.0.0.1", 8080, SECRET.into()))
    }

    fn guarded() -> Router {
        let cfg = config();
        Router::new()
            .route("/api/tasks", get(|| async { "tasks" }))
            .route("/static/app.css", get(|| async { "css" }))
            .route("/ws", get(|| async { "upgraded" }))
            .layer(from_fn_with_state(cfg.clone(), require_upgrade_secret))
            .layer(from_fn_with_state(cfg.clone(), require_secret_header))
            .layer(from_fn_with_state(cfg.clone(), strict_origin))
            .layer(cors_layer(&cfg))
    }

    async fn status(request: axum::http::Request<Body>) -> StatusCode {
        guarded().oneshot(request).await.unwrap().status()
    }

    fn get_req(uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder().method("GET").uri(uri)
    }

    fn upgrade_req(uri: &str) -> axum::http::request::Builder {
        get_req(uri)
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
    }

    #[test]
    fn secret_is_url_safe_base64_of_32_bytes() {
        let secret = generate_secret();
        let decoded = URL_SAFE.decode(&secret).unwrap();
        assert_eq!(decoded.len(), 32);
        assert!(!secret.contains('+') && !secret.contains('/'));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(!is_upgrade_request(&headers));
        let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, upgrade"));
        assert!(is_upgrade_request(&headers));
    }

    #[tokio::test]
    async fn protected_path_needs_secret_header() {
        let missing = get_req("/api/tasks").body(Body::empty()).unwrap();
        assert_eq!(status(missing).await, StatusCode::FORBIDDEN);

        let wrong = get_req("/api/tasks")
            .header(SECRET_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(wrong).await, StatusCode::FORBIDDEN);

        let ok = get_req("/api/tasks")
            .header(SECRET_HEADER, SECRET)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(ok).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn exempt_prefix_skips_secret() {
        let req = get_req("/static/app.css").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn lookalike_of_exempt_path_needs_secret() {
        let req = get_req("/healthcare/records").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::FORBIDDEN);
        let req = get_req("/health-admin").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn foreign_origin_is_forbidden_even_with_secret() {
        let req = get_req("/api/tasks")
            .header(SECRET_HEADER, SECRET)
            .header(header::ORIGIN, "http://evil.example")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(req).await, StatusCode::FORBIDDEN);

        let own = get_req("/api/tasks")
            .header(SECRET_HEADER, SECRET)
            .header(header::ORIGIN, "http://127.0.0.1:8080")
            .body(Body::empty())
            .unwrap();
        let resp = guarded().oneshot(own).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://127.0.0.1:8080"
        );
    }

    #[tokio::test]
    async fn upgrade_without_secret_is_unauthorized() {
        let req = upgrade_req("/ws").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::UNAUTHORIZED);

        let wrong = upgrade_req("/ws?secret=bad").body(Body::empty()).unwrap();
        assert_eq!(status(wrong).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upgrade_secret_via_query_or_header() {
        let query = upgrade_req(&format!("/ws?secret={SECRET}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(query).await, StatusCode::OK);

        let header_only = upgrade_req("/ws")
            .header(SECRET_HEADER, SECRET)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(header_only).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn no_secret_configured_passes_everything() {
        let cfg = Arc::new(TransportConfig::default());
        let app = Router::new()
            .route("/api", get(|| async { "ok" }))
            .layer(from_fn_with_state(cfg.clone(), require_upgrade_secret))
            .layer(from_fn_with_state(cfg, require_secret_header));
        let resp = app
            .oneshot(get_req("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
