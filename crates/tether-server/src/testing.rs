//! Test client for applications served through the [`VirtualHttpAdapter`].
//!
//! Requests run in memory against the router, so route tests need no
//! listener and see exactly what the in-process transport would return.
//!
//! ```ignore
//! let client = TestClient::new(app()).htmx();
//! client.get("/tasks").await.assert_ok().assert_html().assert_contains("<li>");
//! ```

use std::ops::Deref;

use axum::Router;
use serde::de::DeserializeOwned;
use tether_core::{Request, Response};

use crate::adapter::VirtualHttpAdapter;

const FORM: &str = "application/x-www-form-urlencoded";
const JSON: &str = "application/json";

/// Issues requests through a [`VirtualHttpAdapter`] with a fixed header set.
///
/// Header builders return a new client, so a base client can be shared and
/// specialised per test.
#[derive(Clone, Debug)]
pub struct TestClient {
    adapter: VirtualHttpAdapter,
    headers: Vec<(String, String)>,
}

impl TestClient {
    /// Client for `router`.
    pub fn new(router: Router) -> Self {
        Self::from_adapter(VirtualHttpAdapter::new(router))
    }

    /// Client over an existing adapter.
    pub fn from_adapter(adapter: VirtualHttpAdapter) -> Self {
        Self {
            adapter,
            headers: Vec::new(),
        }
    }

    /// A client that also sends `key: value`. A header of the same name is
    /// replaced.
    #[must_use]
    pub fn with_header(&self, key: &str, value: &str) -> Self {
        let mut client = self.clone();
        client.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        client.headers.push((key.to_owned(), value.to_owned()));
        client
    }

    /// A client whose requests look like htmx requests.
    #[must_use]
    pub fn htmx(&self) -> Self {
        self.with_header("HX-Request", "true")
    }

    /// [`htmx`](Self::htmx) aimed at the element `target`.
    #[must_use]
    pub fn htmx_target(&self, target: &str) -> Self {
        self.htmx().with_header("HX-Target", target)
    }

    /// `GET path`.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.send("GET", path, Vec::new()).await
    }

    /// `DELETE path`.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.send("DELETE", path, Vec::new()).await
    }

    /// `POST path` with a raw body.
    pub async fn post(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send("POST", path, body.into()).await
    }

    /// `POST path` with `pairs` form-encoded.
    pub async fn post_form(&self, path: &str, pairs: &[(&str, &str)]) -> TestResponse {
        self.with_header("Content-Type", FORM)
            .send("POST", path, encode_form(pairs))
            .await
    }

    /// `POST path` with a JSON body.
    pub async fn post_json(&self, path: &str, json: &str) -> TestResponse {
        self.with_header("Content-Type", JSON)
            .send("POST", path, json.into())
            .await
    }

    /// `PUT path` with a raw body.
    pub async fn put(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send("PUT", path, body.into()).await
    }

    /// `PUT path` with `pairs` form-encoded.
    pub async fn put_form(&self, path: &str, pairs: &[(&str, &str)]) -> TestResponse {
        self.with_header("Content-Type", FORM)
            .send("PUT", path, encode_form(pairs))
            .await
    }

    /// `PUT path` with a JSON body.
    pub async fn put_json(&self, path: &str, json: &str) -> TestResponse {
        self.with_header("Content-Type", JSON)
            .send("PUT", path, json.into())
            .await
    }

    /// `PATCH path` with a raw body.
    pub async fn patch(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send("PATCH", path, body.into()).await
    }

    /// `PATCH path` with a JSON body.
    pub async fn patch_json(&self, path: &str, json: &str) -> TestResponse {
        self.with_header("Content-Type", JSON)
            .send("PATCH", path, json.into())
            .await
    }

    /// Run a fully built request, adding this client's headers where the
    /// request does not set them.
    pub async fn execute(&self, mut request: Request) -> TestResponse {
        for (key, value) in &self.headers {
            if request.header(key).is_none() {
                let _ = request.headers.insert(key.clone(), value.clone());
            }
        }
        TestResponse(self.adapter.execute(&request).await)
    }

    async fn send(&self, method: &str, path: &str, body: Vec<u8>) -> TestResponse {
        self.execute(Request::new(method, path).with_body(body)).await
    }
}

fn encode_form(pairs: &[(&str, &str)]) -> Vec<u8> {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
        .into_bytes()
}

/// A captured [`Response`] with assertion helpers. Every assertion panics
/// with the response body in the message and returns `self` for chaining.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResponse(pub Response);

impl Deref for TestResponse {
    type Target = Response;

    fn deref(&self) -> &Response {
        &self.0
    }
}

impl TestResponse {
    /// The captured response.
    pub fn into_inner(self) -> Response {
        self.0
    }

    /// Body decoded as JSON.
    #[track_caller]
    pub fn json<T: DeserializeOwned>(&self) -> T {
        match serde_json::from_slice(&self.body) {
            Ok(value) => value,
            Err(e) => panic!("body is not the expected JSON ({e}): {}", self.body_str()),
        }
    }

    /// Status is `expected`.
    #[track_caller]
    pub fn assert_status(&self, expected: u16) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "unexpected status, body: {}",
            self.body_str()
        );
        self
    }

    /// 200.
    #[track_caller]
    pub fn assert_ok(&self) -> &Self {
        self.assert_status(200)
    }

    /// 201.
    #[track_caller]
    pub fn assert_created(&self) -> &Self {
        self.assert_status(201)
    }

    /// 204.
    #[track_caller]
    pub fn assert_no_content(&self) -> &Self {
        self.assert_status(204)
    }

    /// 400.
    #[track_caller]
    pub fn assert_bad_request(&self) -> &Self {
        self.assert_status(400)
    }

    /// 404.
    #[track_caller]
    pub fn assert_not_found(&self) -> &Self {
        self.assert_status(404)
    }

    /// Any 3xx.
    #[track_caller]
    pub fn assert_redirect(&self) -> &Self {
        assert!(
            (300..400).contains(&self.status),
            "expected a redirect, got {}",
            self.status
        );
        self
    }

    /// Body contains `needle`.
    #[track_caller]
    pub fn assert_contains(&self, needle: &str) -> &Self {
        let body = self.body_str();
        assert!(body.contains(needle), "{needle:?} not in body: {body}");
        self
    }

    /// Body contains every one of `needles`.
    #[track_caller]
    pub fn assert_contains_all(&self, needles: &[&str]) -> &Self {
        for needle in needles {
            let _ = self.assert_contains(needle);
        }
        self
    }

    /// Body does not contain `needle`.
    #[track_caller]
    pub fn assert_not_contains(&self, needle: &str) -> &Self {
        let body = self.body_str();
        assert!(!body.contains(needle), "{needle:?} unexpectedly in body: {body}");
        self
    }

    /// Body equals `expected` exactly.
    #[track_caller]
    pub fn assert_body(&self, expected: &str) -> &Self {
        assert_eq!(self.body_str(), expected);
        self
    }

    /// Header `key` is present with value `expected`.
    #[track_caller]
    pub fn assert_header(&self, key: &str, expected: &str) -> &Self {
        assert_eq!(self.header(key), Some(expected), "header {key}");
        self
    }

    /// Header `key` is present.
    #[track_caller]
    pub fn assert_header_exists(&self, key: &str) -> &Self {
        assert!(self.header(key).is_some(), "missing header {key}");
        self
    }

    /// `Content-Type` starts with `expected` (parameters are ignored).
    #[track_caller]
    pub fn assert_content_type(&self, expected: &str) -> &Self {
        let actual = self.header("Content-Type").unwrap_or_default();
        assert!(
            actual.starts_with(expected),
            "expected Content-Type {expected:?}, got {actual:?}"
        );
        self
    }

    /// `text/html`.
    #[track_caller]
    pub fn assert_html(&self) -> &Self {
        self.assert_content_type("text/html")
    }

    /// `application/json`.
    #[track_caller]
    pub fn assert_json(&self) -> &Self {
        self.assert_content_type("application/json")
    }

    /// `HX-Trigger` is `expected`.
    #[track_caller]
    pub fn assert_hx_trigger(&self, expected: &str) -> &Self {
        self.assert_header("HX-Trigger", expected)
    }

    /// `HX-Redirect` is `expected`.
    #[track_caller]
    pub fn assert_hx_redirect(&self, expected: &str) -> &Self {
        self.assert_header("HX-Redirect", expected)
    }

    /// `HX-Refresh: true`.
    #[track_caller]
    pub fn assert_hx_refresh(&self) -> &Self {
        self.assert_header("HX-Refresh", "true")
    }
}
