use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use digest_auth::{AuthContext, HttpMethod};
use reqwest::Url;
use serde_json::json;
use thiserror::Error;
use crate::config::{DigestCredentials, ProxyConfig};

/// Headers that only describe one connection hop, plus the framing headers
/// the gateway's own HTTP layer recomputes.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

/// Dropped from requests only. The client negotiates its own compression
/// and always returns a decoded body.
const REQUEST_ONLY: &[&str] = &["host", "accept-encoding"];

/// One inbound request, already split from the mount prefix.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path remainder after the mount prefix, starting with '/'
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0} header is required")]
    MissingTarget(String),

    #[error("invalid target host {0:?}")]
    InvalidTarget(String),

    #[error("method {0} is not forwarded")]
    MethodNotAllowed(Method),

    /// Refused, timed out or broken mid-response; callers cannot tell which.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingTarget(_) | ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Transport detail stays in the log
            ProxyError::UpstreamUnavailable(_) => "upstream unavailable".to_string(),
            other => other.to_string(),
        };
        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}

/// Forwards requests to the upstream named in each request's target header.
pub struct Gateway {
    client: reqwest::Client,
    config: ProxyConfig,
}

impl Gateway {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build proxy HTTP client")?;

        Ok(Self { client, config })
    }

    pub fn mount(&self) -> &str {
        &self.config.mount
    }

    pub async fn forward(&self, req: ProxyRequest) -> Result<Response, ProxyError> {
        if !self.config.allows_method(req.method.as_str()) {
            return Err(ProxyError::MethodNotAllowed(req.method));
        }

        let target = req
            .headers
            .get(self.config.target_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .ok_or_else(|| ProxyError::MissingTarget(self.config.target_header.clone()))?;

        let url = upstream_url(target, &req.path, req.query.as_deref())?;
        let headers = filter_headers(&req.headers, REQUEST_ONLY);

        tracing::debug!("Forwarding {} {}", req.method, url);
        let mut upstream = self.send(&req.method, &url, headers.clone(), &req.body).await?;

        if upstream.status() == StatusCode::UNAUTHORIZED {
            if let Some(credentials) = &self.config.auth {
                if let Some(authorization) =
                    digest_authorization(credentials, upstream.headers(), &req.method, &url, &req.body)
                {
                    let mut headers = headers;
                    headers.insert(AUTHORIZATION, authorization);
                    upstream = self.send(&req.method, &url, headers, &req.body).await?;
                }
            }
        }

        let status = upstream.status();
        let headers = filter_headers(upstream.headers(), &[]);
        let body = upstream.bytes().await.map_err(|e| {
            tracing::warn!("Upstream {} broke off its response: {}", url, e);
            ProxyError::UpstreamUnavailable(e)
        })?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: HeaderMap,
        body: &Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body.clone());
        }

        request.send().await.map_err(|e| {
            tracing::warn!("Upstream {} unavailable: {}", url, e);
            ProxyError::UpstreamUnavailable(e)
        })
    }
}

/// Swap the gateway's host and mount prefix for the target.
/// A bare `host[:port]` target is reached over plain HTTP.
fn upstream_url(target: &str, path: &str, query: Option<&str>) -> Result<Url, ProxyError> {
    let base = target.trim_end_matches('/');
    let mut url = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    url.push_str(path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    match Url::parse(&url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(url),
        _ => Err(ProxyError::InvalidTarget(target.to_string())),
    }
}

/// Copy `headers` minus hop-by-hop headers, anything the `Connection` header
/// lists, and `extra`.
fn filter_headers(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str)
            || extra.contains(&name_str)
            || listed.iter().any(|token| token == name_str)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Answer a Digest challenge with the configured credentials.
fn digest_authorization(
    credentials: &DigestCredentials,
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
    body: &[u8],
) -> Option<HeaderValue> {
    let challenge = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.trim_start().to_ascii_lowercase().starts_with("digest"))?;

    let mut prompt = match digest_auth::parse(challenge) {
        Ok(prompt) => prompt,
        Err(e) => {
            tracing::warn!("Unusable digest challenge from {}: {}", url, e);
            return None;
        }
    };

    let uri = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let context = AuthContext::new_with_method(
        credentials.username.as_str(),
        credentials.password.as_str(),
        uri.as_str(),
        Some(body),
        HttpMethod::from(method.as_str()),
    );

    match prompt.respond(&context) {
        Ok(answer) => HeaderValue::from_str(&answer.to_header_string()).ok(),
        Err(e) => {
            tracing::warn!("Failed to answer digest challenge from {}: {}", url, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{body_string, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(config: ProxyConfig) -> Gateway {
        Gateway::new(config).unwrap()
    }

    fn request(method: Method, path: &str, target: Option<&str>) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gateway.local:8000"));
        if let Some(target) = target {
            headers.insert("x-target-host", HeaderValue::from_str(target).unwrap());
        }
        ProxyRequest {
            method,
            path: path.to_string(),
            query: None,
            headers,
            body: Bytes::new(),
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_target_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = gateway(ProxyConfig::default())
            .forward(request(Method::GET, "/status", None))
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewrites_url_and_host() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/devices/reader/settings"))
            .and(query_param("apply", "1"))
            .and(body_string("power=30"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(Method::PUT, "/devices/reader/settings", Some(&server.uri()));
        req.query = Some("apply=1".to_string());
        req.body = Bytes::from_static(b"power=30");

        let response = gateway(ProxyConfig::default()).forward(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let received = server.received_requests().await.unwrap();
        let host = received[0].headers.get("host").unwrap().to_str().unwrap();
        assert_ne!(host, "gateway.local:8000");
        assert!(server.uri().ends_with(host));
    }

    #[tokio::test]
    async fn test_bare_host_target() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let bare = server.address().to_string();
        let response = gateway(ProxyConfig::default())
            .forward(request(Method::GET, "/status", Some(&bare)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_filters_framing_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-custom", "foo")
                    .set_body_string("x".repeat(42)),
            )
            .mount(&server)
            .await;

        let response = gateway(ProxyConfig::default())
            .forward(request(Method::GET, "/status", Some(&server.uri())))
            .await
            .unwrap();

        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get("x-custom").unwrap(), "foo");
        assert_eq!(body_text(response).await.len(), 42);
    }

    #[tokio::test]
    async fn test_passes_redirects_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;

        let response = gateway(ProxyConfig::default())
            .forward(request(Method::GET, "/old", Some(&server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/new");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_listening_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ProxyConfig {
            timeout_ms: 500,
            ..ProxyConfig::default()
        };
        let started = Instant::now();
        let err = gateway(config)
            .forward(request(Method::GET, "/status", Some(&format!("http://{addr}"))))
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_hung_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let config = ProxyConfig {
            timeout_ms: 200,
            ..ProxyConfig::default()
        };
        let started = Instant::now();
        let err = gateway(config)
            .forward(request(Method::GET, "/status", Some(&server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_method_policy() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = gateway(ProxyConfig::default())
            .forward(request(Method::DELETE, "/tags", Some(&server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(server.received_requests().await.unwrap().is_empty());

        let open = ProxyConfig {
            methods: vec!["*".to_string()],
            ..ProxyConfig::default()
        };
        let response = gateway(open)
            .forward(request(Method::DELETE, "/tags", Some(&server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_answers_digest_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                r#"Digest realm="reader", qop="auth", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
            ))
            .mount(&server)
            .await;

        let config = ProxyConfig {
            auth: Some(DigestCredentials {
                username: "admin".to_string(),
                password: "admin".to_string(),
            }),
            ..ProxyConfig::default()
        };
        let response = gateway(config)
            .forward(request(Method::GET, "/status", Some(&server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "secret");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 2);
        let authorization = received[1].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with("Digest "));
        assert!(authorization.contains(r#"username="admin""#));
    }

    #[tokio::test]
    async fn test_challenge_passed_through_without_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("www-authenticate", r#"Digest realm="reader", nonce="abc""#),
            )
            .mount(&server)
            .await;

        let response = gateway(ProxyConfig::default())
            .forward(request(Method::GET, "/status", Some(&server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("www-authenticate").is_some());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn test_filter_drops_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("host", HeaderValue::from_static("gateway.local"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = filter_headers(&headers, REQUEST_ONLY);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("x-trace").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("host").is_none());
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_upstream_url() {
        let url = upstream_url("http://10.0.0.7:8080/", "/api/status", Some("a=1&b=%20")).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.7:8080/api/status?a=1&b=%20");

        let url = upstream_url("10.0.0.7", "/api", None).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.7/api");

        assert!(upstream_url("ftp://10.0.0.7", "/api", None).is_err());
        assert!(upstream_url("http://[::1", "/api", None).is_err());
    }
}
