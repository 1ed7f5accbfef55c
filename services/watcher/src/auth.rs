//! Two-step login against the upstream HTTP API.
//!
//! # Flow
//! 1. `POST /chat/auth-formtoken` with an empty body; yields an anti-forgery token.
//! 2. `POST /chat/login` with form fields `email`, `password`, `token` and the
//!    token repeated in the `X-Auth-Formtoken` header; yields the session
//!    cookie value and the account's API and streaming hosts.
//!
//! Both requests share one cookie-bearing client. Nothing is cached here;
//! the connection manager owns the result.

use std::fmt;
use std::time::Duration;

use cw_protocol::{ErrorResponse, LoginResponse, TokenResponse};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, HeaderMap};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://www.irccloud.com";
pub const DEFAULT_STREAM_URL: &str = "wss://www.irccloud.com/?since_id=0&stream_id=0";
pub const USER_AGENT: &str = concat!("watcher/", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_BODY_LIMIT: usize = 200;
const SENSITIVE_HEADERS: [&str; 4] = ["cookie", "set-cookie", "x-auth-formtoken", "authorization"];

/// Account credentials. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Where to authenticate and where to fall back when login omits a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token_url: String,
    pub login_url: String,
    /// Base for relative backlog URLs when login returned no `api_host`.
    pub fallback_api_host: String,
    /// Used when login returned no streaming host or path.
    pub fallback_stream_url: String,
    /// `wss` in production; `ws` against a local test server.
    pub stream_scheme: String,
    pub origin: String,
    pub user_agent: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::for_base(DEFAULT_BASE_URL)
    }
}

impl Endpoints {
    /// Endpoints rooted at `base` (e.g. `https://www.irccloud.com`).
    ///
    /// A plain `http://` base selects `ws` for the stream as well.
    pub fn for_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        let stream_scheme = if base.starts_with("http://") { "ws" } else { "wss" };
        Self {
            token_url: format!("{base}/chat/auth-formtoken"),
            login_url: format!("{base}/chat/login"),
            fallback_api_host: base.to_owned(),
            fallback_stream_url: DEFAULT_STREAM_URL.to_owned(),
            stream_scheme: stream_scheme.to_owned(),
            origin: DEFAULT_BASE_URL.to_owned(),
            user_agent: USER_AGENT.to_owned(),
        }
    }
}

/// A successful login. `Debug` redacts the session.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub session: String,
    pub uid: i64,
    /// Base URL with scheme, e.g. `https://api-2.irccloud.com`. May be empty.
    pub api_host: String,
    pub stream_host: String,
    pub stream_path: String,
}

impl fmt::Debug for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResult")
            .field("session", &"[redacted]")
            .field("uid", &self.uid)
            .field("api_host", &self.api_host)
            .field("stream_host", &self.stream_host)
            .field("stream_path", &self.stream_path)
            .finish()
    }
}

impl From<LoginResponse> for AuthResult {
    fn from(r: LoginResponse) -> Self {
        Self {
            session: r.session,
            uid: r.uid,
            api_host: r.api_host,
            stream_host: r.websocket_host,
            stream_path: r.websocket_path,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    TokenRequest(String),
    #[error("login rejected (HTTP {status}): {message}")]
    Api { message: String, status: u16 },
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
}

/// Streaming URL for an account, or the fallback when host or path is empty.
pub fn stream_url(auth: &AuthResult, endpoints: &Endpoints) -> String {
    if auth.stream_host.is_empty() || auth.stream_path.is_empty() {
        return endpoints.fallback_stream_url.clone();
    }
    format!(
        "{}://{}{}?since_id=0&stream_id=0",
        endpoints.stream_scheme, auth.stream_host, auth.stream_path
    )
}

pub struct Authenticator {
    endpoints: Endpoints,
    debug: bool,
}

impl Authenticator {
    /// With `debug`, every request and response is logged at info level,
    /// secrets redacted.
    pub fn new(endpoints: Endpoints, debug: bool) -> Self {
        Self { endpoints, debug }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub async fn authenticate(&self, creds: &Credentials) -> Result<AuthResult, AuthError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(self.endpoints.user_agent.as_str())
            .build()?;

        let token = self.fetch_token(&client).await?;
        let auth = self.login(&client, creds, &token).await?;
        info!(uid = auth.uid, api_host = %auth.api_host, stream_host = %auth.stream_host, "authenticated");
        Ok(auth)
    }

    async fn fetch_token(&self, client: &reqwest::Client) -> Result<String, AuthError> {
        self.log_request("POST", &self.endpoints.token_url);
        let resp = client
            .post(&self.endpoints.token_url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_LENGTH, "0")
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .text()
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;
        self.log_response(status, &headers, &body);

        if status != StatusCode::OK {
            return Err(AuthError::TokenRequest(format!("HTTP {}", status.as_u16())));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::TokenRequest(format!("invalid response: {e}")))?;
        if !parsed.success || parsed.token.is_empty() {
            return Err(AuthError::TokenRequest("token request unsuccessful".to_owned()));
        }
        Ok(parsed.token)
    }

    async fn login(
        &self,
        client: &reqwest::Client,
        creds: &Credentials,
        token: &str,
    ) -> Result<AuthResult, AuthError> {
        self.log_request("POST", &self.endpoints.login_url);
        let resp = client
            .post(&self.endpoints.login_url)
            .header(ACCEPT, "application/json")
            .header("X-Auth-Formtoken", token)
            .form(&[
                ("email", creds.email.as_str()),
                ("password", creds.password.as_str()),
                ("token", token),
            ])
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        self.log_response(status, &headers, &body);

        if status != StatusCode::OK {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "unexpected status".to_owned());
            return Err(AuthError::Api {
                message,
                status: status.as_u16(),
            });
        }

        let parsed: LoginResponse = serde_json::from_str(&body).map_err(|e| AuthError::Api {
            message: format!("invalid login response: {e}"),
            status: status.as_u16(),
        })?;
        if !parsed.success {
            return Err(AuthError::Api {
                message: parsed
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Authentication failed".to_owned()),
                status: status.as_u16(),
            });
        }
        Ok(parsed.into())
    }

    fn log_request(&self, method: &str, url: &str) {
        if self.debug {
            info!(method, url, "auth request");
        }
    }

    fn log_response(&self, status: StatusCode, headers: &HeaderMap, body: &str) {
        if self.debug {
            info!(
                status = status.as_u16(),
                headers = %loggable_headers(headers),
                body = truncate_for_log(body, LOG_BODY_LIMIT),
                "auth response"
            );
        }
    }
}

/// `name: value` pairs with credential-bearing values replaced.
pub(crate) fn loggable_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                "[redacted]"
            } else {
                value.to_str().unwrap_or("[binary]")
            };
            format!("{name}: {value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// At most `limit` bytes of `s`, cut on a char boundary.
pub(crate) fn truncate_for_log(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn auth(host: &str, path: &str) -> AuthResult {
        AuthResult {
            session: "secret".to_owned(),
            uid: 1,
            api_host: String::new(),
            stream_host: host.to_owned(),
            stream_path: path.to_owned(),
        }
    }

    #[test]
    fn stream_url_uses_assigned_host_and_path() {
        assert_eq!(
            stream_url(&auth("api-2.example.com", "/websocket/2"), &Endpoints::default()),
            "wss://api-2.example.com/websocket/2?since_id=0&stream_id=0"
        );
    }

    #[test]
    fn stream_url_falls_back_when_incomplete() {
        let e = Endpoints::default();
        assert_eq!(stream_url(&auth("", "/websocket/2"), &e), DEFAULT_STREAM_URL);
        assert_eq!(stream_url(&auth("api-2.example.com", ""), &e), DEFAULT_STREAM_URL);
    }

    #[test]
    fn local_base_selects_plain_ws() {
        let e = Endpoints::for_base("http://127.0.0.1:9000/");
        assert_eq!(e.token_url, "http://127.0.0.1:9000/chat/auth-formtoken");
        assert_eq!(e.login_url, "http://127.0.0.1:9000/chat/login");
        assert_eq!(
            stream_url(&auth("127.0.0.1:9001", "/ws"), &e),
            "ws://127.0.0.1:9001/ws?since_id=0&stream_id=0"
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials {
            email: "a@b.c".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
        assert!(!format!("{:?}", auth("h", "/p")).contains("secret"));
    }

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut h = HeaderMap::new();
        h.insert("set-cookie", HeaderValue::from_static("session=abc"));
        h.insert("x-auth-formtoken", HeaderValue::from_static("tok"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        let out = loggable_headers(&h);
        assert!(!out.contains("abc"));
        assert!(!out.contains("tok"));
        assert!(out.contains("content-type: application/json"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 200), "short");
        let long = "é".repeat(150);
        let cut = truncate_for_log(&long, 200);
        assert!(cut.len() <= 200);
        assert_eq!(cut.chars().count(), 100);
    }
}
