// mock_http_server: Mock of the upstream HTTP API (token, login, backlog).
//
// The login response points the client at a streaming endpoint supplied by
// the test (usually a `MockStreamServer`) and at this server as API host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cw_protocol::{LoginResponse, TokenResponse};
use tokio::net::TcpListener;

pub const TEST_TOKEN: &str = "1752956700.e40fd00eac68b2e0b0979ba8bae1469f";
pub const TEST_SESSION: &str = "2.73dcfacebec8df39d9affb7d4a58e556";
pub const TEST_UID: i64 = 305_680;

/// How the login endpoint answers.
#[derive(Debug, Clone)]
pub enum LoginMode {
    /// Succeed when email/password match.
    Accept { email: String, password: String },
    /// Reply 200 with `success=false` and this message.
    Refuse(String),
    /// Reply with this HTTP status and a plain-text body.
    Status(u16),
}

/// Canned backlog response.
#[derive(Debug, Clone)]
pub struct Backlog {
    pub status: u16,
    pub body: Vec<u8>,
    /// Adds `Content-Encoding: gzip`; the body must already be compressed.
    pub gzip: bool,
}

impl Backlog {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            gzip: false,
        }
    }
}

/// One recorded login request.
#[derive(Debug, Clone, Default)]
pub struct LoginRecord {
    pub form: HashMap<String, String>,
    pub formtoken_header: Option<String>,
}

struct HttpState {
    stream_host: String,
    stream_path: String,
    api_host: Mutex<String>,
    login_mode: Mutex<LoginMode>,
    token_status: Mutex<u16>,
    token_refused: AtomicBool,
    backlog: Mutex<Option<Backlog>>,
    token_requests: AtomicUsize,
    logins: Mutex<Vec<LoginRecord>>,
    backlog_cookies: Mutex<Vec<Option<String>>>,
}

/// Mock upstream HTTP API bound to a random local port.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<HttpState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    /// Start the server. Successful logins advertise
    /// `websocket_host = stream_host` and `websocket_path = stream_path`.
    pub async fn start(
        stream_host: impl Into<String>,
        stream_path: impl Into<String>,
        mode: LoginMode,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(HttpState {
            stream_host: stream_host.into(),
            stream_path: stream_path.into(),
            api_host: Mutex::new(format!("http://{addr}")),
            login_mode: Mutex::new(mode),
            token_status: Mutex::new(200),
            token_refused: AtomicBool::new(false),
            backlog: Mutex::new(None),
            token_requests: AtomicUsize::new(0),
            logins: Mutex::new(Vec::new()),
            backlog_cookies: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/chat/auth-formtoken", post(formtoken))
            .route("/chat/login", post(login))
            .route("/chat/backlog", get(backlog))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("{}/chat/auth-formtoken", self.base_url())
    }

    pub fn login_url(&self) -> String {
        format!("{}/chat/login", self.base_url())
    }

    pub fn set_login_mode(&self, mode: LoginMode) {
        *self.state.login_mode.lock().unwrap() = mode;
    }

    /// Make the token endpoint answer with this status.
    pub fn set_token_status(&self, status: u16) {
        *self.state.token_status.lock().unwrap() = status;
    }

    /// Make the token endpoint answer 200 with `{"success":false}`.
    pub fn set_token_refused(&self, refused: bool) {
        self.state.token_refused.store(refused, Ordering::SeqCst);
    }

    /// Override the `api_host` advertised by login.
    pub fn set_api_host(&self, api_host: impl Into<String>) {
        *self.state.api_host.lock().unwrap() = api_host.into();
    }

    pub fn set_backlog(&self, backlog: Backlog) {
        *self.state.backlog.lock().unwrap() = Some(backlog);
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> Vec<LoginRecord> {
        self.state.logins.lock().unwrap().clone()
    }

    /// Cookie header of every backlog request, in arrival order.
    pub fn backlog_cookies(&self) -> Vec<Option<String>> {
        self.state.backlog_cookies.lock().unwrap().clone()
    }
}

async fn formtoken(State(state): State<Arc<HttpState>>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    let status = *state.token_status.lock().unwrap();
    if status != 200 {
        return (status_code(status), "token unavailable").into_response();
    }
    if state.token_refused.load(Ordering::SeqCst) {
        return axum::Json(serde_json::json!({ "success": false })).into_response();
    }
    axum::Json(TokenResponse {
        success: true,
        token: TEST_TOKEN.to_owned(),
    })
    .into_response()
}

async fn login(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let formtoken_header = headers
        .get("x-auth-formtoken")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.logins.lock().unwrap().push(LoginRecord {
        form: form.clone(),
        formtoken_header: formtoken_header.clone(),
    });

    let mode = state.login_mode.lock().unwrap().clone();
    match mode {
        LoginMode::Status(code) => (status_code(code), "login unavailable").into_response(),
        LoginMode::Refuse(message) => axum::Json(LoginResponse {
            success: false,
            message: Some(message),
            ..LoginResponse::default()
        })
        .into_response(),
        LoginMode::Accept { email, password } => {
            let token_ok = form.get("token").map(String::as_str) == Some(TEST_TOKEN)
                && formtoken_header.as_deref() == Some(TEST_TOKEN);
            let creds_ok = form.get("email") == Some(&email) && form.get("password") == Some(&password);
            if !(token_ok && creds_ok) {
                return axum::Json(LoginResponse {
                    success: false,
                    message: Some("Invalid credentials".to_owned()),
                    ..LoginResponse::default()
                })
                .into_response();
            }
            axum::Json(LoginResponse {
                success: true,
                session: TEST_SESSION.to_owned(),
                uid: TEST_UID,
                api_host: state.api_host.lock().unwrap().clone(),
                websocket_host: state.stream_host.clone(),
                websocket_path: state.stream_path.clone(),
                url: Some(String::new()),
                message: None,
            })
            .into_response()
        }
    }
}

async fn backlog(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.backlog_cookies.lock().unwrap().push(cookie);

    let Some(canned) = state.backlog.lock().unwrap().clone() else {
        return (StatusCode::NOT_FOUND, "no backlog").into_response();
    };
    let mut response = (status_code(canned.status), canned.body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    if canned.gzip {
        response.headers_mut().insert(
            header::CONTENT_ENCODING,
            header::HeaderValue::from_static("gzip"),
        );
    }
    response
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
