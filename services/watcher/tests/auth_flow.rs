use cw_test_utils::mock_http_server::{TEST_SESSION, TEST_TOKEN, TEST_UID};
use cw_test_utils::{LoginMode, MockUpstream, STREAM_PATH, TEST_EMAIL, TEST_PASSWORD};
use watcher::auth::{AuthError, Authenticator, Credentials, Endpoints, stream_url};

fn creds(password: &str) -> Credentials {
    Credentials {
        email: TEST_EMAIL.to_owned(),
        password: password.to_owned(),
    }
}

#[tokio::test]
async fn login_returns_session_and_stream_location() {
    let upstream = MockUpstream::start().await.unwrap();
    let endpoints = Endpoints::for_base(&upstream.http.base_url());
    let auth = Authenticator::new(endpoints.clone(), true)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap();

    assert_eq!(auth.session, TEST_SESSION);
    assert_eq!(auth.uid, TEST_UID);
    assert_eq!(auth.api_host, upstream.http.base_url());
    assert_eq!(auth.stream_host, upstream.stream.local_addr().to_string());
    assert_eq!(auth.stream_path, STREAM_PATH);
    assert_eq!(
        stream_url(&auth, &endpoints),
        format!(
            "ws://{}{}?since_id=0&stream_id=0",
            upstream.stream.local_addr(),
            STREAM_PATH
        )
    );

    assert_eq!(upstream.http.token_requests(), 1);
    let logins = upstream.http.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].form["email"], TEST_EMAIL);
    assert_eq!(logins[0].form["password"], TEST_PASSWORD);
    assert_eq!(logins[0].form["token"], TEST_TOKEN);
    assert_eq!(logins[0].formtoken_header.as_deref(), Some(TEST_TOKEN));
}

#[tokio::test]
async fn wrong_password_is_an_api_error_with_message() {
    let upstream = MockUpstream::start().await.unwrap();
    let err = Authenticator::new(Endpoints::for_base(&upstream.http.base_url()), false)
        .authenticate(&creds("wrong"))
        .await
        .unwrap_err();
    match err {
        AuthError::Api { message, status } => {
            assert_eq!(message, "Invalid credentials");
            assert_eq!(status, 200);
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn refusal_without_message_uses_generic_text() {
    let upstream = MockUpstream::start().await.unwrap();
    upstream.http.set_login_mode(LoginMode::Refuse(String::new()));
    let err = Authenticator::new(Endpoints::for_base(&upstream.http.base_url()), false)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Api { ref message, .. } if message == "Authentication failed"));
}

#[tokio::test]
async fn login_http_failure_carries_status() {
    let upstream = MockUpstream::start().await.unwrap();
    upstream.http.set_login_mode(LoginMode::Status(503));
    let err = Authenticator::new(Endpoints::for_base(&upstream.http.base_url()), false)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Api { status: 503, .. }), "got {err:?}");
}

#[tokio::test]
async fn token_endpoint_failure_stops_before_login() {
    let upstream = MockUpstream::start().await.unwrap();
    upstream.http.set_token_status(500);
    let err = Authenticator::new(Endpoints::for_base(&upstream.http.base_url()), false)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenRequest(_)), "got {err:?}");
    assert!(upstream.http.logins().is_empty());
}

#[tokio::test]
async fn unsuccessful_token_reply_stops_before_login() {
    let upstream = MockUpstream::start().await.unwrap();
    upstream.http.set_token_refused(true);
    let err = Authenticator::new(Endpoints::for_base(&upstream.http.base_url()), false)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenRequest(_)), "got {err:?}");
    assert_eq!(upstream.http.token_requests(), 1);
    assert!(upstream.http.logins().is_empty());
}

#[tokio::test]
async fn unreachable_token_endpoint_is_a_token_error() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let err = Authenticator::new(Endpoints::for_base(&format!("http://{addr}")), false)
        .authenticate(&creds(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenRequest(_)), "got {err:?}");
}
