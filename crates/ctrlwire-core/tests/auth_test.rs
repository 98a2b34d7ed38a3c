// Integration tests for the credential lifecycle manager against a wiremock
// authorization server.
#![allow(clippy::unwrap_used)]

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ctrlwire_api::TransportConfig;
use ctrlwire_core::{AuthError, AuthOptions, CredentialManager, GrantType, PasswordCredentials, StorageMode};

use common::RecordingNavigator;

const REDIRECT: &str = "http://localhost:4200/oauth-resp.html";

fn authority_body() -> serde_json::Value {
    json!({
        "id": "auth-1",
        "name": "Test Platform",
        "domain": "bms.test",
        "version": "2.4.0",
        "session": false,
        "login_url": "/login?continue={{url}}",
        "logout_url": "/logout"
    })
}

async fn server_with_authority() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/authority"))
        .respond_with(ResponseTemplate::new(200).set_body_json(authority_body()))
        .mount(&server)
        .await;
    server
}

fn token_body(access: &str, expires_in: i64) -> serde_json::Value {
    json!({
        "access_token": access,
        "refresh_token": "refresh-1",
        "expires_in": expires_in,
        "token_type": "Bearer"
    })
}

fn manager() -> (CredentialManager, Arc<RecordingNavigator>) {
    let navigator = Arc::new(RecordingNavigator::default());
    let manager = CredentialManager::new(navigator.clone(), TransportConfig::default(), CancellationToken::new());
    (manager, navigator)
}

fn options(server: &MockServer) -> AuthOptions {
    let mut options = AuthOptions::new(Url::parse(&server.uri()).unwrap(), REDIRECT);
    options.authority_retry_base = Duration::from_millis(10);
    options.logout_delay = Duration::ZERO;
    options
}

fn password(server: &MockServer) -> AuthOptions {
    options(server).with_password(PasswordCredentials {
        username: "operator".into(),
        password: SecretString::from("hunter2".to_owned()),
        client_secret: None,
    })
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

/// The authorize URL embedded in the login page URL the navigator was sent to.
fn authorize_url(navigator: &RecordingNavigator) -> Url {
    let login = navigator.last_visit().unwrap();
    assert_eq!(login.path(), "/login");
    Url::parse(&query_map(&login)["continue"]).unwrap()
}

#[tokio::test]
async fn no_token_means_empty_string() {
    let server = server_with_authority().await;
    let (manager, _) = manager();
    manager.setup(options(&server)).await.unwrap();

    assert_eq!(manager.token(), "");
    assert!(!manager.has_token());
    assert_eq!(manager.authority().unwrap().version, "2.4.0");
}

#[tokio::test]
async fn token_before_setup_is_empty() {
    let (manager, _) = manager();
    assert_eq!(manager.token(), "");
    assert_eq!(manager.authorise(None).await.unwrap_err(), AuthError::NotConfigured);
}

#[tokio::test]
async fn password_grant_returns_and_stores_token() {
    let server = server_with_authority().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("username=operator"))
        .and(body_string_contains("password=hunter2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, _) = manager();
    manager.setup(password(&server)).await.unwrap();
    let online = manager.online();

    let (a, b) = tokio::join!(manager.authorise(None), manager.authorise(None));
    assert_eq!(a.unwrap(), "tok-1");
    assert_eq!(b.unwrap(), "tok-1");
    assert_eq!(manager.token(), "tok-1");
    assert!(manager.has_token());
    assert!(*online.borrow());
}

#[tokio::test]
async fn authority_load_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/authority"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/authority"))
        .respond_with(ResponseTemplate::new(200).set_body_json(authority_body()))
        .mount(&server)
        .await;

    let (manager, _) = manager();
    manager.setup(options(&server)).await.unwrap();

    assert_eq!(manager.authority().unwrap().id, "auth-1");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn expired_token_is_invalidated_then_refreshed() {
    let server = server_with_authority().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("short-lived", 0)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", 3600)))
        .mount(&server)
        .await;

    let mut opts = password(&server);
    opts.credentials = None;
    opts.grant = GrantType::AuthCode;
    let (manager, _) = manager();

    // Obtain a short-lived token through the password grant first.
    manager.setup(password(&server)).await.unwrap();
    assert_eq!(manager.authorise(None).await.unwrap(), "short-lived");
    assert_eq!(manager.token(), "");

    // Without password credentials the stored refresh token is used.
    manager.setup(opts).await.unwrap();
    assert_eq!(manager.authorise(None).await.unwrap(), "fresh");
    assert_eq!(manager.token(), "fresh");
}

#[tokio::test]
async fn failed_exchange_surfaces_status() {
    let server = server_with_authority().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let (manager, _) = manager();
    manager.setup(password(&server)).await.unwrap();
    let err = manager.authorise(None).await.unwrap_err();

    assert!(matches!(err, AuthError::TokenExchange { status: Some(401), .. }));
    assert!(!manager.has_token());
}

#[tokio::test]
async fn code_flow_checks_nonce_and_persists_tokens() {
    let server = server_with_authority().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc123"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("code-token", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("credentials.json");
    let mut opts = options(&server);
    opts.storage = StorageMode::Persistent;
    opts.storage_path = Some(file.clone());

    let (manager, navigator) = manager();
    manager.setup(opts).await.unwrap();

    let err = manager.authorise(Some("/dashboard".into())).await.unwrap_err();
    let AuthError::LoginRequired { login_url } = err else {
        panic!("expected a login redirect, got {err:?}");
    };
    assert!(login_url.starts_with(&format!("{}/login?continue=", server.uri())));

    let authorize = authorize_url(&navigator);
    let params = query_map(&authorize);
    assert_eq!(authorize.path(), "/auth/oauth/authorize");
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["redirect_uri"], REDIRECT);
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["code_challenge"].len(), 43);
    let state = params["state"].clone();
    assert!(state.ends_with(";/dashboard"));

    let forged = Url::parse(&format!("{REDIRECT}?code=abc123&state=forged%3B")).unwrap();
    assert_eq!(manager.handle_callback(&forged).await.unwrap_err(), AuthError::NonceMismatch);
    assert!(!manager.has_token());

    let mut callback = Url::parse(REDIRECT).unwrap();
    callback
        .query_pairs_mut()
        .append_pair("code", "abc123")
        .append_pair("state", &state);
    assert_eq!(manager.handle_callback(&callback).await.unwrap(), "code-token");
    assert_eq!(manager.token(), "code-token");

    // Nonce is single use.
    assert_eq!(manager.handle_callback(&callback).await.unwrap_err(), AuthError::NonceMismatch);

    let persisted = std::fs::read_to_string(&file).unwrap();
    assert!(persisted.contains("code-token"));
    assert!(persisted.contains("refresh-1"));
}

#[tokio::test]
async fn implicit_flow_reads_token_from_fragment() {
    let server = server_with_authority().await;
    let mut opts = options(&server);
    opts.grant = GrantType::Implicit;

    let (manager, navigator) = manager();
    manager.setup(opts).await.unwrap();
    assert!(matches!(
        manager.authorise(None).await.unwrap_err(),
        AuthError::LoginRequired { .. }
    ));

    let params = query_map(&authorize_url(&navigator));
    assert_eq!(params["response_type"], "token");
    assert!(!params.contains_key("code_challenge"));

    let state: String = url::form_urlencoded::byte_serialize(params["state"].as_bytes()).collect();
    let callback = Url::parse(&format!(
        "{REDIRECT}#access_token=implicit-token&expires_in=600&state={state}"
    ))
    .unwrap();
    assert_eq!(manager.handle_callback(&callback).await.unwrap(), "implicit-token");
    assert_eq!(manager.token(), "implicit-token");
}

#[tokio::test]
async fn oversized_lifetime_is_treated_as_non_expiring() {
    let server = server_with_authority().await;
    let mut opts = options(&server);
    opts.grant = GrantType::Implicit;

    let (manager, navigator) = manager();
    manager.setup(opts).await.unwrap();
    let _ = manager.authorise(None).await;

    let params = query_map(&authorize_url(&navigator));
    let state: String = url::form_urlencoded::byte_serialize(params["state"].as_bytes()).collect();
    let callback = Url::parse(&format!(
        "{REDIRECT}#access_token=forever-token&expires_in={}&state={state}",
        i64::MAX
    ))
    .unwrap();
    assert_eq!(manager.handle_callback(&callback).await.unwrap(), "forever-token");
    assert_eq!(manager.token(), "forever-token");
    assert!(manager.has_token());
}

#[tokio::test]
async fn callback_error_is_reported() {
    let server = server_with_authority().await;
    let (manager, _) = manager();
    manager.setup(options(&server)).await.unwrap();

    let callback = Url::parse(&format!("{REDIRECT}?error=access_denied&error_description=nope")).unwrap();
    let err = manager.handle_callback(&callback).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExchange { status: None, .. }));
}

#[tokio::test]
async fn logout_revokes_purges_and_navigates() {
    let server = server_with_authority().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 3600)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .and(query_param("token", "tok-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, navigator) = manager();
    manager.setup(password(&server)).await.unwrap();
    manager.authorise(None).await.unwrap();
    let online = manager.online();

    manager.logout().await.unwrap();

    assert_eq!(manager.token(), "");
    assert!(!*online.borrow());
    let visited = navigator.last_visit().unwrap();
    assert_eq!(visited.path(), "/logout");
}

#[tokio::test]
async fn mock_mode_skips_http() {
    let server = MockServer::start().await;
    let mut opts = options(&server);
    opts.mock = true;

    let (manager, _) = manager();
    manager.setup(opts).await.unwrap();

    assert!(manager.authority().is_some());
    assert_eq!(manager.refresh_authority().await.unwrap().version, "2.0.0");
    assert!(server.received_requests().await.unwrap().is_empty());
}
