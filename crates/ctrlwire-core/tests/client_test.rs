// End-to-end tests for the Client facade: simulated backend, request
// deduplication and resync after reconnect.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ctrlwire_api::CommandKind;
use ctrlwire_core::mock::demo_light;
use ctrlwire_core::{
    AuthOptions, BindingKey, Client, ClientConfig, CoreError, ErrorCode, PasswordCredentials, RequestError,
    SimulatedSystem,
};

use common::{ScriptedConnector, ServerSide, call_log};

fn power() -> BindingKey {
    BindingKey::new("S", "Light", 1, "power")
}

async fn mock_client() -> Client {
    let client = Client::new(ClientConfig::default());
    client
        .backend()
        .register("S", SimulatedSystem::new().with_module("Light", demo_light()));
    let mut options = AuthOptions::new(Url::parse("http://localhost:8080").unwrap(), "http://localhost:8080/cb");
    options.mock = true;
    client.setup(options).await.unwrap();
    client
}

async fn wait_for_value(stream: &mut ctrlwire_core::BindingStream, expected: &Value) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while stream.changed().await.as_ref() != Some(expected) {}
    })
    .await
    .unwrap();
}

// ── Simulated backend ───────────────────────────────────────────────

#[tokio::test]
async fn mock_bind_streams_until_unbind() {
    let client = mock_client().await;
    let mut stream = client.bind(&power()).await.unwrap();
    assert!(client.auth().token().is_empty());

    let light = client.backend().module("S", "Light", 1).unwrap();
    light.set("power", json!(true));
    wait_for_value(&mut stream, &json!(true)).await;
    assert_eq!(client.value(&power()), Some(json!(true)));

    client.unbind(&power()).await.unwrap();
    light.set("power", json!(false));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.value(&power()), Some(json!(true)));
    client.shutdown();
}

#[tokio::test]
async fn mock_exec_updates_bound_value() {
    let client = mock_client().await;
    let level = BindingKey::new("S", "Light", 1, "level");
    let mut stream = client.bind(&level).await.unwrap();

    let method = BindingKey::new("S", "Light", 1, "level");
    assert_eq!(client.exec(&method, vec![json!(65)]).await.unwrap(), json!(65));
    wait_for_value(&mut stream, &json!(65)).await;
    client.shutdown();
}

#[tokio::test]
async fn mock_errors_reject_only_the_request() {
    let client = mock_client().await;

    let missing = BindingKey::new("S", "Light", 9, "power");
    let err = client.bind(&missing).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Request(RequestError::Protocol {
            code: ErrorCode::ModuleNotFound,
            ..
        })
    ));

    let no_system = BindingKey::new("Nope", "Light", 1, "toggle");
    let err = client.exec(&no_system, vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Request(RequestError::Protocol {
            code: ErrorCode::SystemNotFound,
            ..
        })
    ));

    let toggle = BindingKey::new("S", "Light", 1, "toggle");
    assert_eq!(client.exec(&toggle, vec![]).await.unwrap(), json!(true));
    assert!(*client.connected().borrow());
    client.shutdown();
}

#[tokio::test]
async fn debug_and_ignore_succeed() {
    let client = mock_client().await;
    client.debug("S", "Light", 1).await.unwrap();
    client.ignore("S", "Light", 1).await.unwrap();
    assert_eq!(client.pending_requests(), 0);
    client.shutdown();
}

// ── Live path with a scripted socket ────────────────────────────────

async fn auth_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/authority"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "auth-1",
            "name": "Test",
            "version": "2.4.0",
            "session": false,
            "login_url": "/login?continue={{url}}",
            "logout_url": "/logout"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "live-token",
            "refresh_token": "refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;
    server
}

async fn live_client(
    server: &MockServer,
) -> (Client, tokio::sync::mpsc::UnboundedReceiver<ServerSide>, Arc<ScriptedConnector>) {
    let (connector, servers) = ScriptedConnector::new(call_log());
    let client = Client::builder(ClientConfig::default())
        .connector(connector.clone())
        .build();
    let options = AuthOptions::new(Url::parse(&server.uri()).unwrap(), "http://localhost/cb").with_password(
        PasswordCredentials {
            username: "operator".into(),
            password: SecretString::from("hunter2".to_owned()),
            client_secret: None,
        },
    );
    client.setup(options).await.unwrap();
    (client, servers, connector)
}

#[tokio::test]
async fn identical_concurrent_execs_share_one_frame() {
    let server = auth_server().await;
    let (client, mut servers, _) = live_client(&server).await;
    assert_eq!(client.auth().token(), "live-token");

    let toggle = BindingKey::new("sys-1", "Light", 1, "toggle");
    let a = tokio::spawn({
        let client = client.clone();
        let toggle = toggle.clone();
        async move { client.exec(&toggle, vec![]).await }
    });
    let b = tokio::spawn({
        let client = client.clone();
        let toggle = toggle.clone();
        async move { client.exec(&toggle, vec![]).await }
    });

    let mut socket = servers.recv().await.unwrap();
    assert!(socket.request.url.query().unwrap().contains("bearer_token=live-token"));
    let command = socket.next_command().await;
    assert_eq!(command.cmd, CommandKind::Exec);
    assert_eq!(command.id, 1);

    socket.push(&json!({ "type": "success", "id": command.id, "value": "on" }));
    assert_eq!(a.await.unwrap().unwrap(), json!("on"));
    assert_eq!(b.await.unwrap().unwrap(), json!("on"));
    assert!(socket.drain_frames().is_empty());
    client.shutdown();
}

#[tokio::test]
async fn notify_frames_reach_subscribers_in_order() {
    let server = auth_server().await;
    let (client, mut servers, _) = live_client(&server).await;
    let key = BindingKey::new("sys-1", "Display", 1, "volume");

    let bind = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        async move { client.bind(&key).await }
    });
    let mut socket = servers.recv().await.unwrap();
    let command = socket.next_command().await;
    socket.push(&json!({ "type": "success", "id": command.id, "value": null }));
    let mut stream = bind.await.unwrap().unwrap();

    for volume in 1..=5 {
        socket.push(&json!({
            "type": "notify",
            "value": volume.to_string(),
            "meta": { "sys": "sys-1", "mod": "Display", "index": 1, "name": "volume" }
        }));
    }
    for volume in 1..=5 {
        assert_eq!(stream.changed().await, Some(json!(volume)));
    }
    assert_eq!(client.value(&key), Some(json!(5)));
    client.shutdown();
}

#[tokio::test]
async fn debug_frames_reach_the_debug_channel() {
    let server = auth_server().await;
    let (client, mut servers, _) = live_client(&server).await;
    let mut debug = client.debug_events();

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.debug("sys-1", "Display", 2).await }
    });
    let mut socket = servers.recv().await.unwrap();
    let command = socket.next_command().await;
    assert_eq!(command.cmd, CommandKind::Debug);
    socket.push(&json!({ "type": "success", "id": command.id }));
    request.await.unwrap().unwrap();

    socket.push(&json!({
        "type": "debug",
        "mod": "mod-abc",
        "klass": "::Display::Samsung",
        "msg": "input changed",
        "level": "info",
        "meta": { "mod": "Display", "index": 2 }
    }));
    let event = debug.recv().await.unwrap();
    assert_eq!(event.mod_id, "mod-abc");
    assert_eq!(event.module, "Display_2");
    assert_eq!(event.class_name, "::Display::Samsung");
    assert_eq!(event.message, "input changed");
    client.shutdown();
}

#[tokio::test]
async fn reconnect_resends_pending_and_rebinds() {
    let server = auth_server().await;
    let (client, mut servers, connector) = live_client(&server).await;
    let key = BindingKey::new("sys-1", "Display", 1, "power");

    let bind = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        async move { client.bind(&key).await }
    });
    let mut first = servers.recv().await.unwrap();
    let bind_cmd = first.next_command().await;
    first.push(&json!({ "type": "success", "id": bind_cmd.id, "value": false }));
    bind.await.unwrap().unwrap();

    let method = BindingKey::new("sys-1", "Display", 1, "power_on");
    let exec = tokio::spawn({
        let client = client.clone();
        async move { client.exec(&method, vec![]).await }
    });
    let exec_cmd = first.next_command().await;
    assert_eq!(exec_cmd.cmd, CommandKind::Exec);

    first.close();
    let mut second = servers.recv().await.unwrap();
    assert_eq!(connector.attempts(), 2);

    let mut resent = vec![second.next_command().await, second.next_command().await];
    resent.sort_by_key(|c| c.id);
    assert_eq!(resent[0].id, exec_cmd.id);
    assert_eq!(resent[0].cmd, CommandKind::Exec);
    assert_eq!(resent[1].cmd, CommandKind::Bind);
    assert_eq!(resent[1].name, "power");

    second.push(&json!({ "type": "success", "id": exec_cmd.id, "value": true }));
    assert_eq!(exec.await.unwrap().unwrap(), json!(true));
    client.shutdown();
}

#[tokio::test]
async fn abandoned_request_does_not_stall_the_connection() {
    let server = auth_server().await;
    let (client, mut servers, connector) = live_client(&server).await;
    connector.fail_next(ctrlwire_api::Error::TransportClosed);

    let power_on = BindingKey::new("sys-1", "Display", 1, "power_on");
    let gave_up = tokio::time::timeout(Duration::from_millis(200), client.exec(&power_on, vec![])).await;
    assert!(gave_up.is_err());

    let power_off = BindingKey::new("sys-1", "Display", 1, "power_off");
    let exec = tokio::spawn({
        let client = client.clone();
        async move { client.exec(&power_off, vec![]).await }
    });

    let mut socket = tokio::time::timeout(Duration::from_secs(5), servers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connector.attempts(), 2);
    let command = socket.next_command().await;
    assert_eq!(command.name, "power_off");

    socket.push(&json!({ "type": "success", "id": command.id, "value": false }));
    assert_eq!(exec.await.unwrap().unwrap(), json!(false));
    client.shutdown();
}

#[tokio::test]
async fn request_issued_while_reconnecting_is_sent_once() {
    let server = auth_server().await;
    let (client, mut servers, connector) = live_client(&server).await;

    let toggle = BindingKey::new("sys-1", "Display", 1, "toggle");
    let warm_up = tokio::spawn({
        let client = client.clone();
        async move { client.exec(&toggle, vec![]).await }
    });
    let mut first = servers.recv().await.unwrap();
    let command = first.next_command().await;
    first.push(&json!({ "type": "success", "id": command.id, "value": true }));
    warm_up.await.unwrap().unwrap();

    connector.fail_next(ctrlwire_api::Error::TransportClosed);
    first.close();
    client.connected().wait_for(|connected| !*connected).await.unwrap();

    let power_on = BindingKey::new("sys-1", "Display", 1, "power_on");
    let exec = tokio::spawn({
        let client = client.clone();
        async move { client.exec(&power_on, vec![]).await }
    });

    let mut second = tokio::time::timeout(Duration::from_secs(5), servers.recv())
        .await
        .unwrap()
        .unwrap();
    let sent = second.next_command().await;
    assert_eq!(sent.name, "power_on");

    // Outlast the send poll so a second write would have landed.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(second.drain_frames().is_empty());

    second.push(&json!({ "type": "success", "id": sent.id, "value": true }));
    assert_eq!(exec.await.unwrap().unwrap(), json!(true));
    client.shutdown();
}

#[tokio::test]
async fn shutdown_rejects_pending_requests() {
    let server = auth_server().await;
    let (client, mut servers, _) = live_client(&server).await;
    let method = BindingKey::new("sys-1", "Display", 1, "power_on");

    let exec = tokio::spawn({
        let client = client.clone();
        async move { client.exec(&method, vec![]).await }
    });
    let mut socket = servers.recv().await.unwrap();
    socket.next_command().await;

    client.shutdown();
    let err = exec.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Request(RequestError::Shutdown)));
}
