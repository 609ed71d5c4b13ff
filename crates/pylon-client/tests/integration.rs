//! End-to-end tests over a real WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use pylon_client::{
    ClientConfig, ClientService, InviteService, LocalAgent, NoGeo, ServiceConfig, ServiceEvent,
    WsTransport,
};
use pylon_core::{Command, CommandResult, Frame, InviteCreated, Notify, SessionType};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsServer = WebSocketStream<TcpStream>;

struct TestConfig;

impl ServiceConfig for TestConfig {
    fn session_type(&self) -> SessionType {
        SessionType::TeaClient
    }

    fn selected_locale_url(&self) -> Option<String> {
        None
    }

    fn host_info(&self) -> LocalAgent {
        LocalAgent {
            platform: "linux".into(),
            platform_version: "6.1".into(),
            architecture: "x86_64".into(),
            client_version: "1.0.0".into(),
            ui_version: "1.0.0".into(),
        }
    }
}

/// Bind a listener and build a service pointed at it.
async fn boot() -> (TcpListener, ClientService) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut settings = ClientConfig::new(format!("ws://{addr}/"));
    settings.reconnect_interval_ms = 100;
    settings.retry_window_ms = 100;
    let service = ClientService::new(
        settings,
        Arc::new(TestConfig),
        Arc::new(NoGeo),
        Arc::new(WsTransport::new()),
    );
    (listener, service)
}

async fn accept_session(listener: &TcpListener) -> WsServer {
    let (stream, _) = timeout(TIMEOUT, listener.accept())
        .await
        .expect("no connection attempt")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_command(ws: &mut WsServer) -> (String, Command) {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("client hung up")
            .unwrap();
        if let Message::Text(text) = message {
            match serde_json::from_str::<Frame>(&text).unwrap() {
                Frame::Command { token, command } => return (token, command),
                other => panic!("expected a command frame, got {other:?}"),
            }
        }
    }
}

async fn send_frame(ws: &mut WsServer, frame: &Frame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(Message::text(text)).await.unwrap();
}

async fn send_result(ws: &mut WsServer, token: &str, result: CommandResult) {
    send_frame(
        ws,
        &Frame::CommandResult {
            token: Some(token.into()),
            result,
        },
    )
    .await;
}

/// Answer the bootstrap sequence with `Success` for every command.
async fn answer_bootstrap(ws: &mut WsServer) {
    let (token, command) = next_command(ws).await;
    assert!(matches!(command, Command::SessionInitialize(_)));
    send_result(ws, &token, CommandResult::Success).await;

    for _ in 0..2 {
        let (token, command) = next_command(ws).await;
        assert!(matches!(
            command,
            Command::SessionInitializeAgent(_) | Command::SessionUpdateLocale(_)
        ));
        send_result(ws, &token, CommandResult::Success).await;
    }
}

async fn expect_event(events: &mut broadcast::Receiver<ServiceEvent>, expected: ServiceEvent) {
    let event = timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a service event")
        .expect("event channel closed");
    assert_eq!(event, expected);
}

#[tokio::test]
async fn session_bootstraps_and_recovers_across_a_server_restart() {
    let (listener, service) = boot().await;
    let mut events = service.subscribe();
    service.start().await;

    let mut ws = accept_session(&listener).await;
    answer_bootstrap(&mut ws).await;
    expect_event(&mut events, ServiceEvent::SessionInitialized).await;
    assert!(service.is_session_initialized());

    // The server drops the connection mid-session.
    ws.close(None).await.unwrap();
    drop(ws);
    expect_event(&mut events, ServiceEvent::SessionClosed).await;
    assert!(!service.is_session_initialized());

    // The client reconnects by itself and bootstraps again.
    let mut ws = accept_session(&listener).await;
    answer_bootstrap(&mut ws).await;
    expect_event(&mut events, ServiceEvent::SessionInitialized).await;

    service.stop().await;
}

#[tokio::test]
async fn invite_creation_round_trips_over_the_wire() {
    let (listener, service) = boot().await;
    let mut events = service.subscribe();
    service.start().await;

    let mut ws = accept_session(&listener).await;
    answer_bootstrap(&mut ws).await;
    expect_event(&mut events, ServiceEvent::SessionInitialized).await;

    let invites = InviteService::new(service.connection().clone());
    let task = tokio::spawn(async move {
        invites
            .create_invite_link(true, Default::default(), Default::default())
            .await
    });

    let (token, command) = next_command(&mut ws).await;
    assert!(matches!(command, Command::InviteCreate(_)));
    send_frame(
        &mut ws,
        &Frame::Notify {
            notify: Notify::InviteCreated(InviteCreated {
                link_id: "lnk-int".into(),
                admin_token: Some("admin-int".into()),
            }),
        },
    )
    .await;
    send_result(&mut ws, &token, CommandResult::Success).await;

    let created = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(created.link_id, "lnk-int");
    assert_eq!(created.admin_token.as_deref(), Some("admin-int"));

    service.stop().await;
}

#[tokio::test]
async fn transient_server_errors_are_retried_transparently() {
    let (listener, service) = boot().await;
    let mut events = service.subscribe();
    service.start().await;

    let mut ws = accept_session(&listener).await;
    let (token, command) = next_command(&mut ws).await;
    assert!(matches!(command, Command::SessionInitialize(_)));
    send_result(&mut ws, &token, CommandResult::ServerInternalError).await;

    // The client waits out the retry window and reissues the command.
    let (token, command) = next_command(&mut ws).await;
    assert!(matches!(command, Command::SessionInitialize(_)));
    send_result(&mut ws, &token, CommandResult::Success).await;

    for _ in 0..2 {
        let (token, _) = next_command(&mut ws).await;
        send_result(&mut ws, &token, CommandResult::Success).await;
    }
    expect_event(&mut events, ServiceEvent::SessionInitialized).await;

    service.stop().await;
}
