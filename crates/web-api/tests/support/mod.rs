#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::message_store::memory::MemoryMessageStore;
use application::repository::memory::{MemoryDeviceTokenRepository, MemoryPreferenceRepository};
use application::{
    ChatService, ChatServiceDependencies, ConnectionGateway, ConversationRooms,
    DispatcherDependencies, GatewayDependencies, NotificationDispatcher, PresenceTracker,
    PushOutcome, PushProvider, SystemClock, TypingCoordinator,
};
use async_trait::async_trait;
use config::{NotificationConfig, RealtimeConfig};
use domain::{NotificationPayload, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 记录每次推送的令牌
#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<String>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushProvider for RecordingPush {
    async fn send(&self, token: &str, _payload: &NotificationPayload) -> PushOutcome {
        self.sent.lock().unwrap().push(token.to_owned());
        PushOutcome::Delivered
    }
}

pub struct TestApp {
    pub base_http: String,
    pub base_ws: String,
    pub client: reqwest::Client,
    pub jwt: Arc<JwtService>,
    pub push: Arc<RecordingPush>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl TestApp {
    pub fn token(&self, user: UserId) -> String {
        self.jwt.generate_token(user).expect("token")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_http, path)
    }

    pub async fn connect(&self, user: UserId) -> WsClient {
        let (mut socket, _) = connect_async(format!(
            "{}/api/v1/ws?token={}",
            self.base_ws,
            self.token(user)
        ))
        .await
        .expect("websocket connect");
        let ready = next_event(&mut socket, "ready").await;
        assert_eq!(ready["data"]["user_id"], user.to_string());
        socket
    }

    pub async fn create_direct(&self, creator: UserId, other: UserId) -> Value {
        let response = self
            .client
            .post(self.url("/conversations"))
            .bearer_auth(self.token(creator))
            .json(&serde_json::json!({ "participant_ids": [other] }))
            .send()
            .await
            .expect("create conversation");
        assert_eq!(response.status(), 201);
        response.json().await.expect("conversation json")
    }
}

pub async fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryMessageStore::new());
    let presence = Arc::new(PresenceTracker::new());
    let device_tokens = Arc::new(MemoryDeviceTokenRepository::new());
    let preferences = Arc::new(MemoryPreferenceRepository::new());
    let push = Arc::new(RecordingPush::default());
    let clock = Arc::new(SystemClock);

    let dispatcher = NotificationDispatcher::new(
        DispatcherDependencies {
            store: store.clone(),
            device_tokens: device_tokens.clone(),
            preferences: preferences.clone(),
            push: push.clone(),
            clock: clock.clone(),
        },
        &NotificationConfig {
            dispatch_delay_ms: 100,
            ..NotificationConfig::default()
        },
    );
    dispatcher.spawn_workers(2);

    let rooms = Arc::new(ConversationRooms::new(
        presence.clone(),
        store.clone(),
        dispatcher,
    ));
    let typing = Arc::new(TypingCoordinator::new(rooms.clone(), Duration::from_secs(5)));
    let chat = Arc::new(ChatService::new(ChatServiceDependencies {
        store: store.clone(),
        rooms: rooms.clone(),
        device_tokens,
        preferences,
        clock,
    }));
    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "integration-secret-integration-secret".into(),
        expiration_hours: 1,
    }));
    let gateway = Arc::new(ConnectionGateway::new(
        GatewayDependencies {
            verifier: jwt.clone(),
            store,
            presence,
            rooms,
            typing,
            chat: chat.clone(),
        },
        64,
    ));

    let state = AppState::new(chat, gateway, jwt.clone(), RealtimeConfig::default());
    let app = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    TestApp {
        base_http: format!("http://{addr}"),
        base_ws: format!("ws://{addr}"),
        client: reqwest::Client::new(),
        jwt,
        push,
        shutdown: Some(shutdown_tx),
    }
}

pub async fn send_event(socket: &mut WsClient, event: Value) {
    socket
        .send(WsMessage::Text(event.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一个指定类型的事件，跳过其他事件
pub async fn next_event(socket: &mut WsClient, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = socket
                .next()
                .await
                .expect("socket open")
                .expect("frame");
            if let WsMessage::Text(text) = frame {
                let event: Value = serde_json::from_str(text.as_str()).expect("event json");
                if event["type"] == kind {
                    return event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}
