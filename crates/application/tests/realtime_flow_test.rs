//! 实时链路端到端测试（内存实现）
//!
//! 覆盖：离线接收者推送与重连追赶、同一用户多设备、在线接收者不重复推送、
//! 非成员事件被拒绝、输入状态经网关广播。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::message_store::memory::MemoryMessageStore;
use application::repository::memory::{MemoryDeviceTokenRepository, MemoryPreferenceRepository};
use application::{
    ApplicationError, ChatService, ChatServiceDependencies, ConnectionGateway, ConnectionHandle,
    ConversationRooms, CreateConversationRequest, DispatcherDependencies, GatewayDependencies,
    MessageStore, NotificationDispatcher, PresenceTracker, PushOutcome, PushProvider,
    RegisterDeviceTokenRequest, SessionVerifier, SystemClock, TypingCoordinator,
};
use async_trait::async_trait;
use config::NotificationConfig;
use domain::{
    ClientEvent, Conversation, DeliveryState, DevicePlatform, NotificationPayload, ServerEvent,
    UserId,
};
use tokio::sync::mpsc;

/// 令牌字符串即用户 ID
struct StaticVerifier;

#[async_trait]
impl SessionVerifier for StaticVerifier {
    async fn verify(&self, credential: &str) -> Result<UserId, ApplicationError> {
        credential
            .parse::<uuid::Uuid>()
            .map(UserId::from)
            .map_err(|_| ApplicationError::Authentication("invalid credential".into()))
    }
}

/// 记录每次推送的令牌
#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<String>>,
}

impl RecordingPush {
    fn sent(&self) -> Vec<String> {
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

struct Harness {
    gateway: ConnectionGateway,
    chat: Arc<ChatService>,
    store: Arc<MemoryMessageStore>,
    push: Arc<RecordingPush>,
    dispatcher: NotificationDispatcher,
}

fn harness() -> Harness {
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
            dispatch_delay_ms: 200,
            ..NotificationConfig::default()
        },
    );
    dispatcher.spawn_workers(2);

    let rooms = Arc::new(ConversationRooms::new(
        presence.clone(),
        store.clone(),
        dispatcher.clone(),
    ));
    let typing = Arc::new(TypingCoordinator::new(rooms.clone(), Duration::from_secs(5)));
    let chat = Arc::new(ChatService::new(ChatServiceDependencies {
        store: store.clone(),
        rooms: rooms.clone(),
        device_tokens,
        preferences,
        clock,
    }));
    let gateway = ConnectionGateway::new(
        GatewayDependencies {
            verifier: Arc::new(StaticVerifier),
            store: store.clone(),
            presence,
            rooms,
            typing,
            chat: chat.clone(),
        },
        64,
    );

    Harness {
        gateway,
        chat,
        store,
        push,
        dispatcher,
    }
}

async fn connect(h: &Harness, user: UserId) -> ConnectionHandle {
    let mut handle = h.gateway.on_connect(&user.to_string()).await.unwrap();
    match handle.events.recv().await {
        Some(ServerEvent::Ready { user_id, .. }) => assert_eq!(user_id, user),
        other => panic!("expected ready, got {other:?}"),
    }
    handle
}

async fn direct(h: &Harness, a: UserId, b: UserId) -> Conversation {
    h.chat
        .create_conversation(CreateConversationRequest {
            creator_id: a,
            participant_ids: vec![b],
            is_group: false,
            name: None,
        })
        .await
        .unwrap()
}

async fn register_device(h: &Harness, user: UserId, token: &str) {
    h.chat
        .register_device_token(RegisterDeviceTokenRequest {
            user_id: user,
            token: token.into(),
            platform: DevicePlatform::Ios,
        })
        .await
        .unwrap();
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn offline_recipient_gets_one_push_and_catches_up() {
    let h = harness();
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = direct(&h, alice, bob).await;
    register_device(&h, bob, "bob-phone").await;

    let mut alice_conn = connect(&h, alice).await;
    h.gateway
        .on_client_event(
            alice_conn.connection_id,
            ClientEvent::SendMessage {
                conversation_id: conversation.id,
                content: "hello".into(),
                client_ref: Some("c-1".into()),
            },
        )
        .await
        .unwrap();

    let sender_events = drain(&mut alice_conn.events);
    assert!(
        !sender_events
            .iter()
            .any(|event| matches!(event, ServerEvent::NewMessage { .. })),
        "the sending connection only gets message_accepted"
    );
    let accepted = sender_events
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::MessageAccepted { client_ref, message } => Some((client_ref, message)),
            _ => None,
        })
        .expect("sender gets message_accepted");
    assert_eq!(accepted.0.as_deref(), Some("c-1"));
    assert_eq!(accepted.1.sequence, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.push.sent(), vec!["bob-phone".to_string()]);
    assert_eq!(h.dispatcher.stats().delivered, 1);

    // 重连后从 0 开始追赶
    let _bob_conn = connect(&h, bob).await;
    let missed = h
        .chat
        .list_messages(bob, conversation.id, 0, None)
        .await
        .unwrap();
    assert_eq!(missed.len(), 1);
    assert_eq!(missed[0].sequence, 1);
    assert_eq!(missed[0].content.as_str(), "hello");
}

#[tokio::test(start_paused = true)]
async fn both_devices_receive_and_no_push_is_sent() {
    let h = harness();
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = direct(&h, alice, bob).await;
    register_device(&h, alice, "alice-phone").await;

    let mut alice_web = connect(&h, alice).await;
    let mut alice_phone = connect(&h, alice).await;
    let bob_conn = connect(&h, bob).await;

    h.gateway
        .on_client_event(
            bob_conn.connection_id,
            ClientEvent::SendMessage {
                conversation_id: conversation.id,
                content: "hi alice".into(),
                client_ref: None,
            },
        )
        .await
        .unwrap();

    for conn in [&mut alice_web, &mut alice_phone] {
        let got = drain(&mut conn.events)
            .into_iter()
            .any(|event| matches!(event, ServerEvent::NewMessage { ref message } if message.sender_id == bob));
        assert!(got, "every device of alice receives new_message");
    }

    let message = h
        .store
        .messages_after(conversation.id, 0, 10)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(
        h.store.delivery_state(message.id, alice).await.unwrap(),
        Some(DeliveryState::Delivered)
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.push.sent().is_empty());
}

#[tokio::test]
async fn events_on_foreign_conversations_are_rejected() {
    let h = harness();
    let (alice, bob, mallory) = (UserId::random(), UserId::random(), UserId::random());
    let conversation = direct(&h, alice, bob).await;
    let mut intruder = connect(&h, mallory).await;

    let err = h
        .gateway
        .on_client_event(
            intruder.connection_id,
            ClientEvent::SendMessage {
                conversation_id: conversation.id,
                content: "let me in".into(),
                client_ref: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Authorization(_)));

    match intruder.events.recv().await {
        Some(ServerEvent::Error { code, .. }) => assert_eq!(code, "authorization_error"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(h
        .store
        .messages_after(conversation.id, 0, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn invalid_credential_is_refused() {
    let h = harness();
    let err = h.gateway.on_connect("not-a-token").await.err().unwrap();
    assert!(matches!(err, ApplicationError::Authentication(_)));
}

#[tokio::test]
async fn typing_and_presence_reach_the_other_participant() {
    let h = harness();
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = direct(&h, alice, bob).await;

    let mut bob_conn = connect(&h, bob).await;
    let alice_conn = connect(&h, alice).await;

    h.gateway
        .on_client_event(
            alice_conn.connection_id,
            ClientEvent::TypingStart {
                conversation_id: conversation.id,
            },
        )
        .await
        .unwrap();
    h.gateway.on_disconnect(alice_conn.connection_id).await;

    let events = drain(&mut bob_conn.events);
    let expected = [
        ServerEvent::PresenceChanged {
            user_id: alice,
            online: true,
        },
        ServerEvent::TypingStart {
            conversation_id: conversation.id,
            user_id: alice,
        },
        ServerEvent::TypingStop {
            conversation_id: conversation.id,
            user_id: alice,
        },
        ServerEvent::PresenceChanged {
            user_id: alice,
            online: false,
        },
    ];
    assert_eq!(events, expected);
}

#[tokio::test]
async fn read_receipt_is_broadcast_once() {
    let h = harness();
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = direct(&h, alice, bob).await;
    let mut alice_conn = connect(&h, alice).await;
    let bob_conn = connect(&h, bob).await;

    h.gateway
        .on_client_event(
            alice_conn.connection_id,
            ClientEvent::SendMessage {
                conversation_id: conversation.id,
                content: "read me".into(),
                client_ref: None,
            },
        )
        .await
        .unwrap();
    let message = h
        .store
        .messages_after(conversation.id, 0, 1)
        .await
        .unwrap()
        .remove(0);
    drain(&mut alice_conn.events);

    for _ in 0..2 {
        h.gateway
            .on_client_event(
                bob_conn.connection_id,
                ClientEvent::MarkRead {
                    message_id: message.id,
                },
            )
            .await
            .unwrap();
    }

    let receipts: HashMap<_, _> = drain(&mut alice_conn.events)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::MessageReadBy {
                message_id,
                user_id,
                ..
            } => Some((message_id, user_id)),
            _ => None,
        })
        .fold(HashMap::new(), |mut acc, key| {
            *acc.entry(key).or_insert(0) += 1;
            acc
        });
    assert_eq!(receipts.get(&(message.id, bob)), Some(&1));
    assert_eq!(
        h.store.delivery_state(message.id, bob).await.unwrap(),
        Some(DeliveryState::Read)
    );
}
