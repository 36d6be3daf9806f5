mod support;

use domain::UserId;
use serde_json::json;
use tokio_tungstenite::connect_async;

use support::{next_event, send_event, spawn_app};

#[tokio::test]
async fn invalid_token_is_refused_before_upgrade() {
    let app = spawn_app().await;
    let result = connect_async(format!("{}/api/v1/ws?token=not-a-jwt", app.base_ws)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn realtime_message_typing_and_receipts() {
    let app = spawn_app().await;
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = app.create_direct(alice, bob).await;
    let conversation_id = conversation["id"].as_str().expect("id").to_owned();

    let mut alice_ws = app.connect(alice).await;
    let mut bob_ws = app.connect(bob).await;

    let online = next_event(&mut alice_ws, "presence_changed").await;
    assert_eq!(online["data"]["user_id"], bob.to_string());
    assert_eq!(online["data"]["online"], true);

    send_event(
        &mut bob_ws,
        json!({ "type": "typing_start", "data": { "conversation_id": conversation_id } }),
    )
    .await;
    let typing = next_event(&mut alice_ws, "typing_start").await;
    assert_eq!(typing["data"]["user_id"], bob.to_string());

    send_event(
        &mut bob_ws,
        json!({
            "type": "send_message",
            "data": { "conversation_id": conversation_id, "content": "hello alice", "client_ref": "b-1" }
        }),
    )
    .await;

    let accepted = next_event(&mut bob_ws, "message_accepted").await;
    assert_eq!(accepted["data"]["client_ref"], "b-1");
    assert_eq!(accepted["data"]["message"]["sequence"], 1);

    let incoming = next_event(&mut alice_ws, "new_message").await;
    let message_id = incoming["data"]["message"]["id"]
        .as_str()
        .expect("message id")
        .to_owned();
    assert_eq!(incoming["data"]["message"]["content"], "hello alice");
    // 发送消息会结束输入状态
    next_event(&mut alice_ws, "typing_stop").await;

    send_event(
        &mut alice_ws,
        json!({ "type": "mark_read", "data": { "message_id": message_id } }),
    )
    .await;
    let receipt = next_event(&mut bob_ws, "message_read_by").await;
    assert_eq!(receipt["data"]["message_id"], message_id);
    assert_eq!(receipt["data"]["user_id"], alice.to_string());
}

#[tokio::test]
async fn bad_frames_and_foreign_conversations_produce_error_events() {
    let app = spawn_app().await;
    let (alice, bob, mallory) = (UserId::random(), UserId::random(), UserId::random());
    let conversation = app.create_direct(alice, bob).await;
    let conversation_id = conversation["id"].as_str().expect("id").to_owned();

    let mut intruder = app.connect(mallory).await;

    send_event(&mut intruder, json!({ "type": "shout", "data": {} })).await;
    let malformed = next_event(&mut intruder, "error").await;
    assert_eq!(malformed["data"]["code"], "validation_error");

    send_event(
        &mut intruder,
        json!({
            "type": "send_message",
            "data": { "conversation_id": conversation_id, "content": "let me in" }
        }),
    )
    .await;
    let rejected = next_event(&mut intruder, "error").await;
    assert_eq!(rejected["data"]["code"], "authorization_error");

    // 连接仍然可用
    send_event(
        &mut intruder,
        json!({ "type": "join_conversation", "data": { "conversation_id": conversation_id } }),
    )
    .await;
    let again = next_event(&mut intruder, "error").await;
    assert_eq!(again["data"]["code"], "authorization_error");
}

#[tokio::test]
async fn disconnect_broadcasts_offline() {
    let app = spawn_app().await;
    let (alice, bob) = (UserId::random(), UserId::random());
    app.create_direct(alice, bob).await;

    let mut alice_ws = app.connect(alice).await;
    let mut bob_ws = app.connect(bob).await;
    next_event(&mut alice_ws, "presence_changed").await;

    bob_ws.close(None).await.expect("close");
    let offline = next_event(&mut alice_ws, "presence_changed").await;
    assert_eq!(offline["data"]["user_id"], bob.to_string());
    assert_eq!(offline["data"]["online"], false);
}
