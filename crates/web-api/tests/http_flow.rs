mod support;

use std::time::Duration;

use domain::UserId;
use serde_json::{json, Value};

use support::spawn_app;

#[tokio::test]
async fn health_is_public_and_api_requires_a_token() {
    let app = spawn_app().await;

    let health = app
        .client
        .get(format!("{}/health", app.base_http))
        .send()
        .await
        .expect("health");
    assert_eq!(health.status(), 200);

    let anonymous = app
        .client
        .get(app.url("/conversations"))
        .send()
        .await
        .expect("list");
    assert_eq!(anonymous.status(), 401);
    let body: Value = anonymous.json().await.expect("error json");
    assert_eq!(body["code"], "auth_error");
}

#[tokio::test]
async fn send_list_and_read_over_http() {
    let app = spawn_app().await;
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = app.create_direct(alice, bob).await;
    let conversation_id = conversation["id"].as_str().expect("id").to_owned();

    // 同一对用户再次创建返回已有私聊
    let again = app.create_direct(bob, alice).await;
    assert_eq!(again["id"], conversation["id"]);

    for text in ["first", "second", "third"] {
        let sent = app
            .client
            .post(app.url(&format!("/conversations/{conversation_id}/messages")))
            .bearer_auth(app.token(alice))
            .json(&json!({ "content": text }))
            .send()
            .await
            .expect("send");
        assert_eq!(sent.status(), 201);
    }

    let page: Vec<Value> = app
        .client
        .get(app.url(&format!(
            "/conversations/{conversation_id}/messages?after=1&limit=10"
        )))
        .bearer_auth(app.token(bob))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("messages json");
    let sequences: Vec<u64> = page
        .iter()
        .map(|m| m["sequence"].as_u64().expect("sequence"))
        .collect();
    assert_eq!(sequences, vec![2, 3]);
    assert_eq!(page[0]["content"], "second");

    let message_id = page[0]["id"].as_str().expect("message id");
    let read: Value = app
        .client
        .post(app.url(&format!("/messages/{message_id}/read")))
        .bearer_auth(app.token(bob))
        .send()
        .await
        .expect("read")
        .json()
        .await
        .expect("read json");
    assert_eq!(read["state"], "read");
    assert_eq!(read["changed"], true);
}

#[tokio::test]
async fn outsiders_and_bad_input_are_rejected() {
    let app = spawn_app().await;
    let (alice, bob, mallory) = (UserId::random(), UserId::random(), UserId::random());
    let conversation = app.create_direct(alice, bob).await;
    let conversation_id = conversation["id"].as_str().expect("id");

    let forbidden = app
        .client
        .get(app.url(&format!("/conversations/{conversation_id}/messages")))
        .bearer_auth(app.token(mallory))
        .send()
        .await
        .expect("list");
    assert_eq!(forbidden.status(), 403);

    let empty = app
        .client
        .post(app.url(&format!("/conversations/{conversation_id}/messages")))
        .bearer_auth(app.token(alice))
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .expect("send");
    assert_eq!(empty.status(), 400);
    let body: Value = empty.json().await.expect("error json");
    assert_eq!(body["code"], "validation_error");

    let missing = app
        .client
        .get(app.url(&format!(
            "/conversations/{}/messages",
            uuid::Uuid::new_v4()
        )))
        .bearer_auth(app.token(alice))
        .send()
        .await
        .expect("list");
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn group_membership_and_archive() {
    let app = spawn_app().await;
    let (alice, bob, carol) = (UserId::random(), UserId::random(), UserId::random());

    let group: Value = app
        .client
        .post(app.url("/conversations"))
        .bearer_auth(app.token(alice))
        .json(&json!({ "participant_ids": [bob], "is_group": true, "name": "garden club" }))
        .send()
        .await
        .expect("create group")
        .json()
        .await
        .expect("group json");
    let group_id = group["id"].as_str().expect("id").to_owned();

    let added: Value = app
        .client
        .post(app.url(&format!("/conversations/{group_id}/participants")))
        .bearer_auth(app.token(alice))
        .json(&json!({ "user_id": carol }))
        .send()
        .await
        .expect("add participant")
        .json()
        .await
        .expect("conversation json");
    assert_eq!(added["participants"].as_array().expect("participants").len(), 3);

    let removed = app
        .client
        .delete(app.url(&format!("/conversations/{group_id}/participants/{bob}")))
        .bearer_auth(app.token(alice))
        .send()
        .await
        .expect("remove participant");
    assert_eq!(removed.status(), 200);

    let archived = app
        .client
        .post(app.url(&format!("/conversations/{group_id}/archive")))
        .bearer_auth(app.token(carol))
        .send()
        .await
        .expect("archive");
    assert_eq!(archived.status(), 200);

    let late = app
        .client
        .post(app.url(&format!("/conversations/{group_id}/messages")))
        .bearer_auth(app.token(alice))
        .json(&json!({ "content": "anyone here?" }))
        .send()
        .await
        .expect("send");
    assert_eq!(late.status(), 409);

    let listed: Vec<Value> = app
        .client
        .get(app.url("/conversations"))
        .bearer_auth(app.token(alice))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("list json");
    assert!(listed.is_empty());
}

#[tokio::test]
async fn offline_recipient_is_pushed_unless_muted() {
    let app = spawn_app().await;
    let (alice, bob) = (UserId::random(), UserId::random());
    let conversation = app.create_direct(alice, bob).await;
    let conversation_id = conversation["id"].as_str().expect("id").to_owned();

    let registered = app
        .client
        .post(app.url("/notifications/register-token"))
        .bearer_auth(app.token(bob))
        .json(&json!({ "token": "bob-phone", "platform": "android" }))
        .send()
        .await
        .expect("register token");
    assert_eq!(registered.status(), 201);

    let send = |content: &'static str| {
        app.client
            .post(app.url(&format!("/conversations/{conversation_id}/messages")))
            .bearer_auth(app.token(alice))
            .json(&json!({ "content": content }))
            .send()
    };

    send("are you around?").await.expect("send");
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(app.push.sent(), vec!["bob-phone".to_string()]);

    let settings: Value = app
        .client
        .put(app.url("/notifications/settings"))
        .bearer_auth(app.token(bob))
        .json(&json!({ "message": false }))
        .send()
        .await
        .expect("update settings")
        .json()
        .await
        .expect("settings json");
    assert_eq!(settings["message"], false);
    assert_eq!(settings["alert"], true);

    send("still there?").await.expect("send");
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(app.push.sent().len(), 1);

    let unregistered = app
        .client
        .delete(app.url("/notifications/unregister-token"))
        .bearer_auth(app.token(bob))
        .json(&json!({ "token": "bob-phone" }))
        .send()
        .await
        .expect("unregister");
    assert_eq!(unregistered.status(), 204);

    let again = app
        .client
        .delete(app.url("/notifications/unregister-token"))
        .bearer_auth(app.token(bob))
        .json(&json!({ "token": "bob-phone" }))
        .send()
        .await
        .expect("unregister");
    assert_eq!(again.status(), 404);
}
