//! Integration tests for bans, timeouts, reports, message deletion, and
//! per-user visibility.

mod common;

use common::{
    connect_ws, create_room, get_json, post_json, recv_frame, register, send_frame,
    start_test_server,
};
use serde_json::json;

#[tokio::test]
async fn ban_requires_rank_and_blocks_rejoin() {
    let server = start_test_server().await;
    let alice = register(&server, "alice").await;
    let bob = register(&server, "bob").await;
    let carol = register(&server, "carol").await;

    let room_id = create_room(&server, &alice, "General", "topic").await;
    for user in [&bob, &carol] {
        post_json(&server, user, &format!("/api/rooms/{}/join", room_id), json!({})).await;
    }

    // A level-1 member cannot ban anyone.
    let resp = server
        .client
        .post(format!(
            "{}/api/rooms/{}/ban/{}",
            server.base_url, room_id, carol.user_id
        ))
        .bearer_auth(&bob.access_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["errors"][0], "insufficient_permission");

    // Promote bob to moderator; moderators cannot ban upward.
    server
        .client
        .put(format!(
            "{}/api/rooms/{}/members/{}/level",
            server.base_url, room_id, bob.user_id
        ))
        .bearer_auth(&alice.access_token)
        .json(&json!({"level": 2}))
        .send()
        .await
        .unwrap();
    let resp = server
        .client
        .post(format!(
            "{}/api/rooms/{}/ban/{}",
            server.base_url, room_id, alice.user_id
        ))
        .bearer_auth(&bob.access_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["errors"][0], "target_outranks_actor");

    // A moderator bans downward; the target loses membership and cannot
    // rejoin.
    let banned = post_json(
        &server,
        &bob,
        &format!("/api/rooms/{}/ban/{}", room_id, carol.user_id),
        json!({"reason": "spam"}),
    )
    .await;
    assert_eq!(banned["success"], true);

    let members = get_json(&server, &alice, &format!("/api/rooms/{}/members", room_id)).await;
    assert!(members["data"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["username"] != "carol"));

    let rejoin = server
        .client
        .post(format!("{}/api/rooms/{}/join", server.base_url, room_id))
        .bearer_auth(&carol.access_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejoin.status(), 403);
}

#[tokio::test]
async fn timeout_blocks_posting_but_not_delivery() {
    let server = start_test_server().await;
    let alice = register(&server, "alice").await;
    let bob = register(&server, "bob").await;

    let room_id = create_room(&server, &alice, "General", "topic").await;
    post_json(&server, &bob, &format!("/api/rooms/{}/join", room_id), json!({})).await;

    let timed_out = post_json(
        &server,
        &alice,
        &format!("/api/rooms/{}/timeout/{}", room_id, bob.user_id),
        json!({"minutes": 10}),
    )
    .await;
    assert_eq!(timed_out["success"], true);

    let mut bob_ws = connect_ws(&server, &bob).await;

    // Posting is rejected while the timeout is active.
    send_frame(
        &mut bob_ws,
        json!({"type": "send_message", "room_id": room_id, "content": "hello?"}),
    )
    .await;
    let err = recv_frame(&mut bob_ws, |f| f["type"] == "error").await;
    assert_eq!(err["code"], "permission_denied");

    // Delivery is unaffected: bob still receives alice's messages.
    let mut alice_ws = connect_ws(&server, &alice).await;
    send_frame(
        &mut alice_ws,
        json!({"type": "send_message", "room_id": room_id, "content": "still here"}),
    )
    .await;
    let event = recv_frame(&mut bob_ws, |f| {
        f["type"] == "event" && f["body"] == "message_posted"
    })
    .await;
    assert_eq!(event["content"], "still here");
}

#[tokio::test]
async fn reports_are_stored_and_moderator_only() {
    let server = start_test_server().await;
    let alice = register(&server, "alice").await;
    let bob = register(&server, "bob").await;

    let room_id = create_room(&server, &alice, "General", "topic").await;
    post_json(&server, &bob, &format!("/api/rooms/{}/join", room_id), json!({})).await;

    let filed = post_json(
        &server,
        &bob,
        &format!("/api/rooms/{}/reports", room_id),
        json!({"target_kind": "message", "target_id": "m-1", "reason": "spam"}),
    )
    .await;
    assert_eq!(filed["success"], true);

    // The reporter cannot read the report queue.
    let resp = server
        .client
        .get(format!("{}/api/rooms/{}/reports", server.base_url, room_id))
        .bearer_auth(&bob.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let listing = get_json(&server, &alice, &format!("/api/rooms/{}/reports", room_id)).await;
    let reports = listing["data"]["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["reason"], "spam");
    assert_eq!(reports[0]["reporter_id"], bob.user_id.as_str());
}

#[tokio::test]
async fn deleted_and_hidden_messages_leave_history() {
    let server = start_test_server().await;
    let alice = register(&server, "alice").await;
    let bob = register(&server, "bob").await;

    let room_id = create_room(&server, &alice, "General", "topic").await;
    post_json(&server, &bob, &format!("/api/rooms/{}/join", room_id), json!({})).await;

    let mut alice_ws = connect_ws(&server, &alice).await;
    for content in ["one", "two", "three"] {
        send_frame(
            &mut alice_ws,
            json!({"type": "send_message", "room_id": room_id, "content": content}),
        )
        .await;
    }
    // Wait for the last echo so all three are sequenced.
    recv_frame(&mut alice_ws, |f| f["content"] == "three").await;

    let history = get_json(
        &server,
        &bob,
        &format!("/api/rooms/{}/messages", room_id),
    )
    .await;
    let messages = history["data"]["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 3);
    // Newest first.
    assert_eq!(messages[0]["content"], "three");

    // Alice deletes her own message; everyone stops seeing it.
    let deleted_id = messages[1]["id"].as_str().unwrap();
    let resp = server
        .client
        .delete(format!(
            "{}/api/rooms/{}/messages/{}",
            server.base_url, room_id, deleted_id
        ))
        .bearer_auth(&alice.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Bob hides another one; only bob stops seeing it.
    let hidden_id = messages[2]["id"].as_str().unwrap();
    post_json(
        &server,
        &bob,
        "/api/hidden",
        json!({"item_kind": "message", "item_id": hidden_id}),
    )
    .await;

    let bob_view = get_json(&server, &bob, &format!("/api/rooms/{}/messages", room_id)).await;
    let bob_messages = bob_view["data"]["messages"].as_array().unwrap();
    assert_eq!(bob_messages.len(), 1);
    assert_eq!(bob_messages[0]["content"], "three");

    let alice_view = get_json(&server, &alice, &format!("/api/rooms/{}/messages", room_id)).await;
    assert_eq!(alice_view["data"]["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn muted_rooms_deliver_with_the_silent_flag() {
    let server = start_test_server().await;
    let alice = register(&server, "alice").await;
    let bob = register(&server, "bob").await;

    let room_id = create_room(&server, &alice, "General", "topic").await;
    post_json(&server, &bob, &format!("/api/rooms/{}/join", room_id), json!({})).await;
    post_json(&server, &bob, &format!("/api/rooms/{}/mute", room_id), json!({})).await;

    let muted = get_json(&server, &bob, "/api/muted").await;
    assert_eq!(muted["data"]["room_ids"][0], room_id.as_str());

    let mut bob_ws = connect_ws(&server, &bob).await;
    let mut alice_ws = connect_ws(&server, &alice).await;
    send_frame(
        &mut alice_ws,
        json!({"type": "send_message", "room_id": room_id, "content": "psst"}),
    )
    .await;

    let event = recv_frame(&mut bob_ws, |f| f["body"] == "message_posted").await;
    assert_eq!(event["silent"], true);

    // The sender did not mute, so their echo is loud.
    let echo = recv_frame(&mut alice_ws, |f| f["body"] == "message_posted").await;
    assert_eq!(echo["silent"], false);
}
