//! Integration tests for support tickets and their push notifications.

mod common;

use common::{connect_ws, get_json, post_json, recv_frame, register, start_test_server};
use serde_json::json;

#[tokio::test]
async fn tickets_walk_forward_through_statuses() {
    let server = start_test_server().await;
    let admin = register(&server, "admin").await;
    let alice = register(&server, "alice").await;

    let created = post_json(
        &server,
        &alice,
        "/api/tickets",
        json!({"subject": "Cannot join room", "body": "Joining #general 403s."}),
    )
    .await;
    assert_eq!(created["success"], true);
    let ticket_id = created["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["status"], "open");

    // Owners see their own tickets; admins see all of them.
    let own = get_json(&server, &alice, "/api/tickets").await;
    assert_eq!(own["data"]["tickets"].as_array().unwrap().len(), 1);
    let all = get_json(&server, &admin, "/api/tickets").await;
    assert_eq!(all["data"]["tickets"].as_array().unwrap().len(), 1);

    // A non-admin cannot respond.
    let resp = server
        .client
        .put(format!("{}/api/tickets/{}", server.base_url, ticket_id))
        .bearer_auth(&alice.access_token)
        .json(&json!({"status": "closed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let updated = server
        .client
        .put(format!("{}/api/tickets/{}", server.base_url, ticket_id))
        .bearer_auth(&admin.access_token)
        .json(&json!({"status": "in_progress", "response": "Looking into it."}))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 200);

    let closed = server
        .client
        .put(format!("{}/api/tickets/{}", server.base_url, ticket_id))
        .bearer_auth(&admin.access_token)
        .json(&json!({"status": "closed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(closed.status(), 200);

    // Status never walks backwards.
    let reopened = server
        .client
        .put(format!("{}/api/tickets/{}", server.base_url, ticket_id))
        .bearer_auth(&admin.access_token)
        .json(&json!({"status": "open"}))
        .send()
        .await
        .unwrap();
    assert_eq!(reopened.status(), 409);

    let own = get_json(&server, &alice, "/api/tickets").await;
    let ticket = &own["data"]["tickets"][0];
    assert_eq!(ticket["status"], "closed");
    assert_eq!(ticket["response"], "Looking into it.");
}

#[tokio::test]
async fn ticket_updates_push_to_the_owner() {
    let server = start_test_server().await;
    let admin = register(&server, "admin").await;
    let alice = register(&server, "alice").await;

    let mut alice_ws = connect_ws(&server, &alice).await;
    recv_frame(&mut alice_ws, |f| f["type"] == "ready").await;

    let created = post_json(
        &server,
        &alice,
        "/api/tickets",
        json!({"subject": "Question", "body": "How do topics work?"}),
    )
    .await;
    let ticket_id = created["data"]["id"].as_str().unwrap().to_string();

    server
        .client
        .put(format!("{}/api/tickets/{}", server.base_url, ticket_id))
        .bearer_auth(&admin.access_token)
        .json(&json!({"status": "in_progress", "response": "Docs incoming."}))
        .send()
        .await
        .unwrap();

    let update = recv_frame(&mut alice_ws, |f| {
        f["type"] == "ticket_update" && f["status"] == "in_progress"
    })
    .await;
    assert_eq!(update["ticket_id"], ticket_id.as_str());
}
