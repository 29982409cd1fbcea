//! Session lifecycle over the RPC surface and the sessions topic.

use serde_json::{json, Value};

use crate::{spawn_hub, HubClient};

#[tokio::test]
async fn session_lifecycle_with_topic_events() {
    let hub = spawn_hub().await;

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("sessions").await;
    let initial = observer.next_event("sessions").await;
    assert_eq!(initial["event"], json!("init"));
    assert_eq!(initial["data"], json!([]));

    let mut client = HubClient::connect(&hub).await;
    let api_key = client
        .call("session.new", vec![json!("u1"), json!({"name": "Ada"})])
        .await
        .unwrap();
    let api_key = api_key.as_str().expect("api key is a string").to_string();

    let created = observer.next_event("sessions").await;
    assert_eq!(created["event"], json!("updated"));
    assert_eq!(created["data"]["userId"], json!("u1"));
    // The user blob is part of the creation event.
    assert_eq!(created["data"]["user"], json!({"name": "Ada"}));

    let user_id = client
        .call("session.check", vec![json!(api_key.clone())])
        .await
        .unwrap();
    assert_eq!(user_id, json!("u1"));
    observer.next_event("sessions").await; // the touch

    client
        .call(
            "session.subscribed",
            vec![json!(api_key.clone()), json!("c1"), json!("topic.foo"), json!(42)],
        )
        .await
        .unwrap();

    let updated = observer.next_event("sessions").await;
    assert_eq!(updated["event"], json!("updated"));
    let conn = &updated["data"]["connections"][0];
    assert_eq!(conn["connId"], json!("c1"));
    assert_eq!(conn["subscriptions"]["topic.foo"], json!(42));
    // Subscription churn never re-broadcasts the user blob.
    assert!(updated["data"].get("user").is_none());

    client
        .call(
            "session.unsubscribed",
            vec![json!(api_key.clone()), json!("c1"), json!("topic.foo")],
        )
        .await
        .unwrap();
    let updated = observer.next_event("sessions").await;
    assert_eq!(updated["data"]["connections"], json!([]));

    client
        .call("session.delete", vec![json!(api_key.clone())])
        .await
        .unwrap();
    let deleted = observer.next_event("sessions").await;
    assert_eq!(deleted["event"], json!("deleted"));
    assert_eq!(deleted["data"]["apiKey"], json!(api_key.clone()));

    let (error_uri, _) = client
        .call("session.check", vec![json!(api_key)])
        .await
        .unwrap_err();
    assert_eq!(error_uri, "error.not-found");
}

#[tokio::test]
async fn delete_connection_erases_all_its_subscriptions() {
    let hub = spawn_hub().await;
    let mut client = HubClient::connect(&hub).await;

    let api_key = client
        .call("session.new", vec![json!("u1")])
        .await
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();
    for uri in ["a", "b"] {
        client
            .call(
                "session.subscribed",
                vec![json!(api_key.clone()), json!("c1"), json!(uri), Value::Null],
            )
            .await
            .unwrap();
    }

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("sessions").await;
    let initial = observer.next_event("sessions").await;
    assert_eq!(
        initial["data"][0]["connections"][0]["subscriptions"]
            .as_object()
            .unwrap()
            .len(),
        2
    );

    client
        .call(
            "session.delete-connection",
            vec![json!(api_key.clone()), json!("c1")],
        )
        .await
        .unwrap();
    let updated = observer.next_event("sessions").await;
    assert_eq!(updated["data"]["connections"], json!([]));
}

#[tokio::test]
async fn user_update_two_arg_rewrites_one_arg_purges() {
    let hub = spawn_hub().await;
    let mut client = HubClient::connect(&hub).await;

    let k1 = client
        .call("session.new", vec![json!("u2")])
        .await
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();
    let k2 = client
        .call("session.new", vec![json!("u2")])
        .await
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("sessions").await;
    observer.next_event("sessions").await; // init

    client
        .call(
            "session.user-update",
            vec![json!("u2"), json!({"role": "admin"})],
        )
        .await
        .unwrap();
    for _ in 0..2 {
        let updated = observer.next_event("sessions").await;
        assert_eq!(updated["event"], json!("updated"));
        // The user blob changed, so the event carries it.
        assert_eq!(updated["data"]["user"], json!({"role": "admin"}));
    }

    client
        .call("session.user-update", vec![json!("u2")])
        .await
        .unwrap();
    for _ in 0..2 {
        let deleted = observer.next_event("sessions").await;
        assert_eq!(deleted["event"], json!("deleted"));
    }
    for key in [k1, k2] {
        let (error_uri, _) = client
            .call("session.check", vec![json!(key)])
            .await
            .unwrap_err();
        assert_eq!(error_uri, "error.not-found");
    }
}

#[tokio::test]
async fn task_queue_departure_drops_all_session_connections() {
    let hub = spawn_hub().await;
    let mut client = HubClient::connect(&hub).await;

    let api_key = client
        .call("session.new", vec![json!("u1")])
        .await
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();
    client
        .call(
            "session.subscribed",
            vec![json!(api_key.clone()), json!("c1"), json!("topic.foo"), Value::Null],
        )
        .await
        .unwrap();

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("sessions").await;
    observer.next_event("sessions").await; // init

    // The task router connects, then restarts.
    let queue = HubClient::connect(&hub).await;
    let mut queue = queue;
    queue
        .call("register", vec![json!({"type": "taskQueue"})])
        .await
        .unwrap();
    queue.close().await;

    // Stale subscription state is cleared for every session.
    let updated = observer.next_event("sessions").await;
    assert_eq!(updated["event"], json!("updated"));
    assert_eq!(updated["data"]["connections"], json!([]));
}
