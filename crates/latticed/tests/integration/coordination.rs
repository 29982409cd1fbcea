//! Mutex fairness, once fences, and disconnect cleanup.

use std::time::Duration;

use serde_json::json;

use crate::{spawn_hub, spawn_hub_with, HubClient};

#[tokio::test]
async fn mutex_grants_are_fifo_across_connections() {
    let hub = spawn_hub().await;
    let mut a = HubClient::connect(&hub).await;
    let mut b = HubClient::connect(&hub).await;
    let mut c = HubClient::connect(&hub).await;

    a.call("sync.lock", vec![json!("m")]).await.unwrap();

    let b_call = b.start_call("sync.lock", vec![json!("m")]).await;
    // Give b's lock time to enqueue before c arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let c_call = c.start_call("sync.lock", vec![json!("m")]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Neither waiter wakes while a holds the lock.
    assert!(b.try_result(&b_call, Duration::from_millis(200)).await.is_none());
    assert!(c.try_result(&c_call, Duration::from_millis(200)).await.is_none());

    a.call("sync.unlock", vec![json!("m")]).await.unwrap();
    b.try_result(&b_call, Duration::from_secs(5))
        .await
        .expect("b wakes first")
        .unwrap();
    assert!(c.try_result(&c_call, Duration::from_millis(200)).await.is_none());

    b.call("sync.unlock", vec![json!("m")]).await.unwrap();
    c.try_result(&c_call, Duration::from_secs(5))
        .await
        .expect("c wakes second")
        .unwrap();
    c.call("sync.unlock", vec![json!("m")]).await.unwrap();
}

#[tokio::test]
async fn unlock_of_unheld_mutex_fails_loudly() {
    let hub = spawn_hub().await;
    let mut client = HubClient::connect(&hub).await;

    let (error_uri, description) = client
        .call("sync.unlock", vec![json!("never-locked")])
        .await
        .unwrap_err();
    assert_eq!(error_uri, "error.internal");
    assert!(description.contains("not locked"));
}

#[tokio::test]
async fn mutex_aliases_share_the_table() {
    let hub = spawn_hub().await;
    let mut a = HubClient::connect(&hub).await;
    let mut b = HubClient::connect(&hub).await;

    a.call("mutex.lock", vec![json!("m")]).await.unwrap();
    let b_call = b.start_call("sync.lock", vec![json!("m")]).await;
    assert!(b.try_result(&b_call, Duration::from_millis(200)).await.is_none());

    a.call("mutex.unlock", vec![json!("m")]).await.unwrap();
    b.try_result(&b_call, Duration::from_secs(5))
        .await
        .expect("alias unlock frees the same mutex")
        .unwrap();
}

#[tokio::test]
async fn disconnect_releases_locks_and_registry_entries() {
    let hub = spawn_hub().await;

    let mut observer = HubClient::connect(&hub).await;
    observer.subscribe("registry").await;
    observer.next_event("registry").await;

    let mut doomed = HubClient::connect(&hub).await;
    doomed
        .call("register", vec![json!({"type": "worker", "port": "9000"})])
        .await
        .unwrap();
    doomed.call("sync.lock", vec![json!("m")]).await.unwrap();
    observer.next_event("registry").await;

    doomed.close().await;

    // Registry entry disappears…
    let snapshot = observer.next_event("registry").await;
    assert_eq!(snapshot["worker"], json!([]));

    // …and the mutex is free for the next owner.
    let mut next = HubClient::connect(&hub).await;
    let call = next.start_call("sync.lock", vec![json!("m")]).await;
    next.try_result(&call, Duration::from_secs(5))
        .await
        .expect("lock freed by disconnect")
        .unwrap();
}

#[tokio::test]
async fn once_has_exactly_one_winner() {
    let hub = spawn_hub().await;
    let mut a = HubClient::connect(&hub).await;
    let mut b = HubClient::connect(&hub).await;

    // Race two connections into the same fence.
    let a_call = a.start_call("sync.once", vec![json!("bootstrap")]).await;
    let b_call = b.start_call("sync.once", vec![json!("bootstrap")]).await;

    let a_outcome = a
        .try_result(&a_call, Duration::from_secs(5))
        .await
        .expect("a resolves");
    let b_outcome = b
        .try_result(&b_call, Duration::from_secs(5))
        .await
        .expect("b resolves");

    let winners = [&a_outcome, &b_outcome]
        .iter()
        .filter(|outcome| outcome.is_ok())
        .count();
    assert_eq!(winners, 1);
    let loser = if a_outcome.is_ok() { b_outcome } else { a_outcome };
    let (error_uri, description) = loser.unwrap_err();
    assert_eq!(error_uri, "error.already-taken");
    assert_eq!(description, "already taken");
}

#[tokio::test]
async fn once_rearms_after_ttl() {
    let hub = spawn_hub_with(|config| config.coordination.once_ttl_secs = 1).await;
    let mut client = HubClient::connect(&hub).await;

    client.call("sync.once", vec![json!("job")]).await.unwrap();
    assert!(client.call("sync.once", vec![json!("job")]).await.is_err());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    client.call("sync.once", vec![json!("job")]).await.unwrap();
}
