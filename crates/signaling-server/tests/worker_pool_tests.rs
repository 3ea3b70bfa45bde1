//! Worker pool recovery tests.
//!
//! Uses `FlakyEngine` to fail worker creation and `LocalWorker::crash` to
//! simulate a media worker process dying under live rooms.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use signaling_server::actors::registry::REASON_WORKER_DIED;
use signaling_server::actors::{ActorMetrics, RoomEvent, WorkerPoolHandle};
use signaling_server::engine::{Worker, WorkerLogLevel, WorkerSettings};
use signaling_server::errors::ErrorKind;
use signaling_test_utils::{FlakyEngine, TestPeer, TestSfu};
use tokio_util::sync::CancellationToken;

fn settings() -> WorkerSettings {
    WorkerSettings {
        log_level: WorkerLogLevel::None,
        rtc_min_port: 49000,
        rtc_max_port: 49100,
    }
}

/// Let actor tasks process pending notifications.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_initialize_fails_and_closes_started_workers() {
    let engine = Arc::new(FlakyEngine::new());
    engine.fail_spawns_after(1, 1);

    let result = WorkerPoolHandle::initialize(
        engine.clone(),
        3,
        settings(),
        CancellationToken::new(),
        ActorMetrics::new(),
    )
    .await;

    let err = result.err().expect("initialization should fail");
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert_eq!(engine.spawn_attempts(), 2);

    let started = engine.spawned_workers();
    assert_eq!(started.len(), 1);
    assert!(started[0].closed(), "worker started before the failure is closed");
}

#[tokio::test]
async fn test_worker_death_closes_its_rooms_and_replacement_serves_new_rooms() {
    let sfu = TestSfu::builder().workers(1).build().await;
    let mut a = sfu.client();
    a.join("interview", &TestPeer::new("a")).await;

    sfu.engine.spawned_workers()[0].crash();
    settle().await;

    let event = a.next_event().await.expect("room-closed");
    assert_eq!(
        event,
        RoomEvent::RoomClosed {
            room_id: "interview".to_string(),
            reason: REASON_WORKER_DIED.to_string(),
        }
    );
    assert!(a.room_id().is_none());

    let workers = sfu.pool.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, "worker_0");
    assert!(!workers[0].closed);

    // The untagged connection can join again, on the replacement worker
    let joined = a.join("interview", &TestPeer::new("a")).await;
    assert_eq!(joined["roomId"], "interview");
    let stats = a.expect_ok("get-room-stats", json!({})).await;
    assert_eq!(stats["workerId"], "worker_0");
    assert_eq!(stats["isActive"], true);
}

#[tokio::test]
async fn test_failed_replacement_exhausts_pool() {
    let sfu = TestSfu::builder().workers(1).build().await;
    let exhausted = sfu.pool.exhausted_token();
    let mut a = sfu.client();
    a.join("interview", &TestPeer::new("a")).await;

    sfu.engine.fail_next_spawns(1);
    sfu.engine.spawned_workers()[0].crash();

    tokio::time::timeout(Duration::from_secs(1), exhausted.cancelled())
        .await
        .expect("pool should report exhaustion");

    assert!(!sfu.pool.health_check().await);

    let mut b = sfu.client();
    let kind = b
        .expect_err("join-room", json!({"roomId": "another"}))
        .await;
    assert_eq!(kind, "pool-exhausted");
}

#[tokio::test]
async fn test_death_of_one_worker_spares_rooms_on_others() {
    let sfu = TestSfu::builder().workers(2).build().await;
    let mut a = sfu.client();
    let mut b = sfu.client();

    // Round-robin puts the two rooms on different workers
    a.join("first", &TestPeer::new("a")).await;
    b.join("second", &TestPeer::new("b")).await;
    let first = a.expect_ok("get-room-stats", json!({})).await;
    let second = b.expect_ok("get-room-stats", json!({})).await;
    assert_ne!(first["workerId"], second["workerId"]);

    let dead_index = if first["workerId"] == "worker_0" { 0 } else { 1 };
    sfu.engine.spawned_workers()[dead_index].crash();
    settle().await;

    assert!(matches!(
        a.next_event().await,
        Some(RoomEvent::RoomClosed { .. })
    ));
    assert!(b.drain_events().is_empty());
    let stats = b.expect_ok("get-room-stats", json!({})).await;
    assert_eq!(stats["isActive"], true);
}
