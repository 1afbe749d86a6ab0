
use std::time::Duration;

use jobmap::error::MapError;
use jobmap::map::WaitOptions;
use jobmap::scheduler::{ComponentStatus, HOLD_CODE_START_FAILED, HOLD_CODE_USER};
use test_harness::{assert_eventually, wait_for_status_count, TestEngine, TEST_TIMEOUT};

const SLEEPY_DOUBLE: &str = "sleep 1; echo $(($1 * 2))";

#[tokio::test]
async fn test_hold() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(None, ["1"])
        .await
        .unwrap();

    map.hold().await.unwrap();

    let counts = map.status_counts().await.unwrap();
    assert_eq!(counts[ComponentStatus::Held], 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_release() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(None, ["1"])
        .await
        .unwrap();

    map.hold().await.unwrap();
    assert_eq!(map.status_counts().await.unwrap()[ComponentStatus::Held], 1);

    map.release().await.unwrap();
    assert_eq!(map.status_counts().await.unwrap()[ComponentStatus::Held], 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_held_components_report_user_hold() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(Some("held"), ["1", "2"])
        .await
        .unwrap();

    map.hold().await.unwrap();

    let holds = map.holds().await.unwrap();
    assert_eq!(holds.len(), 2);
    assert!(holds.values().all(|hold| hold.code == HOLD_CODE_USER));

    let report = map.hold_report().await.unwrap();
    assert!(report.contains("Hold Reason"));
    assert!(report.lines().count() >= 4);

    // Held components never become done on their own
    let result = map.wait(WaitOptions::default()).await;
    assert!(matches!(result, Err(MapError::ComponentHeld { .. })));
    map.wait(WaitOptions {
        holds_ok: true,
        ..Default::default()
    })
    .await
    .unwrap();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_release_runs_held_components_to_completion() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(None, ["1", "2", "3"])
        .await
        .unwrap();

    map.hold().await.unwrap();
    map.release().await.unwrap();

    map.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await.unwrap();
    assert_eq!(map.outputs(None).await.unwrap(), vec!["2", "4", "6"]);
    assert!(map.holds().await.unwrap().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hold_kills_running_component() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 2; echo $1")
        .map(None, ["a"])
        .await
        .unwrap();

    assert!(wait_for_status_count(&map, ComponentStatus::Running, 1).await);
    map.hold().await.unwrap();
    assert_eq!(map.status_counts().await.unwrap()[ComponentStatus::Held], 1);

    // The killed attempt must not overwrite the held status
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        map.component_statuses().await.unwrap(),
        vec![ComponentStatus::Held]
    );
    assert!(matches!(
        map.get(0, Some(Duration::ZERO)).await,
        Err(MapError::ComponentHeld { .. })
    ));

    map.release().await.unwrap();
    assert_eq!(map.get(0, Some(TEST_TIMEOUT)).await.unwrap(), "a");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pause_and_resume() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 1; echo $1")
        .map(None, ["x"])
        .await
        .unwrap();

    assert!(wait_for_status_count(&map, ComponentStatus::Running, 1).await);
    map.pause().await.unwrap();
    assert_eq!(
        map.status_counts().await.unwrap()[ComponentStatus::Suspended],
        1
    );

    // A stopped process makes no progress
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        map.component_statuses().await.unwrap(),
        vec![ComponentStatus::Suspended]
    );

    map.resume().await.unwrap();
    assert_eq!(map.status_counts().await.unwrap()[ComponentStatus::Running], 1);
    assert_eq!(map.get(0, Some(TEST_TIMEOUT)).await.unwrap(), "x");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_vacate_requeues_running_components() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 1; echo $1")
        .map(None, ["v"])
        .await
        .unwrap();

    assert!(wait_for_status_count(&map, ComponentStatus::Running, 1).await);
    map.vacate().await.unwrap();

    let status = map.component_statuses().await.unwrap()[0];
    assert!(
        matches!(status, ComponentStatus::Idle | ComponentStatus::Running),
        "unexpected status after vacate: {}",
        status
    );
    assert_eq!(map.get(0, Some(TEST_TIMEOUT)).await.unwrap(), "v");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_actions_on_finished_map_are_noops() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("echo $1")
        .map(None, ["done"])
        .await
        .unwrap();
    map.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await.unwrap();

    map.hold().await.unwrap();
    map.pause().await.unwrap();
    map.vacate().await.unwrap();

    assert!(map.is_done().await.unwrap());
    assert_eq!(map.status_counts().await.unwrap()[ComponentStatus::Held], 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_set_memory_limits_scheduling() {
    let harness = TestEngine::with_config(|config| config.with_slots(4).with_memory_mb(256)).await;
    let map = harness
        .engine
        .mapped("sleep 1; echo $1")
        .map(None, ["1", "2", "3", "4"])
        .await
        .unwrap();
    map.hold().await.unwrap();

    // Only one 200 MB component fits in the 256 MB budget at a time
    map.set_memory(200).await.unwrap();
    map.release().await.unwrap();

    assert!(wait_for_status_count(&map, ComponentStatus::Running, 1).await);
    assert!(map.status_counts().await.unwrap()[ComponentStatus::Running] <= 1);

    let submission: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(map.map_dir().join("submit.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(submission["request_memory_mb"], 200);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_set_disk_persists_request() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(None, ["1", "2"])
        .await
        .unwrap();
    map.hold().await.unwrap();

    map.set_disk(4096).await.unwrap();

    let submission: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(map.map_dir().join("submit.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(submission["request_disk_kb"], 4096);
    assert_eq!(submission["request_memory_mb"], 128);

    map.release().await.unwrap();
    assert_eq!(map.outputs(Some(TEST_TIMEOUT)).await.unwrap(), vec!["2", "4"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_component_that_cannot_start_is_held() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped(SLEEPY_DOUBLE)
        .map(None, ["1"])
        .await
        .unwrap();
    map.hold().await.unwrap();

    // Its working directory cannot be created under a plain file
    let output_files = map.map_dir().join("output_files");
    tokio::fs::remove_dir_all(&output_files).await.unwrap();
    tokio::fs::write(&output_files, b"").await.unwrap();
    map.release().await.unwrap();

    let held = &map;
    assert_eventually(
        move || async move {
            held.holds()
                .await
                .map(|holds| holds.get(&0).map(|hold| hold.code) == Some(HOLD_CODE_START_FAILED))
                .unwrap_or(false)
        },
        TEST_TIMEOUT,
        "component held after failing to start",
    )
    .await;
    assert_eq!(
        map.component_statuses().await.unwrap(),
        vec![ComponentStatus::Held]
    );

    harness.shutdown().await;
}
