
use std::collections::BTreeSet;
use std::time::Duration;

use jobmap::error::MapError;
use jobmap::map::WaitOptions;
use jobmap::mapping::MapOptions;
use jobmap::scheduler::ComponentStatus;
use test_harness::{TestEngine, TEST_TIMEOUT};
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_map_outputs_in_input_order() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("echo $(($1 * $1))")
        .map(Some("squares"), (0..5).map(|i| i.to_string()))
        .await
        .unwrap();

    assert_eq!(map.tag(), "squares");
    assert_eq!(map.len().await.unwrap(), 5);
    assert!(!map.is_transient());

    map.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await.unwrap();
    assert!(map.is_done().await.unwrap());
    assert!(!map.is_active().await.unwrap());
    assert_eq!(
        map.outputs(None).await.unwrap(),
        vec!["0", "1", "4", "9", "16"]
    );
    assert_eq!(map.get(3, Some(Duration::ZERO)).await.unwrap(), "9");

    let status = map.status().await.unwrap();
    assert!(status.starts_with("Map squares (5 components): idle = 0 | running = 0"));
    assert!(status.contains("completed = 5"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_starmap_passes_every_argument() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("echo $(($1 + $2))")
        .starmap(None, [["1", "2"], ["10", "20"]])
        .await
        .unwrap();

    let pairs = map.outputs_with_inputs(Some(TEST_TIMEOUT)).await.unwrap();
    assert_eq!(
        pairs,
        vec![
            (vec!["1".to_string(), "2".to_string()], "3".to_string()),
            (vec!["10".to_string(), "20".to_string()], "30".to_string()),
        ]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_component_environment() {
    let harness = TestEngine::new().await;
    let options = MapOptions::default().with_env("GREETING", "hello");
    let map = harness
        .engine
        .mapped_with("echo $GREETING $JOBMAP_COMPONENT $1", options)
        .map(None, ["a", "b"])
        .await
        .unwrap();

    assert_eq!(
        map.outputs(Some(TEST_TIMEOUT)).await.unwrap(),
        vec!["hello 0 a", "hello 1 b"]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_empty_map_is_rejected() {
    let harness = TestEngine::new().await;
    let result = harness
        .engine
        .mapped("echo $1")
        .map(None, Vec::<String>::new())
        .await;
    assert!(matches!(result, Err(MapError::EmptyMap)));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_invalid_tags() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");
    mapped.map(Some("taken"), ["1"]).await.unwrap();

    assert!(matches!(
        mapped.map(Some("taken"), ["1"]).await,
        Err(MapError::TagAlreadyExists(_))
    ));
    assert!(matches!(
        mapped.map(Some("no/slashes"), ["1"]).await,
        Err(MapError::InvalidTag { .. })
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_submits_with_one_tag() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");

    let (first, second) = tokio::join!(
        mapped.map(Some("dup"), ["1"]),
        mapped.map(Some("dup"), ["2"])
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(MapError::TagAlreadyExists(tag)) if tag == "dup")));

    // The losing submit leaves nothing behind
    let mut entries = tokio::fs::read_dir(harness.root.path().join("maps"))
        .await
        .unwrap();
    let mut map_dirs = 0;
    while entries.next_entry().await.unwrap().is_some() {
        map_dirs += 1;
    }
    assert_eq!(map_dirs, 1);

    let winner = results.into_iter().find_map(Result::ok).unwrap();
    assert_eq!(harness.engine.load("dup").await.unwrap(), winner);
    assert_eq!(harness.engine.tags().await.unwrap(), vec!["dup".to_string()]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_load_rejects_invalid_tags() {
    let harness = TestEngine::new().await;

    for tag in ["..", "../maps", ""] {
        assert!(
            matches!(
                harness.engine.load(tag).await,
                Err(MapError::InvalidTag { .. })
            ),
            "{:?}",
            tag
        );
    }
    assert!(matches!(
        harness.engine.load("missing").await,
        Err(MapError::TagNotFound(_))
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unwritable_logs_leave_an_error_outcome() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 1; echo $1")
        .map(None, ["x"])
        .await
        .unwrap();

    // Logs cannot be written once their directory is a plain file
    let job_logs = map.map_dir().join("job_logs");
    tokio::fs::remove_dir_all(&job_logs).await.unwrap();
    tokio::fs::write(&job_logs, b"").await.unwrap();

    match map.get(0, Some(TEST_TIMEOUT)).await {
        Err(MapError::ComponentError {
            component, report, ..
        }) => {
            assert_eq!(component, 0);
            assert!(report.contains("failed to store component result"));
        }
        other => panic!("expected a component error, got {:?}", other),
    }
    let errors = map.errors().await.unwrap();
    assert!(errors[&0].stderr.contains("failed to store component result"));

    // The error outcome on disk keeps the component errored across restarts
    let harness = harness.restart().await;
    let map = harness.engine.load(&map.tag()).await.unwrap();
    assert_eq!(
        map.component_statuses().await.unwrap(),
        vec![ComponentStatus::Errored]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_errored_component() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("if [ $1 = bad ]; then echo oops >&2; exit 3; fi; echo $1")
        .map(Some("mixed"), ["good", "bad"])
        .await
        .unwrap();

    let result = map.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await;
    match result {
        Err(MapError::ComponentError {
            component, report, ..
        }) => {
            assert_eq!(component, 1);
            assert!(report.contains("oops"));
        }
        other => panic!("expected a component error, got {:?}", other),
    }

    map.wait(WaitOptions {
        timeout: Some(TEST_TIMEOUT),
        errors_ok: true,
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(map.get(0, None).await.unwrap(), "good");
    assert!(matches!(
        map.get(1, None).await,
        Err(MapError::ComponentError { component: 1, .. })
    ));
    assert!(matches!(
        map.get_err(0, None).await,
        Err(MapError::ExpectedError { component: 0, .. })
    ));

    let error = map.get_err(1, None).await.unwrap();
    assert_eq!(error.exit_code, Some(3));
    assert_eq!(error.input, vec!["bad".to_string()]);
    assert_eq!(error.stderr.trim(), "oops");

    let errors = map.errors().await.unwrap();
    assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(map.error_reports().await.unwrap().len(), 1);

    let by_status = map.components_by_status().await.unwrap();
    assert_eq!(by_status[&ComponentStatus::Completed], vec![0]);
    assert_eq!(by_status[&ComponentStatus::Errored], vec![1]);
    assert!(!map.is_active().await.unwrap());
    assert!(!map.is_done().await.unwrap());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_get_timeouts_and_range() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 2; echo $1")
        .map(None, ["slow"])
        .await
        .unwrap();

    assert!(matches!(
        map.get(0, Some(Duration::ZERO)).await,
        Err(MapError::OutputNotFound { component: 0, .. })
    ));
    assert!(matches!(
        map.get(0, Some(Duration::from_millis(100))).await,
        Err(MapError::Timeout(..))
    ));
    assert!(matches!(
        map.get(7, None).await,
        Err(MapError::ComponentOutOfRange { component: 7, len: 1, .. })
    ));
    assert!(matches!(
        map.wait(WaitOptions::with_timeout(Duration::from_millis(100)))
            .await,
        Err(MapError::Timeout(..))
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_logs_and_output_files() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("echo out-$1; echo err-$1 >&2; echo data > result.txt")
        .map(None, ["x"])
        .await
        .unwrap();

    assert_eq!(map.stdout(0, Some(TEST_TIMEOUT)).await.unwrap(), "out-x\n");
    assert_eq!(map.stderr(0, Some(TEST_TIMEOUT)).await.unwrap(), "err-x\n");

    let dir = map.output_files(0, Some(TEST_TIMEOUT)).await.unwrap();
    assert_eq!(
        tokio::fs::read_to_string(dir.join("result.txt"))
            .await
            .unwrap(),
        "data\n"
    );

    assert_eq!(map.runtime().await.unwrap().len(), 1);
    assert!(map.local_data().await.unwrap() > 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_as_available_yields_every_output() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep $1; echo $1")
        .map(None, ["1", "0"])
        .await
        .unwrap();

    let results: Vec<(usize, String)> = map
        .as_available(Some(TEST_TIMEOUT))
        .map(|result| result.unwrap())
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    // The component without a sleep finishes first
    assert_eq!(results[0], (1, "0".to_string()));
    assert_eq!(results[1], (0, "1".to_string()));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rerun() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("date +%s%N")
        .map(None, ["a", "b"])
        .await
        .unwrap();
    let first = map.outputs(Some(TEST_TIMEOUT)).await.unwrap();

    map.rerun(Some(&[0][..])).await.unwrap();
    let second = map.outputs(Some(TEST_TIMEOUT)).await.unwrap();
    assert_ne!(first[0], second[0]);
    assert_eq!(first[1], second[1]);

    assert!(matches!(
        map.rerun(Some(&[5][..])).await,
        Err(MapError::CannotRerunComponents(_))
    ));

    map.rerun(None).await.unwrap();
    map.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await.unwrap();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rerun_rejects_unfinished_components() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 5")
        .map(None, ["a"])
        .await
        .unwrap();

    assert!(matches!(
        map.rerun(None).await,
        Err(MapError::CannotRerunComponents(_))
    ));

    map.remove(true).await.unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_retag() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("echo $1")
        .map(None, ["a"])
        .await
        .unwrap();
    assert!(map.is_transient());
    let old_tag = map.tag();

    map.retag("renamed").await.unwrap();
    assert_eq!(map.tag(), "renamed");
    assert!(!map.is_transient());

    let loaded = harness.engine.load("renamed").await.unwrap();
    assert_eq!(loaded, map);
    assert!(matches!(
        harness.engine.load(&old_tag).await,
        Err(MapError::TagNotFound(_))
    ));

    assert!(matches!(
        map.retag("renamed").await,
        Err(MapError::CannotRetagMap(_))
    ));
    assert!(matches!(
        map.retag("bad tag").await,
        Err(MapError::CannotRetagMap(_))
    ));

    // The old tag can be reused right away
    harness
        .engine
        .mapped("echo $1")
        .map(Some(&old_tag), ["b"])
        .await
        .unwrap();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_retags_to_one_tag() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");
    let first = mapped.map(Some("first"), ["1"]).await.unwrap();
    let second = mapped.map(Some("second"), ["2"]).await.unwrap();

    let results = tokio::join!(first.retag("shared"), second.retag("shared"));
    let results = [results.0, results.1];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(MapError::CannotRetagMap(_)))));

    let owner = harness.engine.load("shared").await.unwrap();
    let loser = if owner == first { &second } else { &first };
    assert_ne!(loser.tag(), "shared");
    assert_eq!(harness.engine.load(&loser.tag()).await.unwrap(), *loser);
    assert_eq!(harness.engine.tags().await.unwrap().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_remove() {
    let harness = TestEngine::new().await;
    let map = harness
        .engine
        .mapped("sleep 5")
        .map(Some("doomed"), ["a", "b"])
        .await
        .unwrap();
    let dir = map.map_dir();

    map.remove(false).await.unwrap();

    assert!(!map.exists());
    assert!(!dir.exists());
    assert!(matches!(
        map.status_counts().await,
        Err(MapError::MapWasRemoved(_))
    ));
    assert!(matches!(map.hold().await, Err(MapError::MapWasRemoved(_))));
    assert!(matches!(
        harness.engine.load("doomed").await,
        Err(MapError::TagNotFound(_))
    ));
    assert!(harness.engine.tags().await.unwrap().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_clean_removes_transient_maps() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");
    let transient = mapped.map(None, ["a"]).await.unwrap();
    let kept = mapped.map(Some("kept"), ["b"]).await.unwrap();
    transient
        .wait(WaitOptions::with_timeout(TEST_TIMEOUT))
        .await
        .unwrap();

    let removed = harness.engine.clean(false).await.unwrap();
    assert_eq!(removed, vec![transient.tag()]);
    assert!(!transient.exists());
    assert!(kept.exists());

    let removed = harness.engine.clean(true).await.unwrap();
    assert_eq!(removed, vec!["kept".to_string()]);
    assert!(harness.engine.load_maps().await.unwrap().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_load_maps_sorted_by_tag() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");
    for tag in ["charlie", "alpha", "bravo"] {
        mapped.map(Some(tag), ["x"]).await.unwrap();
    }

    let tags: Vec<String> = harness
        .engine
        .load_maps()
        .await
        .unwrap()
        .iter()
        .map(|map| map.tag())
        .collect();
    assert_eq!(tags, vec!["alpha", "bravo", "charlie"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_maps_survive_restart() {
    let harness = TestEngine::new().await;
    let mapped = harness.engine.mapped("echo $1");
    let done = mapped.map(Some("done"), ["1", "2"]).await.unwrap();
    done.wait(WaitOptions::with_timeout(TEST_TIMEOUT)).await.unwrap();

    let slow = harness
        .engine
        .mapped("sleep 5; echo $1")
        .map(Some("unfinished"), ["3"])
        .await
        .unwrap();
    slow.hold().await.unwrap();

    let harness = harness.restart().await;

    let done = harness.engine.load("done").await.unwrap();
    assert!(done.is_done().await.unwrap());
    assert_eq!(done.outputs(None).await.unwrap(), vec!["1", "2"]);

    let slow = harness.engine.load("unfinished").await.unwrap();
    let statuses: BTreeSet<ComponentStatus> =
        slow.component_statuses().await.unwrap().into_iter().collect();
    assert!(statuses.iter().all(|s| matches!(
        s,
        ComponentStatus::Idle | ComponentStatus::Running
    )));
    slow.remove(true).await.unwrap();

    harness.shutdown().await;
}
