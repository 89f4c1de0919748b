mod common;

use bytes::Bytes;
use chrono::Utc;
use common::*;
use rescache_core::{
    CacheError, CacheSettings, CompletionOutcome, Registry, ResourceEvent, ResourceStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_admission_is_fifo_under_cap() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(2);

    let resources: Vec<_> = (0..5)
        .map(|i| registry.download(manual_url(&i.to_string())).unwrap())
        .collect();

    assert_eq!(registry.active_count(), 2);
    assert_eq!(registry.pending_count(), 3);
    assert_eq!(resources[0].status(), ResourceStatus::InProgress);
    assert_eq!(resources[1].status(), ResourceStatus::InProgress);
    for resource in &resources[2..] {
        assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
        assert!(resource.is_queued());
    }

    let mut running: VecDeque<_> = started(&mut rx).into();
    assert_eq!(running.len(), 2);
    let mut order = Vec::new();
    while let Some(transfer) = running.pop_front() {
        order.push(transfer.url().path().to_string());
        complete(transfer, b"x").await;
        assert!(registry.active_count() <= 2);
        running.extend(started(&mut rx));
    }

    assert_eq!(order, vec!["/0", "/1", "/2", "/3", "/4"]);
    for resource in &resources {
        assert_eq!(resource.status(), ResourceStatus::Downloaded);
    }
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn test_queued_requests_start_in_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(1);

    for name in ["a", "b", "c"] {
        registry.download(manual_url(name)).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let mut batch = started(&mut rx);
        assert_eq!(batch.len(), 1);
        let transfer = batch.remove(0);
        seen.push(transfer.url().path().to_string());
        complete(transfer, b"1").await;
    }
    assert_eq!(seen, vec!["/a", "/b", "/c"]);
}

#[tokio::test]
async fn test_download_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let url = manual_url("once");
    registry.download(&url).unwrap();
    registry.download(&url).unwrap();
    let mut transfers = started(&mut rx);
    assert_eq!(transfers.len(), 1);

    complete(transfers.remove(0), b"payload").await;
    registry.download(&url).unwrap();
    assert!(started(&mut rx).is_empty());
    assert_eq!(
        registry.data(&url).await.unwrap(),
        Bytes::from_static(b"payload")
    );
}

#[tokio::test]
async fn test_same_url_yields_same_resource() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;

    let a = registry.resource_for("https://Example.com/x#frag").unwrap();
    let b = registry.resource_for("https://example.com/x").unwrap();
    assert_eq!(a, b);
    assert_eq!(registry.resources().len(), 1);
    assert!(matches!(
        registry.resource_for("::not a url::"),
        Err(CacheError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn test_progress_and_notification_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let resource = registry.resource_for(manual_url("p")).unwrap();
    let recorder = watch(&registry, &resource);
    resource.start().unwrap();

    let mut transfer = started(&mut rx).remove(0);
    transfer.set_expected_length(100);
    transfer.set_content_type("application/octet-stream");
    transfer.append(&[0u8; 30]).await.unwrap();
    assert_eq!(resource.progress(), 0.3);
    transfer.append(&[0u8; 30]).await.unwrap();
    transfer.append(&[0u8; 40]).await.unwrap();
    transfer.finish(Ok(())).await;

    assert_eq!(
        recorder.events(),
        vec![
            "status:in progress",
            "progress:0.30",
            "progress:0.60",
            "progress:1.00",
            "status:downloaded",
            "completed:ok",
        ]
    );
    let info = resource.info();
    assert_eq!(info.progress, 1.0);
    assert_eq!(info.expected_length, 100);
    assert_eq!(info.content_type.as_deref(), Some("application/octet-stream"));
    assert!(info.loaded_date.is_some());
}

#[tokio::test]
async fn test_unknown_length_reports_zero_until_done() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let resource = registry.download(manual_url("u")).unwrap();
    let mut transfer = started(&mut rx).remove(0);
    transfer.append(b"some bytes").await.unwrap();
    assert_eq!(resource.progress(), 0.0);
    assert_eq!(resource.expected_length(), -1);

    transfer.finish(Ok(())).await;
    assert_eq!(resource.progress(), 1.0);
    assert_eq!(resource.expected_length(), 10);
}

#[tokio::test]
async fn test_cancel_is_distinct_from_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy.clone());

    let resource = registry.resource_for(manual_url("c")).unwrap();
    let recorder = watch(&registry, &resource);
    let outcome = outcome_of(&resource);
    resource.start().unwrap();
    let mut transfer = started(&mut rx).remove(0);
    transfer.append(b"partial").await.unwrap();

    resource.cancel();

    assert!(transfer.is_cancelled());
    assert_eq!(strategy.cancelled(), vec![resource.key().clone()]);
    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert!(resource.last_error().is_none());
    assert_eq!(wait(outcome).await, CompletionOutcome::Cancelled);
    assert_eq!(
        recorder.events(),
        vec!["status:in progress", "status:not downloaded", "cancelled"]
    );

    // Late reports from the cancelled attempt are ignored
    transfer.append(b" more").await.unwrap();
    transfer.finish(Ok(())).await;
    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert!(!registry.store().contains(resource.key()).await);
    assert_eq!(recorder.events().len(), 3);
}

#[tokio::test]
async fn test_restart_after_cancel_ignores_old_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let url = manual_url("again");
    registry.download(&url).unwrap();
    let mut old = started(&mut rx).remove(0);
    registry.cancel(&url).unwrap();

    registry.download(&url).unwrap();
    let fresh = started(&mut rx).remove(0);

    old.append(b"stale").await.unwrap();
    old.finish(Ok(())).await;
    assert_eq!(registry.active_count(), 1);

    complete(fresh, b"fresh").await;
    assert_eq!(registry.data(&url).await.unwrap(), Bytes::from_static(b"fresh"));
}

#[tokio::test]
async fn test_cancel_queued_request() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(1);

    registry.download(manual_url("first")).unwrap();
    let queued = registry.download(manual_url("second")).unwrap();
    assert!(queued.is_queued());
    let outcome = outcome_of(&queued);

    queued.cancel();
    assert!(!queued.is_queued());
    assert_eq!(wait(outcome).await, CompletionOutcome::Cancelled);

    complete(started(&mut rx).remove(0), b"1").await;
    assert!(started(&mut rx).is_empty());
    assert_eq!(queued.status(), ResourceStatus::NotDownloaded);
}

#[tokio::test]
async fn test_failure_records_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let resource = registry.resource_for(manual_url("f")).unwrap();
    let recorder = watch(&registry, &resource);
    let outcome = outcome_of(&resource);
    resource.start().unwrap();

    let transfer = started(&mut rx).remove(0);
    let error = CacheError::Network {
        status: None,
        message: "connection reset".to_string(),
    };
    transfer.finish(Err(error.clone())).await;

    assert_eq!(wait(outcome).await, CompletionOutcome::Failed(error.clone()));
    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert_eq!(resource.last_error(), Some(error));
    assert_eq!(
        recorder.events(),
        vec!["status:in progress", "status:not downloaded", "completed:err"]
    );
    assert!(matches!(
        resource.data().await,
        Err(CacheError::NotDownloaded(_))
    ));
}

#[tokio::test]
async fn test_dropped_transfer_fails_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let resource = registry.download(manual_url("dropped")).unwrap();
    drop(started(&mut rx));

    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert!(matches!(resource.last_error(), Some(CacheError::Storage(_))));
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn test_first_registered_strategy_wins() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (first, mut first_rx) = ManualStrategy::new();
    let (second, mut second_rx) = ManualStrategy::new();
    registry.register_strategy(first);
    registry.register_strategy(second);

    registry.download(manual_url("pick")).unwrap();
    assert_eq!(started(&mut first_rx).len(), 1);
    assert!(started(&mut second_rx).is_empty());
}

#[tokio::test]
async fn test_set_data_roundtrip_and_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;

    let resource = registry.resource_for("https://example.com/seed").unwrap();
    let recorder = watch(&registry, &resource);
    resource.set_data(Bytes::from_static(b"seeded bytes")).await.unwrap();

    assert_eq!(resource.status(), ResourceStatus::Downloaded);
    assert_eq!(
        resource.data().await.unwrap(),
        Bytes::from_static(b"seeded bytes")
    );
    assert_eq!(
        recorder.statuses(),
        vec!["status:in progress", "status:downloaded"]
    );

    resource.set_data(Bytes::from_static(b"replaced")).await.unwrap();
    assert_eq!(resource.data().await.unwrap(), Bytes::from_static(b"replaced"));
    assert_eq!(resource.expected_length(), 8);
}

#[tokio::test]
async fn test_set_data_while_in_progress_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);

    let url = manual_url("busy");
    registry.download(&url).unwrap();
    assert!(matches!(
        registry.set_data(&url, Bytes::from_static(b"x")).await,
        Err(CacheError::Busy(_))
    ));
    drop(started(&mut rx));
}

#[tokio::test]
async fn test_encrypted_artifact_differs_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(CacheSettings {
        encryption_key: Some("correct horse".to_string()),
        ..settings(&dir)
    })
    .await
    .unwrap();

    let url = "https://example.com/secret.json";
    let plain = Bytes::from_static(b"{\"token\":\"abc\"}");
    registry.set_data(url, plain.clone()).await.unwrap();

    let resource = registry.resource_for(url).unwrap();
    let raw = std::fs::read(registry.store().artifact_path(resource.key())).unwrap();
    assert_ne!(raw.as_slice(), plain.as_ref());
    assert_eq!(registry.data(url).await.unwrap(), plain);
}

#[tokio::test]
async fn test_remove_then_data_fails() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let url = "https://example.com/gone.png";

    registry.set_data(url, Bytes::from_static(b"png")).await.unwrap();
    let resource = registry.resource_for(url).unwrap();
    let path = registry.store().artifact_path(resource.key());
    assert!(path.exists());

    registry.remove(url).unwrap();
    assert!(!path.exists());
    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert!(matches!(
        registry.data(url).await,
        Err(CacheError::NotDownloaded(_))
    ));
}

#[tokio::test]
async fn test_remove_cancels_running_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy.clone());

    let url = manual_url("rm");
    let resource = registry.download(&url).unwrap();
    let transfer = started(&mut rx).remove(0);

    registry.remove(&url).unwrap();
    assert!(transfer.is_cancelled());
    assert_eq!(strategy.cancelled().len(), 1);
    assert_eq!(resource.status(), ResourceStatus::NotDownloaded);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn test_data_updates_last_access() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let url = "https://example.com/touch";
    registry.set_data(url, Bytes::from_static(b"t")).await.unwrap();

    let before = registry.resource_for(url).unwrap().info().last_access_date.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.data(url).await.unwrap();
    let after = registry.resource_for(url).unwrap().info().last_access_date.unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn test_expiration_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let short = "https://example.com/short";
    let forever = "https://example.com/forever";

    registry.set_data(short, Bytes::from_static(b"s")).await.unwrap();
    registry.set_data(forever, Bytes::from_static(b"f")).await.unwrap();
    registry
        .set_expiration_period(short, Duration::from_secs(1))
        .unwrap();

    let later = Utc::now() + chrono::Duration::seconds(2);
    assert_eq!(registry.sweep_expired_at(later), 1);

    let short_res = registry.resource_for(short).unwrap();
    assert_eq!(short_res.status(), ResourceStatus::NotDownloaded);
    assert!(!registry.store().contains(short_res.key()).await);

    let far_future = Utc::now() + chrono::Duration::days(3650);
    assert_eq!(registry.sweep_expired_at(far_future), 0);
    assert_eq!(registry.data(forever).await.unwrap(), Bytes::from_static(b"f"));
}

#[tokio::test]
async fn test_expired_resource_is_not_served() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let url = "https://example.com/brief";

    registry.set_data(url, Bytes::from_static(b"b")).await.unwrap();
    registry
        .set_expiration_period(url, Duration::from_millis(50))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(matches!(
        registry.data(url).await,
        Err(CacheError::NotDownloaded(_))
    ));
    assert_eq!(
        registry.resource_for(url).unwrap().status(),
        ResourceStatus::NotDownloaded
    );
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy.clone());
    registry.set_max_concurrent_downloads(2);

    let a = registry.download(manual_url("a")).unwrap();
    let b = registry.download(manual_url("b")).unwrap();
    let c = registry.download(manual_url("c")).unwrap();
    let first_round = started(&mut rx);
    assert_eq!(first_round.len(), 2);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    a.add_completion_handler(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    registry.suspend();
    assert!(registry.is_suspended());
    assert!(first_round.iter().all(|t| t.is_cancelled()));
    assert_eq!(strategy.cancelled().len(), 2);
    assert_eq!(a.status(), ResourceStatus::NotDownloaded);
    assert_eq!(b.status(), ResourceStatus::NotDownloaded);
    assert!(a.is_queued() && b.is_queued() && c.is_queued());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let d = registry.download(manual_url("d")).unwrap();
    assert!(d.is_queued());
    assert!(started(&mut rx).is_empty());
    drop(first_round);

    registry.resume();
    let second_round = started(&mut rx);
    let paths: Vec<&str> = second_round.iter().map(|t| t.url().path()).collect();
    assert_eq!(paths, vec!["/a", "/b"]);
    assert_eq!(a.status(), ResourceStatus::InProgress);
    assert_eq!(registry.pending_count(), 2);
}

#[tokio::test]
async fn test_suspend_resume_reaches_same_downloaded_set() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(2);

    let names = ["a", "b", "c", "d"];
    let resources: Vec<_> = names
        .iter()
        .map(|name| registry.download(manual_url(name)).unwrap())
        .collect();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    registry.add_completion_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    registry.suspend();
    drop(started(&mut rx));
    registry.resume();

    let mut finished = Vec::new();
    let mut running: VecDeque<_> = started(&mut rx).into();
    while let Some(transfer) = running.pop_front() {
        finished.push(transfer.url().path().to_string());
        complete(transfer, b"body").await;
        running.extend(started(&mut rx));
    }

    assert_eq!(finished, vec!["/a", "/b", "/c", "/d"]);
    for resource in &resources {
        assert_eq!(resource.status(), ResourceStatus::Downloaded);
        assert_eq!(resource.data().await.unwrap(), Bytes::from_static(b"body"));
    }
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.pending_count(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_with_nothing_left_reports_idle() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let mut events = registry.subscribe();

    registry.suspend();
    registry.resume();

    let mut saw_idle = false;
    while let Ok(event) = events.try_recv() {
        saw_idle |= matches!(event, ResourceEvent::Idle);
    }
    assert!(saw_idle);
}

#[tokio::test]
async fn test_start_rejects_running_or_queued() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(1);

    let first = registry.resource_for(manual_url("first")).unwrap();
    let second = registry.resource_for(manual_url("second")).unwrap();
    first.start().unwrap();
    second.start().unwrap();
    assert_eq!(first.status(), ResourceStatus::InProgress);
    assert!(second.is_queued());

    assert!(matches!(first.start(), Err(CacheError::Busy(_))));
    assert!(matches!(second.start(), Err(CacheError::Busy(_))));

    // Idempotent path stays quiet
    registry.download(manual_url("first")).unwrap();
    registry.download(manual_url("second")).unwrap();
    assert_eq!(registry.active_count(), 1);
    assert_eq!(registry.pending_count(), 1);

    let mut transfers = started(&mut rx);
    assert_eq!(transfers.len(), 1);
    complete(transfers.remove(0), b"1").await;
    complete(started(&mut rx).remove(0), b"2").await;

    first.start().unwrap();
    assert_eq!(first.status(), ResourceStatus::Downloaded);
    assert!(started(&mut rx).is_empty());
}

#[tokio::test]
async fn test_idle_handler_fires_after_batch() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let (strategy, mut rx) = ManualStrategy::new();
    registry.register_strategy(strategy);
    registry.set_max_concurrent_downloads(1);

    registry.download(manual_url("1")).unwrap();
    registry.download(manual_url("2")).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    registry.add_completion_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    complete(started(&mut rx).remove(0), b"1").await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    complete(started(&mut rx).remove(0), b"2").await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Already idle: runs right away, and only once
    let counter = fired.clone();
    registry.add_completion_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_watcher_panic_does_not_block_others() {
    struct Faulty;
    impl rescache_core::ResourceWatcher for Faulty {
        fn status_changed(&self, _resource: &rescache_core::ResourceInfo) {
            panic!("faulty watcher");
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let resource = registry.resource_for("https://example.com/w").unwrap();
    let faulty = registry.register_watcher(Arc::new(Faulty));
    resource.add_watcher(faulty);
    let recorder = watch(&registry, &resource);

    resource.set_data(Bytes::from_static(b"w")).await.unwrap();
    assert_eq!(
        recorder.statuses(),
        vec!["status:in progress", "status:downloaded"]
    );

    registry.remove_watcher_from_all(faulty);
    registry.remove("https://example.com/w").unwrap();
    assert_eq!(recorder.statuses().len(), 3);
}

#[tokio::test]
async fn test_event_stream_mirrors_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir).await;
    let mut events = registry.subscribe();

    registry
        .set_data("https://example.com/e", Bytes::from_static(b"e"))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.url(), Some("https://example.com/e"));
        kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
    }
    assert_eq!(kinds.len(), 3);
}
