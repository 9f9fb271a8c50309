use chrono::Duration;

use super::*;
use crate::testing::Harness;

const CHECKSUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

async fn asset(h: &Harness) -> ContentAsset {
    h.state
        .content
        .register_asset(
            "ops",
            NewContent {
                name: "Spring promo".into(),
                kind: ContentKind::Video,
                url: "https://cdn.example.org/promo.mp4".into(),
                checksum: CHECKSUM.to_uppercase(),
                size_bytes: 4_096,
                duration_secs: Some(30),
            },
        )
        .await
        .unwrap()
}

fn completed(device_id: &str, content_id: i64, checksum: &str) -> SyncReport {
    SyncReport {
        device_id: device_id.into(),
        content_id,
        status: ReportedStatus::Completed,
        progress: Some(100),
        bytes_downloaded: None,
        checksum: Some(checksum.into()),
        error: None,
    }
}

#[tokio::test]
async fn register_asset_validates_and_normalizes() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    assert_eq!(asset.checksum, CHECKSUM);

    let bad = NewContent {
        name: "x".into(),
        kind: ContentKind::Image,
        url: "file:///etc/passwd".into(),
        checksum: CHECKSUM.into(),
        size_bytes: 1,
        duration_secs: None,
    };
    assert!(matches!(
        h.state.content.register_asset("ops", bad).await,
        Err(FleetError::Validation(_))
    ));
}

#[tokio::test]
async fn assign_creates_one_pending_record_per_device() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let a = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    let b = h.register("PI-00000002", "aa:bb:cc:dd:ee:02").await;
    let c = h.register("PI-00000003", "aa:bb:cc:dd:ee:03").await;

    let ids = vec![a.id.clone(), b.id.clone(), c.id.clone(), a.id.clone()];
    let records = h
        .state
        .content
        .assign("ops", asset.id, &ids, Schedule::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SyncStatus::Pending));
    assert_eq!(h.state.content.content_status(asset.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn assign_rejects_unknown_targets_without_partial_writes() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let a = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;

    let ids = vec![a.id.clone(), "missing".to_string()];
    let err = h
        .state
        .content
        .assign("ops", asset.id, &ids, Schedule::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
    assert!(h.state.content.content_status(asset.id).await.unwrap().is_empty());

    let err = h
        .state
        .content
        .assign("ops", 999, &[a.id.clone()], Schedule::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
}

#[tokio::test]
async fn manifest_lists_assigned_content_and_progress_completes() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    let manifest = h.state.content.manifest(&device.id).await.unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].checksum, CHECKSUM);

    let progress = SyncReport {
        device_id: device.id.clone(),
        content_id: asset.id,
        status: ReportedStatus::InProgress,
        progress: Some(40),
        bytes_downloaded: Some(1_600),
        checksum: None,
        error: None,
    };
    let record = h.state.content.report(progress).await.unwrap();
    assert_eq!(record.status, SyncStatus::InProgress);
    assert_eq!(record.progress, 40);

    let record = h
        .state
        .content
        .report(completed(&device.id, asset.id, CHECKSUM))
        .await
        .unwrap();
    assert_eq!(record.status, SyncStatus::Completed);
    assert_eq!(record.bytes_downloaded, 4_096);
    assert!(h.state.content.manifest(&device.id).await.unwrap().is_empty());

    let summary = h.state.content.device_summary(&device.id).await.unwrap();
    assert_eq!((summary.total, summary.downloaded, summary.pending), (1, 1, 0));
    assert_eq!(summary.completion_percent, 100.0);
}

#[tokio::test]
async fn checksum_mismatch_retries_with_backoff_then_fails_permanently() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    // Backoff with the default config: 30s, 60s, 120s
    for (retry, backoff) in [(0, 30), (1, 60), (2, 120)] {
        let record = h
            .state
            .content
            .report(completed(&device.id, asset.id, "deadbeef"))
            .await
            .unwrap();
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.retry_count, retry);
        assert!(record.last_error.as_deref().unwrap_or("").contains("checksum mismatch"));
        assert!(!record.is_permanently_failed());

        // Not due yet: the record stays out of the manifest
        h.advance(Duration::seconds(backoff - 1));
        assert!(h.state.content.manifest(&device.id).await.unwrap().is_empty());

        h.advance(Duration::seconds(1));
        assert_eq!(h.state.content.requeue_due(None).await.unwrap(), 1);
        let manifest = h.state.content.manifest(&device.id).await.unwrap();
        assert_eq!(manifest[0].status, SyncStatus::InProgress);
    }

    let record = h
        .state
        .content
        .report(completed(&device.id, asset.id, "deadbeef"))
        .await
        .unwrap();
    assert_eq!(record.retry_count, 3);
    assert!(record.is_permanently_failed());

    h.advance(Duration::hours(2));
    assert_eq!(h.state.content.requeue_due(None).await.unwrap(), 0);
    let summary = h.state.content.device_summary(&device.id).await.unwrap();
    assert_eq!((summary.failed, summary.pending), (1, 0));

    // Manual retry resets the budget
    let record = h.state.content.retry("ops", &device.id, asset.id).await.unwrap();
    assert_eq!(record.status, SyncStatus::Pending);
    assert_eq!(record.retry_count, 0);
}

#[tokio::test]
async fn manual_retry_requires_permanent_failure() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    let err = h.state.content.retry("ops", &device.id, asset.id).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
}

#[tokio::test]
async fn schedule_window_limits_manifest() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    let now = h.clock.now();
    let schedule = Schedule {
        start: Some(now + Duration::hours(1)),
        end: Some(now + Duration::hours(2)),
    };
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], schedule)
        .await
        .unwrap();

    assert!(h.state.content.manifest(&device.id).await.unwrap().is_empty());
    h.advance(Duration::minutes(90));
    assert_eq!(h.state.content.manifest(&device.id).await.unwrap().len(), 1);
    h.advance(Duration::minutes(30));
    assert!(h.state.content.manifest(&device.id).await.unwrap().is_empty());

    let inverted = Schedule {
        start: schedule.end,
        end: schedule.start,
    };
    assert!(matches!(
        h.state
            .content
            .assign("ops", asset.id, &[device.id.clone()], inverted)
            .await,
        Err(FleetError::Validation(_))
    ));
}

#[tokio::test]
async fn completion_without_checksum_is_rejected() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    let mut report = completed(&device.id, asset.id, CHECKSUM);
    report.checksum = None;
    let err = h.state.content.report(report.clone()).await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));

    report.checksum = Some("  ".into());
    assert!(h.state.content.report(report).await.is_err());

    let record = h.state.content.device_summary(&device.id).await.unwrap().records.remove(0);
    assert_eq!(record.status, SyncStatus::Pending);
}

#[tokio::test]
async fn stale_sync_record_write_is_refused() {
    let h = Harness::new().await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    let pool = &h.state.pool;
    let read = queries_content::get_sync_record(pool, &device.id, asset.id)
        .await
        .unwrap()
        .unwrap();

    let mut first = read.clone();
    first.progress = 10;
    assert!(queries_content::save_sync_record(pool, &first).await.unwrap());

    // Same version as the first writer saw: must lose
    let mut second = read;
    second.progress = 90;
    assert!(!queries_content::save_sync_record(pool, &second).await.unwrap());

    let stored = queries_content::get_sync_record(pool, &device.id, asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.progress, 10);
    assert_eq!(stored.version, first.version + 1);
}

#[tokio::test]
async fn huge_retry_limits_do_not_overflow() {
    let mut config = crate::config::Config::default();
    config.content.retry_base_secs = u64::MAX;
    config.content.retry_max_secs = u64::MAX;
    let h = Harness::with_config(config).await;
    let asset = asset(&h).await;
    let device = h.register("PI-00000001", "aa:bb:cc:dd:ee:01").await;
    h.state
        .content
        .assign("ops", asset.id, &[device.id.clone()], Schedule::default())
        .await
        .unwrap();

    let record = h
        .state
        .content
        .report(completed(&device.id, asset.id, "deadbeef"))
        .await
        .unwrap();
    assert_eq!(record.status, SyncStatus::Failed);
    let due = record.next_retry_at.unwrap();
    let ceiling = Duration::seconds(crate::config::MAX_RETRY_DELAY_SECS as i64);
    assert_eq!(due - h.clock.now(), ceiling);
}
