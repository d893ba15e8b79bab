//! End-to-end pipeline scenarios driven through the job manager with mock
//! collaborators.

mod common;

use common::{request, TestHarness};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;
use volprov_blockdev::BlockDriver;
use volprov_core::JobStatus;
use volprov_jobstore::{JobRecord, JobStore, RECOVERY_ERROR_MESSAGE};
use volprov_server::jobs::{CANCELLED_MESSAGE, DEADLINE_MESSAGE};

const IMAGE_URL: &str = "http://obj/b/ubuntu.qcow2";
const IMAGE_SIZE: usize = 1_048_576;

fn image_bytes() -> Vec<u8> {
    // Deterministic pseudo-random content so checksums are stable per test.
    (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn cold_download_provisions_and_caches() {
    let harness = TestHarness::new().await;
    let checksum = harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.cache_hit, Some(false));
    assert!(view.error.is_none());
    assert!(view.completed_at.is_some());

    let image_path = harness.cache_root().join("ubuntu");
    assert_eq!(view.image_path.as_deref(), Some(image_path.to_str().unwrap()));
    assert_eq!(
        std::fs::metadata(&image_path).unwrap().len(),
        IMAGE_SIZE as u64
    );
    assert_eq!(
        std::fs::read_to_string(harness.cache_root().join("ubuntu.sha256")).unwrap(),
        checksum
    );

    assert_eq!(harness.volumes.volume_size("vm-1"), Some(10));
    let populated = harness.volumes.populated.lock().unwrap();
    assert_eq!(populated.len(), 1);
    assert_eq!(populated[0].0, "vm-1");
    assert_eq!(populated[0].1, image_path);
}

#[tokio::test]
async fn warm_cache_hit_skips_download() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());

    let first = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    let first_view = harness.wait_terminal(first).await;
    assert_eq!(first_view.status, JobStatus::Completed);

    let streamed_before = harness
        .objects
        .bytes_streamed
        .load(std::sync::atomic::Ordering::SeqCst);

    let second = harness
        .manager
        .submit(request(IMAGE_URL, "vm-2"))
        .await
        .unwrap();
    let second_view = harness.wait_terminal(second).await;

    assert_eq!(second_view.status, JobStatus::Completed);
    assert_eq!(second_view.cache_hit, Some(true));
    assert_eq!(second_view.image_path, first_view.image_path);

    // No new object-store bytes were transferred.
    let streamed_after = harness
        .objects
        .bytes_streamed
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(streamed_before, streamed_after);

    assert_eq!(harness.volumes.volume_size("vm-2"), Some(10));
}

#[tokio::test]
async fn missing_sidecar_falls_back_to_url_keyed_caching() {
    let harness = TestHarness::new().await;
    let data = image_bytes();
    let checksum = volprov_core::checksum::sha256_hex(&data);
    harness.objects.put_object(IMAGE_URL, data);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.cache_hit, Some(false));

    // The checksum was computed locally and committed.
    assert_eq!(
        std::fs::read_to_string(harness.cache_root().join("ubuntu.sha256")).unwrap(),
        checksum
    );

    // A second job for the same URL hits the cache by URL key.
    let second = harness
        .manager
        .submit(request(IMAGE_URL, "vm-2"))
        .await
        .unwrap();
    let second_view = harness.wait_terminal(second).await;
    assert_eq!(second_view.status, JobStatus::Completed);
    assert_eq!(second_view.cache_hit, Some(true));
}

#[tokio::test]
async fn malformed_sidecar_is_treated_as_missing() {
    let harness = TestHarness::new().await;
    harness.objects.put_object(IMAGE_URL, image_bytes());
    harness
        .objects
        .put_object(&format!("{IMAGE_URL}.sha256"), "definitely-not-64-hex");

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Completed);
    // The committed sidecar holds the locally computed digest, not the
    // malformed remote one.
    let committed =
        std::fs::read_to_string(harness.cache_root().join("ubuntu.sha256")).unwrap();
    assert_eq!(committed.len(), 64);
    assert!(committed.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn populate_failure_rolls_back_the_volume() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.volumes.fail_populate(true);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-3"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert!(error.contains("populate volume"), "error was: {error}");
    assert!(error.contains(&job_id.to_string()));
    assert!(error.contains("vm-3"));

    // Rollback removed the volume.
    assert_eq!(harness.volumes.volume_size("vm-3"), None);

    // Failed jobs do not expose cache details.
    assert!(view.cache_hit.is_none());
    assert!(view.image_path.is_none());
}

#[tokio::test]
async fn failed_rollback_chains_both_errors() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.volumes.fail_populate(true);
    harness.volumes.fail_delete(true);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-3"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert!(error.contains("populate volume"), "error was: {error}");
    assert!(error.contains("rollback failed"), "error was: {error}");
}

#[tokio::test]
async fn download_failure_cleans_up_partial_file() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.objects.fail_streams(true);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().contains("download image"));

    assert!(!harness.cache_root().join("ubuntu").exists());
    assert!(!harness.cache_root().join("ubuntu.sha256").exists());
    assert_eq!(harness.volumes.volume_size("vm-1"), None);
}

#[tokio::test]
async fn cancel_mid_download_removes_partial_state() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.objects.hold_streams(true);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-4"))
        .await
        .unwrap();

    // Wait for the stream to reach its hold point mid-download.
    let permit = harness.objects.stream_started.acquire().await.unwrap();
    drop(permit);

    let view = harness.manager.get_status(job_id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Running);
    assert_eq!(
        view.progress.unwrap().stage,
        volprov_core::ProgressStage::Downloading
    );

    harness.manager.cancel(job_id).await.unwrap();
    let view = harness.wait_terminal(job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error.as_deref(), Some(CANCELLED_MESSAGE));

    // No block volume, no partial download, no sidecar.
    assert_eq!(harness.volumes.volume_size("vm-4"), None);
    assert!(!harness.cache_root().join("ubuntu").exists());
    assert!(!harness.cache_root().join("ubuntu.sha256").exists());
}

#[tokio::test]
async fn cancel_is_rejected_for_terminal_and_unknown_jobs() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-1"))
        .await
        .unwrap();
    harness.wait_terminal(job_id).await;

    let err = harness.manager.cancel(job_id).await.unwrap_err();
    assert!(err.to_string().contains("cannot be cancelled"));

    let err = harness.manager.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn deadline_expiry_fails_and_rolls_back() {
    let harness = TestHarness::with_options(2, Duration::from_millis(200)).await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.volumes.hold_populate(true);

    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-5"))
        .await
        .unwrap();

    // The job parks inside populate until the deadline watcher fires.
    let permit = harness.volumes.populate_started.acquire().await.unwrap();
    drop(permit);

    let view = harness.wait_terminal(job_id).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error.as_deref(), Some(DEADLINE_MESSAGE));
    assert_eq!(harness.volumes.volume_size("vm-5"), None);
}

#[tokio::test]
async fn restart_recovery_fails_interrupted_jobs() {
    let harness = TestHarness::new().await;

    // A job left running by a previous daemon process.
    let stale = {
        let now = OffsetDateTime::from_unix_timestamp(
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .unwrap();
        let mut record = JobRecord::pending(Uuid::new_v4(), request(IMAGE_URL, "vm-old"), now);
        record.status = JobStatus::Running;
        record
    };
    harness.store.save(&stale).await.unwrap();

    let swept = harness.manager.recover().await.unwrap();
    assert_eq!(swept, 1);

    // The recovered job is visible through the store fallback.
    let view = harness
        .manager
        .get_status(stale.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error.as_deref(), Some(RECOVERY_ERROR_MESSAGE));

    // New requests are admitted normally after recovery.
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    let job_id = harness
        .manager
        .submit(request(IMAGE_URL, "vm-new"))
        .await
        .unwrap();
    let view = harness.wait_terminal(job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
}

#[tokio::test]
async fn concurrency_ceiling_bounds_running_jobs() {
    let harness = TestHarness::new().await; // P = 2
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());
    harness.volumes.hold_populate(true);

    let mut job_ids = Vec::new();
    for i in 0..5 {
        let job_id = harness
            .manager
            .submit(request(IMAGE_URL, &format!("vm-c{i}")))
            .await
            .unwrap();
        job_ids.push(job_id);
    }

    // Exactly two workers make it into populate; the rest wait on the
    // semaphore while still pending.
    let permits = harness
        .volumes
        .populate_started
        .acquire_many(2)
        .await
        .unwrap();
    drop(permits);

    let mut running = 0;
    let mut pending = 0;
    for job_id in &job_ids {
        match harness
            .manager
            .get_status(*job_id)
            .await
            .unwrap()
            .unwrap()
            .status
        {
            JobStatus::Running => running += 1,
            JobStatus::Pending => pending += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(running, 2);
    assert_eq!(pending, 3);
    assert_eq!(harness.manager.active_jobs(), 5);

    // Release everything and let the queue drain.
    harness.volumes.hold_populate(false);
    harness.volumes.populate_release.add_permits(5);
    for job_id in job_ids {
        let view = harness.wait_terminal(job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
    }
    assert_eq!(harness.volumes.list().await.unwrap().len(), 5);
}

#[tokio::test]
async fn duplicate_volume_names_race_to_a_single_winner() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());

    let first = harness
        .manager
        .submit(request(IMAGE_URL, "vm-dup"))
        .await
        .unwrap();
    let second = harness
        .manager
        .submit(request(IMAGE_URL, "vm-dup"))
        .await
        .unwrap();
    assert_ne!(first, second);

    let outcomes = [
        harness.wait_terminal(first).await,
        harness.wait_terminal(second).await,
    ];
    let completed = outcomes
        .iter()
        .filter(|v| v.status == JobStatus::Completed)
        .count();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|v| v.status == JobStatus::Failed)
        .collect();

    assert_eq!(completed, 1);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_ref().unwrap().contains("already exists"));
    assert_eq!(harness.volumes.volume_size("vm-dup"), Some(10));
}

#[tokio::test]
async fn cleanup_bounds_memory_and_store_fallback_serves_dropped_jobs() {
    let harness = TestHarness::new().await;
    harness.objects.put_with_sidecar(IMAGE_URL, image_bytes());

    let mut job_ids = Vec::new();
    for i in 0..105 {
        let job_id = harness
            .manager
            .submit(request(IMAGE_URL, &format!("vm-m{i}")))
            .await
            .unwrap();
        job_ids.push(job_id);
    }
    for job_id in &job_ids {
        harness.wait_terminal(*job_id).await;
    }

    harness.manager.cleanup_completed();
    assert_eq!(harness.manager.active_jobs(), 0);

    // Every job is still queryable: in memory or through the store.
    for job_id in &job_ids {
        let view = harness.manager.get_status(*job_id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn admission_validation_rejects_without_creating_jobs() {
    let harness = TestHarness::new().await;

    let mut bad = request(IMAGE_URL, "vm-1");
    bad.volume_size_gb = 0;
    let err = harness.manager.submit(bad).await.unwrap_err();
    assert!(err.to_string().contains("volume_size_gb"));

    let mut bad = request("", "");
    bad.volume_size_gb = 0;
    assert!(harness.manager.submit(bad).await.is_err());

    // Nothing was persisted.
    assert_eq!(
        harness
            .store
            .list(volprov_jobstore::JobFilter::default())
            .await
            .unwrap()
            .len(),
        0
    );
    assert_eq!(harness.manager.active_jobs(), 0);
}
