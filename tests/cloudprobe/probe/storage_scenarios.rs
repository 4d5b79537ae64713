use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::{GaugeVec, Opts};
use reqwest::StatusCode;

use cloudprobe::cloudprobe::config::{CollectorConfig, ProbeConfig};
use cloudprobe::cloudprobe::gc::GarbageCollector;
use cloudprobe::cloudprobe::openstack::ResourceKind;
use cloudprobe::cloudprobe::probe::storage::{self, StorageStage};
use cloudprobe::cloudprobe::probe::{
    Deadline, ProbeContext, ProbeOutcome, ProbeResult, StepRecorder,
};
use cloudprobe::cloudprobe::test_support::{FakeCloud, FakeLogin};

const PAYLOAD: u64 = 200 * 1024 + 3;

fn context(cloud: &FakeCloud) -> ProbeContext {
    ProbeContext {
        provider: cloud.provider(),
        login: FakeLogin::new().login(),
        config: Arc::new(ProbeConfig {
            payload_size: PAYLOAD,
            ..ProbeConfig::default()
        }),
    }
}

async fn object_probe(ctx: &ProbeContext) -> (ProbeResult<()>, Vec<StorageStage>) {
    let timing = GaugeVec::new(Opts::new("timing", "step timestamps"), &["step"])
        .expect("timing gauge");
    let deadline = Deadline::after(Duration::from_secs(59));
    let mut recorder = StepRecorder::new("storage", timing, deadline);
    let result = storage::run(ctx, &mut recorder).await;
    (result, recorder.stages())
}

#[tokio::test]
async fn round_trip_leaves_no_container_behind() {
    let cloud = FakeCloud::new();
    let ctx = context(&cloud);

    let (result, stages) = object_probe(&ctx).await;

    assert!(result.is_ok(), "probe failed: {result:?}");
    assert_eq!(stages, StorageStage::ALL.to_vec());
    assert!(cloud.container_names().is_empty());
    assert_eq!(cloud.called("upload_object"), 1);
    assert_eq!(cloud.called("download_object"), 1);
}

#[tokio::test]
async fn container_and_object_share_the_run_name() {
    let cloud = FakeCloud::new();
    let ctx = context(&cloud);

    let (result, _) = object_probe(&ctx).await;
    assert!(result.is_ok());

    let calls = cloud.calls();
    let container = calls
        .iter()
        .find_map(|call| call.strip_prefix("create_container "))
        .expect("container created");
    assert!(container.starts_with("cloudprobe-"));
    assert!(calls.contains(&format!("upload_object {container}")));
    assert!(calls.contains(&format!("delete_container {container}")));
}

#[tokio::test]
async fn failed_upload_leaves_the_container_to_the_collector() {
    let cloud = FakeCloud::new();
    cloud.fail(
        "upload_object",
        StatusCode::SERVICE_UNAVAILABLE,
        "Service Unavailable",
    );
    let ctx = context(&cloud);

    let (result, stages) = object_probe(&ctx).await;

    let cause = ProbeOutcome::from(result).as_label();
    assert!(cause.starts_with("failed to upload object: "), "{cause}");
    assert_eq!(stages.last(), Some(&StorageStage::ContainerCreated));
    assert_eq!(cloud.container_names().len(), 1);
    assert_eq!(cloud.called("delete_container"), 0);

    let collector = GarbageCollector::new(
        cloud.provider(),
        Arc::new(CollectorConfig::default()),
    );

    let fresh = collector.sweep(Utc::now()).await.expect("sweep");
    assert_eq!(fresh.deleted(ResourceKind::Container), 0);
    assert_eq!(cloud.container_names().len(), 1);

    let later = Utc::now() + chrono::Duration::minutes(16);
    let expired = collector.sweep(later).await.expect("sweep");
    assert_eq!(expired.deleted(ResourceKind::Container), 1);
    assert!(cloud.container_names().is_empty());
}

#[tokio::test]
async fn failed_download_skips_the_remaining_steps() {
    let cloud = FakeCloud::new();
    cloud.fail("download_object", StatusCode::NOT_FOUND, "Not Found");
    let ctx = context(&cloud);

    let (result, stages) = object_probe(&ctx).await;

    let cause = ProbeOutcome::from(result).as_label();
    assert!(cause.starts_with("failed to download object: "), "{cause}");
    assert_eq!(stages.last(), Some(&StorageStage::ObjectUploaded));
    assert_eq!(cloud.called("delete_object"), 0);
}
