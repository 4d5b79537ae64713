use std::sync::Arc;
use std::time::Duration;

use prometheus::{GaugeVec, Opts};
use reqwest::StatusCode;

use cloudprobe::cloudprobe::config::ProbeConfig;
use cloudprobe::cloudprobe::probe::compute::{self, ComputeStage};
use cloudprobe::cloudprobe::probe::{
    Deadline, ProbeContext, ProbeOutcome, ProbeResult, StepRecorder,
};
use cloudprobe::cloudprobe::test_support::{console_with_host_keys, FakeCloud, FakeLogin};

fn timing() -> GaugeVec {
    GaugeVec::new(Opts::new("timing", "step timestamps"), &["step"]).expect("timing gauge")
}

fn context(cloud: &FakeCloud, login: &FakeLogin) -> ProbeContext {
    ProbeContext {
        provider: cloud.provider(),
        login: login.login(),
        config: Arc::new(ProbeConfig::default()),
    }
}

async fn spawn_probe(
    ctx: &ProbeContext,
    timeout: Duration,
) -> (ProbeResult<()>, Vec<ComputeStage>, GaugeVec) {
    let gauge = timing();
    let mut recorder = StepRecorder::new("compute", gauge.clone(), Deadline::after(timeout));
    let result = compute::run(ctx, &mut recorder).await;
    (result, recorder.stages(), gauge)
}

fn label(result: ProbeResult<()>) -> String {
    ProbeOutcome::from(result).as_label()
}

fn position(calls: &[String], operation: &str) -> usize {
    calls
        .iter()
        .position(|call| call.starts_with(operation))
        .unwrap_or_else(|| panic!("{operation} was never called"))
}

#[tokio::test(start_paused = true)]
async fn successful_spawn_walks_every_stage_and_cleans_up() {
    let cloud = FakeCloud::new();
    cloud.server_statuses(&["BUILD", "BUILD"]);
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, gauge) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert!(result.is_ok(), "probe failed: {result:?}");
    assert_eq!(stages, ComputeStage::ALL.to_vec());
    assert!(gauge.with_label_values(&["end"]).get() >= gauge.with_label_values(&["start"]).get());
    assert_eq!(cloud.resource_count(), 0);

    assert_eq!(login.dial_count(), 1);
    assert_eq!(login.trusted_counts(), vec![1]);
    assert_eq!(login.commands(), vec!["/usr/bin/whoami".to_string()]);
    assert_eq!(login.closed(), 1);
    let target = &login.targets()[0];
    assert_eq!(target.user, "ubuntu");
    assert_eq!(target.address.port(), 22);

    let calls = cloud.calls();
    let order = [
        "delete_server",
        "delete_volume",
        "delete_floating_ip",
        "delete_keypair",
        "delete_security_rule",
        "delete_security_group",
    ]
    .map(|operation| position(&calls, operation));
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{calls:?}");
}

#[tokio::test(start_paused = true)]
async fn missing_image_fails_before_anything_is_created() {
    let cloud = FakeCloud::new();
    cloud.set_images(&[]);
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert_eq!(label(result), "image not found: ubuntu-16.04-x86_64");
    assert_eq!(stages, vec![ComputeStage::Start, ComputeStage::Authenticated]);
    assert_eq!(cloud.called("create_security_group"), 0);
    assert_eq!(cloud.resource_count(), 0);
    assert_eq!(login.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn server_that_never_boots_times_out_and_is_cleaned_up() {
    let cloud = FakeCloud::new();
    cloud.settle_servers_in("BUILD");
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(5)).await;

    assert_eq!(label(result), "timeout during server_active");
    assert_eq!(stages.last(), Some(&ComputeStage::ServerCreateRequested));
    assert_eq!(cloud.resource_count(), 0);
    assert_eq!(cloud.called("delete_server"), 1);
    assert_eq!(cloud.called("delete_security_group"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_rule_creation_releases_only_the_group() {
    let cloud = FakeCloud::new();
    cloud.fail("create_security_rule", StatusCode::FORBIDDEN, "Quota exceeded");
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    let cause = label(result);
    assert!(
        cause.starts_with("failed to create security group rule: "),
        "{cause}"
    );
    assert!(cause.contains("403 Forbidden"), "{cause}");
    assert_eq!(stages.last(), Some(&ComputeStage::SecurityGroupCreated));
    assert_eq!(cloud.called("delete_security_group"), 1);
    for operation in [
        "delete_security_rule",
        "delete_keypair",
        "delete_floating_ip",
        "delete_volume",
        "delete_server",
    ] {
        assert_eq!(cloud.called(operation), 0, "{operation}");
    }
    assert_eq!(cloud.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn server_error_state_reports_the_fault() {
    let cloud = FakeCloud::new();
    cloud.server_statuses(&["BUILD", "ERROR"]);
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, _, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert_eq!(
        label(result),
        "server entered ERROR state: No valid host was found"
    );
    assert_eq!(cloud.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_logins_are_retried_until_the_server_answers() {
    let cloud = FakeCloud::new();
    let login = FakeLogin::new();
    login.refuse_first(3);
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert!(result.is_ok(), "probe failed: {result:?}");
    assert_eq!(stages.last(), Some(&ComputeStage::End));
    assert_eq!(login.dial_count(), 4);
    assert_eq!(login.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn unusable_host_keys_fall_back_to_unpinned_login() {
    let cloud = FakeCloud::new();
    cloud.set_console(&console_with_host_keys(&["ssh-ed25519 not-base64!"]));
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, _, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert!(result.is_ok(), "probe failed: {result:?}");
    assert_eq!(login.trusted_counts(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn console_without_host_keys_times_out() {
    let cloud = FakeCloud::new();
    cloud.set_console("[    0.000000] Linux version 4.4.0\n");
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(10)).await;

    assert_eq!(label(result), "timeout during host_keys_retrieved");
    assert_eq!(stages.last(), Some(&ComputeStage::ConsoleOutputObserved));
    assert_eq!(login.dial_count(), 0);
    assert_eq!(cloud.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_authentication_is_reported_without_side_effects() {
    let cloud = FakeCloud::new();
    cloud.fail_auth("identity returned 401 Unauthorized: bad password");
    let login = FakeLogin::new();
    let ctx = context(&cloud, &login);

    let (result, stages, _) = spawn_probe(&ctx, Duration::from_secs(59)).await;

    assert_eq!(
        label(result),
        "authentication failure: identity returned 401 Unauthorized: bad password"
    );
    assert_eq!(stages, vec![ComputeStage::Start]);
    assert_eq!(cloud.calls(), vec!["authenticate".to_string()]);
}
