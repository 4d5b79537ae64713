use std::time::Duration;

use prometheus::{Encoder, Registry};

use cloudprobe::cloudprobe::config::ProbeConfig;
use cloudprobe::cloudprobe::coordinator::ProbeCoordinator;
use cloudprobe::cloudprobe::observability::metrics::ProbeMetrics;
use cloudprobe::cloudprobe::probe::ProbeKind;
use cloudprobe::cloudprobe::test_support::{FakeCloud, FakeLogin};

fn config(request_timeout: Duration) -> ProbeConfig {
    ProbeConfig {
        request_timeout,
        payload_size: 64 * 1024,
        ..ProbeConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn healthy_cloud_scrapes_as_success() {
    let cloud = FakeCloud::new();
    let login = FakeLogin::new();
    let coordinator = ProbeCoordinator::new(
        cloud.provider(),
        login.login(),
        config(Duration::from_secs(59)),
    );

    let body = coordinator.scrape().await.expect("scrape");
    let text = String::from_utf8(body).expect("utf8");

    assert!(text.contains("cloudprobe_spawn_success{error=\"\"} 1"), "{text}");
    assert!(text.contains("cloudprobe_object_store_success{error=\"\"} 1"), "{text}");
    assert!(text.contains("cloudprobe_spawn_timing{step=\"remote_login_verified\"}"));
    assert!(text.contains("cloudprobe_object_store_timing{step=\"container_deleted\"}"));
    assert!(text.contains("cloudprobe_build_info{version="));
    assert_eq!(cloud.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn probes_fail_independently() {
    let cloud = FakeCloud::new();
    cloud.set_images(&[]);
    let login = FakeLogin::new();
    let coordinator = ProbeCoordinator::new(
        cloud.provider(),
        login.login(),
        config(Duration::from_secs(59)),
    );
    let registry = Registry::new();
    let compute = ProbeMetrics::register(&registry, ProbeKind::Compute).expect("register");
    let storage = ProbeMetrics::register(&registry, ProbeKind::Storage).expect("register");

    let report = coordinator.run(&compute, &storage).await;

    assert_eq!(
        report.compute.as_label(),
        "image not found: ubuntu-16.04-x86_64"
    );
    assert!(report.storage.is_success());
}

#[tokio::test(start_paused = true)]
async fn slow_cleanup_is_reported_as_request_timeout_but_still_completes() {
    let cloud = FakeCloud::new();
    cloud.settle_servers_in("BUILD");
    cloud.delay("delete_server", Duration::from_secs(10));
    let login = FakeLogin::new();
    let coordinator = ProbeCoordinator::new(
        cloud.provider(),
        login.login(),
        config(Duration::from_secs(5)),
    );
    let registry = Registry::new();
    let compute = ProbeMetrics::register(&registry, ProbeKind::Compute).expect("register");
    let storage = ProbeMetrics::register(&registry, ProbeKind::Storage).expect("register");

    let report = coordinator.run(&compute, &storage).await;

    assert_eq!(report.compute.as_label(), "request timeout reached");
    assert!(report.storage.is_success());
    assert_eq!(cloud.resource_count(), 0);

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .expect("encode");
    let text = String::from_utf8(buffer).expect("utf8");
    assert!(text.contains("cloudprobe_spawn_success{error=\"request timeout reached\"} 0"));
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_fails_both_probes() {
    let cloud = FakeCloud::new();
    cloud.fail_auth("identity returned 401 Unauthorized");
    let login = FakeLogin::new();
    let coordinator = ProbeCoordinator::new(
        cloud.provider(),
        login.login(),
        config(Duration::from_secs(59)),
    );
    let registry = Registry::new();
    let compute = ProbeMetrics::register(&registry, ProbeKind::Compute).expect("register");
    let storage = ProbeMetrics::register(&registry, ProbeKind::Storage).expect("register");

    let report = coordinator.run(&compute, &storage).await;

    for outcome in [&report.compute, &report.storage] {
        assert_eq!(
            outcome.as_label(),
            "authentication failure: identity returned 401 Unauthorized"
        );
    }
}
