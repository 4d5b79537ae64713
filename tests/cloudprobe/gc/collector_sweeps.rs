use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use cloudprobe::cloudprobe::config::CollectorConfig;
use cloudprobe::cloudprobe::gc::GarbageCollector;
use cloudprobe::cloudprobe::naming::RunName;
use cloudprobe::cloudprobe::openstack::{CloudError, ResourceKind};
use cloudprobe::cloudprobe::test_support::FakeCloud;

fn collector(cloud: &FakeCloud) -> GarbageCollector {
    GarbageCollector::new(cloud.provider(), Arc::new(CollectorConfig::default()))
}

fn run_name(at: DateTime<Utc>) -> String {
    RunName::generate_at("cloudprobe", at).to_string()
}

fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now - chrono::Duration::minutes(minutes)
}

#[tokio::test]
async fn expired_resources_of_every_kind_are_deleted() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let old = run_name(minutes_ago(now, 20));
    let fresh = run_name(minutes_ago(now, 1));

    for name in [old.as_str(), fresh.as_str(), "production-db", "cloudprobe-not-a-run"] {
        cloud.seed_server(name, "ACTIVE");
        cloud.seed_security_group(name);
        cloud.seed_keypair(name);
        cloud.seed_floating_ip(name);
        cloud.seed_volume(name, "available");
    }

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    for kind in [
        ResourceKind::Server,
        ResourceKind::SecurityGroup,
        ResourceKind::Keypair,
        ResourceKind::FloatingIp,
        ResourceKind::Volume,
    ] {
        assert_eq!(report.deleted(kind), 1, "{kind:?}");
        assert_eq!(report.failed(kind), 0, "{kind:?}");
    }
    assert!(report.is_complete());

    let survivors = vec![
        "cloudprobe-not-a-run".to_string(),
        fresh.clone(),
        "production-db".to_string(),
    ];
    let sorted = |mut names: Vec<String>| {
        names.sort();
        names
    };
    assert_eq!(sorted(cloud.server_names()), sorted(survivors.clone()));
    assert_eq!(sorted(cloud.security_group_names()), sorted(survivors.clone()));
    assert_eq!(sorted(cloud.keypair_names()), sorted(survivors.clone()));
    assert_eq!(sorted(cloud.floating_ip_descriptions()), sorted(survivors.clone()));
    assert_eq!(sorted(cloud.volume_names()), sorted(survivors));
}

#[tokio::test]
async fn sweeps_run_in_dependency_order() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let old = run_name(minutes_ago(now, 30));
    cloud.seed_server(&old, "ACTIVE");
    cloud.seed_security_group(&old);
    cloud.seed_volume(&old, "available");

    collector(&cloud).sweep(now).await.expect("sweep");

    let listings: Vec<String> = cloud
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("list_"))
        .collect();
    assert_eq!(
        listings,
        vec![
            "list_servers",
            "list_security_groups",
            "list_keypairs",
            "list_floating_ips",
            "list_volumes",
            "list_containers cloudprobe",
        ]
    );
}

#[tokio::test]
async fn volumes_are_deleted_only_when_detached() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let attached = run_name(minutes_ago(now, 20));
    let failed = run_name(minutes_ago(now, 20));
    cloud.seed_volume(&attached, "in-use");
    cloud.seed_volume(&failed, "error");

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Volume), 1);
    assert_eq!(cloud.volume_names(), vec![attached]);
}

#[tokio::test]
async fn in_use_security_groups_are_suppressed_then_retried() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_security_group(&name);
    cloud.mark_in_use(&name);
    let collector = collector(&cloud);

    let first = collector.sweep(now).await.expect("sweep");
    assert_eq!(first.suppressed(ResourceKind::SecurityGroup), 1);
    assert_eq!(first.failed(ResourceKind::SecurityGroup), 0);
    assert!(first.is_complete());
    assert_eq!(cloud.security_group_names(), vec![name.clone()]);

    cloud.release(&name);
    let second = collector.sweep(now).await.expect("sweep");
    assert_eq!(second.deleted(ResourceKind::SecurityGroup), 1);
    assert!(cloud.security_group_names().is_empty());
}

#[tokio::test]
async fn security_group_conflicts_other_than_in_use_are_failures() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_security_group(&name);
    cloud.fail(
        "delete_security_group",
        StatusCode::CONFLICT,
        r#"{"NeutronError": {"type": "QuotaExceeded", "message": "quota"}}"#,
    );

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.suppressed(ResourceKind::SecurityGroup), 0);
    assert_eq!(report.failed(ResourceKind::SecurityGroup), 1);
    assert!(!report.is_complete());
    assert_eq!(cloud.security_group_names(), vec![name]);
}

#[tokio::test]
async fn empty_expired_container_is_deleted() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_container(&name, Some(minutes_ago(now, 20)));
    cloud.seed_container("backups", Some(minutes_ago(now, 600)));

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Container), 1);
    assert_eq!(cloud.container_names(), vec!["backups".to_string()]);
}

#[tokio::test]
async fn container_with_a_fresh_object_is_kept() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_container(&name, Some(minutes_ago(now, 20)));
    cloud.seed_object(&name, "stale", minutes_ago(now, 30));
    cloud.seed_object(&name, "fresh", minutes_ago(now, 2));

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Object), 1);
    assert_eq!(report.deleted(ResourceKind::Container), 0);
    assert_eq!(cloud.object_names(&name), vec!["fresh".to_string()]);
    assert_eq!(cloud.container_names(), vec![name]);
}

#[tokio::test]
async fn container_emptied_by_the_sweep_is_deleted_in_the_same_pass() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_container(&name, Some(minutes_ago(now, 20)));
    cloud.seed_object(&name, &name, minutes_ago(now, 20));

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Object), 1);
    assert_eq!(report.deleted(ResourceKind::Container), 1);
    assert!(cloud.container_names().is_empty());
}

#[tokio::test]
async fn unreadable_object_counts_keep_the_container() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let name = run_name(minutes_ago(now, 20));
    cloud.seed_container(&name, Some(minutes_ago(now, 20)));
    cloud.set_unreadable_counts(true);

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Container), 0);
    assert_eq!(cloud.container_names(), vec![name]);
}

#[tokio::test]
async fn container_without_platform_timestamp_ages_by_name() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let old = run_name(minutes_ago(now, 20));
    let fresh = run_name(minutes_ago(now, 5));
    cloud.seed_container(&old, None);
    cloud.seed_container(&fresh, None);

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Container), 1);
    assert_eq!(cloud.container_names(), vec![fresh]);
}

#[tokio::test]
async fn listing_failures_are_isolated_per_kind() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let old = run_name(minutes_ago(now, 20));
    cloud.seed_server(&old, "ACTIVE");
    cloud.seed_keypair(&old);
    cloud.fail(
        "list_servers",
        StatusCode::INTERNAL_SERVER_ERROR,
        "Unexpected API Error",
    );

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert!(report.tally(ResourceKind::Server).listing_failed);
    assert_eq!(report.deleted(ResourceKind::Keypair), 1);
    assert!(!report.is_complete());
    assert_eq!(cloud.server_names(), vec![old]);
}

#[tokio::test]
async fn deletion_failures_do_not_stop_the_sweep() {
    let cloud = FakeCloud::bare();
    let now = Utc::now();
    let first = run_name(minutes_ago(now, 20));
    let second = run_name(minutes_ago(now, 25));
    cloud.seed_keypair(&first);
    cloud.seed_keypair(&second);
    cloud.fail_times(
        "delete_keypair",
        1,
        StatusCode::INTERNAL_SERVER_ERROR,
        "Unexpected API Error",
    );

    let report = collector(&cloud).sweep(now).await.expect("sweep");

    assert_eq!(report.deleted(ResourceKind::Keypair), 1);
    assert_eq!(report.failed(ResourceKind::Keypair), 1);
    assert_eq!(report.total_failed(), 1);
    assert_eq!(cloud.keypair_names().len(), 1);
}

#[tokio::test]
async fn authentication_failure_aborts_the_sweep() {
    let cloud = FakeCloud::bare();
    cloud.fail_auth("identity returned 401 Unauthorized");

    let err = collector(&cloud).sweep(Utc::now()).await.expect_err("sweep fails");

    assert!(matches!(err, CloudError::Auth(_)));
    assert_eq!(cloud.calls(), vec!["authenticate".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn collector_loop_sweeps_every_interval_until_shutdown() {
    let cloud = FakeCloud::bare();
    let config = CollectorConfig {
        interval: Duration::from_secs(60),
        ..CollectorConfig::default()
    };
    let collector = Arc::new(GarbageCollector::new(cloud.provider(), Arc::new(config)));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(collector.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(150)).await;
    shutdown.cancel();
    task.await.expect("collector task");

    assert_eq!(cloud.called("list_servers"), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_sweeps_are_followed_without_delay() {
    let cloud = FakeCloud::bare();
    cloud.delay("list_servers", Duration::from_secs(90));
    let config = CollectorConfig {
        interval: Duration::from_secs(60),
        ..CollectorConfig::default()
    };
    let collector = Arc::new(GarbageCollector::new(cloud.provider(), Arc::new(config)));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(collector.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(200)).await;
    shutdown.cancel();
    task.await.expect("collector task");

    assert_eq!(cloud.called("list_servers"), 3);
}
