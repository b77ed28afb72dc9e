//! End-to-end orchestrator scenarios against the in-memory cluster backend.

use std::sync::Arc;
use std::time::Duration;

use podbox_core::cluster::{ClusterClient, FakeCluster};
use podbox_core::config::OrchestratorConfig;
use podbox_core::management::{ComputeManager, PresetManager};
use podbox_core::models::{ComputeFilters, ComputePhase, ComputeSpec, PresetSpec};
use podbox_utils::OpCtx;

fn setup() -> (Arc<FakeCluster>, ComputeManager) {
    let fake = Arc::new(FakeCluster::new());
    let config = Arc::new(
        OrchestratorConfig::builder()
            .create_poll_interval(Duration::from_millis(5))
            .create_timeout(Duration::from_millis(250))
            .build(),
    );
    let presets = PresetManager::new(fake.clone(), config.clone());
    let computes = ComputeManager::new(fake.clone(), presets, config);
    (fake, computes)
}

fn compute(compute_id: &str, preset_id: &str) -> ComputeSpec {
    ComputeSpec {
        compute_id: Some(compute_id.to_string()),
        preset_id: preset_id.to_string(),
        ..Default::default()
    }
}

async fn replicas(fake: &FakeCluster, deployment: &str) -> i32 {
    fake.get_deployment(&OpCtx::background(), "default", deployment)
        .await
        .unwrap()
        .unwrap()
        .spec
        .unwrap()
        .replicas
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn end_to_end_web_server_lifecycle() {
    let (fake, manager) = setup();
    let ctx = OpCtx::background();

    // A fresh preset starts with zero replicas.
    let preset = manager
        .presets()
        .create_preset(
            &ctx,
            &PresetSpec::new("web-server", "web server", "nginx:latest"),
        )
        .await
        .unwrap();
    assert_eq!(preset.replicas, 0);
    assert_eq!(preset.deployment_name, "preset-web-server");
    assert_eq!(replicas(&fake, "preset-web-server").await, 0);

    // Creating a compute scales 0 -> 1 and yields a running, addressable instance.
    let created = manager
        .create_compute(&ctx, &compute("c1", "web-server"))
        .await
        .unwrap();
    assert_eq!(replicas(&fake, "preset-web-server").await, 1);
    assert_eq!(created.compute_id, "c1");

    let fetched = manager.get_compute(&ctx, "c1").await.unwrap();
    assert_eq!(fetched.status.phase, ComputePhase::Running);
    assert!(!fetched.pod_ip.clone().unwrap_or_default().is_empty());

    // Deleting scales 1 -> 0 and the identifier stops resolving.
    manager.delete_compute(&ctx, "c1").await.unwrap();
    assert_eq!(replicas(&fake, "preset-web-server").await, 0);
    assert!(manager
        .get_compute(&ctx, "c1")
        .await
        .unwrap_err()
        .is_not_found());

    // With the pool back at zero the preset can go away.
    manager.presets().delete_preset(&ctx, "web-server").await.unwrap();
}

#[test_log::test(tokio::test)]
async fn preset_validation_issues_zero_cluster_calls() {
    let (fake, manager) = setup();
    let ctx = OpCtx::background();

    let mut bad = PresetSpec::new("web-server", "web server", "nginx:latest");
    bad.image.clear();
    let err = manager
        .presets()
        .create_preset(&ctx, &bad)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(fake.total_calls(), 0);
}

#[test_log::test(tokio::test)]
async fn preset_delete_is_refused_while_in_use() {
    let (_fake, manager) = setup();
    let ctx = OpCtx::background();

    manager
        .presets()
        .create_preset(&ctx, &PresetSpec::new("py", "python", "python:3.12"))
        .await
        .unwrap();
    manager.create_compute(&ctx, &compute("c1", "py")).await.unwrap();

    let err = manager
        .presets()
        .delete_preset(&ctx, "py")
        .await
        .unwrap_err();
    assert!(err.is_in_use());

    manager.delete_compute(&ctx, "c1").await.unwrap();
    manager.presets().delete_preset(&ctx, "py").await.unwrap();
}

#[test_log::test(tokio::test)]
async fn create_and_delete_return_replicas_to_baseline() {
    let (fake, manager) = setup();
    let ctx = OpCtx::background();

    manager
        .presets()
        .create_preset(&ctx, &PresetSpec::new("py", "python", "python:3.12"))
        .await
        .unwrap();
    manager.create_compute(&ctx, &compute("c1", "py")).await.unwrap();
    manager.create_compute(&ctx, &compute("c2", "py")).await.unwrap();
    assert_eq!(replicas(&fake, "preset-py").await, 2);

    // One delete steps the pool down by exactly one, leaving the survivor intact.
    manager.delete_compute(&ctx, "c2").await.unwrap();
    assert_eq!(replicas(&fake, "preset-py").await, 1);
    assert!(manager.get_compute(&ctx, "c1").await.is_ok());
}

#[test_log::test(tokio::test)]
async fn list_returns_exactly_the_live_computes_of_a_preset() {
    let (_fake, manager) = setup();
    let ctx = OpCtx::background();

    for preset in ["py", "js"] {
        manager
            .presets()
            .create_preset(&ctx, &PresetSpec::new(preset, preset, "img:latest"))
            .await
            .unwrap();
    }
    manager.create_compute(&ctx, &compute("c1", "py")).await.unwrap();
    manager.create_compute(&ctx, &compute("c2", "py")).await.unwrap();
    manager.create_compute(&ctx, &compute("c3", "js")).await.unwrap();
    manager.delete_compute(&ctx, "c2").await.unwrap();

    let py = manager
        .list_computes(
            &ctx,
            &ComputeFilters {
                preset_id: Some("py".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<_> = py.iter().map(|i| i.compute_id.as_str()).collect();
    assert_eq!(ids, vec!["c1"]);
}

#[test_log::test(tokio::test)]
async fn client_level_deletes_are_idempotent() {
    let (fake, manager) = setup();
    let ctx = OpCtx::background();

    manager
        .presets()
        .create_preset(&ctx, &PresetSpec::new("py", "python", "python:3.12"))
        .await
        .unwrap();
    let info = manager.create_compute(&ctx, &compute("c1", "py")).await.unwrap();

    // Deleting the same pod twice never errors on the second call.
    fake.delete_pod(&ctx, "default", &info.pod_name).await.unwrap();
    fake.delete_pod(&ctx, "default", &info.pod_name).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn wait_for_ready_observes_the_ready_condition() {
    let (fake, manager) = setup();
    let ctx = OpCtx::background();

    manager
        .presets()
        .create_preset(&ctx, &PresetSpec::new("py", "python", "python:3.12"))
        .await
        .unwrap();

    fake.set_auto_ready(false);
    let info = manager.create_compute(&ctx, &compute("c1", "py")).await.unwrap();
    assert!(manager
        .wait_for_ready(&ctx, "c1", Duration::from_millis(40))
        .await
        .unwrap_err()
        .is_timeout());

    fake.set_pod_ready("default", &info.pod_name, true);
    let ready = manager
        .wait_for_ready(&ctx, "c1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(ready.status.ready);
}
