mod common;

use serde_json::json;
use std::time::Duration;

use common::{eventually, fast_settings, harness, harness_with_runner, request, stored, Harness, RecordingRunner};
use rollwatch::error::DeployError;
use rollwatch::models::{Deployment, DeploymentStatus, HistoryFilters, Platform};

/// A Kubernetes deployment that is still rolling out, so it stays in
/// `Deploying` until a rollback takes over.
async fn rolling_out(h: &Harness, generation: i64, replica_sets: usize) -> Deployment {
    h.cluster.set_rollout(3, 1, 0, generation);
    h.cluster.set_replica_sets(replica_sets);
    h.service
        .start_deployment(request("api", Platform::Kubernetes))
        .await
        .unwrap()
}

async fn wait_for_status(h: &Harness, id: &str, status: DeploymentStatus) -> bool {
    let storage = h.storage.clone();
    let id = id.to_string();
    eventually(Duration::from_secs(3), || {
        let storage = storage.clone();
        let id = id.clone();
        async move { stored(&storage, &id).await.status == status }
    })
    .await
}

#[tokio::test]
async fn test_first_revision_cannot_rollback() {
    let h = harness(fast_settings()).await;
    let d = rolling_out(&h, 1, 2).await;

    let err = h
        .service
        .initiate_rollback(&d.id, "bad release", None, None)
        .await
        .unwrap_err();
    match err {
        DeployError::RollbackNotApplicable(reason) => {
            assert_eq!(reason, "no previous revision to rollback to")
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(stored(&h.storage, &d.id).await.status, DeploymentStatus::Deploying);
}

#[tokio::test]
async fn test_single_replica_set_cannot_rollback() {
    let h = harness(fast_settings()).await;
    let d = rolling_out(&h, 3, 1).await;

    let err = h
        .service
        .initiate_rollback(&d.id, "bad release", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::RollbackNotApplicable(reason) if reason == "no previous replicaset found"
    ));
}

#[tokio::test]
async fn test_commands_are_ordered_without_duplicates() {
    let h = harness(fast_settings()).await;
    let d = rolling_out(&h, 3, 2).await;

    let commands = h.service.get_rollback_commands(&d.id, None).await.unwrap();
    let orders: Vec<u32> = commands.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert_eq!(commands[0].command, "kubectl rollout undo deployment/api -n default");
    assert_eq!(
        commands[1].command,
        "kubectl rollout status deployment/api -n default --timeout=5m"
    );
    assert_eq!(
        commands[2].command,
        "kubectl get pods -l app=api,version=v2 -n default"
    );
    assert!(commands.iter().all(|c| c.platform == Platform::Kubernetes));

    // "previous" is the same as no target.
    let previous = h
        .service
        .get_rollback_commands(&d.id, Some("previous"))
        .await
        .unwrap();
    assert_eq!(previous, commands);
    h.service.stop_deployment(&d.id).await.unwrap();
}

#[tokio::test]
async fn test_specific_version_sets_image_and_checks_service() {
    let h = harness(fast_settings()).await;
    h.cluster.set_rollout(3, 1, 0, 3);
    let mut req = request("api", Platform::Kubernetes);
    req.configuration
        .insert("service_name".to_string(), json!("api-svc"));
    req.configuration
        .insert("namespace".to_string(), json!("shop"));
    let d = h.service.start_deployment(req).await.unwrap();

    let commands = h
        .service
        .get_rollback_commands(&d.id, Some("v1"))
        .await
        .unwrap();
    assert_eq!(commands.len(), 4);
    assert_eq!(
        commands[0].command,
        "kubectl set image deployment/api *=*:v1 -n shop"
    );
    assert_eq!(commands[3].order, 4);
    assert_eq!(commands[3].command, "kubectl get endpoints api-svc -n shop");
    h.service.stop_deployment(&d.id).await.unwrap();
}

#[tokio::test]
async fn test_rollback_runs_commands_and_finishes() {
    let h = harness(fast_settings()).await;
    let d = rolling_out(&h, 3, 2).await;

    let rollback = h
        .service
        .initiate_rollback(&d.id, "error rate spiked", None, Some("alice"))
        .await
        .unwrap();
    assert_eq!(rollback.status, DeploymentStatus::RollingBack);
    assert_eq!(rollback.target_version, "previous");
    assert_eq!(rollback.initiated_by, "alice");
    assert!(!h.service.is_reconciling(&d.id));

    assert!(wait_for_status(&h, &d.id, DeploymentStatus::RolledBack).await);

    assert_eq!(
        h.runner.recorded(),
        vec![
            "kubectl rollout undo deployment/api -n default".to_string(),
            "kubectl rollout status deployment/api -n default --timeout=5m".to_string(),
            "kubectl get pods -l app=api,version=v2 -n default".to_string(),
        ]
    );

    let finished = stored(&h.storage, &d.id).await;
    let info = finished.rollback_info.unwrap();
    assert_eq!(info.status, DeploymentStatus::RolledBack);
    assert!(info.completed_at.is_some());
    assert!(finished.end_time.is_some());

    let status = h.service.get_rollback_status(&d.id).await.unwrap();
    assert_eq!(status.status, DeploymentStatus::RolledBack);

    let initiated = h
        .service
        .get_deployment_history(&HistoryFilters {
            deployment_id: Some(d.id.clone()),
            event: Some("rollback_initiated".to_string()),
            ..HistoryFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(initiated.len(), 1);
    assert_eq!(initiated[0].actor.as_deref(), Some("alice"));
    assert_eq!(initiated[0].details["reason"], json!("error rate spiked"));

    // A finished rollback cannot be repeated.
    let again = h
        .service
        .initiate_rollback(&d.id, "again", None, None)
        .await
        .unwrap_err();
    assert!(matches!(again, DeployError::RollbackNotApplicable(_)));
}

#[tokio::test]
async fn test_failed_command_fails_rollback() {
    let h = harness_with_runner(fast_settings(), RecordingRunner::failing_on("rollout status")).await;
    let d = rolling_out(&h, 3, 2).await;

    h.service
        .initiate_rollback(&d.id, "bad release", None, None)
        .await
        .unwrap();
    assert!(wait_for_status(&h, &d.id, DeploymentStatus::Failed).await);

    // Execution stops at the failing step.
    assert_eq!(h.runner.recorded().len(), 2);

    let failed = stored(&h.storage, &d.id).await;
    assert!(failed.error.unwrap().starts_with("rollback failed"));
    let info = failed.rollback_info.unwrap();
    assert_eq!(info.status, DeploymentStatus::Failed);
    assert!(info.completed_at.is_some());
    assert_eq!(info.initiated_by, "system");
}

#[tokio::test]
async fn test_stub_platform_rollback_is_not_applicable() {
    let h = harness(fast_settings()).await;
    let d = h
        .service
        .start_deployment(request("worker", Platform::Docker))
        .await
        .unwrap();

    let err = h
        .service
        .initiate_rollback(&d.id, "manual", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::RollbackNotApplicable(_)));
    assert!(h
        .service
        .get_rollback_commands(&d.id, None)
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        h.service.get_rollback_status(&d.id).await,
        Err(DeployError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_deployment_rollback_is_not_found() {
    let h = harness(fast_settings()).await;
    let err = h
        .service
        .initiate_rollback("missing", "why", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_steps_are_argument_lists() {
    let h = harness(fast_settings()).await;
    h.cluster.set_rollout(3, 1, 0, 3);
    h.cluster.set_replica_sets(2);
    let mut req = request("api", Platform::Kubernetes);
    req.configuration.insert("namespace".to_string(), json!("shop"));
    let d = h.service.start_deployment(req).await.unwrap();

    h.service
        .initiate_rollback(&d.id, "bad image", Some("v1"), None)
        .await
        .unwrap();
    assert!(wait_for_status(&h, &d.id, DeploymentStatus::RolledBack).await);

    let argv = h.runner.argv.lock().unwrap().clone();
    assert_eq!(argv.len(), 3);
    assert!(argv.iter().all(|(program, _)| program == "kubectl"));
    assert_eq!(
        argv[0].1,
        vec!["set", "image", "deployment/api", "*=*:v1", "-n", "shop"]
    );
    assert_eq!(
        argv[2].1,
        vec!["get", "pods", "-l", "app=api,version=v2", "-n", "shop"]
    );
}

#[tokio::test]
async fn test_target_version_must_be_an_image_tag() {
    let h = harness(fast_settings()).await;
    let d = rolling_out(&h, 3, 2).await;

    let injected = "v1; touch /tmp/rollwatch-owned #";
    let err = h
        .service
        .get_rollback_commands(&d.id, Some(injected))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Configuration(_)));

    let err = h
        .service
        .initiate_rollback(&d.id, "bad release", Some(injected), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Configuration(_)));

    // Nothing was planned, run or recorded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.runner.recorded().is_empty());
    assert!(matches!(
        h.service.get_rollback_status(&d.id).await,
        Err(DeployError::NotFound(_))
    ));
    let current = stored(&h.storage, &d.id).await;
    assert_eq!(current.status, DeploymentStatus::Deploying);
    assert!(current.rollback_info.is_none());
    assert!(h.service.is_reconciling(&d.id));
    h.service.stop_deployment(&d.id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_rollbacks_keep_the_winning_plan() {
    let h = harness_with_runner(fast_settings(), RecordingRunner::held()).await;
    let d = rolling_out(&h, 3, 2).await;

    let (first, second) = tokio::join!(
        h.service
            .initiate_rollback(&d.id, "first", Some("v1"), Some("alice")),
        h.service.initiate_rollback(&d.id, "second", None, Some("bob")),
    );
    let (winner, loser) = match (first, second) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        (a, b) => panic!("expected exactly one rollback to start: {:?} / {:?}", a, b),
    };
    assert!(matches!(loser, DeployError::RollbackNotApplicable(_)));

    // The plan reported while the commands run is the one that started.
    let status = h.service.get_rollback_status(&d.id).await.unwrap();
    assert_eq!(status.reason, winner.reason);
    assert_eq!(status.target_version, winner.target_version);
    assert_eq!(status.initiated_by, winner.initiated_by);
    assert_eq!(status.status, DeploymentStatus::RollingBack);

    let recorded = stored(&h.storage, &d.id).await.rollback_info.unwrap();
    assert_eq!(recorded.reason, winner.reason);

    h.runner.release();
    assert!(wait_for_status(&h, &d.id, DeploymentStatus::RolledBack).await);
    let finished = h.service.get_rollback_status(&d.id).await.unwrap();
    assert_eq!(finished.reason, winner.reason);
}
