//! Coverage of the pipeline service: config registration, versioned deploys, the
//! single-live-config invariant, and the deletion guards.

use crate::api::test_utils::TestHarness;
use crate::api::{namespaces::DEFAULT_NAMESPACE_ID, pipeline_configs, runs, ApiError};
use gofer_sdk::config::{Pipeline, Task, TaskConfig};
use pretty_assertions::assert_eq;
use std::collections::HashMap;

fn simple_pipeline(id: &str) -> Pipeline {
    Pipeline::new(id, "Test Pipeline").tasks(vec![Task::Custom(TaskConfig::new(
        "task_a",
        "ubuntu:latest",
    ))])
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_is_append_only_and_versions_increment() {
    let harness = TestHarness::new().await;

    let first = harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("versioned"))
        .await
        .unwrap();

    let second = harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("versioned"))
        .await
        .unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert_eq!(first.state, pipeline_configs::ConfigState::Unreleased);

    let configs = harness
        .api
        .list_configs(DEFAULT_NAMESPACE_ID, "versioned", 0, 0)
        .await
        .unwrap();

    assert_eq!(configs.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn deploying_flips_live_and_deprecates_the_previous_config() {
    let harness = TestHarness::new().await;

    harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("flipped"))
        .await
        .unwrap();
    harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("flipped"))
        .await
        .unwrap();

    let deployment = harness
        .api
        .deploy_pipeline(DEFAULT_NAMESPACE_ID, "flipped", 1)
        .await
        .unwrap();

    assert_eq!(deployment.start_version, 0);
    assert_eq!(deployment.end_version, 1);

    let deployment = harness
        .api
        .deploy_pipeline(DEFAULT_NAMESPACE_ID, "flipped", 2)
        .await
        .unwrap();

    assert_eq!(deployment.start_version, 1);
    assert_eq!(deployment.end_version, 2);

    // At most one config is live at any time.
    let configs = harness
        .api
        .list_configs(DEFAULT_NAMESPACE_ID, "flipped", 0, 0)
        .await
        .unwrap();

    let live: Vec<_> = configs
        .iter()
        .filter(|config| config.state == pipeline_configs::ConfigState::Live)
        .collect();

    assert_eq!(live.len(), 1);
    assert_eq!(live.first().unwrap().version, 2);

    let old = configs.iter().find(|config| config.version == 1).unwrap();
    assert_eq!(old.state, pipeline_configs::ConfigState::Deprecated);
    assert!(old.deprecated > 0);

    // Re-deploying the live version is refused.
    let result = harness
        .api
        .deploy_pipeline(DEFAULT_NAMESPACE_ID, "flipped", 2)
        .await
        .unwrap_err();

    assert!(matches!(result, ApiError::FailedPrecondition(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn starting_a_run_requires_a_live_config() {
    let harness = TestHarness::new().await;

    harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("undeployed"))
        .await
        .unwrap();

    let result = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "undeployed",
            runs::Initiator::Human {
                user: "tester".into(),
            },
            HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(result, ApiError::FailedPrecondition(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn namespace_deletion_requires_no_pipelines() {
    let harness = TestHarness::new().await;

    harness
        .api
        .create_namespace("crowded", "Crowded", "")
        .await
        .unwrap();

    harness
        .api
        .register_config("crowded", simple_pipeline("occupant"))
        .await
        .unwrap();

    let result = harness.api.delete_namespace("crowded").await.unwrap_err();
    assert!(matches!(result, ApiError::FailedPrecondition(_)));

    harness
        .api
        .delete_pipeline("crowded", "occupant")
        .await
        .unwrap();

    harness.api.delete_namespace("crowded").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_configs_are_rejected() {
    let harness = TestHarness::new().await;

    // No tasks at all.
    let result = harness
        .api
        .register_config(
            DEFAULT_NAMESPACE_ID,
            Pipeline::new("empty_pipeline", "Empty"),
        )
        .await
        .unwrap_err();
    assert!(matches!(result, ApiError::InvalidArgument(_)));

    // Unknown namespace.
    let result = harness
        .api
        .register_config("ghost_namespace", simple_pipeline("orphaned"))
        .await
        .unwrap_err();
    assert!(matches!(result, ApiError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_validates_hash_expiry_and_disablement() {
    let harness = TestHarness::new().await;

    let (secret, token) = harness
        .api
        .create_token(
            crate::api::tokens::TokenType::Client,
            vec!["default".into()],
            HashMap::new(),
            3600,
        )
        .await
        .unwrap();

    let context = harness.api.authenticate(&secret).await.unwrap();
    assert_eq!(context.token_id, token.id);
    assert!(context.is_allowed_namespace("default"));
    assert!(!context.is_allowed_namespace("other"));

    let result = harness.api.authenticate("not_a_real_token").await.unwrap_err();
    assert!(matches!(result, ApiError::Unauthenticated(_)));

    harness.api.disable_token(&token.id).await.unwrap();
    let result = harness.api.authenticate(&secret).await.unwrap_err();
    assert!(matches!(result, ApiError::Unauthenticated(_)));

    harness.api.enable_token(&token.id).await.unwrap();
    harness.api.authenticate(&secret).await.unwrap();

    // An expired token stops validating even while enabled.
    let (expired_secret, _) = harness
        .api
        .create_token(
            crate::api::tokens::TokenType::Client,
            vec!["default".into()],
            HashMap::new(),
            0,
        )
        .await
        .unwrap();

    let result = harness.api.authenticate(&expired_secret).await.unwrap_err();
    assert!(matches!(result, ApiError::Unauthenticated(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_objects_evict_oldest_past_the_limit() {
    let harness = TestHarness::new().await;

    harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("object_holder"))
        .await
        .unwrap();

    let limit = harness.api.conf.object_store.pipeline_object_limit as usize;

    for i in 0..limit {
        harness
            .api
            .put_pipeline_object(
                DEFAULT_NAMESPACE_ID,
                "object_holder",
                &format!("object_{i:03}"),
                vec![i as u8],
                false,
            )
            .await
            .unwrap();
    }

    // One more pushes the oldest out.
    let evicted = harness
        .api
        .put_pipeline_object(
            DEFAULT_NAMESPACE_ID,
            "object_holder",
            "object_overflow",
            vec![255],
            false,
        )
        .await
        .unwrap();

    assert_eq!(evicted, Some("object_000".to_string()));

    let result = harness
        .api
        .get_pipeline_object(DEFAULT_NAMESPACE_ID, "object_holder", "object_000")
        .await
        .unwrap_err();
    assert!(matches!(result, ApiError::NotFound(_)));

    let value = harness
        .api
        .get_pipeline_object(DEFAULT_NAMESPACE_ID, "object_holder", "object_overflow")
        .await
        .unwrap();
    assert_eq!(value, vec![255]);
}

#[tokio::test(flavor = "multi_thread")]
async fn secret_values_are_write_only_through_the_api() {
    let harness = TestHarness::new().await;

    harness
        .api
        .register_config(DEFAULT_NAMESPACE_ID, simple_pipeline("secretive"))
        .await
        .unwrap();

    harness
        .api
        .put_pipeline_secret(
            DEFAULT_NAMESPACE_ID,
            "secretive",
            "db_password",
            b"hunter2".to_vec(),
            false,
        )
        .await
        .unwrap();

    // The metadata surface never carries the value.
    let secret = harness
        .api
        .get_pipeline_secret(DEFAULT_NAMESPACE_ID, "secretive", "db_password")
        .await
        .unwrap();

    assert_eq!(secret.key, "db_password");
    let serialized = serde_json::to_string(&secret).unwrap();
    assert!(!serialized.contains("hunter2"));

    let listed = harness
        .api
        .list_pipeline_secrets(DEFAULT_NAMESPACE_ID, "secretive")
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    harness
        .api
        .delete_pipeline_secret(DEFAULT_NAMESPACE_ID, "secretive", "db_password")
        .await
        .unwrap();

    let result = harness
        .api
        .get_pipeline_secret(DEFAULT_NAMESPACE_ID, "secretive", "db_password")
        .await
        .unwrap_err();
    assert!(matches!(result, ApiError::NotFound(_)));
}
