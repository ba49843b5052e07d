//! Adapter conformance against a real S3-compatible bucket.
//!
//! Runs only when `STOREGATE_LIVE_S3_BUCKET` is set, along with
//! `STOREGATE_LIVE_S3_ACCESS_KEY`, `STOREGATE_LIVE_S3_SECRET_KEY` and
//! optionally `STOREGATE_LIVE_S3_ENDPOINT` / `STOREGATE_LIVE_S3_REGION`.

mod conformance;

use std::sync::Arc;

use storegate_common::{
    Credential, CredentialSecret, LogicalPath, ProviderKind, SensitiveString, SourceId,
};
use storegate_storage::{create_default_registry, AdapterConfig, StaticCredentials};

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[tokio::test]
async fn test_live_s3_conformance() {
    let Some(bucket) = env("STOREGATE_LIVE_S3_BUCKET") else {
        eprintln!("STOREGATE_LIVE_S3_BUCKET not set, skipping");
        return;
    };
    let access_key = env("STOREGATE_LIVE_S3_ACCESS_KEY").expect("access key");
    let secret_key = env("STOREGATE_LIVE_S3_SECRET_KEY").expect("secret key");

    let credential = Credential::new(
        CredentialSecret::AccessKey {
            access_key_id: access_key,
            secret_access_key: SensitiveString::new(secret_key),
            session_token: None,
        },
        None,
    );

    let mut settings = serde_json::json!({
        "region": env("STOREGATE_LIVE_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
    });
    if let Some(endpoint) = env("STOREGATE_LIVE_S3_ENDPOINT") {
        settings["endpoint"] = serde_json::Value::String(endpoint);
        settings["path_style"] = serde_json::Value::Bool(true);
    }

    let config = AdapterConfig::new(SourceId::new("live-s3").unwrap(), bucket).with_settings(settings);
    let adapter = create_default_registry()
        .create(
            ProviderKind::S3Compatible,
            &config,
            Arc::new(StaticCredentials::new(credential)),
        )
        .unwrap();

    let root = LogicalPath::parse(&format!("/storegate-conformance-{}", uuid::Uuid::new_v4())).unwrap();
    adapter.create_folder(&root).await.unwrap();
    conformance::run_all(adapter.as_ref(), &root).await;
}
