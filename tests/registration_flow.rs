//! Publishing models: asset uploads, dedupe, and readiness reporting.

use meridian_sdk::communication::testkit::{FakePlatform, JobScript};
use meridian_sdk::{
    AssetState, Credential, Error, MeridianClient, ModelAsset, ModelConfig, ModelConfigError,
    ModelSignature, ParameterSignature, PlatformConfig, TransferConfig,
};

fn styler_signature() -> ModelSignature {
    ModelSignature::builder()
        .input(ParameterSignature::builder("Photo", "jpg").build().unwrap())
        .output(ParameterSignature::builder("Styled", "jpg").build().unwrap())
        .build()
        .unwrap()
}

fn weights(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 17 % 239) as u8).collect()
}

async fn connect(platform: &FakePlatform) -> MeridianClient {
    let config = PlatformConfig::default()
        .with_transfer(TransferConfig::default().with_chunk_size(1024));
    MeridianClient::with_connector(config, Credential::new("tok"), platform.connector())
        .await
        .unwrap()
}

#[tokio::test]
async fn registration_uploads_assets_and_reports_ready() {
    let platform = FakePlatform::new("tok");
    let client = connect(&platform).await;

    let data = weights(5000);
    let config = ModelConfig::new("styler", "1.2.0", styler_signature())
        .describe("Photo restyling")
        .asset(ModelAsset::bytes("weights", data.clone()))
        .asset(ModelAsset::bytes("vocab", b"a b c".to_vec()))
        .asset(ModelAsset::link("base", "https://example.net/base.ckpt"));

    let record = client.register_model(&config).await.unwrap();

    assert_eq!(record.model_name, "styler");
    assert_eq!(record.assets.len(), 3);
    assert!(platform.model_ready("styler"));
    assert_eq!(platform.asset_bytes("styler", "weights"), Some(data));
    assert_eq!(
        platform.asset_bytes("styler", "vocab"),
        Some(b"a b c".to_vec())
    );

    let readiness = client.model_status(record.model_id).await.unwrap();
    assert!(readiness.ready);
    assert!(readiness
        .assets
        .iter()
        .all(|a| a.state == AssetState::Stored));
}

#[tokio::test]
async fn identical_asset_content_uploads_once() {
    let platform = FakePlatform::new("tok");
    let client = connect(&platform).await;

    let data = weights(3000);
    let config = ModelConfig::new("twins", "0.1.0", styler_signature())
        .asset(ModelAsset::bytes("left", data.clone()))
        .asset(ModelAsset::bytes("right", data));

    client.register_model(&config).await.unwrap();

    assert_eq!(platform.skipped_upload_count(), 1);
    assert_eq!(platform.transfer_count(), 1);
    assert!(platform.model_ready("twins"));
}

#[tokio::test]
async fn failed_asset_storage_fails_the_registration() {
    let platform = FakePlatform::new("tok");
    platform.fail_asset("weights");
    let client = connect(&platform).await;

    let config = ModelConfig::new("styler", "1.2.0", styler_signature())
        .asset(ModelAsset::bytes("weights", weights(2000)));

    let err = client.register_model(&config).await.unwrap_err();
    match err {
        Error::RegistrationIncomplete { asset_name, detail } => {
            assert_eq!(asset_name, "weights");
            assert!(detail.contains("storage backend"));
        }
        other => panic!("expected RegistrationIncomplete, got {other:?}"),
    }
    assert!(!platform.model_ready("styler"));
}

#[tokio::test]
async fn invalid_configs_are_rejected_before_any_request() {
    let platform = FakePlatform::new("tok");
    let client = connect(&platform).await;

    let duplicate = ModelConfig::new("styler", "1.0.0", styler_signature())
        .asset(ModelAsset::bytes("weights", vec![1]))
        .asset(ModelAsset::bytes("weights", vec![2]));
    let err = client.register_model(&duplicate).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ModelConfig(ModelConfigError::DuplicateAssetName { .. })
    ));

    let ftp = ModelConfig::new("styler", "1.0.0", styler_signature())
        .asset(ModelAsset::link("base", "ftp://example.net/base.ckpt"));
    let err = client.register_model(&ftp).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ModelConfig(ModelConfigError::InvalidAssetLink { .. })
    ));

    assert_eq!(platform.request_count(), 0);
}

#[tokio::test]
async fn registration_seeds_the_signature_cache() {
    let platform = FakePlatform::new("tok");
    let client = connect(&platform).await;

    let config = ModelConfig::new("styler", "1.2.0", styler_signature())
        .asset(ModelAsset::bytes("weights", weights(100)));
    client.register_model(&config).await.unwrap();

    let before = platform.request_count();
    let signature = client.describe_model("styler").await.unwrap();
    assert!(signature.input("Photo").is_some());
    assert_eq!(platform.request_count(), before);
}

#[tokio::test]
async fn seeded_models_never_mix_with_registered_ones() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("oracle", styler_signature(), JobScript::Never);
    let client = connect(&platform).await;

    let config = ModelConfig::new("styler", "1.2.0", styler_signature())
        .asset(ModelAsset::bytes("weights", weights(100)));
    let record = client.register_model(&config).await.unwrap();

    assert!(platform.model_ready("oracle"));
    assert!(platform.model_ready("styler"));
    assert_ne!(record.model_name, "oracle");
}
