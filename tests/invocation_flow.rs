//! End-to-end invocation flows against the in-memory platform.

use std::collections::HashMap;
use std::time::Duration;

use meridian_sdk::communication::testkit::{FakePlatform, JobScript, StagedValue};
use meridian_sdk::{
    Credential, DataModality, Error, InvocationRequest, JobState, MeridianClient, ModelSignature,
    ParameterSignature, PlatformConfig, RemoteJobState, TransferConfig, TransformError,
};

const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

fn text_model() -> ModelSignature {
    ModelSignature::builder()
        .input(ParameterSignature::builder("Prompt", "utf8").build().unwrap())
        .output(ParameterSignature::builder("Answer", "utf8").build().unwrap())
        .build()
        .unwrap()
}

fn image_model() -> ModelSignature {
    ModelSignature::builder()
        .input(ParameterSignature::builder("Prompt", "utf8").build().unwrap())
        .output(ParameterSignature::builder("Image", "png").build().unwrap())
        .build()
        .unwrap()
}

fn tensor_model() -> ModelSignature {
    ModelSignature::builder()
        .input(
            ParameterSignature::builder("Tensor", "safetensors")
                .build()
                .unwrap(),
        )
        .output(ParameterSignature::builder("Summary", "utf8").build().unwrap())
        .build()
        .unwrap()
}

fn uppercase_echo() -> JobScript {
    JobScript::complete_with(Duration::from_millis(30), |staged| {
        let prompt = staged
            .get("prompt")
            .and_then(|v| String::from_utf8(v.data.clone()).ok())
            .unwrap_or_default();
        HashMap::from([(
            "answer".to_string(),
            StagedValue {
                data_encoding: "utf8".into(),
                data: prompt.to_uppercase().into_bytes(),
            },
        )])
    })
}

async fn connect(platform: &FakePlatform) -> MeridianClient {
    MeridianClient::with_connector(
        PlatformConfig::default(),
        Credential::new("tok"),
        platform.connector(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn prompt_in_image_out() {
    let platform = FakePlatform::new("tok");
    platform.seed_model(
        "orbital-diffusion",
        image_model(),
        JobScript::complete_with(Duration::from_millis(30), |staged| {
            // Bind the output to the staged prompt so the assertion below
            // proves the input actually reached the platform.
            let mut data = PNG_HEADER.to_vec();
            if let Some(prompt) = staged.get("prompt") {
                data.extend_from_slice(&prompt.data);
            }
            HashMap::from([(
                "image".to_string(),
                StagedValue {
                    data_encoding: "png".into(),
                    data,
                },
            )])
        }),
    );
    let client = connect(&platform).await;

    let outputs = client
        .invoke(InvocationRequest::new("orbital-diffusion").input("Prompt", "a cat on Mars"))
        .await
        .unwrap();

    let image = outputs.get("Image").unwrap();
    let mut expected = PNG_HEADER.to_vec();
    expected.extend_from_slice(b"a cat on Mars");
    assert_eq!(image.data, expected);
    assert_eq!(image.data_encoding, "png");
    assert_eq!(image.data_modality, DataModality::Image);
    assert!(image.as_text().is_none());
    assert_eq!(platform.invocation_count(), 1);
}

#[tokio::test]
async fn outputs_are_keyed_by_display_titles() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("shouter", text_model(), uppercase_echo());
    let client = connect(&platform).await;

    let outputs = client
        .invoke(InvocationRequest::new("shouter").input("Prompt", "quiet words"))
        .await
        .unwrap();

    assert_eq!(outputs.titles().collect::<Vec<_>>(), vec!["Answer"]);
    assert_eq!(outputs.get("Answer").unwrap().as_text(), Some("QUIET WORDS"));
    assert!(outputs.get("answer").is_none());
}

#[tokio::test]
async fn unknown_input_never_reaches_the_platform() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("shouter", text_model(), uppercase_echo());
    let client = connect(&platform).await;

    let err = client
        .submit(InvocationRequest::new("shouter").input("Wish", "unknown"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Transform(TransformError::UnknownParameter { .. })
    ));
    assert_eq!(platform.invocation_count(), 0);
}

#[tokio::test]
async fn failed_jobs_report_the_platform_reason() {
    let platform = FakePlatform::new("tok");
    platform.seed_model(
        "flaky",
        text_model(),
        JobScript::fail_after(Duration::from_millis(20), "loss diverged"),
    );
    let client = connect(&platform).await;

    let handle = client
        .submit(InvocationRequest::new("flaky").input("Prompt", "anything"))
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, Error::JobFailure { .. }));
    assert!(err.to_string().contains("loss diverged"));
    assert_eq!(handle.state(), JobState::Failed);
    assert_eq!(
        platform.job_state(handle.job_id()),
        Some(RemoteJobState::Failed)
    );

    // Terminal verdicts are absorbing; a second wait repeats the answer.
    let again = handle.wait().await.unwrap_err();
    assert!(again.to_string().contains("loss diverged"));
}

#[tokio::test]
async fn wait_can_be_repeated_after_success() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("shouter", text_model(), uppercase_echo());
    let client = connect(&platform).await;

    let handle = client
        .submit(InvocationRequest::new("shouter").input("Prompt", "once"))
        .await
        .unwrap();

    let first = handle.wait().await.unwrap();
    let second = handle.wait().await.unwrap();
    assert_eq!(handle.state(), JobState::Succeeded);
    assert_eq!(
        first.get("Answer").unwrap().data,
        second.get("Answer").unwrap().data
    );
}

#[tokio::test]
async fn cancel_resolves_wait_even_when_the_platform_stays_silent() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("stuck", text_model(), JobScript::Never);
    platform.swallow_cancels(true);

    let mut config = PlatformConfig::default();
    config.cancel_grace = Duration::from_millis(200);
    let client = MeridianClient::with_connector(config, Credential::new("tok"), platform.connector())
        .await
        .unwrap();

    let handle = client
        .submit(InvocationRequest::new("stuck").input("Prompt", "forever"))
        .await
        .unwrap();

    handle.cancel().await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(handle.state(), JobState::Cancelled);
    assert_eq!(platform.cancel_count(), 1);
    // The platform never acknowledged, so its own record still runs.
    assert_eq!(
        platform.job_state(handle.job_id()),
        Some(RemoteJobState::Running)
    );

    // Cancelling an already-terminal job is a no-op.
    handle.cancel().await.unwrap();
    assert_eq!(platform.cancel_count(), 1);
}

#[tokio::test]
async fn acknowledged_cancel_stops_the_platform_job() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("stuck", text_model(), JobScript::Never);
    let client = connect(&platform).await;

    let handle = client
        .submit(InvocationRequest::new("stuck").input("Prompt", "forever"))
        .await
        .unwrap();

    handle.cancel().await.unwrap();
    assert!(handle.wait().await.unwrap_err().is_cancelled());
    assert_eq!(
        platform.job_state(handle.job_id()),
        Some(RemoteJobState::Cancelled)
    );
}

#[tokio::test]
async fn per_request_ceiling_times_out_the_wait() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("stuck", text_model(), JobScript::Never);
    let client = connect(&platform).await;

    let handle = client
        .submit(
            InvocationRequest::new("stuck")
                .input("Prompt", "forever")
                .timeout(Duration::from_millis(250)),
        )
        .await
        .unwrap();

    let err = handle.wait().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(handle.state(), JobState::TimedOut);
}

#[tokio::test]
async fn oversized_inputs_travel_chunked() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("embedder", tensor_model(), JobScript::Never);

    let config = PlatformConfig::default()
        .with_transfer(TransferConfig::default().with_chunk_size(2048));
    let client = MeridianClient::with_connector(config, Credential::new("tok"), platform.connector())
        .await
        .unwrap();

    let tensor: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let handle = client
        .submit(InvocationRequest::new("embedder").input("Tensor", tensor.clone()))
        .await
        .unwrap();

    assert_eq!(
        platform.staged_input(handle.job_id(), "tensor"),
        Some(tensor)
    );
    assert_eq!(platform.transfer_count(), 1);
    assert_eq!(platform.chunk_frame_count(), 5);
}

#[tokio::test]
async fn small_inputs_skip_the_transfer_path() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("shouter", text_model(), uppercase_echo());
    let client = connect(&platform).await;

    client
        .invoke(InvocationRequest::new("shouter").input("Prompt", "tiny"))
        .await
        .unwrap();

    assert_eq!(platform.transfer_count(), 0);
}

#[tokio::test]
async fn job_status_works_without_a_live_handle() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("stuck", text_model(), JobScript::Never);
    let client = connect(&platform).await;

    let handle = client
        .submit(InvocationRequest::new("stuck").input("Prompt", "forever"))
        .await
        .unwrap();

    let event = client.job_status(handle.job_id()).await.unwrap();
    assert_eq!(event.job_id, handle.job_id());
    assert_eq!(event.state, RemoteJobState::Running);
}

#[tokio::test]
async fn wrong_credential_is_an_authentication_error() {
    let platform = FakePlatform::new("tok");
    platform.seed_model("shouter", text_model(), uppercase_echo());
    let client = MeridianClient::with_connector(
        PlatformConfig::default(),
        Credential::new("not-the-token"),
        platform.connector(),
    )
    .await
    .unwrap();

    let err = client.describe_model("shouter").await.unwrap_err();
    assert!(err.is_auth());
}
