//! Bidirectional transformation between caller-facing values and wire payloads.
//!
//! The forward pass maps an [`InvocationRequest`] onto the internal parameters
//! a signature declares; the reverse pass reassembles platform results into
//! display-level outputs. Both passes fail closed: any unknown, duplicate,
//! missing, or ill-typed value aborts the whole invocation before anything is
//! submitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use super::modality::DataModality;
use super::{ModelSignature, ParameterName, ParameterSignature, ReceiveFormat};

/// Errors raised by the forward or reverse transformation.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unknown input parameter `{title}`")]
    UnknownParameter { title: String },

    #[error("input `{title}` was supplied more than once")]
    DuplicateInput { title: String },

    #[error("missing required input `{title}`")]
    MissingRequiredInput { title: String },

    #[error("input `{title}`: {kind} value does not fit the {format} format with encoding `{encoding}`")]
    FormatMismatch {
        title: String,
        format: ReceiveFormat,
        encoding: String,
        kind: &'static str,
    },

    #[error("input `{title}`: source cannot be read: {detail}")]
    UnreadableSource { title: String, detail: String },

    #[error("input `{title}` decomposes into {actual} parts but the signature declares {expected}")]
    ArityMismatch {
        title: String,
        expected: usize,
        actual: usize,
    },

    #[error("result payload is missing internal parameter `{parameter}`")]
    IncompleteResult { parameter: String },
}

/// A caller-supplied value for one display-level input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Inline text, submitted as a primitive.
    Text(String),
    /// Inline number, rendered to its decimal form before submission.
    Number(f64),
    /// Inline binary payload.
    Bytes(Vec<u8>),
    /// Local file staged through the chunked transfer path.
    File(PathBuf),
    /// Remote http(s) object the platform fetches itself.
    Link(String),
    /// Positional decomposition across the parameter's internal slots.
    Many(Vec<InputValue>),
}

impl InputValue {
    /// Classify a raw string: http(s) URLs become links, strings naming an
    /// existing or path-shaped location become files, everything else text.
    /// A path-shaped string that does not exist is still classified as a
    /// file so the failure carries the parameter it was bound to.
    pub fn detect(raw: &str) -> Self {
        if let Ok(url) = Url::parse(raw) {
            if matches!(url.scheme(), "http" | "https") {
                return Self::Link(raw.to_string());
            }
        }
        let path = Path::new(raw);
        if path.exists()
            || raw.starts_with('/')
            || raw.starts_with("./")
            || raw.starts_with("../")
            || raw.starts_with("~/")
        {
            return Self::File(path.to_path_buf());
        }
        Self::Text(raw.to_string())
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "numeric",
            Self::Bytes(_) => "binary",
            Self::File(_) => "file",
            Self::Link(_) => "link",
            Self::Many(_) => "composite",
        }
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for InputValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<Vec<u8>> for InputValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&Path> for InputValue {
    fn from(value: &Path) -> Self {
        Self::File(value.to_path_buf())
    }
}

impl From<PathBuf> for InputValue {
    fn from(value: PathBuf) -> Self {
        Self::File(value)
    }
}

/// What to run and with which inputs.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    model_name: String,
    inputs: Vec<(String, InputValue)>,
    ceiling: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            inputs: Vec::new(),
            ceiling: None,
        }
    }

    /// Bind a value to a display-level input title.
    pub fn input(mut self, title: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.push((title.into(), value.into()));
        self
    }

    /// Override the per-invocation completion ceiling.
    pub fn timeout(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub(crate) fn entries(&self) -> &[(String, InputValue)] {
        &self.inputs
    }

    pub(crate) fn ceiling(&self) -> Option<Duration> {
        self.ceiling
    }
}

/// One wire-level submission produced by the forward pass.
#[derive(Debug, Clone)]
pub(crate) struct PayloadEntry {
    pub parameter: ParameterName,
    pub data_encoding: String,
    pub data: PayloadData,
}

#[derive(Debug, Clone)]
pub(crate) enum PayloadData {
    Inline(Vec<u8>),
    File { path: PathBuf, size: u64 },
    Link(Url),
}

/// Raw per-parameter results returned by the platform.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResultPayload {
    entries: HashMap<ParameterName, TaggedBytes>,
}

impl ResultPayload {
    pub(crate) fn insert(&mut self, parameter: ParameterName, value: TaggedBytes) {
        self.entries.insert(parameter, value);
    }

    fn get(&self, parameter: &ParameterName) -> Option<&TaggedBytes> {
        self.entries.get(parameter)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TaggedBytes {
    pub data: Vec<u8>,
    pub data_encoding: String,
}

/// Display-level outputs of a finished invocation, in declared order.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutputs {
    entries: Vec<OutputEntry>,
}

#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub display_title: String,
    pub value: OutputValue,
}

#[derive(Debug, Clone)]
pub struct OutputValue {
    pub data: Vec<u8>,
    pub data_encoding: String,
    pub data_modality: DataModality,
}

impl OutputValue {
    /// The output bytes as UTF-8 text, when they are valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

impl InvocationOutputs {
    pub fn get(&self, display_title: &str) -> Option<&OutputValue> {
        self.entries
            .iter()
            .find(|e| e.display_title == display_title)
            .map(|e| &e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputEntry> {
        self.entries.iter()
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.display_title.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, display_title: String, value: OutputValue) {
        self.entries.push(OutputEntry {
            display_title,
            value,
        });
    }
}

/// Forward pass: bind caller inputs to the signature and produce the
/// wire-level payload entries to submit, or fail before anything is sent.
pub(crate) fn forward(
    signature: &ModelSignature,
    request: &InvocationRequest,
) -> Result<Vec<PayloadEntry>, TransformError> {
    let mut bound: HashMap<&str, &InputValue> = HashMap::new();
    for (title, value) in request.entries() {
        if signature.input(title).is_none() {
            return Err(TransformError::UnknownParameter {
                title: title.clone(),
            });
        }
        if bound.insert(title.as_str(), value).is_some() {
            return Err(TransformError::DuplicateInput {
                title: title.clone(),
            });
        }
    }

    let mut payload = Vec::new();
    for declared in &signature.inputs {
        match bound.get(declared.display_title.as_str()) {
            Some(value) => decompose(declared, value, &mut payload)?,
            None => match &declared.default_value {
                Some(default) if declared.receive_format == ReceiveFormat::Primitive => {
                    let substituted = InputValue::Text(default.clone());
                    decompose(declared, &substituted, &mut payload)?;
                }
                _ => {
                    return Err(TransformError::MissingRequiredInput {
                        title: declared.display_title.clone(),
                    })
                }
            },
        }
    }
    Ok(payload)
}

fn decompose(
    declared: &ParameterSignature,
    value: &InputValue,
    payload: &mut Vec<PayloadEntry>,
) -> Result<(), TransformError> {
    let arity = declared.parameters.len();
    match value {
        InputValue::Many(parts) => {
            // Positional: part k feeds internal parameter k, exactly.
            if parts.len() != arity {
                return Err(TransformError::ArityMismatch {
                    title: declared.display_title.clone(),
                    expected: arity,
                    actual: parts.len(),
                });
            }
            for (part, internal) in parts.iter().zip(&declared.parameters) {
                payload.push(resolve_leaf(declared, internal, part)?);
            }
        }
        single if arity == 1 => {
            payload.push(resolve_leaf(declared, &declared.parameters[0], single)?);
        }
        single => {
            // One value against a multi-slot parameter replicates it.
            for internal in &declared.parameters {
                payload.push(resolve_leaf(declared, internal, single)?);
            }
        }
    }
    Ok(())
}

fn resolve_leaf(
    declared: &ParameterSignature,
    internal: &super::InternalParameter,
    value: &InputValue,
) -> Result<PayloadEntry, TransformError> {
    let mismatch = |kind: &'static str| TransformError::FormatMismatch {
        title: declared.display_title.clone(),
        format: declared.receive_format,
        encoding: declared.data_encoding.clone(),
        kind,
    };
    let data = match declared.receive_format {
        ReceiveFormat::Primitive => {
            if !declared.modality().is_text_like() {
                return Err(mismatch(value.kind_name()));
            }
            match value {
                InputValue::Text(text) => PayloadData::Inline(text.clone().into_bytes()),
                InputValue::Number(number) => {
                    PayloadData::Inline(render_number(*number).into_bytes())
                }
                InputValue::Many(parts) => {
                    return Err(TransformError::ArityMismatch {
                        title: declared.display_title.clone(),
                        expected: 1,
                        actual: parts.len(),
                    })
                }
                other => return Err(mismatch(other.kind_name())),
            }
        }
        ReceiveFormat::File => match value {
            InputValue::Bytes(bytes) => PayloadData::Inline(bytes.clone()),
            InputValue::File(path) => {
                let metadata = std::fs::metadata(path).map_err(|err| {
                    TransformError::UnreadableSource {
                        title: declared.display_title.clone(),
                        detail: format!("{}: {err}", path.display()),
                    }
                })?;
                if !metadata.is_file() {
                    return Err(TransformError::UnreadableSource {
                        title: declared.display_title.clone(),
                        detail: format!("{} is not a regular file", path.display()),
                    });
                }
                PayloadData::File {
                    path: path.clone(),
                    size: metadata.len(),
                }
            }
            InputValue::Link(raw) => {
                let url = Url::parse(raw)
                    .ok()
                    .filter(|u| matches!(u.scheme(), "http" | "https"))
                    .ok_or_else(|| TransformError::UnreadableSource {
                        title: declared.display_title.clone(),
                        detail: format!("`{raw}` is not an http(s) link"),
                    })?;
                PayloadData::Link(url)
            }
            InputValue::Many(parts) => {
                return Err(TransformError::ArityMismatch {
                    title: declared.display_title.clone(),
                    expected: 1,
                    actual: parts.len(),
                })
            }
            other => return Err(mismatch(other.kind_name())),
        },
    };
    Ok(PayloadEntry {
        parameter: internal.name.clone(),
        data_encoding: internal.data_encoding.clone(),
        data,
    })
}

/// Integral values render without a trailing `.0` so primitive integer
/// parameters receive the form the platform expects.
fn render_number(number: f64) -> String {
    if number.is_finite() && number == number.trunc() && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{number}")
    }
}

/// Reverse pass: reassemble per-parameter results into display-level outputs
/// in declared order, concatenating multi-slot parameters.
pub(crate) fn reverse(
    signature: &ModelSignature,
    payload: &ResultPayload,
) -> Result<InvocationOutputs, TransformError> {
    let mut outputs = InvocationOutputs::default();
    for declared in &signature.outputs {
        let mut data = Vec::new();
        let mut data_encoding = declared.data_encoding.clone();
        for internal in &declared.parameters {
            let tagged = payload.get(&internal.name).ok_or_else(|| {
                TransformError::IncompleteResult {
                    parameter: internal.name.to_string(),
                }
            })?;
            data.extend_from_slice(&tagged.data);
            if !tagged.data_encoding.is_empty() {
                data_encoding = tagged.data_encoding.clone();
            }
        }
        let data_modality = declared
            .data_modality
            .unwrap_or_else(|| DataModality::resolve(&data_encoding));
        outputs.push(
            declared.display_title.clone(),
            OutputValue {
                data,
                data_encoding,
                data_modality,
            },
        );
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ParameterSignature;

    fn text_to_image() -> ModelSignature {
        ModelSignature::builder()
            .input(
                ParameterSignature::builder("Prompt", "utf8")
                    .primitive()
                    .parameter("prompt", "utf8")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("Image", "png")
                    .file()
                    .parameter("image", "png")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn stereo_signature() -> ModelSignature {
        ModelSignature::builder()
            .input(
                ParameterSignature::builder("Stereo Pair", "wav")
                    .file()
                    .parameter("left", "wav")
                    .parameter("right", "wav")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("Mix", "wav")
                    .file()
                    .parameter("mix", "wav")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn forward_maps_prompt_to_internal_parameter() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter").input("Prompt", "a cat on Mars");
        let payload = forward(&signature, &request).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].parameter, ParameterName::plain("prompt"));
        match &payload[0].data {
            PayloadData::Inline(bytes) => assert_eq!(bytes, b"a cat on Mars"),
            other => panic!("expected inline payload, got {other:?}"),
        }
    }

    #[test]
    fn forward_rejects_unknown_parameter() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter")
            .input("Prompt", "a cat")
            .input("Negative Prompt", "a dog");
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(err, TransformError::UnknownParameter { title } if title == "Negative Prompt"));
    }

    #[test]
    fn forward_rejects_duplicate_binding() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter")
            .input("Prompt", "first")
            .input("Prompt", "second");
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(err, TransformError::DuplicateInput { .. }));
    }

    #[test]
    fn forward_rejects_missing_required_input() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter");
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(err, TransformError::MissingRequiredInput { title } if title == "Prompt"));
    }

    #[test]
    fn forward_substitutes_declared_default() {
        let signature = ModelSignature::builder()
            .input(
                ParameterSignature::builder("Steps", "int")
                    .primitive()
                    .default_value("20")
                    .parameter("steps", "int")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("Answer", "utf8")
                    .primitive()
                    .parameter("answer", "utf8")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let payload = forward(&signature, &InvocationRequest::new("m")).unwrap();
        match &payload[0].data {
            PayloadData::Inline(bytes) => assert_eq!(bytes, b"20"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn forward_rejects_binary_for_primitive() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter").input("Prompt", vec![0u8, 1, 2]);
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(err, TransformError::FormatMismatch { kind: "binary", .. }));
    }

    #[test]
    fn forward_fans_out_positionally() {
        let signature = stereo_signature();
        let request = InvocationRequest::new("mixer").input(
            "Stereo Pair",
            InputValue::Many(vec![
                InputValue::Bytes(vec![1, 1]),
                InputValue::Bytes(vec![2, 2]),
            ]),
        );
        let payload = forward(&signature, &request).unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0].parameter, ParameterName::plain("left"));
        assert_eq!(payload[1].parameter, ParameterName::plain("right"));
    }

    #[test]
    fn forward_rejects_arity_mismatch() {
        let signature = stereo_signature();
        let request = InvocationRequest::new("mixer").input(
            "Stereo Pair",
            InputValue::Many(vec![InputValue::Bytes(vec![1])]),
        );
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(
            err,
            TransformError::ArityMismatch { expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn forward_replicates_single_value_across_slots() {
        let signature = stereo_signature();
        let request = InvocationRequest::new("mixer").input("Stereo Pair", vec![7u8, 7]);
        let payload = forward(&signature, &request).unwrap();
        assert_eq!(payload.len(), 2);
        for entry in &payload {
            match &entry.data {
                PayloadData::Inline(bytes) => assert_eq!(bytes, &vec![7u8, 7]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn forward_rejects_missing_file() {
        let signature = stereo_signature();
        let request = InvocationRequest::new("mixer").input(
            "Stereo Pair",
            InputValue::Many(vec![
                InputValue::File(PathBuf::from("/definitely/not/here.wav")),
                InputValue::Bytes(vec![0]),
            ]),
        );
        let err = forward(&signature, &request).unwrap_err();
        assert!(matches!(err, TransformError::UnreadableSource { title, .. } if title == "Stereo Pair"));
    }

    #[test]
    fn number_rendering_drops_trailing_zero() {
        assert_eq!(render_number(20.0), "20");
        assert_eq!(render_number(-3.0), "-3");
        assert_eq!(render_number(0.5), "0.5");
    }

    #[test]
    fn detect_classifies_urls_files_and_text() {
        assert!(matches!(
            InputValue::detect("https://example.com/cat.png"),
            InputValue::Link(_)
        ));
        assert!(matches!(InputValue::detect("/tmp"), InputValue::File(_)));
        assert!(matches!(
            InputValue::detect("./missing-but-path-shaped"),
            InputValue::File(_)
        ));
        assert!(matches!(InputValue::detect("a cat on Mars"), InputValue::Text(_)));
    }

    #[test]
    fn reverse_orders_outputs_as_declared() {
        let signature = ModelSignature::builder()
            .input(
                ParameterSignature::builder("Prompt", "utf8")
                    .primitive()
                    .parameter("prompt", "utf8")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("First", "utf8")
                    .primitive()
                    .parameter("first", "utf8")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("Second", "utf8")
                    .primitive()
                    .parameter("second", "utf8")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let mut payload = ResultPayload::default();
        // Insertion order deliberately reversed.
        payload.insert(
            ParameterName::plain("second"),
            TaggedBytes { data: b"two".to_vec(), data_encoding: "utf8".into() },
        );
        payload.insert(
            ParameterName::plain("first"),
            TaggedBytes { data: b"one".to_vec(), data_encoding: "utf8".into() },
        );
        let outputs = reverse(&signature, &payload).unwrap();
        let titles: Vec<_> = outputs.titles().collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[test]
    fn reverse_concatenates_multi_slot_outputs() {
        let signature = ModelSignature::builder()
            .input(
                ParameterSignature::builder("Clip", "mp4")
                    .file()
                    .parameter("clip", "mp4")
                    .build()
                    .unwrap(),
            )
            .output(
                ParameterSignature::builder("Frames", "rgb24")
                    .file()
                    .parameter("frames[0]", "rgb24")
                    .parameter("frames[1]", "rgb24")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let mut payload = ResultPayload::default();
        payload.insert(
            ParameterName::indexed("frames", 0),
            TaggedBytes { data: vec![1, 1], data_encoding: "rgb24".into() },
        );
        payload.insert(
            ParameterName::indexed("frames", 1),
            TaggedBytes { data: vec![2, 2], data_encoding: "rgb24".into() },
        );
        let outputs = reverse(&signature, &payload).unwrap();
        assert_eq!(outputs.get("Frames").unwrap().data, vec![1, 1, 2, 2]);
        assert_eq!(outputs.get("Frames").unwrap().data_modality, DataModality::Video);
    }

    #[test]
    fn reverse_fails_on_missing_parameter() {
        let signature = text_to_image();
        let payload = ResultPayload::default();
        let err = reverse(&signature, &payload).unwrap_err();
        assert!(matches!(err, TransformError::IncompleteResult { parameter } if parameter == "image"));
    }

    #[test]
    fn round_trip_preserves_display_titles() {
        let signature = text_to_image();
        let request = InvocationRequest::new("painter").input("Prompt", "a cat on Mars");
        let payload = forward(&signature, &request).unwrap();

        // Pretend the platform echoed results for every declared output.
        let mut result = ResultPayload::default();
        result.insert(
            ParameterName::plain("image"),
            TaggedBytes { data: vec![0x89, 0x50, 0x4e, 0x47], data_encoding: "png".into() },
        );
        let outputs = reverse(&signature, &result).unwrap();

        assert_eq!(payload.len(), 1);
        assert_eq!(outputs.len(), 1);
        assert!(outputs.get("Image").is_some());
        assert_eq!(outputs.get("Image").unwrap().data_modality, DataModality::Image);
    }
}
