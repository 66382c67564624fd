//! Model signatures: the typed I/O contract of a published model.
//!
//! A [`ModelSignature`] declares the named inputs and outputs a model exposes.
//! Each [`ParameterSignature`] is addressed by a human-facing display title and
//! decomposes into one or more internal parameters, which is what actually
//! travels on the wire. Signatures are validated before they are published or
//! used to build an invocation payload.

pub mod modality;
pub mod registry;
pub mod transform;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use modality::DataModality;

/// Errors raised while validating or constructing a signature.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("display title is empty")]
    EmptyDisplayTitle,

    #[error("duplicate display title `{title}` among {side}")]
    DuplicateDisplayTitle { title: String, side: SignatureSide },

    #[error("parameter `{title}` declares no internal parameters")]
    EmptyParameters { title: String },

    #[error("signature declares no {side}")]
    EmptySide { side: SignatureSide },

    #[error("duplicate internal parameter `{name}` among {side}")]
    DuplicateParameterName { name: String, side: SignatureSide },

    #[error("invalid internal parameter name `{name}`")]
    InvalidParameterName { name: String },

    #[error("parameter `{title}` has an empty data encoding")]
    EmptyEncoding { title: String },

    #[error("default value on `{title}` requires the primitive receive format")]
    DefaultOnFileParameter { title: String },
}

/// Which half of a signature a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSide {
    Inputs,
    Outputs,
}

impl fmt::Display for SignatureSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inputs => f.write_str("inputs"),
            Self::Outputs => f.write_str("outputs"),
        }
    }
}

/// How the platform expects a parameter's bytes to arrive.
///
/// `Primitive` values ride inline in control messages; `File` values are
/// staged through the chunked transfer path (or referenced by link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveFormat {
    Primitive,
    File,
}

impl ReceiveFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primitive => "primitive",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ReceiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level name of an internal parameter, optionally indexed.
///
/// Rendered as `base` or `base[index]`; both forms parse back losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterName {
    base: String,
    index: Option<u32>,
}

impl ParameterName {
    pub fn plain(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            index: None,
        }
    }

    pub fn indexed(base: impl Into<String>, index: u32) -> Self {
        Self {
            base: base.into(),
            index: Some(index),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    /// Parse `base` or `base[index]`. The base must be non-empty and the
    /// index, when present, a decimal u32 closing the string.
    pub fn parse(raw: &str) -> Result<Self, SignatureError> {
        let invalid = || SignatureError::InvalidParameterName {
            name: raw.to_string(),
        };
        match raw.find('[') {
            None => {
                if raw.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::plain(raw))
            }
            Some(open) => {
                let base = &raw[..open];
                let rest = &raw[open + 1..];
                let close = rest.find(']').ok_or_else(invalid)?;
                if base.is_empty() || close + 1 != rest.len() {
                    return Err(invalid());
                }
                let index: u32 = rest[..close].parse().map_err(|_| invalid())?;
                Ok(Self::indexed(base, index))
            }
        }
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.base, index),
            None => f.write_str(&self.base),
        }
    }
}

impl FromStr for ParameterName {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ParameterName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ParameterName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}

/// One wire-level parameter inside a display-level parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InternalParameter {
    pub name: ParameterName,
    pub data_encoding: String,
}

impl InternalParameter {
    pub fn new(name: ParameterName, data_encoding: impl Into<String>) -> Self {
        Self {
            name,
            data_encoding: data_encoding.into(),
        }
    }
}

/// A display-level input or output of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSignature {
    /// Human-facing name callers address this parameter by.
    pub display_title: String,
    /// Explicit modality; derived from `data_encoding` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_modality: Option<DataModality>,
    /// Free-form domain hint, e.g. `"prompt"` or `"depth-map"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_domain: Option<String>,
    /// Display-level encoding, used to gate primitive submissions.
    pub data_encoding: String,
    pub receive_format: ReceiveFormat,
    /// Substituted when the caller omits this input. Primitive only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Wire-level decomposition, in declared order.
    pub parameters: Vec<InternalParameter>,
}

impl ParameterSignature {
    pub fn builder(
        display_title: impl Into<String>,
        data_encoding: impl Into<String>,
    ) -> ParameterSignatureBuilder {
        ParameterSignatureBuilder::new(display_title, data_encoding)
    }

    /// Effective modality, falling back to encoding resolution.
    pub fn modality(&self) -> DataModality {
        self.data_modality
            .unwrap_or_else(|| DataModality::resolve(&self.data_encoding))
    }

    fn validate(&self) -> Result<(), SignatureError> {
        if self.display_title.is_empty() {
            return Err(SignatureError::EmptyDisplayTitle);
        }
        if self.data_encoding.is_empty() {
            return Err(SignatureError::EmptyEncoding {
                title: self.display_title.clone(),
            });
        }
        if self.parameters.is_empty() {
            return Err(SignatureError::EmptyParameters {
                title: self.display_title.clone(),
            });
        }
        for parameter in &self.parameters {
            if parameter.data_encoding.is_empty() {
                return Err(SignatureError::EmptyEncoding {
                    title: self.display_title.clone(),
                });
            }
        }
        if self.default_value.is_some() && self.receive_format != ReceiveFormat::Primitive {
            return Err(SignatureError::DefaultOnFileParameter {
                title: self.display_title.clone(),
            });
        }
        Ok(())
    }
}

/// Fluent builder for a [`ParameterSignature`].
#[derive(Debug, Clone)]
pub struct ParameterSignatureBuilder {
    display_title: String,
    data_modality: Option<DataModality>,
    data_domain: Option<String>,
    data_encoding: String,
    receive_format: Option<ReceiveFormat>,
    default_value: Option<String>,
    parameters: Vec<(String, String)>,
}

impl ParameterSignatureBuilder {
    fn new(display_title: impl Into<String>, data_encoding: impl Into<String>) -> Self {
        Self {
            display_title: display_title.into(),
            data_modality: None,
            data_domain: None,
            data_encoding: data_encoding.into(),
            receive_format: None,
            default_value: None,
            parameters: Vec::new(),
        }
    }

    pub fn primitive(mut self) -> Self {
        self.receive_format = Some(ReceiveFormat::Primitive);
        self
    }

    pub fn file(mut self) -> Self {
        self.receive_format = Some(ReceiveFormat::File);
        self
    }

    pub fn modality(mut self, modality: DataModality) -> Self {
        self.data_modality = Some(modality);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.data_domain = Some(domain.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Add an internal parameter. `name` accepts the `base[index]` form.
    pub fn parameter(mut self, name: impl Into<String>, encoding: impl Into<String>) -> Self {
        self.parameters.push((name.into(), encoding.into()));
        self
    }

    pub fn build(self) -> Result<ParameterSignature, SignatureError> {
        let mut parameters = Vec::with_capacity(self.parameters.len().max(1));
        for (name, encoding) in self.parameters {
            parameters.push(InternalParameter::new(ParameterName::parse(&name)?, encoding));
        }
        // A bare scalar decomposes into a single parameter named after itself.
        if parameters.is_empty() {
            parameters.push(InternalParameter::new(
                ParameterName::plain(self.display_title.to_ascii_lowercase().replace(' ', "_")),
                self.data_encoding.clone(),
            ));
        }
        let receive_format = self.receive_format.unwrap_or({
            if DataModality::resolve(&self.data_encoding).is_text_like() {
                ReceiveFormat::Primitive
            } else {
                ReceiveFormat::File
            }
        });
        let signature = ParameterSignature {
            display_title: self.display_title,
            data_modality: self.data_modality,
            data_domain: self.data_domain,
            data_encoding: self.data_encoding,
            receive_format,
            default_value: self.default_value,
            parameters,
        };
        signature.validate()?;
        Ok(signature)
    }
}

/// Full typed contract of a model: its inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSignature {
    pub inputs: Vec<ParameterSignature>,
    pub outputs: Vec<ParameterSignature>,
}

impl ModelSignature {
    pub fn new(inputs: Vec<ParameterSignature>, outputs: Vec<ParameterSignature>) -> Self {
        Self { inputs, outputs }
    }

    pub fn builder() -> SignatureBuilder {
        SignatureBuilder::default()
    }

    pub fn input(&self, display_title: &str) -> Option<&ParameterSignature> {
        self.inputs.iter().find(|p| p.display_title == display_title)
    }

    pub fn output(&self, display_title: &str) -> Option<&ParameterSignature> {
        self.outputs.iter().find(|p| p.display_title == display_title)
    }

    /// Check the structural invariants both halves must uphold.
    ///
    /// Display titles are unique per direction, every parameter decomposes
    /// into at least one uniquely named internal parameter, and defaults only
    /// appear on primitive inputs. Input and output namespaces are distinct,
    /// so the same title may appear on both sides.
    pub fn validate(&self) -> Result<(), SignatureError> {
        Self::validate_side(&self.inputs, SignatureSide::Inputs)?;
        Self::validate_side(&self.outputs, SignatureSide::Outputs)?;
        Ok(())
    }

    fn validate_side(
        side_parameters: &[ParameterSignature],
        side: SignatureSide,
    ) -> Result<(), SignatureError> {
        if side_parameters.is_empty() {
            return Err(SignatureError::EmptySide { side });
        }
        let mut titles = HashSet::new();
        let mut names = HashSet::new();
        for parameter in side_parameters {
            parameter.validate()?;
            if !titles.insert(parameter.display_title.as_str()) {
                return Err(SignatureError::DuplicateDisplayTitle {
                    title: parameter.display_title.clone(),
                    side,
                });
            }
            for internal in &parameter.parameters {
                if !names.insert(&internal.name) {
                    return Err(SignatureError::DuplicateParameterName {
                        name: internal.name.to_string(),
                        side,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fluent builder for a [`ModelSignature`], validated at `build`.
#[derive(Debug, Clone, Default)]
pub struct SignatureBuilder {
    inputs: Vec<ParameterSignature>,
    outputs: Vec<ParameterSignature>,
}

impl SignatureBuilder {
    pub fn input(mut self, parameter: ParameterSignature) -> Self {
        self.inputs.push(parameter);
        self
    }

    pub fn output(mut self, parameter: ParameterSignature) -> Self {
        self.outputs.push(parameter);
        self
    }

    pub fn build(self) -> Result<ModelSignature, SignatureError> {
        let signature = ModelSignature {
            inputs: self.inputs,
            outputs: self.outputs,
        };
        signature.validate()?;
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt_input() -> ParameterSignature {
        ParameterSignature::builder("Prompt", "utf8")
            .primitive()
            .parameter("prompt", "utf8")
            .build()
            .unwrap()
    }

    fn image_output() -> ParameterSignature {
        ParameterSignature::builder("Image", "png")
            .file()
            .parameter("image", "png")
            .build()
            .unwrap()
    }

    #[test]
    fn parameter_name_round_trips_through_display() {
        let plain = ParameterName::plain("prompt");
        assert_eq!(plain.to_string(), "prompt");
        assert_eq!(ParameterName::parse("prompt").unwrap(), plain);

        let indexed = ParameterName::indexed("frames", 3);
        assert_eq!(indexed.to_string(), "frames[3]");
        assert_eq!(ParameterName::parse("frames[3]").unwrap(), indexed);
    }

    #[test]
    fn parameter_name_rejects_malformed_input() {
        assert!(ParameterName::parse("").is_err());
        assert!(ParameterName::parse("[0]").is_err());
        assert!(ParameterName::parse("frames[").is_err());
        assert!(ParameterName::parse("frames[x]").is_err());
        assert!(ParameterName::parse("frames[0]tail").is_err());
    }

    #[test]
    fn parameter_name_serializes_as_string() {
        let name = ParameterName::indexed("frames", 1);
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"frames[1]\"");
        let back: ParameterName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn builder_infers_receive_format_from_encoding() {
        let text = ParameterSignature::builder("Prompt", "utf8")
            .parameter("prompt", "utf8")
            .build()
            .unwrap();
        assert_eq!(text.receive_format, ReceiveFormat::Primitive);

        let image = ParameterSignature::builder("Image", "png")
            .parameter("image", "png")
            .build()
            .unwrap();
        assert_eq!(image.receive_format, ReceiveFormat::File);
    }

    #[test]
    fn builder_synthesizes_parameter_for_bare_scalar() {
        let parameter = ParameterSignature::builder("Max Tokens", "int")
            .primitive()
            .build()
            .unwrap();
        assert_eq!(parameter.parameters.len(), 1);
        assert_eq!(parameter.parameters[0].name, ParameterName::plain("max_tokens"));
    }

    #[test]
    fn duplicate_display_titles_rejected_per_side() {
        let err = ModelSignature::builder()
            .input(prompt_input())
            .input(prompt_input())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SignatureError::DuplicateDisplayTitle { side: SignatureSide::Inputs, .. }
        ));
    }

    #[test]
    fn same_title_allowed_across_sides() {
        let signature = ModelSignature::builder()
            .input(
                ParameterSignature::builder("Image", "png")
                    .file()
                    .parameter("image_in", "png")
                    .build()
                    .unwrap(),
            )
            .output(image_output())
            .build();
        assert!(signature.is_ok());
    }

    #[test]
    fn duplicate_internal_names_rejected() {
        let first = ParameterSignature::builder("A", "utf8")
            .primitive()
            .parameter("shared", "utf8")
            .build()
            .unwrap();
        let second = ParameterSignature::builder("B", "utf8")
            .primitive()
            .parameter("shared", "utf8")
            .build()
            .unwrap();
        let err = ModelSignature::builder()
            .input(first)
            .input(second)
            .build()
            .unwrap_err();
        assert!(matches!(err, SignatureError::DuplicateParameterName { .. }));
    }

    #[test]
    fn default_value_requires_primitive_format() {
        let err = ParameterSignature::builder("Weights", "safetensors")
            .file()
            .default_value("none")
            .parameter("weights", "safetensors")
            .build()
            .unwrap_err();
        assert!(matches!(err, SignatureError::DefaultOnFileParameter { .. }));
    }

    #[test]
    fn empty_sides_are_rejected() {
        let err = ModelSignature::builder()
            .input(prompt_input())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SignatureError::EmptySide { side: SignatureSide::Outputs }
        ));

        let err = ModelSignature::new(vec![], vec![image_output()])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            SignatureError::EmptySide { side: SignatureSide::Inputs }
        ));
    }

    #[test]
    fn signature_json_round_trips() {
        let signature = ModelSignature::builder()
            .input(prompt_input())
            .output(image_output())
            .build()
            .unwrap();
        let json = serde_json::to_string(&signature).unwrap();
        let back: ModelSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signature);
    }

    #[test]
    fn unknown_fields_rejected() {
        let raw = r#"{"inputs": [], "outputs": [], "extra": 1}"#;
        assert!(serde_json::from_str::<ModelSignature>(raw).is_err());
    }
}
