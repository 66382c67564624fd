//! Data modality resolution from declared encodings.
//!
//! The platform tags every parameter with a `data_encoding` string; the modality
//! is derived from it when a signature does not declare one explicitly. Unknown
//! encodings fall back to [`DataModality::File`] and are treated as opaque binary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad category of the data carried by a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataModality {
    Text,
    Integer,
    Float,
    Image,
    Audio,
    Video,
    File,
}

impl DataModality {
    /// Derive the modality for an encoding string, case-insensitively.
    ///
    /// Anything not recognized is treated as an opaque binary file.
    pub fn resolve(encoding: &str) -> Self {
        match encoding.to_ascii_lowercase().as_str() {
            "aac" | "mp3" | "wav" => Self::Audio,
            "jpg" | "jpeg" | "png" => Self::Image,
            "ascii" | "string" | "str" | "text" | "txt" | "utf8" | "utf-8" | "utf16"
            | "utf-16" => Self::Text,
            "double" | "f16" | "f32" | "f64" | "float" => Self::Float,
            "int" | "uint" => Self::Integer,
            "avi" | "mp4" | "h264" | "h265" | "libx264" | "x264" | "rgb24" | "yuv420p" => {
                Self::Video
            }
            _ => Self::File,
        }
    }

    /// Whether values of this modality can ride inline as a primitive scalar.
    pub fn is_text_like(self) -> bool {
        matches!(self, Self::Text | Self::Integer | Self::Float)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

impl fmt::Display for DataModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_encodings() {
        assert_eq!(DataModality::resolve("utf8"), DataModality::Text);
        assert_eq!(DataModality::resolve("utf-16"), DataModality::Text);
        assert_eq!(DataModality::resolve("png"), DataModality::Image);
        assert_eq!(DataModality::resolve("mp3"), DataModality::Audio);
        assert_eq!(DataModality::resolve("mp4"), DataModality::Video);
        assert_eq!(DataModality::resolve("yuv420p"), DataModality::Video);
        assert_eq!(DataModality::resolve("f32"), DataModality::Float);
        assert_eq!(DataModality::resolve("int"), DataModality::Integer);
    }

    #[test]
    fn resolution_ignores_case() {
        assert_eq!(DataModality::resolve("PNG"), DataModality::Image);
        assert_eq!(DataModality::resolve("Utf8"), DataModality::Text);
    }

    #[test]
    fn unknown_encodings_fall_back_to_file() {
        assert_eq!(DataModality::resolve("safetensors"), DataModality::File);
        assert_eq!(DataModality::resolve(""), DataModality::File);
    }

    #[test]
    fn text_like_covers_scalars_only() {
        assert!(DataModality::Text.is_text_like());
        assert!(DataModality::Integer.is_text_like());
        assert!(DataModality::Float.is_text_like());
        assert!(!DataModality::Image.is_text_like());
        assert!(!DataModality::File.is_text_like());
    }
}
