//! High-level SDK features: invocation lifecycle and model registration.

pub mod invocation;
pub mod registration;

pub use invocation::{JobHandle, JobState};
pub use registration::{ModelAsset, ModelConfig, ModelConfigError, ModelReadiness};
