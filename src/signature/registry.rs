//! Process-wide cache of resolved model signatures.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::ModelSignature;

/// A model as the platform resolved it: stable id plus validated signature.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model_id: Uuid,
    pub signature: Arc<ModelSignature>,
}

/// Name-keyed signature cache.
///
/// Every invocation needs the target signature to shape its payloads, but
/// describing a model remotely costs a round trip. The client consults this
/// cache first and fills it on miss; [`invalidate`](Self::invalidate) forces
/// a refetch after a model is republished.
#[derive(Debug, Default)]
pub struct SignatureCache {
    inner: DashMap<String, ResolvedModel>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_name: &str) -> Option<ResolvedModel> {
        self.inner.get(model_name).map(|entry| entry.value().clone())
    }

    /// Cache a resolved model, returning the shared signature handle.
    pub fn insert(
        &self,
        model_name: impl Into<String>,
        model_id: Uuid,
        signature: ModelSignature,
    ) -> Arc<ModelSignature> {
        let signature = Arc::new(signature);
        self.inner.insert(
            model_name.into(),
            ResolvedModel {
                model_id,
                signature: Arc::clone(&signature),
            },
        );
        signature
    }

    pub fn invalidate(&self, model_name: &str) -> bool {
        self.inner.remove(model_name).is_some()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ParameterSignature;

    fn text_to_text() -> ModelSignature {
        ModelSignature::builder()
            .input(ParameterSignature::builder("Prompt", "utf8").build().unwrap())
            .output(ParameterSignature::builder("Answer", "utf8").build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn miss_then_hit() {
        let cache = SignatureCache::new();
        assert!(cache.get("writer").is_none());

        let model_id = Uuid::new_v4();
        let shared = cache.insert("writer", model_id, text_to_text());
        let hit = cache.get("writer").expect("cached entry");
        assert_eq!(hit.model_id, model_id);
        assert!(Arc::ptr_eq(&hit.signature, &shared));
    }

    #[test]
    fn invalidate_forces_a_refetch() {
        let cache = SignatureCache::new();
        cache.insert("writer", Uuid::new_v4(), text_to_text());
        assert!(cache.invalidate("writer"));
        assert!(cache.get("writer").is_none());
        assert!(!cache.invalidate("writer"));
    }

    #[test]
    fn clear_empties_every_entry() {
        let cache = SignatureCache::new();
        cache.insert("a", Uuid::new_v4(), text_to_text());
        cache.insert("b", Uuid::new_v4(), text_to_text());
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
