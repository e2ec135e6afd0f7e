//! PipelineImage Store (`spec.md` §4.5, C5).
//!
//! Content-addressed storage of compiled pipelines, keyed by structural
//! hash, plus a human-alias layer and a syntactic-hash index. In-memory
//! only: durable storage is an explicit Non-goal (`spec.md` §1) left to a
//! pluggable store the embedder supplies.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::dag::{DagSpec, ModuleCallOptions};
use crate::registry::ModuleImpl;

/// A compiled, content-addressed pipeline.
#[derive(Clone)]
pub struct PipelineImage {
    pub structural_hash: String,
    pub syntactic_hash: Option<String>,
    pub spec: Arc<DagSpec>,
    pub module_options: Arc<HashMap<Uuid, ModuleCallOptions>>,
    pub compiled_at: DateTime<Utc>,
    pub source_hash: Option<String>,
}

/// A `PipelineImage` plus the synthetic module implementations needed to
/// cover module nodes the registry doesn't know about (`spec.md` §3, §4.7).
#[derive(Clone)]
pub struct LoadedPipeline {
    pub image: PipelineImage,
    pub synthetic_modules: Arc<HashMap<Uuid, Arc<dyn ModuleImpl>>>,
}

/// Key for the syntactic-hash index: `(syntacticHash, registryHash)`. Two
/// identical source texts compiled against different module registries
/// must miss the cache (`spec.md` §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyntacticKey {
    pub syntactic_hash: String,
    pub registry_hash: String,
}

#[derive(Default)]
pub struct PipelineImageStore {
    images: DashMap<String, PipelineImage>,
    aliases: DashMap<String, String>,
    syntactic_index: DashMap<SyntacticKey, String>,
}

impl PipelineImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, image: PipelineImage) -> String {
        let hash = image.structural_hash.clone();
        tracing::debug!(structural_hash = %hash, pipeline = %image.spec.name, "storing pipeline image");
        self.images.insert(hash.clone(), image);
        hash
    }

    pub fn get(&self, hash: &str) -> Option<PipelineImage> {
        self.images.get(hash).map(|entry| entry.value().clone())
    }

    pub fn alias(&self, name: impl Into<String>, hash: impl Into<String>) {
        let name = name.into();
        let hash = hash.into();
        tracing::debug!(alias = %name, structural_hash = %hash, "aliasing pipeline image");
        self.aliases.insert(name, hash);
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.aliases.get(name).map(|entry| entry.value().clone())
    }

    pub fn index_syntactic(
        &self,
        syntactic_hash: impl Into<String>,
        registry_hash: impl Into<String>,
        structural_hash: impl Into<String>,
    ) {
        self.syntactic_index.insert(
            SyntacticKey {
                syntactic_hash: syntactic_hash.into(),
                registry_hash: registry_hash.into(),
            },
            structural_hash.into(),
        );
    }

    pub fn lookup_syntactic(&self, syntactic_hash: &str, registry_hash: &str) -> Option<String> {
        self.syntactic_index
            .get(&SyntacticKey {
                syntactic_hash: syntactic_hash.to_string(),
                registry_hash: registry_hash.to_string(),
            })
            .map(|entry| entry.value().clone())
    }

    pub fn list_images(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.images.iter().map(|e| e.key().clone()).collect();
        hashes.sort();
        hashes
    }

    pub fn list_aliases(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> =
            self.aliases.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        pairs.sort();
        pairs
    }

    pub fn remove(&self, hash: &str) -> bool {
        let removed = self.images.remove(hash).is_some();
        if removed {
            tracing::debug!(structural_hash = %hash, "removed pipeline image");
        }
        removed
    }
}
