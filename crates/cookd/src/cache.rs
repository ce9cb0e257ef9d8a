//! Recipe cache: remembers per-`{recipe, platform, arch}` progress so
//! repeated builds of the same sources skip completed setup work.

use std::collections::HashMap;
use std::path::PathBuf;

use chef_common::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One resolved ingredient: the fridge archive and its mount target inside
/// the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIngredient {
    pub archive: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub setup_ingredients: bool,
    pub setup_hook_run: bool,
    /// Resolved ingredient layers from the completed setup pass.
    pub ingredients: Vec<CachedIngredient>,
    /// OS packages installed by the last build with this key.
    pub packages: Vec<String>,
}

/// Persisted map from cache key to progress markers.
pub struct RecipeCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

impl RecipeCache {
    /// Cache key: content hash of the recipe plus the target pair.
    pub fn key(recipe_bytes: &[u8], platform: &str, arch: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(recipe_bytes);
        hasher.update([0]);
        hasher.update(platform.as_bytes());
        hasher.update([0]);
        hasher.update(arch.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    pub fn entry(&self, key: &str) -> CacheEntry {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Write back one entry and persist the cache.
    pub fn store(&mut self, key: &str, entry: CacheEntry) -> Result<()> {
        self.entries.insert(key.to_string(), entry);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.entries)
            .expect("cache entries always serialize");
        std::fs::write(&self.path, raw)?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "recipe cache saved");
        Ok(())
    }
}

/// The add/remove package delta between the cached state and the recipe.
pub fn package_delta(cached: &[String], wanted: &[String]) -> (Vec<String>, Vec<String>) {
    let added = wanted
        .iter()
        .filter(|pkg| !cached.contains(pkg))
        .cloned()
        .collect();
    let removed = cached
        .iter()
        .filter(|pkg| !wanted.contains(pkg))
        .cloned()
        .collect();
    (added, removed)
}
