//! Plugin capability consumed by the Worker Pool's success hook (spec §6).
//!
//! Concrete normalizers (HTML→text, media classification) are external
//! collaborators; this module defines the trait, the registry, and the
//! fallback record used when no plugin claims an asset type.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AssetPluginError;

/// A normalized asset produced by a plugin (or the fallback path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub identifier: String,
    pub asset_type: String,
    pub checksum: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub normalized_path: String,
    pub metadata: Option<serde_json::Value>,
}

/// Post-fetch normalization capability.
#[async_trait]
pub trait AssetPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, asset_type: &str) -> bool;

    async fn normalize(
        &self,
        source_url: &str,
        raw_path: &str,
        metadata_json: Option<&str>,
        normalized_dir: &Path,
    ) -> Result<Vec<AssetRecord>, AssetPluginError>;
}

/// Holds registered plugins and selects by asset type (spec §6).
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn AssetPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn AssetPlugin>) {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return;
        }
        self.plugins.push(plugin);
    }

    pub fn find(&self, asset_type: &str) -> Vec<Arc<dyn AssetPlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.supports(asset_type))
            .cloned()
            .collect()
    }
}

/// Builds the default record persisted when no plugin matches the fetched
/// asset type (spec §6: "When no plugin matches, a default record is
/// persisted with the fetcher's asset_type and checksum").
pub fn default_asset_record(
    source_url: &str,
    asset_type: &str,
    checksum: &str,
    normalized_path: Option<&str>,
) -> AssetRecord {
    AssetRecord {
        identifier: source_url.to_string(),
        asset_type: asset_type.to_string(),
        checksum: checksum.to_string(),
        tags: Vec::new(),
        normalized_path: normalized_path.unwrap_or_default().to_string(),
        metadata: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPlugin(&'static str);

    #[async_trait]
    impl AssetPlugin for AlwaysPlugin {
        fn name(&self) -> &str {
            self.0
        }
        fn supports(&self, _asset_type: &str) -> bool {
            true
        }
        async fn normalize(
            &self,
            _source_url: &str,
            _raw_path: &str,
            _metadata_json: Option<&str>,
            _normalized_dir: &Path,
        ) -> Result<Vec<AssetRecord>, AssetPluginError> {
            Ok(vec![])
        }
    }

    #[test]
    fn registering_same_name_twice_is_idempotent() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(AlwaysPlugin("simple")));
        registry.register(Arc::new(AlwaysPlugin("simple")));
        assert_eq!(registry.find("page").len(), 1);
    }

    #[test]
    fn default_record_uses_fetcher_asset_type_and_checksum() {
        let record = default_asset_record("https://example.com/a", "page", "abc123", None);
        assert_eq!(record.asset_type, "page");
        assert_eq!(record.checksum, "abc123");
        assert_eq!(record.normalized_path, "");
    }
}
