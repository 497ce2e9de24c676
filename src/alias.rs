use crate::config::{ModelMapEntry, UpstreamConfig};
use std::collections::HashMap;

/// Maps client-facing model names onto the canonical upstream model id.
///
/// Lookup is an exact match against the alias table. Anything unmatched,
/// including an absent model name, resolves to the default model, so
/// resolution never fails.
#[derive(Debug, Clone)]
pub struct ModelAliasResolver {
    default_model: String,
    table: HashMap<String, String>,
    advertised: Vec<ModelMapEntry>,
}

impl ModelAliasResolver {
    pub fn new(default_model: impl Into<String>, entries: Vec<ModelMapEntry>) -> Self {
        let default_model = default_model.into();
        let mut table = HashMap::with_capacity(entries.len() + 1);
        let mut advertised = Vec::with_capacity(entries.len());
        for entry in entries {
            // first mapping wins; later duplicates are ignored
            if table.contains_key(&entry.alias) {
                continue;
            }
            table.insert(entry.alias.clone(), entry.upstream_model.clone());
            advertised.push(entry);
        }
        table
            .entry(default_model.clone())
            .or_insert_with(|| default_model.clone());
        Self {
            default_model,
            table,
            advertised,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.default_model.clone(), config.aliases.clone())
    }

    pub fn resolve(&self, alias: Option<&str>) -> &str {
        alias
            .and_then(|name| self.table.get(name))
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Aliases in configuration order, for model discovery.
    pub fn advertised(&self) -> &[ModelMapEntry] {
        &self.advertised
    }
}
