//! Catalog of known projections, built explicitly at startup.

use std::collections::BTreeMap;

use tracing::debug;

use super::{builtin_projections, required_attributes, Projection};
use crate::attr_map::EntryKind;
use crate::errors::ConfigError;

/// Name-indexed set of projections available for enabling.
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    projections: BTreeMap<String, Projection>,
}

impl ProjectionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in projections.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for projection in builtin_projections() {
            // Built-in names are distinct.
            let _ = registry.register(projection);
        }
        registry
    }

    /// Add a projection. Names must be unique.
    pub fn register(&mut self, projection: Projection) -> Result<(), ConfigError> {
        let name = projection.name().to_string();
        if self.projections.contains_key(&name) {
            return Err(ConfigError::InvalidValue {
                field: "mappers".into(),
                detail: format!("mapper '{name}' registered twice"),
            });
        }
        debug!(mapper = %name, "registered mapper");
        self.projections.insert(name, projection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Projection> {
        self.projections.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.projections.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.projections.keys().map(String::as_str)
    }

    /// Look up every name in `enabled`, in order. Duplicates are collapsed and
    /// all unknown names are reported together.
    pub fn enabled(&self, enabled: &[String]) -> Result<Vec<Projection>, ConfigError> {
        let mut selected: Vec<Projection> = Vec::with_capacity(enabled.len());
        let mut unknown = Vec::new();
        for name in enabled {
            match self.get(name) {
                Some(p) if !selected.iter().any(|s| s.name() == name) => selected.push(p.clone()),
                Some(_) => {}
                None => unknown.push(ConfigError::UnknownProjection {
                    name: name.clone(),
                    field: "mappers.enabled".into(),
                }),
            }
        }
        match unknown.len() {
            0 => Ok(selected),
            1 => Err(unknown.remove(0)),
            _ => Err(ConfigError::Multiple(unknown)),
        }
    }

    /// Roles needed on `kind` entries by the `enabled` projections. Unknown
    /// names contribute nothing.
    pub fn required_attrs(&self, kind: EntryKind, enabled: &[String]) -> Vec<String> {
        let projections: Vec<Projection> = enabled
            .iter()
            .filter_map(|name| self.get(name).cloned())
            .collect();
        required_attributes(&projections, kind)
    }
}
