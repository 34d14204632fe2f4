//! Hierarchical registry shared between kapps.
//!
//! A registry is a tree of YAML values addressed by dot-separated paths.
//! Kapps publish their outputs into it and read their ancestors' outputs
//! out of it; the executor owns the scrubbing rules for what may cross
//! node and manifest boundaries.

use crate::errors::Error;
use crate::vars;
use anyhow::Result;
use serde_yaml::{Mapping, Value};

/// Top-level key holding kapp outputs
pub const KEY_OUTPUTS: &str = "outputs";

/// Child of `outputs` referring to the current kapp's own outputs. Never
/// inherited by another node.
pub const KEY_THIS: &str = "this";

/// Separator between path segments
pub const FIELD_SEPARATOR: &str = ".";

/// Manifest/kapp separator as rewritten for registry keys. The template
/// engine rejects `:` and `-` in identifiers, so fully-qualified ids are
/// injected with this separator and hyphens become underscores.
pub const TEMPLATE_NAMESPACE_SEPARATOR: &str = "__";

/// `outputs.this`, the fully-joined reserved path
pub fn this_prefix() -> String {
    [KEY_OUTPUTS, KEY_THIS].join(FIELD_SEPARATOR)
}

/// Hierarchical string-keyed value store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    values: Mapping,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a snapshot map
    pub fn from_map(values: Mapping) -> Self {
        Self { values }
    }

    /// Set the value at a dotted path, creating intermediate mappings as
    /// needed. Fails with a registry conflict if an intermediate segment
    /// already holds a non-mapping value.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split(FIELD_SEPARATOR).collect();
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| Error::RegistryConflict(path.to_string()))?;

        let mut current = &mut self.values;
        for segment in parents {
            let key = Value::String((*segment).to_string());
            if !current.contains_key(&key) {
                current.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            match current.get_mut(&key) {
                Some(Value::Mapping(child)) => current = child,
                _ => return Err(Error::RegistryConflict(path.to_string()).into()),
            }
        }

        current.insert(Value::String((*leaf).to_string()), value);
        Ok(())
    }

    /// Get the value at a dotted path. Returns a deep copy so callers can
    /// mutate freely.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split(FIELD_SEPARATOR).collect();
        let (leaf, parents) = segments.split_last()?;
        let mut node: &Mapping = &self.values;
        for segment in parents {
            match node.get(Value::String((*segment).to_string())) {
                Some(Value::Mapping(child)) => node = child,
                _ => return None,
            }
        }
        node.get(Value::String((*leaf).to_string())).cloned()
    }

    /// Remove the subtree at a dotted path. Deleting an absent key is a
    /// no-op.
    pub fn delete(&mut self, path: &str) {
        let segments: Vec<&str> = path.split(FIELD_SEPARATOR).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.values;
        for segment in parents {
            let key = Value::String((*segment).to_string());
            match current.get_mut(&key) {
                Some(Value::Mapping(child)) => current = child,
                _ => return,
            }
        }
        current.remove(Value::String((*leaf).to_string()));
    }

    /// Deep-copy snapshot of the whole tree
    pub fn as_map(&self) -> Mapping {
        self.values.clone()
    }

    /// Deep-merge a snapshot map into this registry
    pub fn merge_map(&mut self, map: &Mapping) {
        vars::merge_into(&mut self.values, map);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Direct child keys of `outputs` that are not fully qualified (no
    /// manifest separator in the key)
    pub fn short_output_keys(&self) -> Vec<String> {
        match self.values.get(Value::String(KEY_OUTPUTS.to_string())) {
            Some(Value::Mapping(outputs)) => outputs
                .keys()
                .filter_map(|k| k.as_str())
                .filter(|k| !k.contains(TEMPLATE_NAMESPACE_SEPARATOR))
                .map(|k| k.to_string())
                .collect(),
            _ => Vec::new(),
        }
    }
}
