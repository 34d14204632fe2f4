//! Manifest files and kapp descriptors.
//!
//! A manifest is an ordered list of kapp descriptors forming one logical
//! deployment unit. Ordering matters: successive kapps within a manifest
//! get an implicit dependency edge, so the YAML order is preserved all the
//! way into the graph.

use crate::errors::Error;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Separator between manifest id and kapp id in fully-qualified ids
pub const NAMESPACE_SEPARATOR: &str = ":";

/// Wildcard kapp selector within a manifest (`manifest-id:*`)
pub const WILDCARD: &str = "*";

/// Name of the per-kapp config file expected inside its cache dir
pub const KAPP_CONFIG_FILE: &str = "desplegar.yaml";

/// A template to render for a kapp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub source: String,
    pub dest: String,

    /// Sensitive templates are rendered just-in-time; deleting them after
    /// the kapp runs is the installer's responsibility
    #[serde(default)]
    pub sensitive: bool,
}

/// How an output file should be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
    #[default]
    Yaml,
}

/// An output a kapp writes for other kapps to consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub id: String,
    pub path: String,

    #[serde(rename = "type", default)]
    pub format: OutputFormat,

    /// Sensitive outputs are deleted from disk once loaded into the registry
    #[serde(default)]
    pub sensitive: bool,
}

/// Where to acquire a kapp's source tree from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub id: String,

    /// Acquirer URI, e.g. `git@github.com:org/repo.git//path/in/repo#branch`
    pub uri: String,
}

impl SourceSpec {
    /// Effective id: the declared one, or the last path component of the
    /// in-repo path
    pub fn effective_id(&self) -> String {
        if !self.id.is_empty() {
            return self.id.clone();
        }
        let without_branch = self.uri.split('#').next().unwrap_or(&self.uri);
        without_branch
            .rsplit('/')
            .next()
            .unwrap_or(without_branch)
            .to_string()
    }
}

/// A lifecycle hook on a kapp. The executor interprets the id; params are
/// action-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,

    #[serde(default)]
    pub params: Vec<String>,
}

/// Whether a kapp should exist in the target cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KappState {
    #[default]
    Present,
    Absent,
}

/// The typed view of a kapp descriptor after overlay merging and
/// templating. Every field is optional in YAML; manifest entries, the
/// kapp's own config file and programmatic overlays all share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KappDescriptor {
    pub state: KappState,

    /// Fully-qualified ids of kapps this one depends on
    pub requires: Vec<String>,

    pub sources: Vec<SourceSpec>,
    pub templates: Vec<Template>,
    pub outputs: Vec<OutputSpec>,

    /// Kapp-scoped variables (third layer of the merge)
    pub vars: Mapping,

    /// Extra environment variables passed to the installer
    pub env_vars: Mapping,

    /// Installer backend for this kapp ("make" if unset)
    pub installer: Option<String>,

    pub pre_install_actions: Vec<Action>,
    pub post_install_actions: Vec<Action>,
    pub pre_delete_actions: Vec<Action>,
    pub post_delete_actions: Vec<Action>,
}

/// Reference to a manifest from a stack config entry: a bare URI or a
/// `{id, uri}` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestRef {
    Uri(String),
    Full {
        #[serde(default)]
        id: Option<String>,
        uri: String,
    },
}

impl ManifestRef {
    pub fn uri(&self) -> &str {
        match self {
            Self::Uri(uri) => uri,
            Self::Full { uri, .. } => uri,
        }
    }

    /// Declared id, or the file stem of the URI
    pub fn id(&self) -> String {
        if let Self::Full { id: Some(id), .. } = self {
            return id.clone();
        }
        Path::new(self.uri())
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.uri().to_string())
    }
}

/// On-disk manifest file shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct ManifestFile {
    /// Manifest-level variable overrides
    vars: Mapping,

    /// Ordered kapp descriptors, keyed by kapp id
    kapps: IndexMap<String, Mapping>,
}

/// A loaded manifest: ordered raw kapp descriptors plus manifest vars
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub id: String,
    pub vars: Mapping,
    pub kapps: IndexMap<String, Mapping>,
}

impl Manifest {
    pub fn parse(id: &str, yaml: &str) -> Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigInvalid(format!("manifest '{}': {}", id, e)))?;
        Ok(Self {
            id: id.to_string(),
            vars: file.vars,
            kapps: file.kapps,
        })
    }

    pub fn load(id: &str, path: &Path) -> Result<Self> {
        debug!("Loading manifest '{}' from {}", id, path.display());
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("error reading manifest '{}'", path.display()))?;
        Self::parse(id, &yaml)
    }
}

/// Load every manifest referenced by a stack, resolving relative URIs
/// against the stack file's directory
pub fn load_manifests(refs: &[ManifestRef], base_dir: &Path) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::with_capacity(refs.len());
    for manifest_ref in refs {
        let mut path = PathBuf::from(manifest_ref.uri());
        if path.is_relative() {
            path = base_dir.join(path);
        }
        manifests.push(Manifest::load(&manifest_ref.id(), &path)?);
    }
    Ok(manifests)
}

/// Split a fully-qualified id into (manifest id, kapp id)
pub fn split_fully_qualified_id(fq_id: &str) -> Result<(String, String)> {
    match fq_id.split_once(NAMESPACE_SEPARATOR) {
        Some((manifest_id, kapp_id)) if !manifest_id.is_empty() && !kapp_id.is_empty() => {
            Ok((manifest_id.to_string(), kapp_id.to_string()))
        }
        _ => Err(Error::ConfigInvalid(format!(
            "'{}' is not a fully-qualified kapp id (expected manifest-id{}kapp-id)",
            fq_id, NAMESPACE_SEPARATOR
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_YAML: &str = r#"
vars:
  namespace: infra
kapps:
  vpc:
    state: present
    templates:
      - source: templates/backend.tpl
        dest: backend.tf
    outputs:
      - id: vpc_id
        path: outputs/vpc.yaml
    sources:
      - uri: git@github.com:org/kapps.git//vpc#master
  cluster-dns:
    state: present
    requires:
      - infra:vpc
    vars:
      ttl: 300
  unused:
    state: absent
"#;

    #[test]
    fn test_parse_preserves_kapp_order() {
        let manifest = Manifest::parse("infra", MANIFEST_YAML).unwrap();
        let ids: Vec<&String> = manifest.kapps.keys().collect();
        assert_eq!(ids, vec!["vpc", "cluster-dns", "unused"]);
    }

    #[test]
    fn test_descriptor_fields_deserialize() {
        let manifest = Manifest::parse("infra", MANIFEST_YAML).unwrap();
        let raw = manifest.kapps.get("vpc").unwrap();
        let descriptor: KappDescriptor =
            serde_yaml::from_value(serde_yaml::Value::Mapping(raw.clone())).unwrap();
        assert_eq!(descriptor.state, KappState::Present);
        assert_eq!(descriptor.templates.len(), 1);
        assert_eq!(descriptor.outputs[0].id, "vpc_id");
        assert_eq!(descriptor.outputs[0].format, OutputFormat::Yaml);
        assert_eq!(descriptor.sources[0].effective_id(), "vpc");
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: KappDescriptor = serde_yaml::from_str("{}").unwrap();
        assert_eq!(descriptor.state, KappState::Present);
        assert!(descriptor.requires.is_empty());
        assert!(descriptor.installer.is_none());
        assert!(descriptor.pre_install_actions.is_empty());
    }

    #[test]
    fn test_requires_parse() {
        let manifest = Manifest::parse("infra", MANIFEST_YAML).unwrap();
        let raw = manifest.kapps.get("cluster-dns").unwrap();
        let descriptor: KappDescriptor =
            serde_yaml::from_value(serde_yaml::Value::Mapping(raw.clone())).unwrap();
        assert_eq!(descriptor.requires, vec!["infra:vpc"]);
    }

    #[test]
    fn test_manifest_ref_forms() {
        let refs: Vec<ManifestRef> = serde_yaml::from_str(
            "- manifests/infra.yaml\n- id: apps\n  uri: manifests/applications.yaml\n",
        )
        .unwrap();
        assert_eq!(refs[0].id(), "infra");
        assert_eq!(refs[1].id(), "apps");
        assert_eq!(refs[1].uri(), "manifests/applications.yaml");
    }

    #[test]
    fn test_split_fully_qualified_id() {
        let (manifest_id, kapp_id) = split_fully_qualified_id("infra:vpc").unwrap();
        assert_eq!(manifest_id, "infra");
        assert_eq!(kapp_id, "vpc");
        assert!(split_fully_qualified_id("vpc").is_err());
        assert!(split_fully_qualified_id(":vpc").is_err());
    }

    #[test]
    fn test_action_parse() {
        let actions: Vec<Action> = serde_yaml::from_str(
            "- id: skip\n- id: add_provider_vars_files\n  params:\n    - extra/vars.yaml\n",
        )
        .unwrap();
        assert_eq!(actions[0].id, "skip");
        assert!(actions[0].params.is_empty());
        assert_eq!(actions[1].params, vec!["extra/vars.yaml"]);
    }
}
