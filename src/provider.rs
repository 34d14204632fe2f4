//! Providers and provider variables.
//!
//! A provider names the environment kapps are installed into and controls
//! where provider variable files are searched for. Vars files are plain
//! YAML mappings loaded in search order, most specific last, and feed the
//! lowest-precedence layer of the merged variable map.

use crate::errors::Error;
use crate::vars;
use anyhow::{Context, Result};
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

pub const LOCAL_PROVIDER: &str = "local";
pub const AWS_PROVIDER: &str = "aws";

/// Subdirectory names in the provider vars search path
const PROFILE_DIR: &str = "profiles";
const CLUSTER_DIR: &str = "clusters";

#[derive(Debug, Clone)]
pub struct Provider {
    name: String,
    profile: String,
    cluster: String,
    region: String,

    /// Base search dirs, already resolved to absolute paths
    search_dirs: Vec<PathBuf>,

    /// Paths appended at runtime by `add_provider_vars_files` actions
    extra_paths: Vec<PathBuf>,

    loaded_vars: Mapping,
}

impl Provider {
    pub fn new(
        name: &str,
        profile: &str,
        cluster: &str,
        region: &str,
        search_dirs: Vec<PathBuf>,
    ) -> Result<Self> {
        match name {
            LOCAL_PROVIDER | AWS_PROVIDER => {}
            other => {
                return Err(
                    Error::ConfigInvalid(format!("provider '{}' doesn't exist", other)).into(),
                )
            }
        }

        let mut provider = Self {
            name: name.to_string(),
            profile: profile.to_string(),
            cluster: cluster.to_string(),
            region: region.to_string(),
            search_dirs,
            extra_paths: Vec::new(),
            loaded_vars: Mapping::new(),
        };
        provider.refresh()?;
        Ok(provider)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The merged provider vars
    pub fn vars(&self) -> &Mapping {
        &self.loaded_vars
    }

    /// Vars every installer should receive for kapps to target this
    /// provider
    pub fn installer_vars(&self) -> Mapping {
        let mut result = Mapping::new();
        if self.name == AWS_PROVIDER && !self.region.is_empty() {
            result.insert(
                serde_yaml::Value::String("region".to_string()),
                serde_yaml::Value::String(self.region.clone()),
            );
        }
        result
    }

    /// Register an extra vars file or directory, loaded after the search
    /// dirs on the next refresh
    pub fn add_vars_path(&mut self, path: PathBuf) {
        debug!("Adding provider vars path: {}", path.display());
        if !self.extra_paths.contains(&path) {
            self.extra_paths.push(path);
        }
    }

    /// Reload all provider vars from disk
    pub fn refresh(&mut self) -> Result<()> {
        let mut merged = Mapping::new();

        for dir in self.vars_dirs() {
            for file in yaml_files_in(&dir) {
                merge_vars_file(&mut merged, &file)?;
            }
        }

        for path in &self.extra_paths {
            if path.is_dir() {
                for file in yaml_files_in(path) {
                    merge_vars_file(&mut merged, &file)?;
                }
            } else if path.exists() {
                merge_vars_file(&mut merged, path)?;
            } else {
                debug!("Skipping absent provider vars path: {}", path.display());
            }
        }

        self.loaded_vars = merged;
        Ok(())
    }

    /// The ordered list of directories searched for vars files: generic
    /// first, most specific (cluster-scoped) last
    fn vars_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for base in &self.search_dirs {
            let provider_dir = base.join(&self.name);
            let profile_dir = provider_dir.join(PROFILE_DIR).join(&self.profile);
            let cluster_dir = profile_dir.join(CLUSTER_DIR).join(&self.cluster);

            let mut candidates = vec![
                base.clone(),
                provider_dir.clone(),
                provider_dir.join(PROFILE_DIR),
                profile_dir.clone(),
                profile_dir.join(CLUSTER_DIR),
                cluster_dir.clone(),
            ];
            if !self.region.is_empty() {
                candidates.push(cluster_dir.join(&self.region));
            }

            for candidate in candidates {
                if candidate.is_dir() {
                    dirs.push(candidate);
                } else {
                    trace!("Provider vars dir doesn't exist: {}", candidate.display());
                }
            }
        }
        dirs
    }
}

/// YAML files directly inside `dir`, sorted by name
fn yaml_files_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

fn merge_vars_file(merged: &mut Mapping, path: &Path) -> Result<()> {
    trace!("Loading provider vars from {}", path.display());
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("error reading vars file '{}'", path.display()))?;
    let map: Mapping = serde_yaml::from_str(&raw)
        .map_err(|e| Error::ConfigInvalid(format!("vars file '{}': {}", path.display(), e)))?;
    vars::merge_into(merged, &map);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = Provider::new("gcp", "dev", "dev1", "", vec![]).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_more_specific_dirs_override() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        fs::write(base.join("defaults.yaml"), "region: eu-west-1\nkeep: base").unwrap();
        let cluster_dir = base.join("local/profiles/dev/clusters/dev1");
        fs::create_dir_all(&cluster_dir).unwrap();
        fs::write(cluster_dir.join("cluster.yaml"), "region: us-east-1").unwrap();

        let provider = Provider::new(LOCAL_PROVIDER, "dev", "dev1", "", vec![base]).unwrap();
        let vars = provider.vars();
        assert_eq!(
            vars.get(serde_yaml::Value::String("region".to_string())),
            Some(&serde_yaml::Value::String("us-east-1".to_string()))
        );
        assert_eq!(
            vars.get(serde_yaml::Value::String("keep".to_string())),
            Some(&serde_yaml::Value::String("base".to_string()))
        );
    }

    #[test]
    fn test_extra_paths_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider =
            Provider::new(LOCAL_PROVIDER, "dev", "dev1", "", vec![dir.path().to_path_buf()])
                .unwrap();
        assert!(provider.vars().is_empty());

        let extra = dir.path().join("extra.yaml");
        fs::write(&extra, "added: later").unwrap();
        provider.add_vars_path(extra);
        provider.refresh().unwrap();
        assert_eq!(
            provider.vars().get(serde_yaml::Value::String("added".to_string())),
            Some(&serde_yaml::Value::String("later".to_string()))
        );
    }

    #[test]
    fn test_aws_installer_vars_carry_region() {
        let provider = Provider::new(AWS_PROVIDER, "dev", "dev1", "eu-west-2", vec![]).unwrap();
        let vars = provider.installer_vars();
        assert_eq!(
            vars.get(serde_yaml::Value::String("region".to_string())),
            Some(&serde_yaml::Value::String("eu-west-2".to_string()))
        );
        let local = Provider::new(LOCAL_PROVIDER, "dev", "dev1", "", vec![]).unwrap();
        assert!(local.installer_vars().is_empty());
    }
}
