//! Stacks: a named cluster plus the manifests deployed into it.
//!
//! The stack owns the merged stack config, the provider, the provisioner
//! and the global registry, and produces the full variable environment any
//! given kapp sees at a given moment. Workers share one stack across
//! threads; the mutable corners (provider vars, global registry, cluster
//! status) are individually synchronized.

use crate::errors::Error;
use crate::installable::Installable;
use crate::manifest::{Manifest, ManifestRef};
use crate::provider::Provider;
use crate::provisioner::{self, Provisioner};
use crate::registry::Registry;
use crate::vars;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// One stack entry in a stack file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct StackConfigEntry {
    provider: String,
    provisioner: String,
    profile: String,
    cluster: String,
    region: String,
    account: String,
    kube_context: String,
    manifests: Vec<ManifestRef>,
    provider_vars_dirs: Vec<PathBuf>,
    vars: Mapping,
    online_timeout: Option<u64>,
}

/// Fully-resolved stack configuration: the stack file entry merged with
/// CLI overrides
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub name: String,
    pub provider: String,
    pub provisioner: String,
    pub profile: String,
    pub cluster: String,
    pub region: String,
    pub account: String,
    pub kube_context: String,
    pub manifests: Vec<ManifestRef>,
    pub provider_vars_dirs: Vec<PathBuf>,
    pub vars: Mapping,
    pub online_timeout: u64,

    /// Directory of the stack file; relative paths resolve against it
    pub dir: PathBuf,
}

/// CLI-supplied field overrides, merged over the stack file entry
#[derive(Debug, Clone, Default)]
pub struct StackOverrides {
    pub provider: Option<String>,
    pub provisioner: Option<String>,
    pub profile: Option<String>,
    pub cluster: Option<String>,
    pub region: Option<String>,
    pub account: Option<String>,
}

impl StackConfig {
    /// Load the named stack from a stack file and apply CLI overrides
    pub fn load(stack_file: &Path, stack_name: &str, overrides: &StackOverrides) -> Result<Self> {
        debug!(
            "Loading stack '{}' from {}",
            stack_name,
            stack_file.display()
        );
        let raw = fs::read_to_string(stack_file)
            .with_context(|| format!("error reading stack file '{}'", stack_file.display()))?;
        let mut stacks: std::collections::HashMap<String, StackConfigEntry> =
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::ConfigInvalid(format!("stack file '{}': {}", stack_file.display(), e))
            })?;

        let entry = stacks.remove(stack_name).ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "no stack called '{}' in '{}'",
                stack_name,
                stack_file.display()
            ))
        })?;

        let dir = stack_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let pick = |over: &Option<String>, from_file: String| {
            over.clone().filter(|s| !s.is_empty()).unwrap_or(from_file)
        };

        let cluster = pick(&overrides.cluster, entry.cluster);
        let kube_context = if entry.kube_context.is_empty() {
            cluster.clone()
        } else {
            entry.kube_context
        };

        let config = Self {
            name: stack_name.to_string(),
            provider: pick(&overrides.provider, entry.provider),
            provisioner: pick(&overrides.provisioner, entry.provisioner),
            profile: pick(&overrides.profile, entry.profile),
            cluster,
            region: pick(&overrides.region, entry.region),
            account: pick(&overrides.account, entry.account),
            kube_context,
            manifests: entry.manifests,
            provider_vars_dirs: entry.provider_vars_dirs,
            vars: entry.vars,
            online_timeout: entry.online_timeout.unwrap_or(600),
            dir,
        };

        if config.provider.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "stack '{}' doesn't name a provider",
                stack_name
            ))
            .into());
        }

        Ok(config)
    }

    /// Provider vars dirs resolved against the stack file's directory
    pub fn absolute_provider_vars_dirs(&self) -> Vec<PathBuf> {
        self.provider_vars_dirs
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.dir.join(p)
                }
            })
            .collect()
    }

    /// The intrinsic `stack` variable map
    fn intrinsic_vars(&self) -> Mapping {
        let mut stack_map = Mapping::new();
        for (key, value) in [
            ("name", &self.name),
            ("provider", &self.provider),
            ("provisioner", &self.provisioner),
            ("profile", &self.profile),
            ("cluster", &self.cluster),
            ("region", &self.region),
            ("account", &self.account),
        ] {
            stack_map.insert(
                Value::String(key.to_string()),
                Value::String(value.clone()),
            );
        }

        let mut result = Mapping::new();
        result.insert(Value::String("stack".to_string()), Value::Mapping(stack_map));
        result.insert(
            Value::String("kube_context".to_string()),
            Value::String(self.kube_context.clone()),
        );
        result
    }
}

/// Cluster liveness as last observed by this run
#[derive(Debug, Clone, Default)]
pub struct ClusterStatus {
    pub is_online: bool,
    pub is_ready: bool,
    pub started_this_run: bool,
}

/// Manifest-scoped data the stack needs after the manifests themselves
/// have been handed to the DAG
#[derive(Debug, Clone)]
pub struct ManifestMeta {
    pub id: String,
    pub vars: Mapping,
}

pub struct Stack {
    config: StackConfig,
    manifests: Vec<ManifestMeta>,
    provider: RwLock<Provider>,
    provisioner: Box<dyn Provisioner>,
    registry: Mutex<Registry>,
    status: Mutex<ClusterStatus>,
}

impl Stack {
    pub fn new(config: StackConfig, manifests: &[Manifest]) -> Result<Self> {
        let provider = Provider::new(
            &config.provider,
            &config.profile,
            &config.cluster,
            &config.region,
            config.absolute_provider_vars_dirs(),
        )?;
        let provisioner = provisioner::new_provisioner(
            &config.provisioner,
            &config.cluster,
            &config.kube_context,
        )?;

        info!(
            "Initialised stack '{}' (provider={}, provisioner={}, cluster={})",
            config.name, config.provider, config.provisioner, config.cluster
        );

        Ok(Self {
            config,
            manifests: manifests
                .iter()
                .map(|m| ManifestMeta {
                    id: m.id.clone(),
                    vars: m.vars.clone(),
                })
                .collect(),
            provider: RwLock::new(provider),
            provisioner,
            registry: Mutex::new(Registry::new()),
            status: Mutex::new(ClusterStatus::default()),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    pub fn set_status<F: FnOnce(&mut ClusterStatus)>(&self, update: F) {
        update(&mut self.status.lock().expect("status lock poisoned"));
    }

    /// Snapshot of the global registry
    pub fn registry_snapshot(&self) -> Mapping {
        self.registry.lock().expect("registry lock poisoned").as_map()
    }

    /// Mutate the global registry under its lock
    pub fn with_registry<T, F: FnOnce(&mut Registry) -> T>(&self, f: F) -> T {
        f(&mut self.registry.lock().expect("registry lock poisoned"))
    }

    /// Current provider vars (deep copy)
    pub fn provider_vars(&self) -> Mapping {
        self.provider
            .read()
            .expect("provider lock poisoned")
            .vars()
            .clone()
    }

    /// Vars installers pass to every kapp for this provider
    pub fn provider_installer_vars(&self) -> Mapping {
        self.provider
            .read()
            .expect("provider lock poisoned")
            .installer_vars()
    }

    /// Register an extra provider vars file or dir
    pub fn add_provider_vars_path(&self, path: PathBuf) {
        self.provider
            .write()
            .expect("provider lock poisoned")
            .add_vars_path(path);
    }

    /// Reload provider vars from disk, picking up paths added at runtime
    pub fn refresh_provider_vars(&self) -> Result<()> {
        self.provider
            .write()
            .expect("provider lock poisoned")
            .refresh()
    }

    /// Merge the full variable environment available to `installable`
    /// right now. Later layers override earlier ones:
    /// stack defaults + provider vars, manifest vars, the kapp's own vars,
    /// the global registry, the kapp's local registry, then `extra`.
    pub fn get_templated_vars(
        &self,
        installable: Option<&Installable>,
        extra: &Mapping,
    ) -> Result<Mapping> {
        let mut merged = self.config.intrinsic_vars();
        vars::merge_into(&mut merged, &self.config.vars);
        vars::merge_into(&mut merged, &self.provider_vars());

        if let Some(installable) = installable {
            if let Some(meta) = self
                .manifests
                .iter()
                .find(|m| m.id == installable.manifest_id())
            {
                vars::merge_into(&mut merged, &meta.vars);
            }
            vars::merge_into(&mut merged, &installable.vars());
        }

        vars::merge_into(&mut merged, &self.registry_snapshot());

        if let Some(installable) = installable {
            if let Some(local_registry) = installable.local_registry() {
                vars::merge_into(&mut merged, &local_registry.as_map());
            }
        }

        vars::merge_into(&mut merged, extra);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK_YAML: &str = r#"
dev:
  provider: local
  provisioner: noop
  profile: dev
  cluster: dev1
  manifests:
    - manifests/infra.yaml
  vars:
    owner: platform-team
    region_alias: local
prod:
  provider: aws
  provisioner: noop
  profile: prod
  cluster: prod1
  region: eu-west-1
"#;

    fn write_stack_file(dir: &Path) -> PathBuf {
        let path = dir.join("stacks.yaml");
        fs::write(&path, STACK_YAML).unwrap();
        path
    }

    #[test]
    fn test_load_named_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack_file(dir.path());
        let config = StackConfig::load(&path, "dev", &StackOverrides::default()).unwrap();
        assert_eq!(config.provider, "local");
        assert_eq!(config.cluster, "dev1");
        assert_eq!(config.kube_context, "dev1");
        assert_eq!(config.manifests.len(), 1);
        assert_eq!(config.online_timeout, 600);
    }

    #[test]
    fn test_unknown_stack_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack_file(dir.path());
        let err = StackConfig::load(&path, "staging", &StackOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("no stack called 'staging'"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack_file(dir.path());
        let overrides = StackOverrides {
            cluster: Some("dev2".to_string()),
            region: Some("us-west-2".to_string()),
            ..Default::default()
        };
        let config = StackConfig::load(&path, "dev", &overrides).unwrap();
        assert_eq!(config.cluster, "dev2");
        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.profile, "dev");
    }

    #[test]
    fn test_templated_vars_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack_file(dir.path());
        let config = StackConfig::load(&path, "dev", &StackOverrides::default()).unwrap();

        let manifest = Manifest::parse(
            "infra",
            "vars:\n  owner: infra-team\nkapps:\n  vpc:\n    vars:\n      owner: vpc-team\n",
        )
        .unwrap();
        let stack = Stack::new(config, &[manifest.clone()]).unwrap();

        // stack layer only
        let stack_vars = stack.get_templated_vars(None, &Mapping::new()).unwrap();
        assert_eq!(
            stack_vars.get(Value::String("owner".to_string())),
            Some(&Value::String("platform-team".to_string()))
        );
        let stack_map = stack_vars
            .get(Value::String("stack".to_string()))
            .and_then(|v| v.as_mapping())
            .unwrap();
        assert_eq!(
            stack_map.get(Value::String("cluster".to_string())),
            Some(&Value::String("dev1".to_string()))
        );

        // kapp vars override manifest vars which override stack vars
        let installable = Installable::new(
            "infra",
            "vpc",
            vec![manifest.kapps.get("vpc").unwrap().clone()],
        )
        .unwrap();
        let kapp_vars = stack
            .get_templated_vars(Some(&installable), &Mapping::new())
            .unwrap();
        assert_eq!(
            kapp_vars.get(Value::String("owner".to_string())),
            Some(&Value::String("vpc-team".to_string()))
        );

        // extra beats everything
        let extra: Mapping = serde_yaml::from_str("owner: extra").unwrap();
        let with_extra = stack.get_templated_vars(Some(&installable), &extra).unwrap();
        assert_eq!(
            with_extra.get(Value::String("owner".to_string())),
            Some(&Value::String("extra".to_string()))
        );
    }

    #[test]
    fn test_global_registry_feeds_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack_file(dir.path());
        let config = StackConfig::load(&path, "dev", &StackOverrides::default()).unwrap();
        let stack = Stack::new(config, &[]).unwrap();

        stack.with_registry(|registry| {
            registry.set("kubeconfig", Value::String("/tmp/kc".to_string()))
        })
        .unwrap();

        let merged = stack.get_templated_vars(None, &Mapping::new()).unwrap();
        assert_eq!(
            merged.get(Value::String("kubeconfig".to_string())),
            Some(&Value::String("/tmp/kc".to_string()))
        );
    }
}
