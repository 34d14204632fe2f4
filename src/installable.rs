//! A single installable unit (kapp).
//!
//! An installable's configuration is a stack of descriptor overlays:
//! manifest defaults, the manifest entry, the kapp's own config file from
//! the cache, and any programmatic overlays. The typed descriptor is the
//! merge of all overlays re-rendered through the template engine, so it is
//! recomputed whenever the variable environment changes and stays
//! idempotent for a fixed set of vars.

use crate::errors::Error;
use crate::manifest::{
    Action, KappDescriptor, KappState, OutputFormat, NAMESPACE_SEPARATOR, KAPP_CONFIG_FILE,
};
use crate::registry::Registry;
use crate::template;
use crate::vars;
use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct Installable {
    id: String,
    manifest_id: String,

    /// Descriptor overlays, lowest precedence first
    overlays: Vec<Mapping>,

    /// Currently-templated merged descriptor
    descriptor: KappDescriptor,

    cache_dir: Option<PathBuf>,
    config_file_dir: Option<PathBuf>,

    local_registry: Option<Registry>,
}

impl Installable {
    pub fn new(manifest_id: &str, id: &str, overlays: Vec<Mapping>) -> Result<Self> {
        let mut installable = Self {
            id: id.to_string(),
            manifest_id: manifest_id.to_string(),
            overlays,
            descriptor: KappDescriptor::default(),
            cache_dir: None,
            config_file_dir: None,
            local_registry: None,
        };
        installable.descriptor = installable.parse_merged(&installable.merged_overlays())?;
        Ok(installable)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manifest_id(&self) -> &str {
        &self.manifest_id
    }

    pub fn fully_qualified_id(&self) -> String {
        format!("{}{}{}", self.manifest_id, NAMESPACE_SEPARATOR, self.id)
    }

    pub fn state(&self) -> KappState {
        self.descriptor.state
    }

    /// The currently-templated descriptor
    pub fn descriptor(&self) -> &KappDescriptor {
        &self.descriptor
    }

    pub fn requires(&self) -> &[String] {
        &self.descriptor.requires
    }

    pub fn has_outputs(&self) -> bool {
        !self.descriptor.outputs.is_empty()
    }

    pub fn pre_install_actions(&self) -> &[Action] {
        &self.descriptor.pre_install_actions
    }

    pub fn post_install_actions(&self) -> &[Action] {
        &self.descriptor.post_install_actions
    }

    pub fn pre_delete_actions(&self) -> &[Action] {
        &self.descriptor.pre_delete_actions
    }

    pub fn post_delete_actions(&self) -> &[Action] {
        &self.descriptor.post_delete_actions
    }

    pub fn local_registry(&self) -> Option<&Registry> {
        self.local_registry.as_ref()
    }

    pub fn set_local_registry(&mut self, registry: Registry) {
        self.local_registry = Some(registry);
    }

    /// Push a descriptor overlay. `prepend` makes it the lowest-precedence
    /// layer instead of the highest.
    pub fn add_descriptor(&mut self, overlay: Mapping, prepend: bool) -> Result<()> {
        if prepend {
            self.overlays.insert(0, overlay);
        } else {
            self.overlays.push(overlay);
        }
        self.descriptor = self.parse_merged(&self.merged_overlays())?;
        Ok(())
    }

    /// Assign this kapp's cache dir under the top-level cache dir
    pub fn set_top_level_cache_dir(&mut self, top_level: &Path) {
        self.cache_dir = Some(top_level.join(&self.manifest_id).join(&self.id));
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Directory containing the kapp's own config file. Relative action
    /// params are resolved against this.
    pub fn config_file_dir(&self) -> Option<&Path> {
        self.config_file_dir.as_deref().or(self.cache_dir())
    }

    /// Load the kapp's config file from the cache (if present) and push it
    /// as the lowest-precedence overlay
    pub fn load_config_file(&mut self) -> Result<()> {
        let Some(cache_dir) = self.cache_dir().map(Path::to_path_buf) else {
            return Ok(());
        };
        if !cache_dir.exists() {
            return Ok(());
        }

        let Some(config_path) = find_config_file(&cache_dir) else {
            debug!(
                "Kapp '{}' has no {} in its cache dir",
                self.fully_qualified_id(),
                KAPP_CONFIG_FILE
            );
            return Ok(());
        };

        debug!(
            "Loading config for kapp '{}' from {}",
            self.fully_qualified_id(),
            config_path.display()
        );
        let yaml = fs::read_to_string(&config_path)
            .with_context(|| format!("error reading '{}'", config_path.display()))?;
        let overlay: Mapping = serde_yaml::from_str(&yaml).map_err(|e| {
            Error::ConfigInvalid(format!(
                "config file for kapp '{}': {}",
                self.fully_qualified_id(),
                e
            ))
        })?;
        self.config_file_dir = config_path.parent().map(Path::to_path_buf);
        self.add_descriptor(overlay, true)
    }

    /// Re-render the descriptor's string fields against `template_vars`.
    /// Always starts from the raw overlays, so repeated calls with the same
    /// vars converge on the same descriptor.
    pub fn template_descriptor(&mut self, template_vars: &Mapping) -> Result<()> {
        let merged = self.merged_overlays();
        let rendered = template::render_value(&Value::Mapping(merged), template_vars)
            .with_context(|| {
                format!(
                    "error templating descriptor of kapp '{}'",
                    self.fully_qualified_id()
                )
            })?;
        match rendered {
            Value::Mapping(map) => {
                self.descriptor = self.parse_merged(&map)?;
                Ok(())
            }
            _ => Err(Error::ConfigInvalid(format!(
                "descriptor of kapp '{}' is not a mapping",
                self.fully_qualified_id()
            ))
            .into()),
        }
    }

    /// The kapp's own variable layer: declared vars plus the intrinsic
    /// `kapp` map
    pub fn vars(&self) -> Mapping {
        let mut result = self.descriptor.vars.clone();

        let mut intrinsic = Mapping::new();
        intrinsic.insert(
            Value::String("id".to_string()),
            Value::String(self.id.clone()),
        );
        intrinsic.insert(
            Value::String("manifest_id".to_string()),
            Value::String(self.manifest_id.clone()),
        );
        intrinsic.insert(
            Value::String("fully_qualified_id".to_string()),
            Value::String(self.fully_qualified_id()),
        );
        intrinsic.insert(
            Value::String("state".to_string()),
            Value::String(
                match self.descriptor.state {
                    KappState::Present => "present",
                    KappState::Absent => "absent",
                }
                .to_string(),
            ),
        );
        if let Some(cache_dir) = self.cache_dir() {
            intrinsic.insert(
                Value::String("cache_root".to_string()),
                Value::String(cache_dir.to_string_lossy().to_string()),
            );
        }

        let mut kapp_map = Mapping::new();
        kapp_map.insert(Value::String("kapp".to_string()), Value::Mapping(intrinsic));
        vars::merge_into(&mut result, &kapp_map);
        result
    }

    /// Render this kapp's declared templates. Returns the absolute paths of
    /// the rendered files.
    pub fn render_templates(
        &self,
        template_vars: &Mapping,
        require_dest_dirs: bool,
        dry_run: bool,
    ) -> Result<Vec<PathBuf>> {
        if self.descriptor.templates.is_empty() {
            return Ok(Vec::new());
        }

        let cache_dir = self.cache_dir().ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "kapp '{}' has templates but no cache dir",
                self.fully_qualified_id()
            ))
        })?;

        let mut rendered_paths = Vec::with_capacity(self.descriptor.templates.len());
        for template in &self.descriptor.templates {
            let source = resolve_path(&template.source, cache_dir);
            let dest = resolve_path(&template.dest, cache_dir);

            trace!(
                "Rendering template '{}' -> '{}' for kapp '{}'",
                source.display(),
                dest.display(),
                self.fully_qualified_id()
            );
            template::render_file(&source, &dest, template_vars, require_dest_dirs, dry_run)
                .with_context(|| {
                    format!(
                        "error rendering template '{}' of kapp '{}'",
                        template.source,
                        self.fully_qualified_id()
                    )
                })?;
            rendered_paths.push(dest);
        }

        info!(
            "Rendered {} template(s) for kapp '{}'",
            rendered_paths.len(),
            self.fully_qualified_id()
        );
        Ok(rendered_paths)
    }

    /// Read back the output files the installer produced, keyed by output
    /// id. Returns an empty map if any are missing and `ignore_missing` is
    /// set.
    pub fn get_outputs(&self, ignore_missing: bool, dry_run: bool) -> Result<Mapping> {
        let mut outputs = Mapping::new();
        if self.descriptor.outputs.is_empty() {
            return Ok(outputs);
        }

        let cache_dir = self.cache_dir().ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "kapp '{}' declares outputs but no cache dir",
                self.fully_qualified_id()
            ))
        })?;

        for output in &self.descriptor.outputs {
            let path = resolve_path(&output.path, cache_dir);
            if !path.exists() {
                if ignore_missing || dry_run {
                    debug!(
                        "Ignoring missing output '{}' of kapp '{}'",
                        path.display(),
                        self.fully_qualified_id()
                    );
                    return Ok(Mapping::new());
                }
                return Err(Error::OutputLoad {
                    path,
                    reason: "output file doesn't exist".to_string(),
                }
                .into());
            }

            let raw = fs::read_to_string(&path).map_err(|e| Error::OutputLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;

            let value = parse_output(&raw, output.format).map_err(|e| Error::OutputLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            outputs.insert(Value::String(output.id.clone()), value);

            if output.sensitive && !dry_run {
                debug!(
                    "Deleting sensitive output file '{}' after loading",
                    path.display()
                );
                let _ = fs::remove_file(&path);
            }
        }

        Ok(outputs)
    }

    fn merged_overlays(&self) -> Mapping {
        let mut merged = Mapping::new();
        for overlay in &self.overlays {
            vars::merge_into(&mut merged, overlay);
        }
        merged
    }

    fn parse_merged(&self, merged: &Mapping) -> Result<KappDescriptor> {
        serde_yaml::from_value(Value::Mapping(merged.clone()))
            .map_err(|e| {
                Error::ConfigInvalid(format!(
                    "descriptor of kapp '{}{}{}': {}",
                    self.manifest_id, NAMESPACE_SEPARATOR, self.id, e
                ))
                .into()
            })
    }
}

/// Resolve a descriptor-relative path against the kapp's cache dir
fn resolve_path(path: &str, cache_dir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cache_dir.join(p)
    }
}

/// Shallowest config file wins when several are checked out
fn find_config_file(cache_dir: &Path) -> Option<PathBuf> {
    WalkDir::new(cache_dir)
        .max_depth(4)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == KAPP_CONFIG_FILE)
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

fn parse_output(raw: &str, format: OutputFormat) -> Result<Value> {
    match format {
        OutputFormat::Text => Ok(Value::String(raw.trim_end().to_string())),
        OutputFormat::Json => {
            let json: serde_json::Value = serde_json::from_str(raw)?;
            Ok(serde_yaml::to_value(json)?)
        }
        OutputFormat::Yaml => Ok(serde_yaml::from_str(raw)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn make_installable(yaml: &str) -> Installable {
        Installable::new("infra", "vpc", vec![overlay(yaml)]).unwrap()
    }

    #[test]
    fn test_identity() {
        let installable = make_installable("state: present");
        assert_eq!(installable.id(), "vpc");
        assert_eq!(installable.manifest_id(), "infra");
        assert_eq!(installable.fully_qualified_id(), "infra:vpc");
        assert_eq!(installable.state(), KappState::Present);
    }

    #[test]
    fn test_overlay_precedence() {
        let mut installable = make_installable("vars:\n  region: eu-west-1");
        installable
            .add_descriptor(overlay("vars:\n  region: us-east-1"), false)
            .unwrap();
        assert_eq!(
            installable.descriptor().vars,
            overlay("region: us-east-1")
        );

        // a prepended overlay is the weakest layer
        installable
            .add_descriptor(overlay("vars:\n  region: ap-south-1\n  zone: a"), true)
            .unwrap();
        assert_eq!(
            installable.descriptor().vars,
            overlay("region: us-east-1\nzone: a")
        );
    }

    #[test]
    fn test_template_descriptor_is_idempotent() {
        let mut installable =
            make_installable("vars:\n  bucket: 'state-{{ stack.cluster }}'");
        let template_vars: Mapping =
            serde_yaml::from_str("stack:\n  cluster: dev1").unwrap();

        installable.template_descriptor(&template_vars).unwrap();
        let first = installable.descriptor().clone();
        installable.template_descriptor(&template_vars).unwrap();
        assert_eq!(installable.descriptor(), &first);
        assert_eq!(
            first.vars,
            overlay("bucket: state-dev1")
        );
    }

    #[test]
    fn test_template_descriptor_resolves_outputs_when_available() {
        let mut installable =
            make_installable("vars:\n  upstream: '{{ outputs.infra__vpc.vpc_id }}'");

        // first pass: output not yet known, renders empty
        installable.template_descriptor(&Mapping::new()).unwrap();
        assert_eq!(installable.descriptor().vars, overlay("upstream: ''"));

        // second pass: output available
        let template_vars: Mapping =
            serde_yaml::from_str("outputs:\n  infra__vpc:\n    vpc_id: vpc-123").unwrap();
        installable.template_descriptor(&template_vars).unwrap();
        assert_eq!(installable.descriptor().vars, overlay("upstream: vpc-123"));
    }

    #[test]
    fn test_cache_dir_layout() {
        let mut installable = make_installable("{}");
        installable.set_top_level_cache_dir(Path::new("/tmp/cache"));
        assert_eq!(
            installable.cache_dir().unwrap(),
            Path::new("/tmp/cache/infra/vpc")
        );
    }

    #[test]
    fn test_vars_carries_kapp_intrinsics() {
        let mut installable = make_installable("vars:\n  answer: 42");
        installable.set_top_level_cache_dir(Path::new("/tmp/cache"));
        let kapp_vars = installable.vars();
        let kapp = kapp_vars
            .get(Value::String("kapp".to_string()))
            .and_then(|v| v.as_mapping())
            .unwrap();
        assert_eq!(
            kapp.get(Value::String("id".to_string())),
            Some(&Value::String("vpc".to_string()))
        );
        assert_eq!(
            kapp.get(Value::String("manifest_id".to_string())),
            Some(&Value::String("infra".to_string()))
        );
        assert_eq!(
            kapp_vars.get(Value::String("answer".to_string())),
            Some(&Value::Number(42.into()))
        );
    }

    #[test]
    fn test_get_outputs_parses_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut installable = Installable::new(
            "infra",
            "vpc",
            vec![overlay(
                "outputs:\n- id: vpc_id\n  path: out/id.txt\n  type: text\n- id: meta\n  path: out/meta.json\n  type: json",
            )],
        )
        .unwrap();
        installable.set_top_level_cache_dir(dir.path());
        let cache_dir = installable.cache_dir().unwrap().to_path_buf();
        fs::create_dir_all(cache_dir.join("out")).unwrap();
        fs::write(cache_dir.join("out/id.txt"), "vpc-123\n").unwrap();
        fs::write(cache_dir.join("out/meta.json"), r#"{"cidr": "10.0.0.0/16"}"#).unwrap();

        let outputs = installable.get_outputs(false, false).unwrap();
        assert_eq!(
            outputs.get(Value::String("vpc_id".to_string())),
            Some(&Value::String("vpc-123".to_string()))
        );
        let meta = outputs
            .get(Value::String("meta".to_string()))
            .and_then(|v| v.as_mapping())
            .unwrap();
        assert_eq!(
            meta.get(Value::String("cidr".to_string())),
            Some(&Value::String("10.0.0.0/16".to_string()))
        );
    }

    #[test]
    fn test_get_outputs_missing_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut installable = Installable::new(
            "infra",
            "vpc",
            vec![overlay("outputs:\n- id: vpc_id\n  path: out/id.txt\n  type: text")],
        )
        .unwrap();
        installable.set_top_level_cache_dir(dir.path());

        assert!(installable.get_outputs(true, false).unwrap().is_empty());
        let err = installable.get_outputs(false, false).unwrap_err();
        assert!(err
            .downcast_ref::<Error>()
            .map(|e| matches!(e, Error::OutputLoad { .. }))
            .unwrap_or(false));
    }

    #[test]
    fn test_sensitive_output_is_deleted_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut installable = Installable::new(
            "infra",
            "db",
            vec![overlay(
                "outputs:\n- id: password\n  path: out/pw.txt\n  type: text\n  sensitive: true",
            )],
        )
        .unwrap();
        installable.set_top_level_cache_dir(dir.path());
        let pw_path = installable.cache_dir().unwrap().join("out/pw.txt");
        fs::create_dir_all(pw_path.parent().unwrap()).unwrap();
        fs::write(&pw_path, "hunter2").unwrap();

        let outputs = installable.get_outputs(false, false).unwrap();
        assert_eq!(
            outputs.get(Value::String("password".to_string())),
            Some(&Value::String("hunter2".to_string()))
        );
        assert!(!pw_path.exists());
    }

    #[test]
    fn test_render_templates_returns_dest_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut installable = Installable::new(
            "apps",
            "svc",
            vec![overlay(
                "templates:\n- source: conf.tpl\n  dest: rendered/conf.yaml",
            )],
        )
        .unwrap();
        installable.set_top_level_cache_dir(dir.path());
        let cache_dir = installable.cache_dir().unwrap().to_path_buf();
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("conf.tpl"), "replicas: {{ replicas }}").unwrap();

        let template_vars: Mapping = serde_yaml::from_str("replicas: 3").unwrap();
        let rendered = installable
            .render_templates(&template_vars, false, false)
            .unwrap();
        assert_eq!(rendered, vec![cache_dir.join("rendered/conf.yaml")]);
        assert_eq!(
            fs::read_to_string(&rendered[0]).unwrap(),
            "replicas: 3"
        );
    }

    #[test]
    fn test_load_config_file_is_weakest_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let mut installable = Installable::new(
            "infra",
            "vpc",
            vec![overlay("vars:\n  region: from-manifest")],
        )
        .unwrap();
        installable.set_top_level_cache_dir(dir.path());
        let cache_dir = installable.cache_dir().unwrap().to_path_buf();
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(
            cache_dir.join(KAPP_CONFIG_FILE),
            "vars:\n  region: from-config-file\n  zone: a\nrequires:\n- infra:base",
        )
        .unwrap();

        installable.load_config_file().unwrap();
        assert_eq!(
            installable.descriptor().vars,
            overlay("region: from-manifest\nzone: a")
        );
        assert_eq!(installable.requires(), vec!["infra:base"]);
        assert_eq!(installable.config_file_dir().unwrap(), cache_dir);
    }
}
