//! Template rendering.
//!
//! Kapp descriptors and declared template files are rendered through
//! minijinja against the merged variable map. Undefined variables render
//! as empty strings rather than failing: descriptors are templated before
//! upstream outputs exist and again once they do, so the first pass must
//! tolerate holes.

use crate::errors::Error;
use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env
}

/// Render a single template string against the given vars
pub fn render_string(template: &str, template_vars: &Mapping) -> Result<String> {
    // fast path: nothing to substitute
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let env = environment();
    let ctx = minijinja::Value::from_serialize(template_vars);
    env.render_str(template, ctx)
        .map_err(|e| Error::TemplateRender(format!("{:#}", e)).into())
}

/// Recursively render every string inside a YAML value, leaving keys and
/// non-string leaves untouched
pub fn render_value(value: &Value, template_vars: &Mapping) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(render_string(s, template_vars)?)),
        Value::Sequence(items) => {
            let rendered: Result<Vec<Value>> = items
                .iter()
                .map(|item| render_value(item, template_vars))
                .collect();
            Ok(Value::Sequence(rendered?))
        }
        Value::Mapping(map) => {
            let mut rendered = Mapping::new();
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, template_vars)?);
            }
            Ok(Value::Mapping(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Render a template file from `source` to `dest`.
///
/// When `require_dest_dirs` is set the dest directory must already exist;
/// otherwise it is created. The write is atomic: a sibling temp file is
/// renamed over the destination.
pub fn render_file(
    source: &Path,
    dest: &Path,
    template_vars: &Mapping,
    require_dest_dirs: bool,
    dry_run: bool,
) -> Result<()> {
    let raw = fs::read_to_string(source)
        .with_context(|| format!("error reading template '{}'", source.display()))?;
    let rendered = render_string(&raw, template_vars)
        .with_context(|| format!("error rendering template '{}'", source.display()))?;

    if dry_run {
        info!(
            "Dry run: would write {} rendered bytes from '{}' to '{}'",
            rendered.len(),
            source.display(),
            dest.display()
        );
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        if !parent.exists() {
            if require_dest_dirs {
                return Err(Error::MissingTemplateDest(parent.to_path_buf()).into());
            }
            fs::create_dir_all(parent)
                .with_context(|| format!("error creating dir '{}'", parent.display()))?;
        }
    }

    let tmp = dest.with_extension("desplegar.tmp");
    fs::write(&tmp, rendered)
        .with_context(|| format!("error writing rendered template '{}'", tmp.display()))?;
    fs::rename(&tmp, dest)
        .with_context(|| format!("error moving rendered template into '{}'", dest.display()))?;

    debug!("Rendered template '{}' to '{}'", source.display(), dest.display());
    Ok(())
}
