//! Installer backends.
//!
//! An installer knows how to run a kapp's lifecycle targets. The `make`
//! backend shells out to the kapp's Makefile; `noop` exists for kapps
//! that carry nothing runnable (pure template/output kapps). Installers
//! also contribute a small vars layer (`action`, `approved`) so templates
//! can branch on what is happening to them.

use crate::config;
use crate::errors::Error;
use crate::exec;
use crate::installable::Installable;
use crate::stack::Stack;
use crate::vars::value_to_env_string;
use anyhow::Result;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const MAKE_INSTALLER: &str = "make";
pub const NOOP_INSTALLER: &str = "noop";

/// Lifecycle targets an installer can run for a kapp
pub trait Installer: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn install(
        &self,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
        dry_run: bool,
    ) -> Result<()>;

    fn delete(
        &self,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
        dry_run: bool,
    ) -> Result<()>;

    fn clean(&self, installable: &Installable, stack: &Stack, dry_run: bool) -> Result<()>;

    fn output(&self, installable: &Installable, stack: &Stack, dry_run: bool) -> Result<()>;

    /// Vars the installer contributes to the kapp's variable environment
    fn get_vars(&self, action: &str, approved: bool) -> Mapping {
        let mut vars = Mapping::new();
        vars.insert(
            Value::String("action".to_string()),
            Value::String(action.to_string()),
        );
        vars.insert(Value::String("approved".to_string()), Value::Bool(approved));
        vars
    }
}

/// Instantiate an installer backend by name
pub fn new_installer(name: &str) -> Result<Box<dyn Installer>> {
    match name {
        MAKE_INSTALLER => Ok(Box::new(MakeInstaller)),
        NOOP_INSTALLER => Ok(Box::new(NoopInstaller)),
        other => Err(Error::ConfigInvalid(format!("installer '{}' doesn't exist", other)).into()),
    }
}

/// The installer backend a kapp wants, defaulting to make
pub fn for_installable(installable: &Installable) -> Result<Box<dyn Installer>> {
    let name = installable
        .descriptor()
        .installer
        .clone()
        .unwrap_or_else(|| MAKE_INSTALLER.to_string());
    new_installer(&name)
}

/// Runs `make <target>` inside the kapp's cache dir
#[derive(Debug)]
pub struct MakeInstaller;

impl MakeInstaller {
    fn run_target(
        &self,
        target: &str,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        let cache_dir = installable.cache_dir().ok_or_else(|| Error::Installer {
            target: target.to_string(),
            kapp: installable.fully_qualified_id(),
            reason: "kapp has no cache dir".to_string(),
        })?;

        if !cache_dir.join("Makefile").exists() {
            return Err(Error::Installer {
                target: target.to_string(),
                kapp: installable.fully_qualified_id(),
                reason: format!("no Makefile in '{}'", cache_dir.display()),
            }
            .into());
        }

        let env_vars = self.env_vars(installable, stack, approved);
        info!(
            "Running 'make {}' for kapp '{}' (approved={})",
            target,
            installable.fully_qualified_id(),
            approved
        );

        let output = exec::run_checked(
            "make",
            &[target],
            &env_vars,
            Some(cache_dir),
            config::current().installer_timeout,
            dry_run,
        )
        .map_err(|e| Error::Installer {
            target: target.to_string(),
            kapp: installable.fully_qualified_id(),
            reason: format!("{:#}", e),
        })?;

        debug!(
            "'make {}' for '{}' wrote {} bytes to stdout",
            target,
            installable.fully_qualified_id(),
            output.stdout.len()
        );
        Ok(())
    }

    fn env_vars(
        &self,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
    ) -> HashMap<String, String> {
        let mut env_vars = HashMap::new();
        env_vars.insert("APPROVED".to_string(), approved.to_string());
        env_vars.insert("KAPP_ID".to_string(), installable.id().to_string());
        if let Some(cache_dir) = installable.cache_dir() {
            env_vars.insert(
                "KAPP_ROOT".to_string(),
                cache_dir.to_string_lossy().to_string(),
            );
        }

        for (key, value) in stack.provider_installer_vars() {
            if let Some(key) = key.as_str() {
                env_vars.insert(key.to_uppercase(), value_to_env_string(&value));
            }
        }

        for (key, value) in &installable.descriptor().env_vars {
            if let Some(key) = key.as_str() {
                env_vars.insert(key.to_uppercase(), value_to_env_string(value));
            }
        }

        env_vars
    }
}

impl Installer for MakeInstaller {
    fn name(&self) -> &str {
        MAKE_INSTALLER
    }

    fn install(
        &self,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        let result = self.run_target("install", installable, stack, approved, dry_run);
        cleanup_sensitive_templates(installable, dry_run);
        result
    }

    fn delete(
        &self,
        installable: &Installable,
        stack: &Stack,
        approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        let result = self.run_target("delete", installable, stack, approved, dry_run);
        cleanup_sensitive_templates(installable, dry_run);
        result
    }

    fn clean(&self, installable: &Installable, stack: &Stack, dry_run: bool) -> Result<()> {
        self.run_target("clean", installable, stack, false, dry_run)
    }

    fn output(&self, installable: &Installable, stack: &Stack, dry_run: bool) -> Result<()> {
        self.run_target("output", installable, stack, false, dry_run)
    }
}

/// Installer for kapps with nothing to run
#[derive(Debug)]
pub struct NoopInstaller;

impl Installer for NoopInstaller {
    fn name(&self) -> &str {
        NOOP_INSTALLER
    }

    fn install(
        &self,
        installable: &Installable,
        _stack: &Stack,
        _approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        debug!("Noop install for kapp '{}'", installable.fully_qualified_id());
        cleanup_sensitive_templates(installable, dry_run);
        Ok(())
    }

    fn delete(
        &self,
        installable: &Installable,
        _stack: &Stack,
        _approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        debug!("Noop delete for kapp '{}'", installable.fully_qualified_id());
        cleanup_sensitive_templates(installable, dry_run);
        Ok(())
    }

    fn clean(&self, _installable: &Installable, _stack: &Stack, _dry_run: bool) -> Result<()> {
        Ok(())
    }

    fn output(&self, _installable: &Installable, _stack: &Stack, _dry_run: bool) -> Result<()> {
        Ok(())
    }
}

/// Remove rendered sensitive templates once the kapp has run. Rendering
/// is the template pass's job; cleanup is ours.
fn cleanup_sensitive_templates(installable: &Installable, dry_run: bool) {
    if dry_run {
        return;
    }
    let Some(cache_dir) = installable.cache_dir() else {
        return;
    };
    for template in &installable.descriptor().templates {
        if !template.sensitive {
            continue;
        }
        let dest = Path::new(&template.dest);
        let dest = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            cache_dir.join(dest)
        };
        if dest.exists() {
            debug!("Deleting sensitive rendered template '{}'", dest.display());
            let _ = fs::remove_file(&dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_installer_is_rejected() {
        let err = new_installer("helm").unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_installer_vars() {
        let installer = new_installer(MAKE_INSTALLER).unwrap();
        let vars = installer.get_vars("install", true);
        assert_eq!(
            vars.get(Value::String("action".to_string())),
            Some(&Value::String("install".to_string()))
        );
        assert_eq!(
            vars.get(Value::String("approved".to_string())),
            Some(&Value::Bool(true))
        );
    }
}
