//! Source acquisition.
//!
//! Kapps declare where their source trees live; the acquirer materializes
//! them into the cache. Git sources use sparse checkouts so only the
//! kapp's subtree is fetched. Acquiring is idempotent: an existing
//! checkout is updated in place, but only if it is on the branch the
//! source demands.

use crate::errors::Error;
use crate::exec;
use crate::manifest::SourceSpec;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const GIT_PATH: &str = "git";

const QUICK_TIMEOUT_SECS: u64 = 5;
const FETCH_TIMEOUT_SECS: u64 = 60;
const CONFIGURE_TIMEOUT_SECS: u64 = 90;

/// Acquires a kapp source via `git` sparse checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAcquirer {
    id: String,
    repo: String,
    path: String,
    branch: String,
}

impl GitAcquirer {
    /// Build an acquirer from a source spec with a
    /// `repo//path/in/repo#branch` URI
    pub fn new(source: &SourceSpec) -> Result<Self> {
        let uri = source.uri.as_str();
        // split on the LAST '//' so https:// remotes parse too
        let (repo, rest) = uri
            .rfind("//")
            .filter(|idx| *idx > 0)
            .map(|idx| (&uri[..idx], &uri[idx + 2..]))
            .filter(|(repo, path)| !repo.is_empty() && !path.is_empty())
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "git source uri '{}' must look like repo//path#branch",
                    uri
                ))
            })?;

        let (path, branch) = match rest.split_once('#') {
            Some((path, branch)) if !branch.is_empty() => (path, branch.to_string()),
            _ => (rest, "master".to_string()),
        };

        Ok(Self {
            id: source.effective_id(),
            repo: repo.to_string(),
            path: path.trim_end_matches('/').to_string(),
            branch,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Fetch or update the source into `dest`
    pub fn acquire(&self, dest: &Path) -> Result<()> {
        if dest.join(".git").exists() {
            debug!(
                "Destination '{}' already exists... will update it",
                dest.display()
            );
            self.update(dest)
        } else {
            debug!(
                "Destination '{}' doesn't exist... will create it",
                dest.display()
            );
            self.clone_sparse(dest)
        }
        .map_err(|e| {
            anyhow::Error::from(Error::Acquirer {
                uri: format!("{}//{}#{}", self.repo, self.path, self.branch),
                reason: format!("{:#}", e),
            })
        })
    }

    fn git(&self, args: &[&str], dest: &Path, timeout_secs: u64) -> Result<exec::CommandOutput> {
        exec::run_checked(
            GIT_PATH,
            args,
            &HashMap::new(),
            Some(dest),
            timeout_secs,
            false,
        )
    }

    /// Sparse checkout into a fresh directory
    fn clone_sparse(&self, dest: &Path) -> Result<()> {
        info!(
            "Cloning git source '{}//{}' into '{}'",
            self.repo,
            self.path,
            dest.display()
        );

        fs::create_dir_all(dest)
            .with_context(|| format!("error creating directory '{}'", dest.display()))?;

        self.git(&["init"], dest, QUICK_TIMEOUT_SECS)?;
        self.git(
            &["remote", "add", "origin", &self.repo],
            dest,
            QUICK_TIMEOUT_SECS,
        )?;
        self.git(&["fetch"], dest, FETCH_TIMEOUT_SECS)?;
        self.git(
            &["config", "core.sparsecheckout", "true"],
            dest,
            CONFIGURE_TIMEOUT_SECS,
        )?;

        let sparse_file = dest.join(".git/info/sparse-checkout");
        if let Some(parent) = sparse_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&sparse_file, format!("{}/*\n", self.path))
            .with_context(|| format!("error writing '{}'", sparse_file.display()))?;

        self.git(&["checkout", &self.branch], dest, CONFIGURE_TIMEOUT_SECS)?;
        Ok(())
    }

    /// Pull a previously checked out source, refusing to switch branches
    fn update(&self, dest: &Path) -> Result<()> {
        let output = self.git(
            &["branch", "--format", "%(refname:short)"],
            dest,
            QUICK_TIMEOUT_SECS,
        )?;
        let local_branch = output.stdout.trim().to_string();

        if local_branch != self.branch {
            return Err(Error::BranchConflict {
                dest: dest.to_path_buf(),
                actual: local_branch,
                wanted: self.branch.clone(),
            }
            .into());
        }

        debug!(
            "Branch '{}' already checked out at '{}'. Will update it...",
            local_branch,
            dest.display()
        );
        self.git(
            &["pull", "origin", &self.branch],
            dest,
            CONFIGURE_TIMEOUT_SECS,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(uri: &str) -> SourceSpec {
        SourceSpec {
            id: String::new(),
            uri: uri.to_string(),
        }
    }

    #[test]
    fn test_parse_full_uri() {
        let acquirer =
            GitAcquirer::new(&source("git@github.com:org/kapps.git//services/web#main")).unwrap();
        assert_eq!(acquirer.repo, "git@github.com:org/kapps.git");
        assert_eq!(acquirer.path, "services/web");
        assert_eq!(acquirer.branch(), "main");
        assert_eq!(acquirer.id(), "web");
    }

    #[test]
    fn test_branch_defaults_to_master() {
        let acquirer = GitAcquirer::new(&source("git@github.com:org/kapps.git//web")).unwrap();
        assert_eq!(acquirer.branch(), "master");
    }

    #[test]
    fn test_uri_without_path_is_invalid() {
        let err = GitAcquirer::new(&source("git@github.com:org/kapps.git#main")).unwrap_err();
        assert!(err.to_string().contains("repo//path#branch"));
    }

    #[test]
    fn test_declared_id_wins() {
        let spec = SourceSpec {
            id: "custom".to_string(),
            uri: "git@github.com:org/kapps.git//web#main".to_string(),
        };
        assert_eq!(GitAcquirer::new(&spec).unwrap().id(), "custom");
    }
}
