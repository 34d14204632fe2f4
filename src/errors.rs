//! Error kinds for the orchestrator core.
//!
//! Most functions propagate `anyhow::Error` chains; the kinds below are
//! attached at the failure site so policy code (e.g. the always-fatal
//! missing-cache check) can downcast and branch on them.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the orchestrator core
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cyclic dependency between kapps: {0}")]
    CyclicDependency(String),

    #[error("kapp '{id}' doesn't exist in the cache at '{path}'")]
    MissingCache { id: String, path: PathBuf },

    #[error("template dest dir '{0}' doesn't exist")]
    MissingTemplateDest(PathBuf),

    #[error("error rendering template: {0}")]
    TemplateRender(String),

    #[error("error acquiring source '{uri}': {reason}")]
    Acquirer { uri: String, reason: String },

    #[error("installer '{target}' failed for kapp '{kapp}': {reason}")]
    Installer {
        target: String,
        kapp: String,
        reason: String,
    },

    #[error("error loading output '{path}': {reason}")]
    OutputLoad { path: PathBuf, reason: String },

    #[error(
        "branch conflict at '{dest}': checked out branch is '{actual}' but '{wanted}' is required"
    )]
    BranchConflict {
        dest: PathBuf,
        actual: String,
        wanted: String,
    },

    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("registry conflict at '{0}': key already holds a non-mapping value")]
    RegistryConflict(String),

    #[error("provisioner error: {0}")]
    Provisioner(String),
}
