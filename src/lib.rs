//! desplegar: deploy ordered stacks of kapps into Kubernetes clusters.
//!
//! A stack names a cluster plus an ordered set of manifests; each
//! manifest lists installable units (kapps) with their sources,
//! dependencies, templates, variables and lifecycle actions. desplegar
//! fetches the sources into a local cache, builds a dependency graph
//! across all kapps and walks it in parallel to install, delete,
//! template or inspect the selected ones.

pub mod acquirer;
pub mod cache;
pub mod clustersot;
pub mod config;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod installable;
pub mod installer;
pub mod manifest;
pub mod provider;
pub mod provisioner;
pub mod registry;
pub mod stack;
pub mod template;
pub mod vars;

pub use config::Config;
pub use dag::{Dag, DagAction, ExecuteOptions, WalkDirection};
pub use errors::Error;
pub use installable::Installable;
pub use manifest::{Manifest, ManifestRef};
pub use registry::Registry;
pub use stack::{Stack, StackConfig, StackOverrides};
