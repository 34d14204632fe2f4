//! Cluster source-of-truth probing.
//!
//! Answers two questions about the target cluster: is the API server
//! responding at all, and are the system pods settled. A probe that exits
//! non-zero means "not online yet", not an error; only failures to run the
//! probe at all propagate.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::exec;

const KUBECTL_PATH: &str = "kubectl";
const PROBE_TIMEOUT_SECS: u64 = 30;

pub trait ClusterSot: Send + Sync {
    fn is_online(&self) -> Result<bool>;
    fn is_ready(&self) -> Result<bool>;
}

/// Probes the cluster through `kubectl`
pub struct KubeCtlSot {
    kube_context: String,
    kubeconfig: Option<String>,
}

impl KubeCtlSot {
    pub fn new(kube_context: &str, kubeconfig: Option<String>) -> Self {
        Self {
            kube_context: kube_context.to_string(),
            kubeconfig,
        }
    }

    fn env(&self) -> HashMap<String, String> {
        let mut env_vars = HashMap::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            env_vars.insert("KUBECONFIG".to_string(), kubeconfig.clone());
        }
        env_vars
    }
}

impl ClusterSot for KubeCtlSot {
    fn is_online(&self) -> Result<bool> {
        let output = exec::run_captured(
            KUBECTL_PATH,
            &["--context", &self.kube_context, "get", "namespace"],
            &self.env(),
            None,
            PROBE_TIMEOUT_SECS,
            false,
        )?;

        if !output.success() {
            info!("Cluster isn't online yet - kubectl isn't getting results");
            return Ok(false);
        }
        Ok(true)
    }

    fn is_ready(&self) -> Result<bool> {
        let output = exec::run_checked(
            KUBECTL_PATH,
            &[
                "--context",
                &self.kube_context,
                "-n",
                "kube-system",
                "get",
                "pod",
                "-o",
                "jsonpath={.items[*].status.phase}",
            ],
            &self.env(),
            None,
            PROBE_TIMEOUT_SECS,
            false,
        )?;

        let pending: Vec<&str> = output
            .stdout
            .split_whitespace()
            .filter(|phase| *phase != "Running" && *phase != "Succeeded")
            .collect();

        if pending.is_empty() {
            Ok(true)
        } else {
            debug!("{} pod(s) not yet Running/Succeeded", pending.len());
            Ok(false)
        }
    }
}

/// Source of truth for clusters that are always there (noop provisioner)
pub struct AlwaysOnlineSot;

impl ClusterSot for AlwaysOnlineSot {
    fn is_online(&self) -> Result<bool> {
        Ok(true)
    }

    fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_online_sot() {
        let sot = AlwaysOnlineSot;
        assert!(sot.is_online().unwrap());
        assert!(sot.is_ready().unwrap());
    }
}
