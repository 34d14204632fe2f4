//! Cluster provisioners.
//!
//! A provisioner creates, updates and deletes the target cluster. Kapps
//! never talk to it directly; the executor invokes it for `cluster_update`
//! and `cluster_delete` actions, and `cluster create` drives it from the
//! CLI.

use crate::clustersot::{AlwaysOnlineSot, ClusterSot, KubeCtlSot};
use crate::errors::Error;
use crate::exec;
use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const MINIKUBE_PROVISIONER: &str = "minikube";
pub const NOOP_PROVISIONER: &str = "noop";

/// Seconds between liveness/readiness probe attempts
const POLL_SLEEP_SECS: u64 = 5;

const MINIKUBE_START_TIMEOUT_SECS: u64 = 600;
const MINIKUBE_STATUS_TIMEOUT_SECS: u64 = 30;

pub trait Provisioner: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, dry_run: bool) -> Result<()>;
    fn update(&self, dry_run: bool) -> Result<()>;
    fn delete(&self, dry_run: bool) -> Result<()>;
    fn is_already_online(&self) -> Result<bool>;
    fn cluster_sot(&self) -> Box<dyn ClusterSot>;
}

/// Instantiate a provisioner by name
pub fn new_provisioner(
    name: &str,
    cluster: &str,
    kube_context: &str,
) -> Result<Box<dyn Provisioner>> {
    match name {
        MINIKUBE_PROVISIONER => Ok(Box::new(MinikubeProvisioner {
            cluster: cluster.to_string(),
            kube_context: kube_context.to_string(),
        })),
        NOOP_PROVISIONER => Ok(Box::new(NoopProvisioner)),
        other => Err(Error::ConfigInvalid(format!("provisioner '{}' doesn't exist", other)).into()),
    }
}

/// Drives a local minikube profile
#[derive(Debug)]
pub struct MinikubeProvisioner {
    cluster: String,
    kube_context: String,
}

impl MinikubeProvisioner {
    fn run(&self, args: &[&str], timeout_secs: u64, dry_run: bool) -> Result<()> {
        exec::run_checked("minikube", args, &HashMap::new(), None, timeout_secs, dry_run)
            .map_err(|e| Error::Provisioner(format!("{:#}", e)))?;
        Ok(())
    }
}

impl Provisioner for MinikubeProvisioner {
    fn name(&self) -> &str {
        MINIKUBE_PROVISIONER
    }

    fn create(&self, dry_run: bool) -> Result<()> {
        info!("Creating minikube cluster '{}'...", self.cluster);
        self.run(
            &["start", "-p", &self.cluster],
            MINIKUBE_START_TIMEOUT_SECS,
            dry_run,
        )
    }

    fn update(&self, _dry_run: bool) -> Result<()> {
        // minikube has no reconcile step
        debug!("Minikube clusters can't be updated in place; nothing to do");
        Ok(())
    }

    fn delete(&self, dry_run: bool) -> Result<()> {
        info!("Deleting minikube cluster '{}'...", self.cluster);
        self.run(
            &["delete", "-p", &self.cluster],
            MINIKUBE_START_TIMEOUT_SECS,
            dry_run,
        )
    }

    fn is_already_online(&self) -> Result<bool> {
        let output = exec::run_captured(
            "minikube",
            &["status", "-p", &self.cluster],
            &HashMap::new(),
            None,
            MINIKUBE_STATUS_TIMEOUT_SECS,
            false,
        )?;
        Ok(output.success())
    }

    fn cluster_sot(&self) -> Box<dyn ClusterSot> {
        Box::new(KubeCtlSot::new(&self.kube_context, None))
    }
}

/// Provisioner for clusters managed out of band
#[derive(Debug)]
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn name(&self) -> &str {
        NOOP_PROVISIONER
    }

    fn create(&self, _dry_run: bool) -> Result<()> {
        Ok(())
    }

    fn update(&self, _dry_run: bool) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _dry_run: bool) -> Result<()> {
        Ok(())
    }

    fn is_already_online(&self) -> Result<bool> {
        Ok(true)
    }

    fn cluster_sot(&self) -> Box<dyn ClusterSot> {
        Box::new(AlwaysOnlineSot)
    }
}

/// Poll until the cluster is online and its system pods are settled, or
/// the timeout budget is exhausted
pub fn wait_for_cluster_readiness(
    provisioner: &dyn Provisioner,
    online_timeout_secs: u64,
) -> Result<()> {
    let sot = provisioner.cluster_sot();

    info!(
        "Checking whether the cluster is online... will try for {} seconds",
        online_timeout_secs
    );
    poll(
        || sot.is_online(),
        online_timeout_secs,
        "waiting for the cluster to come online",
    )?;
    info!("Cluster is online");

    info!("Checking whether the cluster is ready...");
    poll(
        || sot.is_ready(),
        online_timeout_secs,
        "waiting for the cluster to become ready",
    )?;
    info!("Cluster is ready");
    Ok(())
}

fn poll<F>(mut probe: F, timeout_secs: u64, what: &str) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if probe()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                command: what.to_string(),
                seconds: timeout_secs,
            }
            .into());
        }
        debug!("Not there yet. Sleeping...");
        std::thread::sleep(Duration::from_secs(POLL_SLEEP_SECS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provisioner_is_rejected() {
        let err = new_provisioner("kops", "dev1", "dev1").unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_noop_provisioner_is_always_online() {
        let provisioner = new_provisioner(NOOP_PROVISIONER, "dev1", "dev1").unwrap();
        assert!(provisioner.is_already_online().unwrap());
        provisioner.create(false).unwrap();
        provisioner.update(false).unwrap();
        provisioner.delete(false).unwrap();
    }

    #[test]
    fn test_readiness_wait_succeeds_for_noop() {
        let provisioner = new_provisioner(NOOP_PROVISIONER, "dev1", "dev1").unwrap();
        wait_for_cluster_readiness(provisioner.as_ref(), 1).unwrap();
    }

    #[test]
    fn test_poll_times_out() {
        let err = poll(|| Ok(false), 0, "testing").unwrap_err();
        assert!(err
            .downcast_ref::<Error>()
            .map(|e| matches!(e, Error::Timeout { .. }))
            .unwrap_or(false));
    }
}
