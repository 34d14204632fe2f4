//! On-disk kapp cache.
//!
//! Layout: `<cache>/<manifest-id>/<kapp-id>/<source-id>` with each
//! source's sparse checkout in its own subdirectory and the kapp's
//! config file anywhere inside the kapp dir. Creating the cache is
//! idempotent; existing checkouts are updated in place by the acquirer.

use crate::acquirer::GitAcquirer;
use crate::installable::Installable;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Create or refresh the cache for a set of installables. Returns how
/// many sources were acquired.
pub fn create_cache(
    installables: &mut [Installable],
    cache_dir: &Path,
    dry_run: bool,
) -> Result<usize> {
    info!("Building kapp cache in '{}'", cache_dir.display());
    let mut acquired = 0;

    for installable in installables.iter_mut() {
        installable.set_top_level_cache_dir(cache_dir);
        let kapp_dir = installable
            .cache_dir()
            .expect("cache dir was just assigned")
            .to_path_buf();

        if dry_run {
            info!(
                "Dry run: would acquire {} source(s) for kapp '{}' into '{}'",
                installable.descriptor().sources.len(),
                installable.fully_qualified_id(),
                kapp_dir.display()
            );
            continue;
        }

        fs::create_dir_all(&kapp_dir)
            .with_context(|| format!("error creating cache dir '{}'", kapp_dir.display()))?;

        for source in installable.descriptor().sources.clone() {
            let acquirer = GitAcquirer::new(&source)?;
            let dest = kapp_dir.join(acquirer.id());
            debug!(
                "Acquiring source '{}' of kapp '{}' into '{}'",
                source.uri,
                installable.fully_qualified_id(),
                dest.display()
            );
            acquirer.acquire(&dest)?;
            acquired += 1;
        }

        // pick up the kapp's own config file now its sources are present
        installable.load_config_file()?;
    }

    info!("Acquired {} source(s)", acquired);
    Ok(acquired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    #[test]
    fn test_cache_dirs_created_per_kapp() {
        let dir = tempfile::tempdir().unwrap();
        let mut installables = vec![
            Installable::new("infra", "vpc", vec![Mapping::new()]).unwrap(),
            Installable::new("apps", "web", vec![Mapping::new()]).unwrap(),
        ];

        let acquired = create_cache(&mut installables, dir.path(), false).unwrap();
        assert_eq!(acquired, 0);
        assert!(dir.path().join("infra/vpc").is_dir());
        assert!(dir.path().join("apps/web").is_dir());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut installables =
            vec![Installable::new("infra", "vpc", vec![Mapping::new()]).unwrap()];
        create_cache(&mut installables, dir.path(), true).unwrap();
        assert!(!dir.path().join("infra/vpc").exists());
    }
}
