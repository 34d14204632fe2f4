//! Worker pool and action dispatch for DAG walks.
//!
//! A fixed pool of workers drains the process queue while the walk
//! scheduler feeds it. Each worker builds the node's local registry from
//! its predecessors, templates the kapp twice (before and after outputs
//! are known) and dispatches the action. The first error terminates the
//! walk; in-flight workers finish their current kapp.

use super::{Dag, WalkDirection};
use crate::config;
use crate::errors::Error;
use crate::installable::Installable;
use crate::installer::{self, Installer};
use crate::manifest::{Action, NAMESPACE_SEPARATOR};
use crate::provisioner;
use crate::registry::{
    self, Registry, FIELD_SEPARATOR, KEY_OUTPUTS, TEMPLATE_NAMESPACE_SEPARATOR,
};
use crate::stack::Stack;
use crate::vars;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded};
use petgraph::graph::NodeIndex;
use serde_yaml::{Mapping, Value};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Pre-action id suppressing the installer call for a kapp
pub const ACTION_SKIP: &str = "skip";
/// Action id triggering `provisioner.update`
pub const ACTION_CLUSTER_UPDATE: &str = "cluster_update";
/// Action id triggering `provisioner.delete`
pub const ACTION_CLUSTER_DELETE: &str = "cluster_delete";
/// Action id registering extra provider vars files
pub const ACTION_ADD_PROVIDER_VARS_FILES: &str = "add_provider_vars_files";

/// Registry key under which rendered template paths are exposed
const KAPP_KEY: &str = "kapp";
const TEMPLATES_KEY: &str = "templates";

/// What to do to the processable nodes of the DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagAction {
    Install,
    Delete,
    Template,
    Clean,
    Output,
}

impl DagAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Delete => "delete",
            Self::Template => "template",
            Self::Clean => "clean",
            Self::Output => "output",
        }
    }

    /// Deletes tear dependents down first; everything else flows
    /// dependencies-first
    pub fn direction(self) -> WalkDirection {
        match self {
            Self::Delete => WalkDirection::Up,
            _ => WalkDirection::Down,
        }
    }
}

/// Flags controlling one `execute` run
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Invoke the installer unapproved first so kapps can plan changes
    pub plan: bool,

    /// Allow destructive operations to actually run
    pub approved: bool,

    pub skip_pre_actions: bool,
    pub skip_post_actions: bool,

    /// Degrade template/output errors to warnings (template action only)
    pub ignore_errors: bool,

    pub dry_run: bool,
}

impl Dag {
    /// Walk the DAG executing `action` on marked/processable nodes
    pub fn execute(&mut self, action: DagAction, stack: &Stack, opts: ExecuteOptions) -> Result<()> {
        let direction = action.direction();
        self.set_processable(direction);

        info!(
            "Executing DAG with action={}, plan={}, approved={}, skipPostActions={}, ignoreErrors={}, dryRun={}",
            action.name(),
            opts.plan,
            opts.approved,
            opts.skip_post_actions,
            opts.ignore_errors,
            opts.dry_run
        );

        if action == DagAction::Delete {
            // walk down first to load outputs and build local registries so
            // up-walk deletes can reference outputs of not-yet-deleted kapps
            self.init_local_registries(stack, action.name(), opts.approved, opts.dry_run)?;
        }

        let dag: &Dag = self;
        dag.run_pool(direction, |index| {
            process_node(dag, index, action, stack, &opts, direction)
        })
        .context("Error processing kapp")
    }

    /// Walk the DAG printing variables for all marked nodes
    pub fn execute_get_vars(
        &mut self,
        stack: &Stack,
        load_outputs: bool,
        suppress: &[String],
    ) -> Result<()> {
        self.set_processable(WalkDirection::Down);

        if load_outputs {
            // make outputs available in the dumped vars
            self.init_local_registries(stack, "vars", false, false)?;
        } else {
            debug!("Skipping loading outputs");
        }

        let dag: &Dag = self;
        dag.run_pool(WalkDirection::Down, |index| {
            vars_node(dag, index, stack, suppress)
        })
        .context("Error processing kapp")
    }

    /// Pre-pass: populate every processable node's local registry by
    /// walking down and loading whatever outputs already exist
    fn init_local_registries(
        &self,
        stack: &Stack,
        action_name: &str,
        approved: bool,
        dry_run: bool,
    ) -> Result<()> {
        debug!("Walking down the DAG to initialise local registries");
        self.run_pool(WalkDirection::Down, |index| {
            registry_node(self, index, stack, action_name, approved, dry_run)
        })
        .context("Error processing registry workers")
    }

    /// Run a worker pool over the processable nodes in `direction`.
    /// `worker_fn` returning `Ok` emits `done` for the node; the first
    /// error cancels the walk and is returned.
    fn run_pool<F>(&self, direction: WalkDirection, worker_fn: F) -> Result<()>
    where
        F: Fn(NodeIndex) -> Result<()> + Sync,
    {
        let num_workers = config::current().num_workers.max(1);

        let (process_tx, process_rx) = bounded::<NodeIndex>(num_workers);
        let (done_tx, done_rx) = bounded::<NodeIndex>(0);
        let (err_tx, err_rx) = unbounded::<anyhow::Error>();
        let (finished_tx, finished_rx) = bounded::<bool>(1);

        std::thread::scope(|scope| {
            // the cancel sender must live inside the scope: it is dropped in
            // the error arm below, while the scope is still joining, to wake
            // the walk
            let (cancel_tx, cancel_rx) = bounded::<()>(0);

            let worker_fn = &worker_fn;
            for _ in 0..num_workers {
                let process_rx = process_rx.clone();
                let done_tx = done_tx.clone();
                let err_tx = err_tx.clone();
                scope.spawn(move || {
                    while let Ok(index) = process_rx.recv() {
                        match worker_fn(index) {
                            Ok(()) => {
                                if done_tx.send(index).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                // one error per worker, then stop
                                let _ = err_tx.send(e);
                                return;
                            }
                        }
                    }
                });
            }
            drop(process_rx);
            drop(done_tx);
            drop(err_tx);

            scope.spawn(|| self.walk(direction, process_tx, done_rx, finished_tx, cancel_rx));

            debug!("Blocking waiting for the DAG to finish processing...");
            crossbeam_channel::select! {
                recv(err_rx) -> msg => {
                    // abort the walk: it drops process_tx, the idle workers'
                    // recv fails and the scope can join. In-flight workers
                    // still finish their current kapp.
                    drop(cancel_tx);
                    match msg {
                        Ok(e) => Err(e),
                        Err(_) => Err(anyhow::anyhow!("worker pool stopped unexpectedly")),
                    }
                }
                recv(finished_rx) -> _ => {
                    info!("Finished processing kapps");
                    Ok(())
                }
            }
        })
    }
}

/// Worker body for install/delete/template/clean/output
fn process_node(
    dag: &Dag,
    index: NodeIndex,
    action: DagAction,
    stack: &Stack,
    opts: &ExecuteOptions,
    direction: WalkDirection,
) -> Result<()> {
    build_local_registry(dag, index, direction)?;

    let node = dag.node(index);
    check_cache(&node.installable.read().expect("installable lock"))?;

    let installer = {
        let installable = node.installable.read().expect("installable lock");
        installer::for_installable(&installable).with_context(|| {
            format!(
                "Error instantiating installer for kapp '{}'",
                installable.id()
            )
        })?
    };

    match action {
        DagAction::Install => install_or_delete(true, dag, index, installer.as_ref(), stack, opts),
        DagAction::Delete => install_or_delete(false, dag, index, installer.as_ref(), stack, opts),
        DagAction::Template => template_node(dag, index, installer.as_ref(), stack, opts),
        DagAction::Clean => {
            if node.marked {
                let mut installable = node.installable.write().expect("installable lock");
                let templated_vars = stack.get_templated_vars(
                    Some(&installable),
                    &installer.get_vars(action.name(), opts.approved),
                )?;
                installable.template_descriptor(&templated_vars)?;
                installer
                    .clean(&installable, stack, opts.dry_run)
                    .with_context(|| format!("Error cleaning kapp '{}'", installable.id()))?;
            }
            Ok(())
        }
        DagAction::Output => {
            if node.marked {
                let mut installable = node.installable.write().expect("installable lock");
                let templated_vars = stack.get_templated_vars(
                    Some(&installable),
                    &installer.get_vars(action.name(), opts.approved),
                )?;
                installable.template_descriptor(&templated_vars)?;
                installer
                    .output(&installable, stack, opts.dry_run)
                    .with_context(|| {
                        format!("Error generating output for kapp '{}'", installable.id())
                    })?;
            }
            Ok(())
        }
    }
}

/// Shared install/delete pipeline. Deletes additionally load existing
/// outputs up front so the delete itself can reference them; installs
/// load outputs after the installer has (possibly) produced them.
fn install_or_delete(
    install: bool,
    dag: &Dag,
    index: NodeIndex,
    installer: &dyn Installer,
    stack: &Stack,
    opts: &ExecuteOptions,
) -> Result<()> {
    let node = dag.node(index);
    let marked = node.marked;
    let mut installable = node.installable.write().expect("installable lock");
    let fq_id = installable.fully_qualified_id();

    let action_name = if install { "install" } else { "delete" };
    let (pre_actions, post_actions) = if install {
        (
            installable.pre_install_actions().to_vec(),
            installable.post_install_actions().to_vec(),
        )
    } else {
        (
            installable.pre_delete_actions().to_vec(),
            installable.post_delete_actions().to_vec(),
        )
    };

    let installer_vars = installer.get_vars(action_name, opts.approved);

    // render templates in case any are used as outputs
    render_kapp_templates(stack, &mut installable, &installer_vars, opts.dry_run)?;

    if !install {
        // outputs of this kapp still exist; surface them before deleting
        let outputs = load_outputs(&installable, stack, installer, true, opts.dry_run)?;
        merge_outputs_into_local_registry(&mut installable, &outputs)?;
        render_kapp_templates(stack, &mut installable, &installer_vars, opts.dry_run)?;
    }

    // only plan or process kapps that are flagged for processing
    let mut skip_installer = false;
    if marked {
        if opts.plan {
            run_installer(install, installer, &installable, stack, false, opts.dry_run)
                .with_context(|| format!("Error planning kapp '{}'", installable.id()))?;
        }

        // pre actions only run once the changes are approved
        if opts.approved && !opts.skip_pre_actions {
            info!(
                "Will run {} pre {} action(s) for kapp '{}'",
                pre_actions.len(),
                action_name,
                fq_id
            );
            for action in &pre_actions {
                if action.id == ACTION_SKIP {
                    info!(
                        "Marking that we should skip running '{}' on kapp '{}'",
                        action_name, fq_id
                    );
                    skip_installer = true;
                } else {
                    execute_action(action, &installable, stack, opts.dry_run)?;
                }
            }
        }

        if opts.approved && !skip_installer {
            run_installer(
                install,
                installer,
                &installable,
                stack,
                opts.approved,
                opts.dry_run,
            )
            .with_context(|| format!("Error processing kapp '{}'", installable.id()))?;
        }
    }

    // load outputs after an approved install. Skipped kapps are assumed to
    // have been installed previously, so theirs are loaded too.
    if install && opts.approved {
        let outputs = load_outputs(&installable, stack, installer, false, opts.dry_run)?;
        merge_outputs_into_local_registry(&mut installable, &outputs)?;
    }

    // rerender templates so they can use the kapp's outputs
    render_kapp_templates(stack, &mut installable, &installer_vars, opts.dry_run)?;

    if marked && opts.approved && !opts.skip_post_actions {
        info!(
            "Will run {} post {} action(s) for kapp '{}'",
            post_actions.len(),
            action_name,
            fq_id
        );
        for action in &post_actions {
            execute_action(action, &installable, stack, opts.dry_run)?;
        }
    }

    Ok(())
}

fn run_installer(
    install: bool,
    installer: &dyn Installer,
    installable: &Installable,
    stack: &Stack,
    approved: bool,
    dry_run: bool,
) -> Result<()> {
    if install {
        installer.install(installable, stack, approved, dry_run)
    } else {
        installer.delete(installable, stack, approved, dry_run)
    }
}

/// Worker body for the template action. With `ignore_errors`, template
/// and output failures degrade to warnings and the node reports done.
fn template_node(
    dag: &Dag,
    index: NodeIndex,
    installer: &dyn Installer,
    stack: &Stack,
    opts: &ExecuteOptions,
) -> Result<()> {
    let node = dag.node(index);
    let mut installable = node.installable.write().expect("installable lock");
    let installer_vars = installer.get_vars(DagAction::Template.name(), opts.approved);

    // template before loading outputs in case loading them relies on
    // templated files (e.g. terraform backends)
    if node.marked {
        if let Err(e) =
            render_kapp_templates(stack, &mut installable, &installer_vars, opts.dry_run)
        {
            return ignore_or_fail(e, opts.ignore_errors, "templating kapp");
        }
    }

    let templated_vars = stack.get_templated_vars(Some(&installable), &installer_vars)?;
    installable.template_descriptor(&templated_vars)?;

    // try loading outputs, but don't fail the walk if we can't
    let outputs = match load_outputs(&installable, stack, installer, true, opts.dry_run) {
        Ok(outputs) => outputs,
        Err(e) => return ignore_or_fail(e, opts.ignore_errors, "getting outputs"),
    };
    merge_outputs_into_local_registry(&mut installable, &outputs)?;

    // only template marked nodes
    if node.marked {
        if let Err(e) =
            render_kapp_templates(stack, &mut installable, &installer_vars, opts.dry_run)
        {
            return ignore_or_fail(e, opts.ignore_errors, "templating kapp");
        }
    }

    Ok(())
}

/// Pre-pass worker body: template the descriptor and load whatever
/// outputs exist into the local registry
fn registry_node(
    dag: &Dag,
    index: NodeIndex,
    stack: &Stack,
    action_name: &str,
    approved: bool,
    dry_run: bool,
) -> Result<()> {
    build_local_registry(dag, index, WalkDirection::Down)?;

    let node = dag.node(index);
    check_cache(&node.installable.read().expect("installable lock"))?;

    let installer = {
        let installable = node.installable.read().expect("installable lock");
        installer::for_installable(&installable)?
    };

    let mut installable = node.installable.write().expect("installable lock");
    debug!(
        "Registry worker received kapp '{}' for processing",
        installable.fully_qualified_id()
    );

    let templated_vars = stack.get_templated_vars(
        Some(&installable),
        &installer.get_vars(action_name, approved),
    )?;
    installable.template_descriptor(&templated_vars)?;

    let outputs = load_outputs(&installable, stack, installer.as_ref(), true, dry_run)?;
    merge_outputs_into_local_registry(&mut installable, &outputs)?;
    Ok(())
}

/// Worker body for the vars action: dump merged vars and the templated
/// descriptor for marked nodes
fn vars_node(dag: &Dag, index: NodeIndex, stack: &Stack, suppress: &[String]) -> Result<()> {
    let node = dag.node(index);
    if !node.marked {
        debug!(
            "Not printing variables for unmarked kapp '{}'",
            node.installable
                .read()
                .expect("installable lock")
                .fully_qualified_id()
        );
        return Ok(());
    }

    check_cache(&node.installable.read().expect("installable lock"))?;
    let installer = {
        let installable = node.installable.read().expect("installable lock");
        installer::for_installable(&installable)?
    };

    let mut installable = node.installable.write().expect("installable lock");
    let fq_id = installable.fully_qualified_id();
    debug!("Getting variables for kapp '{}'", fq_id);

    let mut templated_vars =
        stack.get_templated_vars(Some(&installable), &installer.get_vars("vars", false))?;

    for exclusion in suppress {
        // allow leading dots for compatibility with template references
        let trimmed = exclusion.trim_start_matches('.');
        let segments: Vec<&str> = trimmed.split(FIELD_SEPARATOR).collect();
        let blanked = vars::blank_nested_map(&segments);
        debug!("Suppressing '{}' in vars output", trimmed);
        vars::merge_into(&mut templated_vars, &blanked);
    }

    let vars_yaml = serde_yaml::to_string(&templated_vars)?;
    write_block("variables", &fq_id, &vars_yaml)?;

    installable.template_descriptor(&templated_vars)?;
    let descriptor_yaml = serde_yaml::to_string(installable.descriptor())?;
    write_block("config", &fq_id, &descriptor_yaml)?;

    Ok(())
}

/// Format a bracketed stdout block for a kapp
pub fn format_block(what: &str, fq_id: &str, body: &str) -> String {
    format!(
        "\n***** Start {what} for kapp '{fq_id}' *****\n{body}***** End {what} for kapp '{fq_id}' *****\n"
    )
}

/// A single write per block: blocks from concurrent workers may
/// interleave with each other but never internally
fn write_block(what: &str, fq_id: &str, body: &str) -> Result<()> {
    let block = format_block(what, fq_id, body);
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(block.as_bytes())?;
    Ok(())
}

/// Run a recognised action. Unknown ids are fatal.
fn execute_action(
    action: &Action,
    installable: &Installable,
    stack: &Stack,
    dry_run: bool,
) -> Result<()> {
    info!(
        "Executing action '{}' for kapp '{}'",
        action.id,
        installable.fully_qualified_id()
    );
    match action.id.as_str() {
        // handled by the pre-action loop; nothing to do here
        ACTION_SKIP => Ok(()),
        ACTION_CLUSTER_UPDATE => {
            stack
                .provisioner()
                .update(dry_run)
                .with_context(|| {
                    format!(
                        "Error updating cluster, triggered by kapp '{}'",
                        installable.id()
                    )
                })?;
            if !dry_run {
                provisioner::wait_for_cluster_readiness(
                    stack.provisioner(),
                    stack.config().online_timeout,
                )?;
                stack.set_status(|status| {
                    status.is_online = true;
                    status.is_ready = true;
                });
            }
            Ok(())
        }
        ACTION_CLUSTER_DELETE => stack.provisioner().delete(dry_run).with_context(|| {
            format!(
                "Error deleting cluster, triggered by kapp '{}'",
                installable.id()
            )
        }),
        ACTION_ADD_PROVIDER_VARS_FILES => {
            for param in &action.params {
                let mut path = PathBuf::from(param);
                if path.is_relative() {
                    if let Some(config_dir) = installable.config_file_dir() {
                        path = config_dir.join(path);
                    }
                }
                stack.add_provider_vars_path(path);
            }
            // reload so the files just added take effect
            stack.refresh_provider_vars()
        }
        other => Err(Error::UnknownAction(other.to_string()).into()),
    }
}

/// Build a node's local registry from its predecessors in the walk
/// direction. Entries inherited across a manifest boundary lose their
/// short-form output keys; `outputs.this` never crosses a node boundary.
fn build_local_registry(dag: &Dag, index: NodeIndex, direction: WalkDirection) -> Result<()> {
    let node = dag.node(index);
    let own_manifest = node
        .installable
        .read()
        .expect("installable lock")
        .manifest_id()
        .to_string();

    // keep whatever a pre-pass already collected for this node
    let mut merged = node
        .installable
        .read()
        .expect("installable lock")
        .local_registry()
        .cloned()
        .unwrap_or_default();

    for parent_index in dag.neighbors(index, direction.predecessors()) {
        let parent = dag
            .node(parent_index)
            .installable
            .read()
            .expect("installable lock");

        // may be unset, e.g. if errors were ignored while building the cache
        let Some(parent_registry) = parent.local_registry() else {
            continue;
        };

        let mut snapshot = Registry::from_map(parent_registry.as_map());
        snapshot.delete(&registry::this_prefix());
        if parent.manifest_id() != own_manifest {
            for key in snapshot.short_output_keys() {
                snapshot.delete(&[KEY_OUTPUTS, key.as_str()].join(FIELD_SEPARATOR));
            }
        }

        merged.merge_map(&snapshot.as_map());
    }

    node.installable
        .write()
        .expect("installable lock")
        .set_local_registry(merged);
    Ok(())
}

/// Make a kapp generate its outputs, then load and return them
fn load_outputs(
    installable: &Installable,
    stack: &Stack,
    installer: &dyn Installer,
    ignore_missing: bool,
    dry_run: bool,
) -> Result<Mapping> {
    if !installable.has_outputs() {
        return Ok(Mapping::new());
    }

    // run the output target to write outputs to files
    installer
        .output(installable, stack, dry_run)
        .with_context(|| format!("Error writing output for kapp '{}'", installable.id()))?;

    installable
        .get_outputs(ignore_missing, dry_run)
        .with_context(|| format!("Error loading the output of kapp '{}'", installable.id()))
}

/// Merge freshly-loaded outputs into the kapp's local registry under its
/// `this`, short and fully-qualified prefixes
fn merge_outputs_into_local_registry(
    installable: &mut Installable,
    outputs: &Mapping,
) -> Result<()> {
    let mut local_registry = installable.local_registry().cloned().unwrap_or_default();
    if !outputs.is_empty() {
        add_outputs_to_registry(installable, outputs, &mut local_registry)?;
    }
    installable.set_local_registry(local_registry);
    Ok(())
}

/// Store outputs under `outputs.this.<id>`, `outputs.<kapp>.<id>` and
/// `outputs.<manifest>__<kapp>.<id>`. Hyphens become underscores because
/// the template engine rejects them in identifiers.
fn add_outputs_to_registry(
    installable: &Installable,
    outputs: &Mapping,
    target: &mut Registry,
) -> Result<()> {
    let underscored_id = installable.id().replace('-', "_");
    let underscored_fq_id = installable
        .fully_qualified_id()
        .replace('-', "_")
        .replace(NAMESPACE_SEPARATOR, TEMPLATE_NAMESPACE_SEPARATOR);

    let prefixes = [
        registry::this_prefix(),
        [KEY_OUTPUTS, underscored_id.as_str()].join(FIELD_SEPARATOR),
        [KEY_OUTPUTS, underscored_fq_id.as_str()].join(FIELD_SEPARATOR),
    ];

    for (output_id, output_value) in outputs {
        let Some(output_id) = output_id.as_str() else {
            continue;
        };
        let underscored_output = output_id.replace('-', "_");
        for prefix in &prefixes {
            let key = [prefix.as_str(), underscored_output.as_str()].join(FIELD_SEPARATOR);
            target.set(&key, output_value.clone())?;
        }
    }

    Ok(())
}

/// Template a kapp end to end: descriptor, declared template files, then
/// the descriptor again so it can reference the just-rendered paths
/// (exposed as `kapp.templates`)
fn render_kapp_templates(
    stack: &Stack,
    installable: &mut Installable,
    installer_vars: &Mapping,
    dry_run: bool,
) -> Result<()> {
    let templated_vars = stack.get_templated_vars(Some(installable), installer_vars)?;

    // template the descriptor in case variables refer to outputs
    installable.template_descriptor(&templated_vars)?;

    let mut templated_vars = stack.get_templated_vars(Some(installable), installer_vars)?;
    let rendered_paths = installable.render_templates(&templated_vars, false, dry_run)?;

    let rendered_values: Vec<Value> = rendered_paths
        .iter()
        .map(|p| Value::String(p.to_string_lossy().to_string()))
        .collect();
    let mut kapp_map = Mapping::new();
    kapp_map.insert(
        Value::String(TEMPLATES_KEY.to_string()),
        Value::Sequence(rendered_values),
    );
    let mut overlay = Mapping::new();
    overlay.insert(Value::String(KAPP_KEY.to_string()), Value::Mapping(kapp_map));

    debug!(
        "Merging {} rendered template path(s) into the vars of kapp '{}'",
        rendered_paths.len(),
        installable.fully_qualified_id()
    );
    vars::merge_into(&mut templated_vars, &overlay);

    // remerge so the descriptor can access the rendered template paths
    installable.template_descriptor(&templated_vars)?;
    Ok(())
}

fn check_cache(installable: &Installable) -> Result<()> {
    let cache_dir = installable.cache_dir().map(|p| p.to_path_buf()).unwrap_or_default();
    if !cache_dir.is_dir() {
        let msg = format!(
            "Kapp '{}' doesn't exist in the cache at '{}'",
            installable.id(),
            cache_dir.display()
        );
        warn!("{}", msg);
        return Err(Error::MissingCache {
            id: installable.id().to_string(),
            path: cache_dir,
        }
        .into());
    }
    Ok(())
}

fn ignore_or_fail(error: anyhow::Error, ignore_errors: bool, what: &str) -> Result<()> {
    if ignore_errors {
        warn!("Ignoring error {}: {:#}", what, error);
        Ok(())
    } else {
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_directions() {
        assert_eq!(DagAction::Install.direction(), WalkDirection::Down);
        assert_eq!(DagAction::Template.direction(), WalkDirection::Down);
        assert_eq!(DagAction::Clean.direction(), WalkDirection::Down);
        assert_eq!(DagAction::Output.direction(), WalkDirection::Down);
        assert_eq!(DagAction::Delete.direction(), WalkDirection::Up);
    }

    #[test]
    fn test_format_block_brackets_body() {
        let block = format_block("variables", "infra:vpc", "a: 1\n");
        assert!(block.starts_with("\n***** Start variables for kapp 'infra:vpc' *****\n"));
        assert!(block.ends_with("***** End variables for kapp 'infra:vpc' *****\n"));
        assert!(block.contains("a: 1\n"));
    }

    #[test]
    fn test_output_registry_keys() {
        let installable = Installable::new(
            "infra",
            "vpc-net",
            vec![serde_yaml::Mapping::new()],
        )
        .unwrap();
        let mut outputs = Mapping::new();
        outputs.insert(
            Value::String("vpc-id".to_string()),
            Value::String("vpc-123".to_string()),
        );

        let mut target = Registry::new();
        add_outputs_to_registry(&installable, &outputs, &mut target).unwrap();

        let expected = Value::String("vpc-123".to_string());
        assert_eq!(target.get("outputs.this.vpc_id"), Some(expected.clone()));
        assert_eq!(target.get("outputs.vpc_net.vpc_id"), Some(expected.clone()));
        assert_eq!(
            target.get("outputs.infra__vpc_net.vpc_id"),
            Some(expected)
        );
    }
}
