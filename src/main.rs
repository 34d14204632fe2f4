//! desplegar CLI entry point.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use desplegar::dag::{self, Dag, DagAction, ExecuteOptions};
use desplegar::errors::Error;
use desplegar::manifest;
use desplegar::provisioner;
use desplegar::stack::{Stack, StackConfig, StackOverrides};
use desplegar::{cache, config};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "desplegar",
    version,
    about = "Deploy ordered stacks of kapps into Kubernetes clusters",
    propagate_version = true
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Number of parallel workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with the local kapp cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Install, delete, template or inspect kapps
    Kapps {
        #[command(subcommand)]
        command: KappsCommands,
    },
    /// Work with the target cluster
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
}

/// Positional stack selection plus config overrides, shared by most
/// subcommands
#[derive(Args)]
struct StackArgs {
    /// Path to the YAML file defining stacks by name
    stack_file: PathBuf,

    /// Name of the stack to operate on
    stack_name: String,

    /// Kapp cache directory
    #[arg(default_value = ".desplegar-cache")]
    cache_dir: PathBuf,

    /// Name of the provider, e.g. aws, local
    #[arg(long)]
    provider: Option<String>,

    /// Name of the provisioner, e.g. minikube, noop
    #[arg(long)]
    provisioner: Option<String>,

    /// Launch profile, e.g. dev, test, prod
    #[arg(long)]
    profile: Option<String>,

    /// Name of the cluster, e.g. dev1
    #[arg(long, short = 'c')]
    cluster: Option<String>,

    /// Account identifier (for providers that support it)
    #[arg(long, short = 'a')]
    account: Option<String>,

    /// Region (for providers that support it)
    #[arg(long, short = 'r')]
    region: Option<String>,
}

impl StackArgs {
    fn overrides(&self) -> StackOverrides {
        StackOverrides {
            provider: self.provider.clone(),
            provisioner: self.provisioner.clone(),
            profile: self.profile.clone(),
            cluster: self.cluster.clone(),
            region: self.region.clone(),
            account: self.account.clone(),
        }
    }
}

/// Kapp selection flags
#[derive(Args, Default)]
struct SelectArgs {
    /// Only process the given kapps (manifest-id:kapp-id, or manifest-id:*)
    #[arg(long, short = 'i')]
    include: Vec<String>,

    /// Exclude the given kapps (manifest-id:kapp-id, or manifest-id:*)
    #[arg(long, short = 'x')]
    exclude: Vec<String>,

    /// Also process all dependencies of included kapps
    #[arg(long)]
    parents: bool,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Create or refresh the local kapp cache for a stack
    Create {
        #[command(flatten)]
        stack_args: StackArgs,

        /// Show what would happen without acquiring anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum KappsCommands {
    /// Install kapps into the cluster according to the stack's manifests
    Apply {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        /// Actually make changes; without this kapps only plan them
        #[arg(long)]
        approved: bool,

        /// Plan and apply in a single invocation
        #[arg(long)]
        one_shot: bool,

        /// Install without a cluster diff (required; diffing isn't
        /// implemented)
        #[arg(long)]
        force: bool,

        /// Show what would happen but don't run installers
        #[arg(long)]
        dry_run: bool,

        /// Don't run pre-install actions
        #[arg(long)]
        skip_pre_actions: bool,

        /// Don't run post-install actions
        #[arg(long)]
        skip_post_actions: bool,
    },
    /// Delete kapps from the cluster, dependents first
    Delete {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        #[arg(long)]
        approved: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        skip_pre_actions: bool,

        #[arg(long)]
        skip_post_actions: bool,
    },
    /// Render the templates of the selected kapps
    Template {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        #[arg(long)]
        dry_run: bool,

        /// Warn on per-kapp template errors instead of aborting the walk
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Run the clean target of the selected kapps
    Clean {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        #[arg(long)]
        dry_run: bool,
    },
    /// Regenerate the outputs of the selected kapps
    Output {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        #[arg(long)]
        dry_run: bool,
    },
    /// Print the merged variables and templated descriptor of each kapp
    Vars {
        #[command(flatten)]
        stack_args: StackArgs,

        #[command(flatten)]
        select: SelectArgs,

        /// Don't load kapp outputs into the dumped variables
        #[arg(long)]
        skip_outputs: bool,

        /// Blank out the given dotted variable paths in the output
        #[arg(long)]
        suppress: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Create the cluster if it isn't already online, then wait for it to
    /// become ready
    Create {
        #[command(flatten)]
        stack_args: StackArgs,

        #[arg(long)]
        dry_run: bool,
    },
    /// Print the stack-level variables
    Vars {
        #[command(flatten)]
        stack_args: StackArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    config::init(config::Config {
        num_workers: cli.workers.unwrap_or_else(|| config::Config::default().num_workers),
        log_level: cli.log_level.clone(),
        ..config::Config::default()
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".bright_red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Cache { command } => match command {
            CacheCommands::Create {
                stack_args,
                dry_run,
            } => cache_create(&stack_args, dry_run),
        },
        Commands::Kapps { command } => run_kapps(command),
        Commands::Cluster { command } => match command {
            ClusterCommands::Create {
                stack_args,
                dry_run,
            } => cluster_create(&stack_args, dry_run),
            ClusterCommands::Vars { stack_args } => cluster_vars(&stack_args),
        },
    }
}

fn run_kapps(command: KappsCommands) -> Result<()> {
    match command {
        KappsCommands::Apply {
            stack_args,
            select,
            approved,
            one_shot,
            force,
            dry_run,
            skip_pre_actions,
            skip_post_actions,
        } => {
            if !force {
                return Err(Error::ConfigInvalid(
                    "cluster diffing is not implemented; pass --force to apply all kapps \
                     defined by the stack's manifests"
                        .to_string(),
                )
                .into());
            }

            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            let (plan, approved) = if one_shot {
                println!("Applying the plan in a single pass");
                (true, true)
            } else {
                println!("Applying the plan with APPROVED={}...", approved);
                (!approved, approved)
            };

            dag.execute(
                DagAction::Install,
                &stack,
                ExecuteOptions {
                    plan,
                    approved,
                    skip_pre_actions,
                    skip_post_actions,
                    ignore_errors: false,
                    dry_run,
                },
            )?;
            println!("{}", "Kapps successfully applied".bright_green());
            Ok(())
        }
        KappsCommands::Delete {
            stack_args,
            select,
            approved,
            dry_run,
            skip_pre_actions,
            skip_post_actions,
        } => {
            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            dag.execute(
                DagAction::Delete,
                &stack,
                ExecuteOptions {
                    plan: !approved,
                    approved,
                    skip_pre_actions,
                    skip_post_actions,
                    ignore_errors: false,
                    dry_run,
                },
            )?;
            println!("{}", "Kapps successfully deleted".bright_green());
            Ok(())
        }
        KappsCommands::Template {
            stack_args,
            select,
            dry_run,
            ignore_errors,
        } => {
            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            dag.execute(
                DagAction::Template,
                &stack,
                ExecuteOptions {
                    ignore_errors,
                    dry_run,
                    ..Default::default()
                },
            )?;
            println!("{}", "Kapps successfully templated".bright_green());
            Ok(())
        }
        KappsCommands::Clean {
            stack_args,
            select,
            dry_run,
        } => {
            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            dag.execute(
                DagAction::Clean,
                &stack,
                ExecuteOptions {
                    dry_run,
                    ..Default::default()
                },
            )
        }
        KappsCommands::Output {
            stack_args,
            select,
            dry_run,
        } => {
            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            dag.execute(
                DagAction::Output,
                &stack,
                ExecuteOptions {
                    dry_run,
                    ..Default::default()
                },
            )
        }
        KappsCommands::Vars {
            stack_args,
            select,
            skip_outputs,
            suppress,
        } => {
            let (stack, mut dag) = build_stack_and_dag(&stack_args, &select)?;
            dag.execute_get_vars(&stack, !skip_outputs, &suppress)
        }
    }
}

fn cache_create(stack_args: &StackArgs, dry_run: bool) -> Result<()> {
    let stack_config =
        StackConfig::load(&stack_args.stack_file, &stack_args.stack_name, &stack_args.overrides())?;
    let manifests = manifest::load_manifests(&stack_config.manifests, &stack_config.dir)?;
    let mut installables = dag::installables_from_manifests(&manifests)?;

    let acquired = cache::create_cache(&mut installables, &stack_args.cache_dir, dry_run)?;
    println!(
        "{} ({} kapps, {} sources)",
        "Cache created".bright_green(),
        installables.len(),
        acquired
    );
    Ok(())
}

fn cluster_create(stack_args: &StackArgs, dry_run: bool) -> Result<()> {
    let stack_config =
        StackConfig::load(&stack_args.stack_file, &stack_args.stack_name, &stack_args.overrides())?;
    let stack = Stack::new(stack_config, &[])?;

    if stack.provisioner().is_already_online()? {
        println!("Cluster '{}' is already online", stack.config().cluster);
        stack.set_status(|status| status.is_online = true);
    } else {
        println!("Creating cluster '{}'...", stack.config().cluster);
        stack.provisioner().create(dry_run)?;
        stack.set_status(|status| status.started_this_run = true);
    }

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

    println!("{}", "Cluster is ready".bright_green());
    Ok(())
}

fn cluster_vars(stack_args: &StackArgs) -> Result<()> {
    let stack_config =
        StackConfig::load(&stack_args.stack_file, &stack_args.stack_name, &stack_args.overrides())?;
    let manifests = manifest::load_manifests(&stack_config.manifests, &stack_config.dir)?;
    let stack = Stack::new(stack_config, &manifests)?;

    let merged = stack.get_templated_vars(None, &serde_yaml::Mapping::new())?;
    print!("{}", serde_yaml::to_string(&merged)?);
    Ok(())
}

/// Load the stack, its manifests and the cached kapps, then build and
/// mark the DAG
fn build_stack_and_dag(stack_args: &StackArgs, select: &SelectArgs) -> Result<(Stack, Dag)> {
    let stack_config =
        StackConfig::load(&stack_args.stack_file, &stack_args.stack_name, &stack_args.overrides())?;
    let manifests = manifest::load_manifests(&stack_config.manifests, &stack_config.dir)?;
    let stack = Stack::new(stack_config, &manifests)?;

    let mut installables = dag::installables_from_manifests(&manifests)?;
    // kapp config files can add requires, so load them before building edges
    for installable in &mut installables {
        installable.set_top_level_cache_dir(&stack_args.cache_dir);
        installable.load_config_file()?;
    }

    let mut dag = Dag::build(installables)?;
    dag.mark(&select.include, &select.exclude, select.parents)?;
    Ok((stack, dag))
}
