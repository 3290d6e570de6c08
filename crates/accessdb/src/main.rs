use std::env;
use std::path::{Path, PathBuf};

use accessdb_core::alias::canonicalize;
use accessdb_core::config::{AccessConfig, load_config};
use accessdb_core::error::MigrationError;
use accessdb_core::lease;
use accessdb_core::migrate::{Runner, RunnerOptions, migration_status, pending_steps};
use accessdb_core::reconcile::reconcile_exclusive;
use accessdb_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use accessdb_core::steps::CATALOG;
use accessdb_core::store::Store;
use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "accessdb",
    version,
    about = "Online migrations and permission reconciliation for the access store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the .accessdb/ layout and a default config
    Init(InitArgs),
    /// Apply pending migration steps under the migration lock
    Migrate(MigrateArgs),
    /// Show the progress marker, lock holder, pending steps and history
    Status(StatusArgs),
    /// Clear a stale migration lock
    Unlock(UnlockArgs),
    /// Rebuild permittables from workspace membership
    Reconcile(ReconcileArgs),
    /// Print the canonical alias for a raw string
    Alias(AliasArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .accessdb/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, value_name = "NAME", help = "Lock owner label (defaults to host and pid)")]
    owner: Option<String>,
    #[arg(long, help = "List pending steps without running them")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, help = "Print status as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct UnlockArgs {
    #[arg(long, help = "Clear the lock even if its lease has not expired")]
    force: bool,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long, help = "Also strip workspace-scoped ids from roleIds")]
    fix_role_ids: bool,
    #[arg(long, value_name = "NAME", help = "Lock owner label (defaults to host and pid)")]
    owner: Option<String>,
}

#[derive(Debug, Args)]
struct AliasArgs {
    raw: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Alias(AliasArgs { raw })) => {
            println!("{}", canonicalize(&raw));
            Ok(())
        }
        Some(Commands::Init(args)) => {
            let (paths, _) = prepare_runtime(&runtime)?;
            run_init(&runtime, &paths, args)
        }
        Some(Commands::Migrate(args)) => {
            let (paths, config) = prepare_runtime(&runtime)?;
            run_migrate(&runtime, &paths, &config, args)
        }
        Some(Commands::Status(args)) => {
            let (paths, _) = prepare_runtime(&runtime)?;
            run_status(&runtime, &paths, args)
        }
        Some(Commands::Unlock(args)) => {
            let (paths, _) = prepare_runtime(&runtime)?;
            run_unlock(&paths, args)
        }
        Some(Commands::Reconcile(args)) => {
            let (paths, config) = prepare_runtime(&runtime)?;
            run_reconcile(&paths, &config, args)
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Resolve paths, load config and install logging for store-backed commands.
fn prepare_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, AccessConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    init_logging(&config)?;
    Ok((paths, config))
}

fn init_logging(config: &AccessConfig) -> Result<()> {
    let directive = config.log_filter();
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter `{directive}`"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))
}

fn run_init(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: InitArgs) -> Result<()> {
    let report = init_layout(
        paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let store = Store::open(&paths.db_path)?;
    let progress = lease::read_progress(&store)?;

    println!("Initialized accessdb runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("current_key: {}", progress.current_key);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_migrate(
    runtime: &RuntimeOptions,
    paths: &ResolvedPaths,
    config: &AccessConfig,
    args: MigrateArgs,
) -> Result<()> {
    let store = Store::open(&paths.db_path)?;

    if args.dry_run {
        let pending = pending_steps(&store, CATALOG)?;
        println!("migrate (dry run)");
        println!("db_path: {}", normalize_path(&paths.db_path));
        println!("pending: {}", pending.len());
        for step in pending {
            println!("  - {} {}", step.key, step.name);
        }
        return Ok(());
    }

    let owner = resolve_owner(args.owner, config);
    let options = RunnerOptions {
        owner: owner.clone(),
        lease_ttl: config.lease_ttl()?,
        batch_size: config.batch_size()?,
    };
    let report = match Runner::new(&store, options).run(CATALOG) {
        Ok(report) => report,
        Err(err) => return Err(explain_migration_error(err)),
    };

    println!("migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("owner: {owner}");
    println!("previous_key: {}", report.previous_key);
    println!("current_key: {}", report.current_key);
    println!("applied: {}", report.applied.len());
    for applied in &report.applied {
        println!("  - {} {} ({} ms)", applied.key, applied.name, applied.elapsed_ms);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn explain_migration_error(err: MigrationError) -> anyhow::Error {
    if let Some(duplicate) = err.duplicate_key() {
        eprintln!("colliding values:");
        for value in &duplicate.values {
            eprintln!("  - {value}");
        }
    }
    if err.is_lock_acquisition_failure() {
        return anyhow::Error::new(err).context("another runner holds the migration lock; retry later");
    }
    anyhow::Error::new(err)
}

fn run_status(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: StatusArgs) -> Result<()> {
    let store = Store::open(&paths.db_path)?;
    let status = migration_status(&store, CATALOG)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let progress = &status.progress;
    println!("status");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("current_key: {}", progress.current_key);
    println!("locked: {}", format_flag(progress.locked));
    println!("owner: {}", progress.owner.as_deref().unwrap_or("<none>"));
    println!(
        "lease_expires_at_unix: {}",
        progress
            .lease_expires_at_unix
            .map(|value| value.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("pending: {}", status.pending.len());
    for step in &status.pending {
        println!("  - {} {}", step.key, step.name);
    }
    println!("history: {}", status.history.len());
    for entry in &status.history {
        println!(
            "  - {} {} by {} at unix {}",
            entry.key, entry.name, entry.owner, entry.applied_at_unix
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_unlock(paths: &ResolvedPaths, args: UnlockArgs) -> Result<()> {
    let store = Store::open(&paths.db_path)?;
    match lease::force_unlock(&store, args.force)? {
        Some(owner) => {
            info!(previous_owner = %owner, forced = args.force, "migration lock cleared");
            println!("unlocked: yes");
            println!("previous_owner: {owner}");
        }
        None => println!("unlocked: no (lock was not held)"),
    }
    Ok(())
}

fn run_reconcile(paths: &ResolvedPaths, config: &AccessConfig, args: ReconcileArgs) -> Result<()> {
    let store = Store::open(&paths.db_path)?;
    let owner = resolve_owner(args.owner, config);
    let run = reconcile_exclusive(
        &store,
        &owner,
        config.lease_ttl()?,
        config.batch_size()?,
        args.fix_role_ids,
    )?;

    if let Some(fixed) = run.fixed_role_ids {
        println!("fix_role_ids.scanned: {}", fixed.scanned);
        println!("fix_role_ids.updated: {}", fixed.updated);
    }
    let report = run.report;
    println!("reconcile.workspaces: {}", report.workspaces);
    println!("reconcile.permittables_scanned: {}", report.permittables_scanned);
    println!("reconcile.updated: {}", report.updated);
    println!("reconcile.created: {}", report.created);
    println!("reconcile.unresolved_roles: {}", report.unresolved_roles);
    Ok(())
}

fn resolve_owner(flag: Option<String>, config: &AccessConfig) -> String {
    flag.map(|owner| owner.trim().to_string())
        .filter(|owner| !owner.is_empty())
        .or_else(|| config.lock_owner())
        .unwrap_or_else(|| {
            let host = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("{host}-{}", std::process::id())
        })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
