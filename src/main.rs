// SPDX-License-Identifier: GPL-3.0-or-later

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::ProgressBar;
use tracing::{debug, warn};

use nb_cli::config::Config;
use nb_cli::environment::{self, ManagerKind};
use nb_cli::error::CliError;
use nb_cli::extensions::{Extensions, InstallOptions};
use nb_cli::manifest::{ManifestStore, Requirement};
use nb_cli::process::{self, SpawnOptions};
use nb_cli::registry::{self, ModuleKind, Package, RegistryClient};
use nb_cli::reloader::Reloader;
use nb_cli::report::{json, terminal};
use nb_cli::runner::{self, BotEntry, DEFAULT_ENTRY, ProcessLauncher};
use nb_cli::watcher::{FileFilter, FsWatcher, watch_roots};
use nb_cli::{logging, meta, project, signals};

/// Interpreter used by `nb self`; falls back to the default interpreter.
const SELF_PYTHON_ENV: &str = "NB_CLI_PYTHON";

const RETRY_HINT: &str = "You may retry with `--no-restrict-version` to install the latest release.";

#[derive(Parser)]
#[command(
    name = "nb",
    about = "Bootstrap, extend and supervise NoneBot projects",
    version
)]
struct Cli {
    /// Directory to run in instead of the current one
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Python interpreter to use
    #[arg(long, global = true)]
    python: Option<PathBuf>,

    /// Do not pick up the project's virtual environment
    #[arg(long, global = true)]
    no_auto_venv: bool,

    /// Print debug diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot of the current project
    Run(RunArgs),

    /// Manage adapters
    Adapter {
        #[command(subcommand)]
        command: ModuleCommands,
    },

    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        command: ModuleCommands,
    },

    /// Manage drivers
    Driver {
        #[command(subcommand)]
        command: ModuleCommands,
    },

    /// Manage registry caches
    Cache {
        #[command(subcommand)]
        command: Option<CacheCommands>,
    },

    /// Convert a legacy manifest to the grouped format
    UpgradeFormat,

    /// Flatten a grouped manifest back to the legacy format
    DowngradeFormat,

    /// Manage packages in the CLI's own interpreter
    #[command(name = "self")]
    SelfManage {
        #[command(subcommand)]
        command: SelfCommands,
    },

    /// Show interpreter and environment manager information
    Env,

    /// Show or edit configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Entry file, relative to the project root
    #[arg(short, long, default_value = DEFAULT_ENTRY)]
    file: String,

    /// Restart the bot when source files change
    #[arg(short, long)]
    reload: bool,

    /// Extra directories to watch
    #[arg(long = "reload-dirs")]
    reload_dirs: Vec<PathBuf>,

    /// Directories to ignore while watching
    #[arg(long = "reload-dirs-excludes")]
    reload_dirs_excludes: Vec<PathBuf>,

    /// Globs of files that trigger a restart
    #[arg(long = "reload-includes")]
    reload_includes: Vec<String>,

    /// Globs of files that never trigger a restart
    #[arg(long = "reload-excludes")]
    reload_excludes: Vec<String>,

    /// Milliseconds to wait between stopping and restarting the bot
    #[arg(long = "reload-delay")]
    reload_delay: Option<u64>,

    /// Arguments passed to the bot
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum ModuleCommands {
    /// List the packages the project uses
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show every package in the registry
    Store {
        /// Also show packages installed outside the registry
        #[arg(long)]
        include_unpublished: bool,

        /// Maximum number of packages to display (0 for all)
        #[arg(long, default_value = "0")]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Search the registry
    Search {
        query: String,

        /// Maximum number of packages to display (0 for all)
        #[arg(long, default_value = "0")]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Install a package into the project
    #[command(visible_alias = "add")]
    Install(InstallArgs),

    /// Update an installed package
    Update(ChangeArgs),

    /// Remove a package from the project
    #[command(visible_alias = "remove")]
    Uninstall(ChangeArgs),
}

#[derive(Args)]
struct InstallArgs {
    /// Import path, distribution or display name
    name: String,

    /// Request the bare distribution instead of `>=` the registry version
    #[arg(long)]
    no_restrict_version: bool,

    /// Add to the development dependency group
    #[arg(long)]
    dev: bool,

    /// Accept a distribution the registry does not list
    #[arg(long)]
    allow_unpublished: bool,

    /// Environment manager to use instead of the detected one
    #[arg(long, value_enum)]
    manager: Option<ManagerKind>,

    /// Arguments passed to the environment manager
    #[arg(last = true)]
    extra: Vec<String>,
}

#[derive(Args)]
struct ChangeArgs {
    /// Import path, distribution or display name
    name: String,

    /// Environment manager to use instead of the detected one
    #[arg(long, value_enum)]
    manager: Option<ManagerKind>,

    /// Arguments passed to the environment manager
    #[arg(last = true)]
    extra: Vec<String>,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache file sizes
    Status,

    /// Delete cached catalogs
    Clear {
        /// Only delete catalogs of unpublished packages
        #[arg(long)]
        unpublished: bool,
    },

    /// Download catalogs again
    Update {
        /// Only this kind of module
        #[arg(value_enum)]
        kind: Option<ModuleKind>,
    },
}

#[derive(Subcommand)]
enum SelfCommands {
    /// Install packages next to the CLI
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Update packages next to the CLI
    Update {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Uninstall packages next to the CLI
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// List packages next to the CLI
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Open configuration file in $EDITOR
    Edit,
}

/// Per-invocation state shared by the commands.
struct Session {
    cwd: PathBuf,
    python: Option<PathBuf>,
    auto_venv: bool,
    config: Config,
}

impl Session {
    fn project_root(&self) -> Result<PathBuf> {
        Ok(project::find_project_root(&self.cwd)?)
    }

    fn python(&self, root: Option<&Path>) -> Result<PathBuf> {
        Ok(meta::resolve_python(
            self.python.as_deref(),
            root,
            self.auto_venv,
        )?)
    }

    fn registry(&self) -> Result<RegistryClient> {
        self.config.registry_client()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start the async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run_cli(cli));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run_cli(cli: Cli) -> i32 {
    if let Err(err) = signals::install() {
        warn!(%err, "failed to install signal handlers");
    }

    let retry_hint = wants_retry_hint(&cli.command);

    let result = if cancellable(&cli.command) {
        tokio::select! {
            result = dispatch(cli) => result,
            () = signals::interrupted() => Err(CliError::Cancelled.into()),
        }
    } else {
        dispatch(cli).await
    };

    match result {
        Ok(code) => code,
        Err(err) => report_error(&err, retry_hint),
    }
}

/// Commands that may be abandoned on an interrupt. Commands that drive a
/// child process leave interrupts to the child wrapper, which terminates and
/// reaps it.
fn cancellable(command: &Commands) -> bool {
    match command {
        Commands::Adapter { command }
        | Commands::Plugin { command }
        | Commands::Driver { command } => matches!(
            command,
            ModuleCommands::List { .. } | ModuleCommands::Store { .. } | ModuleCommands::Search { .. }
        ),
        Commands::Cache { .. } | Commands::UpgradeFormat | Commands::DowngradeFormat => true,
        Commands::Config { command } => !matches!(command, Some(ConfigCommands::Edit)),
        Commands::Run(_) | Commands::SelfManage { .. } | Commands::Env => false,
    }
}

fn wants_retry_hint(command: &Commands) -> bool {
    match command {
        Commands::Adapter { command }
        | Commands::Plugin { command }
        | Commands::Driver { command } => {
            matches!(command, ModuleCommands::Install(_) | ModuleCommands::Update(_))
        }
        _ => false,
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => env::current_dir().context("Failed to read the current directory")?,
    };
    let config = Config::load()?;
    let session = Session {
        cwd,
        python: cli.python,
        auto_venv: config.auto_venv && !cli.no_auto_venv,
        config,
    };

    let code = match cli.command {
        Commands::Run(args) => cmd_run(&session, &args).await,
        Commands::Adapter { command } => cmd_module(&session, ModuleKind::Adapter, command).await,
        Commands::Plugin { command } => cmd_module(&session, ModuleKind::Plugin, command).await,
        Commands::Driver { command } => cmd_module(&session, ModuleKind::Driver, command).await,
        Commands::Cache { command } => cmd_cache(&session, command).await,
        Commands::UpgradeFormat => cmd_format(&session, true),
        Commands::DowngradeFormat => cmd_format(&session, false),
        Commands::SelfManage { command } => cmd_self(&session, command).await,
        Commands::Env => cmd_env(&session).await,
        Commands::Config { command } => cmd_config(&session.config, &command),
    }?;
    Ok(code.unwrap_or(0))
}

/// Print `err` and pick the exit code. Errors outside the known taxonomy also
/// leave a crash report in the working directory.
fn report_error(err: &anyhow::Error, retry_hint: bool) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Cancelled) => 1,
        Some(CliError::NoSelectablePackage(_)) => {
            eprintln!("{err:#}");
            1
        }
        Some(failed @ CliError::ProcessExecutionError { .. }) => {
            eprintln!("Error: {err:#}");
            if retry_hint {
                eprintln!("{RETRY_HINT}");
            }
            failed.exit_code().filter(|code| *code > 0).unwrap_or(1)
        }
        Some(
            CliError::ProjectNotFound { .. }
            | CliError::ProjectInvalid(_)
            | CliError::ModuleLoadFailed { .. }
            | CliError::PythonInterpreter(_)
            | CliError::NoneBotNotInstalled
            | CliError::PipNotInstalled
            | CliError::UnknownManager(_)
            | CliError::InvalidRequirement { .. },
        ) => {
            eprintln!("Error: {err:#}");
            1
        }
        _ => {
            eprintln!("Error: {err:#}");
            match write_crash_report(err) {
                Ok(path) => eprintln!("Details were written to {}", path.display()),
                Err(log_err) => warn!(%log_err, "failed to write crash report"),
            }
            1
        }
    }
}

fn write_crash_report(err: &anyhow::Error) -> Result<PathBuf> {
    let now = chrono::Local::now();
    let path = env::current_dir()?.join(format!(
        "nb-cli-errors-{}.log",
        now.format("%Y%m%d-%H%M%S")
    ));
    let args: Vec<String> = env::args().collect();
    let body = format!(
        "time: {}\nversion: {}\ncommand: {}\n\n{err:?}\n",
        now.to_rfc3339(),
        env!("CARGO_PKG_VERSION"),
        args.join(" "),
    );
    fs::write(&path, body)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn cmd_run(session: &Session, args: &RunArgs) -> Result<Option<i32>> {
    let root = session.project_root()?;
    let python = session.python(Some(&root))?;
    let version = meta::requires_nonebot(&python).await?;
    debug!(python = %python.display(), nonebot = %version, "starting bot");

    let manifest = ManifestStore::new(&root).read()?;
    let entry = BotEntry::resolve(&root, &args.file, &manifest);
    let launcher = ProcessLauncher::new(python, entry, args.args.clone(), &root);

    if !args.reload {
        return Ok(Some(runner::run_once(&launcher).await?));
    }

    let reload = &session.config.reload;
    let dirs = prefer(args.reload_dirs.as_slice(), reload.dirs.as_slice());
    let dirs_excludes = prefer(args.reload_dirs_excludes.as_slice(), reload.dirs_excludes.as_slice());
    let includes = prefer(args.reload_includes.as_slice(), reload.includes.as_slice());
    let excludes = prefer(args.reload_excludes.as_slice(), reload.excludes.as_slice());
    let delay = args
        .reload_delay
        .map(Duration::from_millis)
        .unwrap_or_else(|| reload.delay());

    let filter = FileFilter::new(includes, excludes, &root)
        .with_exclude_dirs(dirs_excludes.iter().map(|dir| root.join(dir)));
    let watcher = FsWatcher::new(watch_roots(dirs, &root))?;
    for dir in watcher.roots() {
        eprintln!("Will watch for changes in these directories: {}", dir.display());
    }

    let mut reloader = Reloader::new(launcher, watcher, filter, &root).with_delay(delay);
    Ok(Some(reloader.run().await?))
}

/// Command-line values when given, otherwise the configured ones.
fn prefer<'a, T>(cli: &'a [T], configured: &'a [T]) -> &'a [T] {
    if cli.is_empty() { configured } else { cli }
}

async fn cmd_module(
    session: &Session,
    kind: ModuleKind,
    command: ModuleCommands,
) -> Result<Option<i32>> {
    let registry = session.registry()?;

    match command {
        ModuleCommands::Store {
            include_unpublished,
            limit,
            json,
        } => {
            let pb = spinner(format!("Loading {} list...", kind));
            let packages = registry.list(kind, None, include_unpublished).await;
            pb.finish_and_clear();
            show_packages(kind, packages?, limit, json)?;
        }
        ModuleCommands::Search { query, limit, json } => {
            let pb = spinner(format!("Searching {}...", kind.plural()));
            let packages = registry.list(kind, Some(&query), true).await;
            pb.finish_and_clear();
            show_packages(kind, packages?, limit, json)?;
        }
        ModuleCommands::List { json } => {
            let root = session.project_root()?;
            let manifest = ManifestStore::new(&root);
            let python = session.python(Some(&root))?;
            let executor = environment::get(None, &root, python, SpawnOptions::default());
            let extensions = Extensions::new(&registry, &manifest, executor.as_ref());
            let packages = extensions.list_installed(kind).await?;
            show_packages(kind, packages, 0, json)?;
        }
        ModuleCommands::Install(args) => {
            let root = session.project_root()?;
            let manifest = ManifestStore::new(&root);
            let python = session.python(Some(&root))?;
            let executor = environment::get(args.manager, &root, python, SpawnOptions::default());
            let extensions = Extensions::new(&registry, &manifest, executor.as_ref());

            let pb = spinner(format!("Loading {} list...", kind));
            let pkg = extensions
                .resolve(kind, &args.name, args.allow_unpublished)
                .await;
            pb.finish_and_clear();
            let pkg = pkg?;

            let options = InstallOptions {
                restrict_version: !args.no_restrict_version,
                dev: args.dev,
                extra_args: args.extra,
            };
            eprintln!("Installing {} {}...", kind, describe(&pkg));
            extensions.install(kind, &pkg, &options).await?;
            println!("Installed {} {}.", kind, describe(&pkg));
        }
        ModuleCommands::Update(args) => {
            let root = session.project_root()?;
            let manifest = ManifestStore::new(&root);
            let python = session.python(Some(&root))?;
            let executor = environment::get(args.manager, &root, python, SpawnOptions::default());
            let extensions = Extensions::new(&registry, &manifest, executor.as_ref());

            let pkg = extensions.resolve(kind, &args.name, true).await?;
            eprintln!("Updating {} {}...", kind, describe(&pkg));
            extensions.update(&pkg, &args.extra).await?;
            println!("Updated {} {}.", kind, describe(&pkg));
        }
        ModuleCommands::Uninstall(args) => {
            let root = session.project_root()?;
            let manifest = ManifestStore::new(&root);
            let python = session.python(Some(&root))?;
            let executor = environment::get(args.manager, &root, python, SpawnOptions::default());
            let extensions = Extensions::new(&registry, &manifest, executor.as_ref());

            let installed = extensions.list_installed(kind).await?;
            let pkg = registry::find_exact_package(&args.name, &installed)?.clone();
            if extensions.uninstall(kind, &pkg, &args.extra).await? {
                println!("Uninstalled {} {}.", kind, describe(&pkg));
            } else {
                println!(
                    "Removed {} {} from the manifest; {} is still used by another entry.",
                    kind,
                    pkg.module_name,
                    pkg.project_link
                );
            }
        }
    }
    Ok(None)
}

fn describe(pkg: &Package) -> String {
    format!("{} ({})", pkg.name, pkg.project_link)
}

fn show_packages(kind: ModuleKind, mut packages: Vec<Package>, limit: usize, as_json: bool) -> Result<()> {
    terminal::sort_packages(&mut packages);
    if as_json {
        json::print_json(kind, &packages)
    } else {
        terminal::print_packages(&packages, limit);
        Ok(())
    }
}

async fn cmd_cache(session: &Session, command: Option<CacheCommands>) -> Result<Option<i32>> {
    let registry = session.registry()?;

    match command {
        None | Some(CacheCommands::Status) => {
            println!("Cache location: {}", registry.cache_dir().display());
            println!("{}", terminal::cache_status_table(&registry.status().await));
        }
        Some(CacheCommands::Clear { unpublished }) => {
            if unpublished {
                registry.clear_unpublished().await?;
                println!("Cleared unpublished package caches.");
            } else {
                registry.clear().await?;
                println!("Cleared all package caches.");
            }
        }
        Some(CacheCommands::Update { kind }) => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => ModuleKind::ALL.to_vec(),
            };
            let mut failed = false;
            for kind in kinds {
                let pb = spinner(format!("Updating {} cache...", kind));
                let result = registry.refresh(kind).await;
                pb.finish_and_clear();
                match result {
                    Ok(catalog) => println!(
                        "Successfully updated data cache for module {kind} ({} entries).",
                        catalog.len()
                    ),
                    Err(err) => {
                        eprintln!("Error: Failed to update data cache for module {kind}: {err}");
                        failed = true;
                    }
                }
            }
            if failed {
                return Ok(Some(1));
            }
        }
    }
    Ok(None)
}

fn cmd_format(session: &Session, upgrade: bool) -> Result<Option<i32>> {
    let root = session.project_root()?;
    let store = ManifestStore::new(&root);
    if upgrade {
        if store.upgrade_format()? {
            println!("Upgraded {} to the grouped format.", store.path().display());
        } else {
            println!("{} already uses the grouped format.", store.path().display());
        }
    } else if store.downgrade_format()? {
        println!("Downgraded {} to the legacy format.", store.path().display());
    } else {
        println!("{} already uses the legacy format.", store.path().display());
    }
    Ok(None)
}

fn self_python(session: &Session) -> Result<PathBuf> {
    if let Some(python) = env::var_os(SELF_PYTHON_ENV) {
        return Ok(PathBuf::from(python));
    }
    session.python(None)
}

fn parse_requirements(packages: &[String]) -> Result<Vec<Requirement>> {
    packages
        .iter()
        .map(|package| package.parse::<Requirement>().map_err(anyhow::Error::from))
        .collect()
}

async fn cmd_self(session: &Session, command: SelfCommands) -> Result<Option<i32>> {
    let python = self_python(session)?;
    meta::requires_pip(&python).await?;
    let pip = environment::executor(ManagerKind::Pip, SpawnOptions::default(), python.clone(), None);

    match command {
        SelfCommands::Install { packages, extra } => {
            pip.install(&parse_requirements(&packages)?, &extra, false).await?;
        }
        SelfCommands::Update { packages, extra } => {
            pip.update(&parse_requirements(&packages)?, &extra).await?;
        }
        SelfCommands::Uninstall { packages, extra } => {
            pip.uninstall(&parse_requirements(&packages)?, &extra).await?;
        }
        SelfCommands::List => {
            let argv = [
                python.as_os_str(),
                OsStr::new("-m"),
                OsStr::new("pip"),
                OsStr::new("list"),
            ];
            let code = process::run(&argv, &SpawnOptions::default()).await?;
            if code != 0 {
                return Err(CliError::ProcessExecutionError {
                    program: python.display().to_string(),
                    code,
                }
                .into());
            }
        }
    }
    Ok(None)
}

async fn cmd_env(session: &Session) -> Result<Option<i32>> {
    let root = project::find_project_root(&session.cwd).ok();
    match &root {
        Some(root) => println!("Project: {}", root.display()),
        None => println!("Project: (none)"),
    }

    match session.python(root.as_deref()) {
        Ok(python) => {
            println!("Python: {}", python.display());
            match meta::python_version(&python).await {
                Ok(version) => println!("Python version: {}.{}", version.major, version.minor),
                Err(err) => println!("Python version: unavailable ({err})"),
            }
            let nonebot = meta::nonebot_version(&python).await.ok().flatten();
            println!("NoneBot: {}", nonebot.as_deref().unwrap_or("not installed"));
            let pip = meta::pip_version(&python).await.ok().flatten();
            println!("pip: {}", pip.as_deref().unwrap_or("not installed"));
        }
        Err(err) => println!("Python: unavailable ({err})"),
    }

    if let Some(root) = &root {
        let (current, available) = environment::probe(root);
        println!("Project manager: {current}");
        println!("Selected manager: {available}");
    }
    let managers: Vec<&str> = environment::available_managers()
        .into_iter()
        .map(ManagerKind::as_str)
        .collect();
    println!("Managers on PATH: {}", managers.join(", "));
    Ok(None)
}

fn cmd_config(config: &Config, command: &Option<ConfigCommands>) -> Result<Option<i32>> {
    match command {
        None | Some(ConfigCommands::Show) => cmd_config_show(config)?,
        Some(ConfigCommands::Edit) => cmd_config_edit()?,
    }
    Ok(None)
}

fn cmd_config_show(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    eprintln!("# {}", path.display());

    let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{toml}");
    Ok(())
}

fn cmd_config_edit() -> Result<()> {
    let path = Config::config_path()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    if !path.exists() {
        let default_toml = toml::to_string_pretty(&Config::default())
            .context("Failed to serialize default config")?;
        fs::write(&path, &default_toml)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        eprintln!("Created default config at {}", path.display());
    }

    let editor = env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let status = Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor '{editor}'"))?;

    if !status.success() {
        anyhow::bail!("Editor '{editor}' exited with {status}");
    }

    Ok(())
}
