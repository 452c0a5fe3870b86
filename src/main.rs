//! Charm CLI - dispatch plugin executions and reconcile remote jobs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use charm::{
    CharmConfig, CharmError, DispatchOutcome, Engine, ExecutionMode, ExecutionRecord, ExecutionStatus,
    FixSuggestion, LaunchConfig, MemoryStore, NewRecord, PluginDescriptor, PollOutcome,
    RecordId, RecordStore,
};

type Result<T> = std::result::Result<T, CharmError>;

#[derive(Parser)]
#[command(name = "charm")]
#[command(about = "Charm - plugin execution dispatch and status reconciliation")]
#[command(version)]
struct Cli {
    /// Config file (YAML); defaults apply if missing
    #[arg(long, global = true, default_value = "charm.yaml")]
    config: PathBuf,

    /// Store snapshot (YAML); created if missing
    #[arg(long, global = true, default_value = ".charm/store.yaml")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the plugin catalog
    Plugin {
        #[command(subcommand)]
        action: PluginCommand,
    },

    /// Create an execution record and bind its parameters
    Create {
        #[arg(long)]
        plugin: String,

        #[arg(long)]
        owner: String,

        /// Triggering record (required for data-processing plugins)
        #[arg(long)]
        parent: Option<RecordId>,

        /// Parameter as name=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Print a record's output directory (created if missing)
    Path { id: RecordId },

    /// Dispatch a record
    Run(RunArgs),

    /// Reconcile remote status
    Poll {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<RecordId>,

        /// Poll every record running on the job manager
        #[arg(long)]
        all: bool,
    },

    /// Register the files in a record's output directory
    Register { id: RecordId },

    /// Show a record's status, diagnostic and files
    Show { id: RecordId },

    /// List all records
    List,
}

#[derive(Subcommand)]
enum PluginCommand {
    /// Register a plugin descriptor from a YAML file
    Add { file: PathBuf },
}

#[derive(Args)]
struct RunArgs {
    id: RecordId,

    /// crunner (default) | pman | internal (embedding programs only)
    #[arg(short, long)]
    mode: Option<String>,

    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Override the resolved output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// In-process app name
    #[arg(long)]
    app: Option<String>,
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = CharmConfig::load(&cli.config)?.with_env()?;
    let store = Arc::new(MemoryStore::load(&cli.store)?);
    let engine = Engine::new(config, store)?;

    let result = execute(&engine, cli.command).await;
    // Failed runs still persist their terminal status
    engine.store().save(&cli.store)?;
    result
}

async fn execute(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Plugin {
            action: PluginCommand::Add { file },
        } => add_plugin(engine, &file),
        Commands::Create {
            plugin,
            owner,
            parent,
            params,
        } => create(engine, plugin, owner, parent, params),
        Commands::Path { id } => {
            let path = engine.resolver().resolve(id)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Run(args) => run(engine, args).await,
        Commands::Poll { id, all } => {
            if all {
                poll_all(engine).await
            } else {
                match id {
                    Some(id) => poll(engine, id).await,
                    None => Err(CharmError::validation("give a record id or --all")),
                }
            }
        }
        Commands::Register { id } => {
            let registration = engine.registrar().register(id)?;
            println!(
                "{} {} new of {} file(s) in {}",
                "✓".green(),
                registration.added,
                registration.discovered,
                registration.output_dir.display()
            );
            Ok(())
        }
        Commands::Show { id } => show(engine, id),
        Commands::List => {
            for record in engine.store().records() {
                println!(
                    "{:>5}  {:<20} {:<12} {}",
                    record.id,
                    record.plugin,
                    record.owner.username,
                    paint(record.status)
                );
            }
            Ok(())
        }
    }
}

fn add_plugin(engine: &Engine, file: &Path) -> Result<()> {
    let yaml = std::fs::read_to_string(file)?;
    let plugin: PluginDescriptor = serde_yaml::from_str(&yaml)?;
    let name = plugin.name.clone();
    let kind = plugin.kind;
    engine.store().insert_plugin(plugin)?;
    println!("{} Plugin '{}' ({}) registered", "✓".green(), name.cyan(), kind.as_str());
    Ok(())
}

fn create(
    engine: &Engine,
    plugin: String,
    owner: String,
    parent: Option<RecordId>,
    params: Vec<(String, String)>,
) -> Result<()> {
    let new = match parent {
        Some(parent) => NewRecord::child(plugin, owner, parent),
        None => NewRecord::root(plugin, owner),
    };
    let raw: BTreeMap<String, String> = params.into_iter().collect();
    let record = engine.dispatcher().submit(new, &raw)?;
    println!(
        "{} Created record {} ({})",
        "✓".green(),
        record.id.to_string().bold(),
        record.plugin
    );
    Ok(())
}

async fn run(engine: &Engine, args: RunArgs) -> Result<()> {
    let mut launch = LaunchConfig {
        mode: args.mode.as_deref().map(str::parse::<ExecutionMode>).transpose()?,
        ..LaunchConfig::default()
    };
    if let Some(dir) = args.input_dir {
        launch = launch.with_input_dir(dir);
    }
    if let Some(dir) = args.output_dir {
        launch = launch.with_output_dir(dir);
    }
    if let Some(app) = args.app {
        launch = launch.with_app(app);
    }

    let command = engine.dispatcher().command_for(args.id, &launch)?;
    println!("{} {}", "→".cyan(), command);

    match engine.dispatcher().run(args.id, &launch).await? {
        DispatchOutcome::Completed {
            registration,
            stdout,
        } => {
            if !stdout.is_empty() {
                print!("{}", stdout);
            }
            println!(
                "{} Record {} finished, {} file(s) registered",
                "✓".green(),
                args.id,
                registration.added
            );
        }
        DispatchOutcome::Submitted { accepted: true } => {
            println!("{} Record {} submitted to job manager", "✓".green(), args.id);
        }
        DispatchOutcome::Submitted { accepted: false } => {
            println!(
                "{} Job manager did not accept record {}; it stays started",
                "!".yellow(),
                args.id
            );
        }
    }
    Ok(())
}

async fn poll(engine: &Engine, id: RecordId) -> Result<()> {
    let outcome = engine.reconciler().poll(id).await?;
    report(id, &outcome);
    if let PollOutcome::Transitioned {
        to: ExecutionStatus::FinishedWithError,
        ..
    } = outcome
    {
        return Err(CharmError::RemoteJob { id });
    }
    Ok(())
}

async fn poll_all(engine: &Engine) -> Result<()> {
    let results = engine.reconciler().poll_all().await;
    if results.is_empty() {
        println!("No records running on the job manager");
    }
    for (id, result) in results {
        match result {
            Ok(outcome) => report(id, &outcome),
            Err(e) => eprintln!("{} record {}: {}", "Error:".red().bold(), id, e),
        }
    }
    Ok(())
}

fn report(id: RecordId, outcome: &PollOutcome) {
    match outcome {
        PollOutcome::Transitioned {
            from,
            to,
            registration,
            diagnostic,
        } => {
            println!(
                "{} Record {}: {} → {} ({} file(s) registered)",
                "✓".green(),
                id,
                from,
                paint(*to),
                registration.added
            );
            for line in diagnostic.iter().flat_map(|d| d.lines()) {
                println!("  {}", line.red());
            }
        }
        PollOutcome::Unchanged { remote } => {
            println!("{} Record {}: remote reports {}", "·".dimmed(), id, remote);
        }
        PollOutcome::Settled { status } => {
            println!("{} Record {} already {}", "·".dimmed(), id, paint(*status));
        }
        PollOutcome::Deferred { reason } => {
            println!("{} Record {}: poll deferred ({})", "!".yellow(), id, reason);
        }
    }
}

fn show(engine: &Engine, id: RecordId) -> Result<()> {
    let record: ExecutionRecord = engine
        .store()
        .record(id)
        .ok_or(CharmError::RecordNotFound { id })?;

    println!("{} {}", "Record".bold(), record.id);
    println!("  Plugin:  {}", record.plugin);
    println!("  Owner:   {}", record.owner.username);
    println!("  Status:  {}", paint(record.status));
    if let Some(parent) = record.parent {
        println!("  Parent:  {}", parent);
    }
    if let Some(mode) = record.mode {
        println!("  Mode:    {}", mode);
    }
    println!("  Started: {}", record.start_time.to_rfc3339());
    if let Some(end) = record.end_time {
        println!("  Ended:   {}", end.to_rfc3339());
    }
    if let Some(diagnostic) = &record.diagnostic {
        println!("  {}", "Diagnostic:".red());
        for line in diagnostic.lines() {
            println!("    {}", line);
        }
    }
    let files = engine.store().result_files(id);
    if !files.is_empty() {
        println!("  Files:");
        for file in files {
            println!("    {}", file.path.display());
        }
    }
    Ok(())
}

fn paint(status: ExecutionStatus) -> colored::ColoredString {
    match status {
        ExecutionStatus::Started => status.as_str().normal(),
        ExecutionStatus::RunningOnRemote => status.as_str().cyan(),
        ExecutionStatus::FinishedOnRemote => status.as_str().green(),
        ExecutionStatus::FinishedWithError => status.as_str().red(),
    }
}
