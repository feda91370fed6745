mod config;
mod provider;
mod render;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;

use keel_core::address::ResourceAddress;
use keel_core::engine::{Engine, EngineConfig, LockMode, PlanOptions};
use keel_core::error::EngineResult;
use keel_core::executor::ApplyReport;
use keel_core::plan::Plan;
use keel_core::provider::ProviderRegistry;
use keel_state::create_backend;

use crate::config::LoadedConfig;
use crate::provider::FileProvider;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "A declarative infrastructure reconciliation tool", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, default_value = "keel.json")]
    config: PathBuf,

    /// Maximum number of concurrent provider calls
    #[arg(long, global = true, default_value_t = 10)]
    parallelism: usize,

    /// Seconds to wait for a busy state lock
    #[arg(long, global = true, default_value_t = 0)]
    lock_timeout: u64,

    /// Seconds a single provider call may take
    #[arg(long, global = true)]
    change_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show execution plan without applying changes
    Plan {
        /// Read every tracked resource before planning
        #[arg(long)]
        refresh: bool,

        /// Plan the deletion of every tracked resource
        #[arg(long)]
        destroy: bool,

        /// Plan without taking the state lock (the result may go stale)
        #[arg(long)]
        no_lock: bool,

        /// Save the plan as JSON for `apply --plan`
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Apply changes to reach the desired state
    Apply {
        /// Read every tracked resource before planning
        #[arg(long)]
        refresh: bool,

        /// Apply a plan saved with `plan --out`
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Stop starting new changes after this many seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Destroy all tracked resources
    Destroy {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Report resources changed or deleted outside of Keel
    Refresh,
    /// Inspect recorded state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Mark a resource instance for replacement on the next apply
    Taint {
        /// Resource address, e.g. file.index or file.part[0]
        address: String,
    },
    /// Remove the replacement mark from a resource instance
    Untaint { address: String },
    /// Release a lock left behind by an interrupted run
    ForceUnlock { lock_id: String },
    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print every tracked resource
    Show {
        /// Print the raw snapshot JSON
        #[arg(long)]
        json: bool,
    },
    /// List tracked resource addresses
    List,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "keel", &mut io::stdout());
        return Ok(());
    }

    let loaded = config::load(&cli.config)?;
    let deadline = match &cli.command {
        Commands::Apply {
            deadline: Some(secs),
            ..
        } => Some(Duration::from_secs(*secs)),
        _ => None,
    };
    let engine = build_engine(&cli, &loaded, deadline).await?;

    match cli.command {
        Commands::Plan {
            refresh,
            destroy,
            no_lock,
            out,
        } => {
            let lock_mode = if no_lock {
                LockMode::Relaxed
            } else {
                LockMode::Exclusive
            };
            let options = PlanOptions::new()
                .with_refresh(refresh)
                .with_destroy(destroy)
                .with_lock_mode(lock_mode);
            run_plan(&engine, &loaded, options, out.as_deref()).await
        }
        Commands::Apply { refresh, plan, .. } => {
            run_apply(&engine, &loaded, refresh, plan.as_deref()).await
        }
        Commands::Destroy { auto_approve } => run_destroy(&engine, &loaded, auto_approve).await,
        Commands::Refresh => {
            let result = engine.refresh().await.map_err(|e| e.to_string())?;
            print!("{}", render::render_refresh(&result));
            Ok(())
        }
        Commands::State { command } => run_state(&engine, command).await,
        Commands::Taint { address } => run_taint(&engine, &address, true).await,
        Commands::Untaint { address } => run_taint(&engine, &address, false).await,
        Commands::ForceUnlock { lock_id } => {
            engine
                .force_unlock(&lock_id)
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", format!("Lock {} released.", lock_id).green());
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

/// Directory that relative resource paths are resolved against
fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

async fn build_engine(
    cli: &Cli,
    loaded: &LoadedConfig,
    deadline: Option<Duration>,
) -> Result<Engine, String> {
    log::debug!(
        "Using {} backend, state key '{}'",
        loaded.backend.backend_type,
        loaded.backend.state_key()
    );
    let store = create_backend(&loaded.backend)
        .await
        .map_err(|e| e.to_string())?;
    let providers =
        ProviderRegistry::new().with(Arc::new(FileProvider::new(config_dir(&cli.config))));

    Ok(Engine::new(
        providers,
        Arc::from(store),
        engine_config(cli, loaded, deadline),
    ))
}

fn engine_config(cli: &Cli, loaded: &LoadedConfig, deadline: Option<Duration>) -> EngineConfig {
    EngineConfig {
        parallelism: cli.parallelism,
        lock_timeout: Duration::from_secs(cli.lock_timeout),
        change_timeout: cli.change_timeout.map(Duration::from_secs),
        deadline,
        state_key: loaded.backend.state_key().to_string(),
        ..EngineConfig::default()
    }
}

/// Stop starting new changes on Ctrl-C; running ones finish and are recorded
fn cancel_on_interrupt(engine: &Engine) {
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "Interrupted, waiting for running changes to finish...".yellow()
            );
            cancel.cancel();
        }
    });
}

async fn run_plan(
    engine: &Engine,
    loaded: &LoadedConfig,
    options: PlanOptions,
    out: Option<&Path>,
) -> Result<(), String> {
    let plan = engine
        .plan(&loaded.configuration, options)
        .await
        .map_err(|e| e.to_string())?;
    print!("{}", render::render_plan(&plan));

    if let Some(out) = out {
        let json = serde_json::to_string_pretty(&plan)
            .map_err(|e| format!("Failed to serialize plan: {}", e))?;
        fs::write(out, json).map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;
        println!("Saved plan to {}", out.display());
    }
    Ok(())
}

async fn run_apply(
    engine: &Engine,
    loaded: &LoadedConfig,
    refresh: bool,
    saved: Option<&Path>,
) -> Result<(), String> {
    let plan = match saved {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            serde_json::from_str::<Plan>(&content)
                .map_err(|e| format!("Invalid plan file {}: {}", path.display(), e))?
        }
        None => engine
            .plan(&loaded.configuration, PlanOptions::new().with_refresh(refresh))
            .await
            .map_err(|e| e.to_string())?,
    };

    print!("{}", render::render_plan(&plan));
    if plan.is_empty() {
        return Ok(());
    }

    log::info!("Applying plan with {} changes", plan.changes().len());
    println!();
    println!("{}", "Applying changes...".cyan().bold());
    cancel_on_interrupt(engine);
    finish(engine.apply_plan(&plan).await)
}

async fn run_destroy(engine: &Engine, loaded: &LoadedConfig, auto_approve: bool) -> Result<(), String> {
    let options = PlanOptions::new().with_destroy(true);
    let plan = engine
        .plan(&loaded.configuration, options)
        .await
        .map_err(|e| e.to_string())?;

    if plan.is_empty() {
        println!("{}", "No resources to destroy.".green());
        return Ok(());
    }
    print!("{}", render::render_plan(&plan));

    if !auto_approve && !confirm("Do you really want to destroy all resources? Type 'yes' to confirm:")? {
        println!("{}", "Destroy cancelled.".yellow());
        return Ok(());
    }

    log::info!("Destroying {} resources", plan.changes().len());
    println!();
    println!("{}", "Destroying resources...".red().bold());
    cancel_on_interrupt(engine);
    finish(engine.apply_plan(&plan).await)
}

fn confirm(prompt: &str) -> Result<bool, String> {
    print!("{} ", prompt.yellow().bold());
    io::stdout().flush().map_err(|e| e.to_string())?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| format!("Failed to read answer: {}", e))?;
    Ok(answer.trim() == "yes")
}

/// Print the outcome of an apply and turn failures into the CLI error
fn finish(result: EngineResult<ApplyReport>) -> Result<(), String> {
    match result {
        Ok(report) => {
            print!("{}", render::render_report(&report));
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                print!("{}", render::render_report(report));
            }
            if e.is_retryable() {
                Err(format!("{} (run the command again)", e))
            } else {
                Err(e.to_string())
            }
        }
    }
}

async fn run_state(engine: &Engine, command: StateCommands) -> Result<(), String> {
    let Some(snapshot) = engine.state().await.map_err(|e| e.to_string())? else {
        println!("No state recorded.");
        return Ok(());
    };

    match command {
        StateCommands::Show { json: true } => {
            let json = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| format!("Failed to serialize state: {}", e))?;
            println!("{}", json);
        }
        StateCommands::Show { json: false } => print!("{}", render::render_state(&snapshot)),
        StateCommands::List => {
            for address in snapshot.addresses() {
                println!("{}", address);
            }
        }
    }
    Ok(())
}

async fn run_taint(engine: &Engine, address: &str, tainted: bool) -> Result<(), String> {
    let address: ResourceAddress = address.parse().map_err(|e| format!("{}", e))?;
    engine
        .set_tainted(&address, tainted)
        .await
        .map_err(|e| e.to_string())?;

    let message = if tainted {
        format!("{} will be replaced on the next apply.", address)
    } else {
        format!("{} is no longer marked for replacement.", address)
    };
    println!("{}", message.green());
    Ok(())
}
