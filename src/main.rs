use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

use crewdeck::api::CrewApi;
use crewdeck::config::CrewdeckConfig;
use crewdeck::model::{Crew, ExecutionRecord, ExecutionStatus};
use crewdeck::store::{validate, Entity, Origin};
use crewdeck::AppContext;

#[derive(Parser)]
#[command(
    name = "crewdeck",
    about = "Command-line client for a multi-agent crew orchestration service",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $CREWDECK_CONFIG, then ./crewdeck.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Service base URL
    #[arg(long, global = true, env = "CREWDECK_API_URL")]
    api_url: Option<String>,

    /// Live update websocket URL
    #[arg(long, global = true, env = "CREWDECK_WS_URL")]
    ws_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Service(ServiceCommand),

    /// Print the effective configuration
    Config,
}

/// Commands that run against an opened [`AppContext`].
#[derive(Subcommand)]
enum ServiceCommand {
    /// Manage crews
    Crews {
        #[command(subcommand)]
        action: CrewAction,
    },

    /// List agents
    Agents {
        #[command(subcommand)]
        action: ListAction,
    },

    /// List tasks
    Tasks {
        #[command(subcommand)]
        action: ListAction,
    },

    /// List crew templates (built-in and from the service)
    Templates {
        #[command(subcommand)]
        action: ListAction,
    },

    /// Launch a crew
    Execute {
        /// Crew id or name
        crew: String,

        /// Execution parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Follow live updates until the execution finishes
        #[arg(long)]
        watch: bool,
    },

    /// Inspect and control executions
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },

    /// Check that the service is reachable
    Health,
}

#[derive(Subcommand)]
enum CrewAction {
    /// List crews
    List {
        /// Show the stored list without contacting the service
        #[arg(long)]
        cached: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one crew with its agents and tasks
    Show {
        /// Crew id or name
        crew: String,

        #[arg(long)]
        json: bool,
    },

    /// Create a crew from a JSON definition
    Create {
        /// Path to the crew JSON
        file: PathBuf,
    },

    /// Delete a crew
    Delete { id: String },

    /// Check a crew definition without contacting the service
    Validate {
        /// Path to the crew JSON
        file: PathBuf,
    },

    /// Create a crew from a template
    FromTemplate {
        /// Template id
        template: String,

        /// Name for the new crew (default: the template's name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Export a crew through the service
    Export {
        id: String,

        /// Output file path (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Import an exported crew through the service
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum ListAction {
    /// List items
    List {
        #[arg(long)]
        cached: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions, newest first
    List {
        /// Only this status
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Only this crew id
        #[arg(long)]
        crew: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show one execution
    Show {
        id: String,

        /// Re-read it from the service first
        #[arg(long)]
        refresh: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print an execution's log
    Logs {
        id: String,

        /// Fetch the full log from the service first
        #[arg(long)]
        refresh: bool,
    },

    /// Cancel a running execution
    Cancel { id: String },

    /// Pause a running execution
    Pause { id: String },

    /// Resume a paused execution
    Resume { id: String },

    /// Counts per status
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Write an execution bundle file
    Export {
        id: String,

        /// Output file or directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load an execution bundle file
    Import { file: PathBuf },

    /// Forget every stored execution
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CrewdeckConfig::resolve(cli.config.as_deref())?;
    if let Some(url) = cli.api_url.clone().filter(|s| !s.is_empty()) {
        config.api.base_url = url;
    }
    if let Some(url) = cli.ws_url.clone().filter(|s| !s.is_empty()) {
        config.api.ws_url = url;
    }

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Config => print_config(&config),
        Commands::Service(command) => {
            let ctx = AppContext::open(config).await?;
            let outcome = run(&ctx, command).await;
            show_notifications(&ctx);
            ctx.shutdown().await;
            outcome
        }
    }
}

async fn run(ctx: &AppContext, command: ServiceCommand) -> Result<()> {
    match command {
        ServiceCommand::Crews { action } => crews(ctx, action).await,
        ServiceCommand::Agents {
            action: ListAction::List { cached, json },
        } => {
            let agents = if cached {
                ctx.crews.agents.list().await
            } else {
                report(ctx.crews.agents.fetch().await?)
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
            } else if agents.is_empty() {
                println!("No agents found.");
            } else {
                println!("{:<36} | {:<20} | Role", "ID", "Name");
                println!("{:-<36}-|-{:-<20}-|-{:-<30}", "", "", "");
                for a in agents {
                    println!("{:<36} | {:<20} | {}", a.id, a.name, a.role);
                }
            }
            Ok(())
        }
        ServiceCommand::Tasks {
            action: ListAction::List { cached, json },
        } => {
            let tasks = if cached {
                ctx.crews.tasks.list().await
            } else {
                report(ctx.crews.tasks.fetch().await?)
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!("{:<36} | {:<12} | Description", "ID", "Agent");
                println!("{:-<36}-|-{:-<12}-|-{:-<30}", "", "", "");
                for t in tasks {
                    println!(
                        "{:<36} | {:<12} | {}",
                        t.id,
                        t.agent.as_deref().unwrap_or("-"),
                        t.description
                    );
                }
            }
            Ok(())
        }
        ServiceCommand::Templates {
            action: ListAction::List { cached, json },
        } => {
            if !cached {
                if let Err(e) = ctx.crews.templates.fetch().await {
                    tracing::warn!(error = %e, "could not fetch templates, showing built-ins");
                }
            }
            let templates = ctx.crews.all_templates().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&templates)?);
            } else {
                println!("{:<20} | {:<22} | {:<10} | Members", "ID", "Name", "Category");
                println!("{:-<20}-|-{:-<22}-|-{:-<10}-|-{:-<10}", "", "", "", "");
                for t in templates {
                    println!(
                        "{:<20} | {:<22} | {:<10} | {} agents, {} tasks",
                        t.id,
                        t.name,
                        t.category.as_deref().unwrap_or("-"),
                        t.agents.len(),
                        t.tasks.len()
                    );
                }
            }
            Ok(())
        }
        ServiceCommand::Execute { crew, params, watch } => {
            let params: Value = serde_json::from_str(&params).context("--params is not valid JSON")?;
            if !params.is_object() {
                bail!("--params must be a JSON object");
            }
            tracing::info!(%crew, watch, "Launching crew");
            let launched = ctx.execute(&crew, params).await?;
            let record = report(launched);
            println!("Execution {} started ({}).", record.id, record.status);
            if watch {
                follow(ctx, &record.id).await?;
            }
            Ok(())
        }
        ServiceCommand::Executions { action } => executions(ctx, action).await,
        ServiceCommand::Health => {
            let body = ctx.api.health().await?;
            let status = body.get("status").and_then(Value::as_str).unwrap_or("unknown");
            println!("Service at {}: {}", ctx.config.api.base_url, status);
            Ok(())
        }
    }
}

async fn crews(ctx: &AppContext, action: CrewAction) -> Result<()> {
    match action {
        CrewAction::List { cached, json } => {
            let crews = if cached {
                ctx.crews.crews.list().await
            } else {
                report(ctx.crews.crews.fetch().await?)
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&crews)?);
            } else if crews.is_empty() {
                println!("No crews found.");
            } else {
                println!(
                    "{:<36} | {:<24} | {:<8} | {:<6} | {:<5} | Runs",
                    "ID", "Name", "Status", "Agents", "Tasks"
                );
                println!("{:-<36}-|-{:-<24}-|-{:-<8}-|-{:-<6}-|-{:-<5}-|-{:-<4}", "", "", "", "", "", "");
                for c in crews {
                    println!(
                        "{:<36} | {:<24} | {:<8} | {:<6} | {:<5} | {}",
                        c.id,
                        c.name,
                        c.status,
                        c.agents.len(),
                        c.tasks.len(),
                        c.executions
                    );
                }
            }
        }
        CrewAction::Show { crew, json } => {
            let Some(c) = ctx.crews.find_crew(&crew).await else {
                bail!("crew '{}' not found (try `crewdeck crews list` first)", crew);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&c)?);
            } else {
                print_crew(&c);
            }
        }
        CrewAction::Create { file } => {
            let crew = read_crew(&file)?;
            let errors = validate(&crew);
            if !errors.is_empty() {
                for e in &errors {
                    println!(" - {}", e);
                }
                bail!("crew definition has {} problem(s)", errors.len());
            }
            let created = report(ctx.crews.crews.create(crew).await?);
            println!("Crew '{}' created ({}).", created.name, created.id);
        }
        CrewAction::Delete { id } => {
            let origin = ctx.crews.crews.delete(&id).await?;
            if origin == Origin::Local {
                println!("Service unreachable; deleted locally only.");
            }
            println!("Crew '{}' deleted.", id);
        }
        CrewAction::Validate { file } => validate_file(&file)?,
        CrewAction::FromTemplate { template, name } => {
            let Some(tpl) = ctx.crews.template(&template).await else {
                bail!("template '{}' not found", template);
            };
            let crew = ctx.crews.crew_from_template(&tpl, name.as_deref()).await;
            println!(
                "Crew '{}' created from template '{}' ({} agents, {} tasks).",
                crew.name,
                tpl.id,
                crew.agents.len(),
                crew.tasks.len()
            );
            println!("ID: {}", crew.id);
        }
        CrewAction::Export { id, output } => {
            let doc = ctx.crews.export_crew(&id).await?;
            let json = serde_json::to_string_pretty(&doc)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Crew '{}' exported to {}.", id, path.display());
                }
                None => println!("{}", json),
            }
        }
        CrewAction::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let doc: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not JSON", file.display()))?;
            let crew = ctx.crews.import_crew(&doc).await?;
            println!("Crew '{}' imported ({}).", crew.name, crew.id);
        }
    }
    Ok(())
}

async fn executions(ctx: &AppContext, action: ExecutionAction) -> Result<()> {
    let store = &ctx.executions;
    match action {
        ExecutionAction::List { status, crew, json } => {
            let mut records = match status {
                Some(s) => store.by_status(s).await,
                None => store.list().await,
            };
            if let Some(crew_id) = crew {
                records.retain(|r| r.crew_id == crew_id);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions found.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<9} | {:<20} | Tokens",
                    "ID", "Crew", "Status", "Started"
                );
                println!("{:-<36}-|-{:-<20}-|-{:-<9}-|-{:-<20}-|-{:-<6}", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<36} | {:<20} | {:<9} | {:<20} | {}",
                        r.id,
                        r.crew_name.as_deref().unwrap_or(&r.crew_id),
                        r.status,
                        r.started_at
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        r.tokens_used
                    );
                }
            }
        }
        ExecutionAction::Show { id, refresh, json } => {
            let record = if refresh {
                report(store.refresh(&id).await?)
            } else {
                match store.focus(&id).await {
                    Some(r) => r,
                    None => bail!("execution '{}' not found", id),
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_execution(&record);
            }
        }
        ExecutionAction::Logs { id, refresh } => {
            let logs = if refresh {
                report(store.fetch_logs(&id).await?)
            } else {
                match store.get(&id).await {
                    Some(r) => r.logs,
                    None => bail!("execution '{}' not found", id),
                }
            };
            if logs.is_empty() {
                println!("No log lines.");
            }
            for l in logs {
                println!(
                    "{} [{:<7}] {:<10} {}",
                    l.timestamp.format("%H:%M:%S"),
                    l.level,
                    l.source,
                    l.message
                );
            }
        }
        ExecutionAction::Cancel { id } => {
            let r = store.cancel(&id).await?;
            println!("Execution {} {}.", r.id, r.status);
        }
        ExecutionAction::Pause { id } => {
            let r = store.pause(&id).await?;
            println!("Execution {} {}.", r.id, r.status);
        }
        ExecutionAction::Resume { id } => {
            let r = store.resume(&id).await?;
            println!("Execution {} {}.", r.id, r.status);
        }
        ExecutionAction::Stats { json } => {
            let stats = store.stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Total:        {}", stats.total);
                println!("Running:      {}", stats.running);
                println!("Pending:      {}", stats.pending);
                println!("Paused:       {}", stats.paused);
                println!("Completed:    {}", stats.completed);
                println!("Failed:       {}", stats.failed);
                println!("Cancelled:    {}", stats.cancelled);
                println!("Success rate: {:.1}%", stats.success_rate * 100.0);
            }
        }
        ExecutionAction::Export { id, output } => {
            let bundle = store.export(&id).await?;
            let path = crewdeck::export::write_bundle(&bundle, output.as_deref())?;
            println!("Execution {} exported to {}.", id, path.display());
        }
        ExecutionAction::Import { file } => {
            let bundle = crewdeck::export::read_bundle(&file)?;
            let record = store.import(bundle).await;
            println!("Execution {} imported ({}).", record.id, record.status);
        }
        ExecutionAction::Clear => {
            let count = store.list().await.len();
            store.clear().await;
            println!("Cleared {} execution(s).", count);
        }
    }
    Ok(())
}

/// Print log lines for `id` as they arrive until it reaches a terminal
/// status, the live channel drops, or Ctrl-C.
async fn follow(ctx: &AppContext, id: &str) -> Result<()> {
    let store = &ctx.executions;
    let mut changes = store.subscribe();
    let mut printed = 0;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        let Some(record) = store.get(id).await else {
            bail!("execution '{}' disappeared", id);
        };
        for l in record.logs.iter().skip(printed) {
            println!("{} [{:<7}] {}", l.timestamp.format("%H:%M:%S"), l.level, l.message);
        }
        printed = record.logs.len();
        show_notifications(ctx);
        if record.status.is_terminal() {
            print_outcome(&record);
            return Ok(());
        }

        tokio::select! {
            changed = changes.recv() => match changed {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tick.tick() => {
                if store.live_execution().await.as_deref() != Some(id) {
                    println!("Live updates ended; execution is still {}.", record.status);
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped watching; execution {} continues.", id);
                return Ok(());
            }
        }
    }
}

/// Print queued notifications and dismiss them.
fn show_notifications(ctx: &AppContext) {
    for n in ctx.notifications.list() {
        if n.message.is_empty() {
            println!("[{}] {}", n.kind, n.title);
        } else {
            println!("[{}] {}: {}", n.kind, n.title, n.message);
        }
        ctx.notifications.remove(n.id);
    }
}

fn print_config(config: &CrewdeckConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.api.token.is_some() {
        shown.api.token = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}

fn validate_file(path: &Path) -> Result<()> {
    let crew = read_crew(path)?;
    let errors = validate(&crew);
    if errors.is_empty() {
        println!("Crew '{}' is valid.", crew.name);
        return Ok(());
    }
    for e in &errors {
        println!(" - {}", e);
    }
    bail!("crew definition has {} problem(s)", errors.len())
}

/// Unwrap a synced value, telling the user when it is local-only.
fn report<T>(synced: crewdeck::store::Synced<T>) -> T {
    if synced.is_local() {
        println!("(service unreachable; showing local data)");
    }
    synced.value
}

fn read_crew(path: &Path) -> Result<Crew> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;
    let value = match value {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    Crew::from_json(value).with_context(|| format!("{} is not a crew definition", path.display()))
}

fn print_crew(c: &Crew) {
    println!("\n=== {} ===", c.name);
    println!("ID:       {}", c.id);
    println!("Status:   {}", c.status);
    if let Some(d) = &c.description {
        println!("About:    {}", d);
    }
    println!("Runs:     {}", c.executions);
    println!("\nAgents:");
    for a in &c.agents {
        println!(" - {} ({}): {}", a.name, a.role, a.goal);
    }
    println!("\nTasks:");
    for t in &c.tasks {
        println!(
            " - {} -> {} [{}]",
            t.description,
            t.expected_output,
            t.agent.as_deref().unwrap_or("unassigned")
        );
    }
    println!();
}

fn print_execution(r: &ExecutionRecord) {
    println!("\n=== Execution {} ===", r.id);
    println!("Crew:      {}", r.crew_name.as_deref().unwrap_or(&r.crew_id));
    println!("Status:    {}", r.status);
    if let Some(t) = r.started_at {
        println!("Started:   {}", t.to_rfc3339());
    }
    if let Some(t) = r.completed_at {
        println!("Finished:  {}", t.to_rfc3339());
    }
    println!("Duration:  {} ms", r.duration_ms);
    println!("Tokens:    {}", r.tokens_used);
    println!("API calls: {}", r.api_calls);
    println!("Cost:      ${:.4}", r.cost);
    println!("Log lines: {}", r.logs.len());
    print_outcome(r);
    println!();
}

fn print_outcome(r: &ExecutionRecord) {
    if let Some(result) = &r.result {
        println!("\nResult:\n{}", result);
    }
    if let Some(error) = &r.error {
        println!("\nError: {}", error);
    }
}
