//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::markdown;
use dossier_core::{
    BriefRequest, BriefResponse, Constraints, ContextStore, DossierConfig, FailureKind,
    FileContextStore, FinalBrief, Orchestrator, RunFailure, SessionStats,
};
use std::io::IsTerminal;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    match command {
        Commands::Brief {
            query,
            session,
            depth,
            max_sources,
            output,
        } => {
            let mut request = BriefRequest::new(query);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            if depth.is_some() || max_sources.is_some() {
                request = request.with_constraints(Constraints {
                    depth,
                    max_sources: max_sources.map(|n| n as usize),
                });
            }
            handle_brief(request, output.as_deref(), workspace, quiet).await
        }
        Commands::History { session } => handle_history(session.as_deref(), workspace).await,
        Commands::Stats { session } => handle_stats(&session, workspace).await,
        Commands::Resume { run_id, output } => {
            handle_resume(run_id, output.as_deref(), workspace, quiet).await
        }
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

fn load_config(workspace: &Path) -> anyhow::Result<DossierConfig> {
    let config = dossier_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    for warning in config.validate() {
        warn!("{warning}");
    }
    Ok(config)
}

/// Cancel `token` on Ctrl+C so the run stops at the next stage boundary.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            token.cancel();
        }
    });
}

async fn handle_brief(
    request: BriefRequest,
    output: Option<&Path>,
    workspace: &Path,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let state = orchestrator.execute(request, cancel).await;
    let run_id = state.run_id;
    let outcome = state
        .outcome()
        .unwrap_or_else(|| Err(RunFailure::internal("run stopped before a terminal stage")));
    report(outcome, run_id, output, quiet)
}

async fn handle_resume(
    run_id: uuid::Uuid,
    output: Option<&Path>,
    workspace: &Path,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = orchestrator.resume(run_id, cancel).await;
    report(outcome, run_id, output, quiet)
}

fn report(
    outcome: Result<FinalBrief, RunFailure>,
    run_id: uuid::Uuid,
    output: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<()> {
    if let Some(path) = output {
        write_output(path, &outcome)?;
        if !quiet {
            eprintln!("Wrote {}", path.display());
        }
    }

    match outcome {
        Ok(brief) => {
            let md = markdown::render_brief(&brief);
            if std::io::stdout().is_terminal() {
                print!("{}", markdown::render_terminal(&md));
            } else {
                print!("{md}");
            }
            if !quiet && let Some(session) = &brief.metadata.session_id {
                eprintln!("Follow up in this session with: dossier brief <QUERY> --session {session}");
            }
            Ok(())
        }
        Err(failure) => {
            if failure.kind == FailureKind::Cancelled {
                eprintln!("Run {run_id} interrupted. Continue with: dossier resume {run_id}");
            }
            Err(anyhow::anyhow!("{failure}"))
        }
    }
}

/// Write the outcome to `path`, choosing the format from its extension.
///
/// `.json` receives the wire response (brief or error body); `.md` receives
/// the rendered brief and is skipped when the run failed.
fn write_output(path: &Path, outcome: &Result<FinalBrief, RunFailure>) -> anyhow::Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("json") => {
            let response = BriefResponse::from(outcome.clone());
            std::fs::write(path, serde_json::to_string_pretty(&response)?)?;
        }
        Some("md") | Some("markdown") => {
            if let Ok(brief) = outcome {
                std::fs::write(path, markdown::render_brief(brief))?;
            }
        }
        _ => anyhow::bail!(
            "Unsupported output format for {} (use .json or .md)",
            path.display()
        ),
    }
    Ok(())
}

async fn handle_history(session: Option<&str>, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let store = FileContextStore::new(config.session_dir(), config.context.max_turns);

    match session {
        None => {
            let sessions = store.sessions().await?;
            if sessions.is_empty() {
                println!("No sessions found in {}", store.dir().display());
                return Ok(());
            }
            println!("Sessions ({}):", sessions.len());
            for s in &sessions {
                println!(
                    "  {} ({} turn(s), updated {}) {}",
                    s.id,
                    s.turn_count,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.last_query.as_deref().unwrap_or("")
                );
            }
        }
        Some(id) => {
            let id = require_session(id)?;
            let turns = store.get_history(id).await?;
            info!(session_id = id, turns = turns.len(), "Loaded session history");
            if turns.is_empty() {
                println!("Session '{id}' has no turns.");
                return Ok(());
            }
            println!("Session '{id}' ({} turn(s)):", turns.len());
            for (i, turn) in turns.iter().enumerate() {
                println!(
                    "  {}. [{}] {} ({} reference(s))",
                    i + 1,
                    turn.completed_at.format("%Y-%m-%d %H:%M"),
                    turn.request.query,
                    turn.brief.references.len()
                );
            }
        }
    }
    Ok(())
}

fn require_session(id: &str) -> anyhow::Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("Session id must not be blank");
    }
    Ok(id)
}

async fn handle_stats(session: &str, workspace: &Path) -> anyhow::Result<()> {
    let id = require_session(session)?;
    let config = load_config(workspace)?;
    let store = FileContextStore::new(config.session_dir(), config.context.max_turns);
    let stats = SessionStats::from_turns(&store.get_history(id).await?);
    info!(session_id = id, briefs = stats.total_briefs, "Computed session stats");
    print!("{}", format_stats(id, &stats));
    Ok(())
}

fn format_stats(id: &str, stats: &SessionStats) -> String {
    if stats.total_briefs == 0 {
        return format!("Session '{id}' has no briefs.\n");
    }
    format!(
        "Session '{id}'\n  \
         Briefs:              {}\n  \
         Avg processing time: {:.1}s\n  \
         Total tokens:        {}\n  \
         Avg confidence:      {:.2}\n  \
         References:          {}\n  \
         Search retries:      {}\n",
        stats.total_briefs,
        stats.avg_processing_ms / 1000.0,
        stats.total_tokens,
        stats.avg_confidence,
        stats.total_references,
        stats.total_retries
    )
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".dossier");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&DossierConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
