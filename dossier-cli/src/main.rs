//! Dossier CLI: generate research briefs from the terminal.

mod commands;
mod markdown;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Dossier: evidence-linked research briefs
#[derive(Parser, Debug)]
#[command(name = "dossier", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for .dossier/config.toml)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Research a query and print the brief
    Brief {
        /// The research question
        query: String,
        /// Session id; follow-ups in the same session build on earlier briefs
        #[arg(short, long)]
        session: Option<String>,
        /// Research depth: 1 (shallow) to 3 (deep)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=3))]
        depth: Option<u8>,
        /// Maximum number of sources (1-20)
        #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..=20))]
        max_sources: Option<u64>,
        /// Also write the brief to a file (.json or .md)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show stored sessions, or the turns of one session
    History {
        /// Session id (lists all sessions if omitted)
        session: Option<String>,
    },
    /// Show brief count, processing time and token totals for a session
    Stats {
        /// Session id
        session: String,
    },
    /// Resume an interrupted run from its last checkpoint
    Resume {
        /// Run id printed when the run stopped
        run_id: uuid::Uuid,
        /// Also write the brief to a file (.json or .md)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace config at .dossier/config.toml
    Init,
    /// Show the merged configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,dossier_core=info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = dossier_core::config::data_dir().join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "dossier.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.quiet).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_brief_with_options() {
        let cli = Cli::try_parse_from([
            "dossier",
            "brief",
            "effects of remote work",
            "--session",
            "team",
            "--depth",
            "3",
            "-n",
            "8",
            "-o",
            "brief.md",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Brief {
                query,
                session,
                depth,
                max_sources,
                output,
            } => {
                assert_eq!(query, "effects of remote work");
                assert_eq!(session.as_deref(), Some("team"));
                assert_eq!(depth, Some(3));
                assert_eq!(max_sources, Some(8));
                assert_eq!(output, Some(PathBuf::from("brief.md")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_depth_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["dossier", "brief", "q", "--depth", "4"]).is_err());
        assert!(Cli::try_parse_from(["dossier", "brief", "q", "-n", "0"]).is_err());
    }

    #[test]
    fn test_stats_requires_session() {
        assert!(Cli::try_parse_from(["dossier", "stats"]).is_err());
        let cli = Cli::try_parse_from(["dossier", "stats", "team"]).unwrap();
        assert!(matches!(cli.command, Commands::Stats { session } if session == "team"));
    }

    #[test]
    fn test_resume_requires_uuid() {
        assert!(Cli::try_parse_from(["dossier", "resume", "not-a-uuid"]).is_err());
        let id = uuid::Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["dossier", "resume", &id]).is_ok());
    }
}
