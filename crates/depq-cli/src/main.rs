//! depq command line tool.

use clap::{Parser, Subcommand, ValueEnum};
use depq_db::{RuntimeMetric, StatusFilter};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "depq")]
#[command(about = "Dependency-aware job queue administration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection string, overrides the configuration file
    #[arg(long, env = "DEPQ_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema
    Migrate,
    /// Show job counts for a queue group
    Stats {
        /// Queue group, defaults to the configured group
        #[arg(long)]
        group: Option<String>,
    },
    /// List groups with pending or recently completed jobs
    Groups {
        /// How far back to look for completed jobs
        #[arg(long, default_value = "1h")]
        since: String,
    },
    /// Monitoring reports
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Mark jobs completed without running them
    Complete {
        /// Job ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "depq.kdl")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Job counts per type
    Counts {
        #[arg(long, value_enum, default_value_t = StatusArg::All)]
        status: StatusArg,
        /// Split counts by queue group
        #[arg(long)]
        by_group: bool,
    },
    /// Average run time or start latency of recently finished jobs
    Timing {
        #[arg(long, default_value = "1h")]
        window: String,
        #[arg(long, value_enum, default_value_t = MetricArg::Duration)]
        metric: MetricArg,
        #[arg(long)]
        by_group: bool,
    },
    /// Error totals of recently finished jobs
    Errors {
        #[arg(long, default_value = "1h")]
        window: String,
        #[arg(long)]
        by_group: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    All,
    Pending,
    InProgress,
    Completed,
}

impl From<StatusArg> for StatusFilter {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::All => StatusFilter::All,
            StatusArg::Pending => StatusFilter::Pending,
            StatusArg::InProgress => StatusFilter::InProgress,
            StatusArg::Completed => StatusFilter::Completed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricArg {
    Duration,
    Latency,
}

impl From<MetricArg> for RuntimeMetric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Duration => RuntimeMetric::Duration,
            MetricArg::Latency => RuntimeMetric::Latency,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let ctx = commands::Context::load(cli.config.as_deref(), cli.database_url, cli.json)?;

    match cli.command {
        Commands::Migrate => commands::migrate(&ctx).await?,
        Commands::Stats { group } => commands::stats::stats(&ctx, group).await?,
        Commands::Groups { since } => commands::stats::groups(&ctx, &since).await?,
        Commands::Complete { ids } => commands::stats::complete(&ctx, ids).await?,
        Commands::Report { command } => match command {
            ReportCommands::Counts { status, by_group } => {
                commands::report::counts(&ctx, status.into(), by_group).await?;
            }
            ReportCommands::Timing {
                window,
                metric,
                by_group,
            } => {
                commands::report::timing(&ctx, &window, metric.into(), by_group).await?;
            }
            ReportCommands::Errors { window, by_group } => {
                commands::report::errors(&ctx, &window, by_group).await?;
            }
        },
        Commands::Validate { path } => commands::validate(&path)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_report_arguments() {
        let cli = Cli::try_parse_from([
            "depq",
            "--database-url",
            "postgres://localhost/depq",
            "report",
            "counts",
            "--status",
            "in-progress",
            "--by-group",
        ])
        .unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("postgres://localhost/depq"));
        match cli.command {
            Commands::Report {
                command: ReportCommands::Counts { status, by_group },
            } => {
                assert_eq!(StatusFilter::from(status), StatusFilter::InProgress);
                assert!(by_group);
            }
            _ => panic!("expected report counts"),
        }
    }

    #[test]
    fn complete_requires_ids() {
        assert!(Cli::try_parse_from(["depq", "complete"]).is_err());
    }
}
