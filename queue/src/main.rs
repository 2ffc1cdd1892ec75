use anyhow::Result;
use clap::{Args, Parser, Subcommand};
mod cli_utils;
mod commands;

use commands::{
    JobSubmitOptions, dead_list, dead_retry, job_show, job_submit, queue_groups, queue_monitor,
    queue_purge, queue_reap, queue_stats,
};
use groupq::telemetry;

#[derive(Parser)]
#[command(name = "groupq")]
#[command(version)]
#[command(about = "Operator tooling for the groupq group-ordered queue", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Settings file (falls back to GROUPQ_CONFIG, then ./groupq.toml).
    #[arg(long, global = true)]
    config: Option<String>,
    /// Overrides the namespace from settings.
    #[arg(long, global = true)]
    namespace: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print queue counts once.
    Stats,
    /// Print queue counts repeatedly until interrupted.
    Monitor {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List ready groups and current leases.
    Groups {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    Dead {
        #[command(subcommand)]
        command: DeadCommand,
    },
    /// Reclaim expired leases once.
    Reap {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Delete every key in the namespace.
    Purge {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    Show {
        job_id: String,
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    Submit {
        #[arg(long)]
        group: String,
        /// JSON payload.
        #[arg(long)]
        payload: String,
        #[arg(long, allow_negative_numbers = true)]
        order_ms: Option<i64>,
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        max_attempts: Option<i64>,
    },
}

#[derive(Subcommand)]
enum DeadCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    Retry {
        job_id: String,
    },
}

async fn dispatch_command(target: Target, command: Commands) -> Result<()> {
    let Target { config, namespace } = target;
    match command {
        Commands::Stats => queue_stats(config, namespace).await?,
        Commands::Monitor { interval_ms } => queue_monitor(config, namespace, interval_ms).await?,
        Commands::Groups { limit } => queue_groups(config, namespace, limit).await?,
        Commands::Job { command } => match command {
            JobCommand::Show { job_id, raw } => job_show(job_id, config, namespace, raw).await?,
            JobCommand::Submit {
                group,
                payload,
                order_ms,
                job_id,
                max_attempts,
            } => {
                job_submit(JobSubmitOptions {
                    config,
                    namespace,
                    group,
                    payload,
                    order_ms,
                    job_id,
                    max_attempts,
                })
                .await?;
            }
        },
        Commands::Dead { command } => match command {
            DeadCommand::List { limit, raw } => dead_list(config, namespace, limit, raw).await?,
            DeadCommand::Retry { job_id } => dead_retry(job_id, config, namespace).await?,
        },
        Commands::Reap { limit } => queue_reap(config, namespace, limit).await?,
        Commands::Purge { yes } => queue_purge(config, namespace, yes).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    dispatch_command(cli.target, cli.command).await
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
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "groupq",
            "job",
            "submit",
            "--group",
            "org-1",
            "--payload",
            "{}",
            "--order-ms",
            "-5",
            "--namespace",
            "analytics",
        ])
        .unwrap();
        assert_eq!(cli.target.namespace.as_deref(), Some("analytics"));
        match cli.command {
            Commands::Job {
                command: JobCommand::Submit {
                    group, order_ms, ..
                },
            } => {
                assert_eq!(group, "org-1");
                assert_eq!(order_ms, Some(-5));
            }
            _ => panic!("expected job submit"),
        }
    }

    #[test]
    fn purge_requires_explicit_flag_for_noninteractive_use() {
        let cli = Cli::try_parse_from(["groupq", "purge"]).unwrap();
        assert!(matches!(cli.command, Commands::Purge { yes: false }));
        let cli = Cli::try_parse_from(["groupq", "--config", "x.toml", "purge", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Purge { yes: true }));
        assert_eq!(cli.target.config.as_deref(), Some("x.toml"));
    }
}
