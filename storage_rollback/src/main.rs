use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use storage_rollback::rollback::{rollback_bucket, RollbackParams, RunMode};
use storage_rollback::timestamp::parse_timestamp;
use storage_rollback::versions::show_versions;
use storage_rollback::{init_logging, init_storage, parse_bucket_url};

#[derive(Parser)]
#[command(author, version, about = "Point-in-time rollback for versioned object store buckets", long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Bucket URL, s3://bucket[/prefix] or gs://bucket[/prefix]. The prefix
    /// may point at a directory or a single object.
    #[arg(short, long)]
    bucket: String,

    /// Name of the AWS shared-config profile to authenticate with; the
    /// default credential chain applies when unset.
    #[arg(long)]
    aws_profile: Option<String>,

    /// Path to a GCP service-account JSON key; GOOGLE_APPLICATION_CREDENTIALS
    /// applies when unset.
    #[arg(long)]
    gcp_key_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Roll objects under the bucket prefix back to a point in time.
    ///
    /// Rollback happens in place: object history is only appended to, never
    /// erased, so a rollback can itself be undone.
    Rollback {
        /// The instant to restore to, e.g. "2021-02-21 23:00:00 +01:00".
        #[arg(short, long)]
        time: String,
        #[arg(long, default_value_t = RunMode::Execute)]
        mode: RunMode,
        /// Maximum number of rollback actions applied concurrently.
        #[arg(long = "concurrency", short = 'j', default_value_t = 32)]
        concurrency: usize,
        /// Suppress per-action success lines.
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// Show the recorded version history of objects under the prefix.
    Versions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let target = parse_bucket_url(&cli.bucket)?;
    let command_log_name = match &cli.command {
        Command::Rollback { .. } => "rollback",
        Command::Versions => "versions",
    };
    let _guard = init_logging(&format!(
        "{}_{}_{}_{}.log",
        std::env::args().next().unwrap(),
        command_log_name,
        target.bucket,
        chrono::Utc::now().format("%Y_%m_%d__%H_%M_%S")
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, no further actions will start");
            shutdown.cancel();
        }
    });

    let storage = init_storage(
        &target,
        cli.aws_profile.as_deref(),
        cli.gcp_key_file.as_deref(),
    )
    .await?;

    match cli.command {
        Command::Rollback {
            time,
            mode,
            concurrency,
            quiet,
        } => {
            let at = parse_timestamp(&time).context("parse --time")?;
            println!(
                "Restoring objects inside path '{}' of bucket '{}':\n\
                 \x20            restore time: {at}\n",
                target.prefix, target.bucket
            );
            let params = RollbackParams {
                target,
                at,
                mode,
                concurrency,
                quiet,
            };
            rollback_bucket(&storage, &params, &cancel).await?;
            Ok(())
        }
        Command::Versions => show_versions(&storage, &target, &cancel).await,
    }
}
