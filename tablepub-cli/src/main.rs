//! tablepub CLI: validate CSV files and publish datasets.

mod commands;

use clap::Parser;
use std::path::PathBuf;

/// Validate tabular datasets and publish them to a hosted repository.
#[derive(Parser, Debug)]
#[command(name = "tablepub", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
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
    /// Check that a CSV file is well formed, optionally against a schema
    Validate {
        /// CSV file to check
        csv: PathBuf,
        /// Table schema path or URL
        #[arg(short, long)]
        schema: Option<String>,
    },
    /// Validate and publish a dataset
    Publish(PublishArgs),
    /// Show the status of a background job
    Status {
        /// Job id returned by `publish`
        job_id: String,
    },
    /// Delete a dataset and its remote repository
    Destroy {
        /// Dataset id
        dataset_id: uuid::Uuid,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    /// Dataset name; also determines the repository name
    #[arg(long)]
    name: String,
    /// github_public, github_private or local_private
    #[arg(long, default_value = "github_public")]
    method: tablepub_core::PublishingMethod,
    /// Data file as `title=path` or `title=URL`; repeat for several files
    #[arg(long = "file", value_parser = parse_file_arg, required = true)]
    files: Vec<(String, PathBuf)>,
    /// Schema path or URL applied to every file
    #[arg(long)]
    schema: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    license: Option<String>,
    #[arg(long)]
    frequency: Option<String>,
    #[arg(long)]
    publisher_name: Option<String>,
    #[arg(long)]
    publisher_url: Option<String>,
    /// Organisation that owns the repository
    #[arg(long)]
    owner: Option<String>,
    /// Login of the publishing user on the repository host
    #[arg(long)]
    login: String,
    /// Email for the success notification
    #[arg(long)]
    email: Option<String>,
    /// Live channel id to report the outcome on
    #[arg(long)]
    channel: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
}

fn parse_file_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (title, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected title=path, got '{raw}'"))?;
    if title.trim().is_empty() || path.trim().is_empty() {
        return Err(format!("expected title=path, got '{raw}'"));
    }
    Ok((title.trim().to_string(), PathBuf::from(path.trim())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = tablepub_core::logging::init(cli.verbose, cli.quiet);

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
