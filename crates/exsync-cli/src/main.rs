use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use exsync_core::{Mode, SchemaNode};
use exsync_sync::{split_record_types, ConfigError, SyncConfig, SyncSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "exsync")]
#[command(about = "Mirror remote records to a local file tree and back")]
struct Cli {
    /// Remote endpoint URL.
    #[arg(short = 'u', long = "url", env = "EXSYNC_ENDPOINT", global = true)]
    endpoint: Option<String>,
    /// status | sync | get | put
    #[arg(short, long, env = "EXSYNC_MODE", global = true)]
    mode: Option<String>,
    /// Comma-separated top-level record types.
    #[arg(short, long, env = "EXSYNC_TYPES", default_value = exsync_sync::DEFAULT_RECORD_TYPES, global = true)]
    types: String,
    /// Only records whose folder starts with this prefix.
    #[arg(short, long, env = "EXSYNC_PATH", default_value = "", global = true)]
    path: String,
    #[arg(short, long, env = "EXSYNC_OUTPUT", default_value = ".", global = true)]
    output: PathBuf,
    #[arg(
        short,
        long,
        env = "EXSYNC_VERBOSITY",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=3),
        global = true
    )]
    verbosity: u8,
    /// After a `get`, delete files under each cleanup root that were not fetched.
    #[arg(long, env = "EXSYNC_CLEAN_ORPHANS", global = true)]
    clean_orphans: bool,
    /// Assemble pushes but never send them.
    #[arg(long, env = "EXSYNC_NO_PUSH", global = true)]
    no_push: bool,
    /// Never rewrite an existing JSON file.
    #[arg(long, env = "EXSYNC_IGNORE_JSON_DIFF", global = true)]
    ignore_json_diff: bool,
    /// Use the legacy `crmscript` extension for script files.
    #[arg(long, env = "EXSYNC_LEGACY_EXTENSION", global = true)]
    legacy_extension: bool,
    #[arg(long, env = "EXSYNC_SCHEMA", default_value = "schema.yaml", global = true)]
    schema: PathBuf,
    /// Serve rows from a local fixture file instead of the endpoint.
    #[arg(long, env = "EXSYNC_FIXTURE", global = true)]
    fixture: Option<PathBuf>,
    #[arg(long, env = "EXSYNC_TIMEOUT_SECS", default_value_t = 30, global = true)]
    timeout_secs: u64,
    #[arg(long, env = "EXSYNC_USER_AGENT", global = true)]
    user_agent: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the selected mode (default).
    Run,
    /// Validate the schema file and print its record type tree.
    Schema,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            endpoint: self.endpoint.clone().filter(|e| !e.trim().is_empty()),
            mode: self.mode.clone(),
            record_types: split_record_types(&self.types),
            path_filter: self.path.clone(),
            output_root: self.output.clone(),
            verbosity: self.verbosity,
            clean_orphans: self.clean_orphans,
            no_push: self.no_push,
            ignore_json_diff: self.ignore_json_diff,
            legacy_script_extension: self.legacy_extension,
            schema_path: self.schema.clone(),
            fixture: self.fixture.clone(),
            http_timeout_secs: self.timeout_secs,
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_tree(nodes: &[SchemaNode], depth: usize) {
    for node in nodes {
        println!("{}{}", "  ".repeat(depth), node.record_type);
        print_tree(&node.children, depth + 1);
    }
}

fn print_report(mode: Mode, verbosity: u8, summary: &SyncSummary) {
    match mode {
        Mode::Status => {
            for line in &summary.statuses {
                println!("{line}");
            }
        }
        Mode::Sync if verbosity <= 1 => {
            for path in &summary.pulled {
                println!("<== {path}");
            }
            for path in &summary.pushed {
                println!("==> {path}");
            }
        }
        _ => {}
    }
    for path in &summary.withheld {
        println!("(no-push) {path}");
    }
    for failed in &summary.failed_pushes {
        eprintln!("push failed: {}: {}", failed.path, failed.reason);
    }
    if !summary.read_only.is_empty() {
        eprintln!("{} read-only record(s) not pushed", summary.read_only.len());
    }
    if !summary.unresolved.is_empty() {
        eprintln!("{} record(s) skipped as unresolved", summary.unresolved.len());
    }
}

fn usage_error(err: &anyhow::Error) -> ! {
    Cli::command()
        .error(ErrorKind::InvalidValue, format!("{err:#}"))
        .exit()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);
    let config = cli.sync_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match exsync_sync::run_from_config(&config).await {
            Ok((mode, summary)) => print_report(mode, config.verbosity, &summary),
            Err(err) if err.downcast_ref::<ConfigError>().is_some() => usage_error(&err),
            Err(err) => return Err(err),
        },
        Commands::Schema => match exsync_sync::load_schema_tree(&config.schema_path).await {
            Ok(tree) => print_tree(&tree.record_types, 0),
            Err(err) => usage_error(&anyhow::Error::from(err)),
        },
    }

    Ok(())
}
