use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use commands::{auth, daemon, dead_letters, reset, status, sync, test_sink, AppContext};
use std::path::PathBuf;
use watch_sync_models::SyncMode;

mod commands;
mod logging;
mod output;

#[derive(Parser)]
#[command(name = "watchledger")]
#[command(about = "watchledger - Mirror your Trakt watch history into InfluxDB")]
#[command(version)]
struct Cli {
    /// Enable verbose output (use multiple times for more verbosity: -v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "WATCHLEDGER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Backfill,
    Incremental,
    Reconcile,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Backfill => SyncMode::Backfill,
            ModeArg::Incremental => SyncMode::Incremental,
            ModeArg::Reconcile => SyncMode::Reconcile,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize watchledger against your Trakt account
    #[command(long_about = "Run the Trakt authorization flow and store the resulting tokens. Prompts for the API client id and secret if they are not configured yet. Any previously stored tokens are discarded first.")]
    Auth {
        /// Exchange this authorization code instead of using the device flow
        #[arg(long, value_name = "CODE")]
        auth_code: Option<String>,
    },
    /// Run one sync cycle and exit
    #[command(long_about = "Pull watch history from Trakt, record it in the state ledger and export it to InfluxDB. Backfill walks the whole history once, incremental continues from the last cursor, reconcile re-checks the recent window and retracts events deleted on Trakt.")]
    Sync {
        /// Which sync mode to run
        #[arg(value_enum, default_value = "incremental")]
        mode: ModeArg,

        /// Run a backfill even if one already completed
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,

        /// Fetch and record without exporting to InfluxDB
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Run as daemon with internal scheduler
    #[command(long_about = "Run watchledger in the foreground with an internal cron scheduler. Incremental syncs run on SYNC_CRON and reconciles on RECONCILE_CRON. On start-up a pending backfill runs first, followed by an incremental sync, unless --no-startup-sync is given.")]
    Daemon {
        /// Skip the initial sync on startup
        #[arg(long, action = ArgAction::SetTrue)]
        no_startup_sync: bool,

        /// Fetch and record without exporting to InfluxDB
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Check InfluxDB connectivity and write access to both buckets
    TestSink,
    /// Delete all sync state so the next run starts with a backfill
    #[command(long_about = "Wipe cursors, accepted events and dead letters from the state ledger. Trakt credentials are kept. Data already exported to InfluxDB is not touched.")]
    ResetState {
        /// Skip the confirmation prompt
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// Show ledger counts, cursors and the authorized user
    Status,
    /// List or resolve history items that failed validation
    DeadLetters {
        /// Include entries already marked resolved
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,

        /// Maximum number of entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[command(subcommand)]
        cmd: Option<DeadLetterCommands>,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// Mark a dead letter as handled
    Resolve {
        /// Dead letter id as shown by `watchledger dead-letters`
        id: i64,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let output = output::Output::new(cli.output, cli.quiet);
    let ctx = AppContext::load(cli.config, output)?;

    // Only the daemon keeps a log file; one-shot commands log to stderr
    let log_file = matches!(cli.command, Commands::Daemon { .. }).then(|| ctx.paths.daemon_log_file());
    logging::init_logging(cli.verbose, cli.quiet, &ctx.config.runtime.log_level, log_file.as_deref())
        .map_err(|e| color_eyre::eyre::eyre!("{}", e))?;

    match cli.command {
        Commands::Auth { auth_code } => auth::run_auth(&ctx, auth_code).await,
        Commands::Sync { mode, force, dry_run } => sync::run_sync(&ctx, mode.into(), force, dry_run).await,
        Commands::Daemon {
            no_startup_sync,
            dry_run,
        } => daemon::run_daemon(&ctx, no_startup_sync, dry_run).await,
        Commands::TestSink => test_sink::run_test_sink(&ctx).await,
        Commands::ResetState { yes } => reset::run_reset(&ctx, yes),
        Commands::Status => status::run_status(&ctx),
        Commands::DeadLetters { all, limit, cmd } => match cmd {
            Some(DeadLetterCommands::Resolve { id }) => dead_letters::resolve_dead_letter(&ctx, id),
            None => dead_letters::list_dead_letters(&ctx, all, limit),
        },
    }
}
