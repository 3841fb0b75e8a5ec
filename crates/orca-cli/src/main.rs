mod add_cmd;
mod config;
mod db;
mod dispatch_cmd;
mod start_cmd;
mod status_cmd;
mod sync_cmd;

use clap::{Parser, Subcommand};

use config::ConfigArgs;

#[derive(Parser)]
#[command(name = "orca", about = "Supervisor that turns tracked issues into autonomous coding-agent runs")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor: reconciler, scheduler, cleanup, poller, and webhook receiver.
    Start,
    /// Register a single tracker issue outside the periodic full sync.
    Add {
        /// Tracker issue id.
        issue_id: String,
    },
    /// Show task progress and per-task status.
    Status,
    /// Force an immediate implement run for one ready task.
    Dispatch {
        /// Tracker issue id.
        issue_id: String,
    },
    /// Run one full tracker sync immediately.
    Sync,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let resolved = match cli.config.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let result = run(cli.command, resolved).await;

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(2);
    }
}

async fn run(command: Commands, config: orca_core::config::OrcaConfig) -> anyhow::Result<()> {
    match command {
        Commands::Start => {
            let pool = db::open_pool(&config).await?;
            start_cmd::run(pool, config).await
        }
        Commands::Add { issue_id } => {
            let pool = db::open_pool(&config).await?;
            let result = add_cmd::run(&pool, &config, &issue_id).await;
            pool.close().await;
            result
        }
        Commands::Status => {
            let pool = db::open_pool(&config).await?;
            let result = status_cmd::run(&pool).await;
            pool.close().await;
            result
        }
        Commands::Dispatch { issue_id } => {
            let pool = db::open_pool(&config).await?;
            let result = dispatch_cmd::run(&pool, &config, &issue_id).await;
            pool.close().await;
            result
        }
        Commands::Sync => {
            let pool = db::open_pool(&config).await?;
            let result = sync_cmd::run(&pool, &config).await;
            pool.close().await;
            result
        }
    }
}
