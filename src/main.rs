// Gridpilot - unattended grid-trading controller CLI

use clap::{Parser, Subcommand};
use gridpilot::clients::{MarketDataFeed, SimGateway, TradingGateway};
use gridpilot::{App, Config, Database};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gridpilot")]
#[command(version = "0.2.0")]
#[command(about = "Unattended grid-trading controller", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and workspace
    Init,

    /// Run the controller until interrupted
    Run {
        /// Force simulated execution regardless of the configured mode
        #[arg(long)]
        paper: bool,
    },

    /// Show controller state from the durable layer
    Status {
        /// Show detailed system information
        #[arg(short, long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging first (before config load so we can see config errors)
    let log_level = if cli.verbose { "debug" } else { "info" };
    std::env::set_var("RUST_LOG", log_level);
    tracing_subscriber::fmt::init();

    match cli.command {
        Commands::Init => {
            let config = Config::load_or_create(&cli.config)?;
            let database = Database::new(&config.store.db_path)?;
            database.run_migrations()?;
            info!("workspace ready: {} / {}", cli.config, config.store.db_path);
        }

        Commands::Run { paper } => {
            let mut config = Config::load_or_create(&cli.config)?;
            if paper {
                config.account.mode = "sim".to_string();
            }
            if config.account.mode != "live" {
                info!("running in simulated execution mode");
            }

            // The live gateway connector plugs in here; until an account is
            // wired up, the in-process sim gateway stands in for both modes.
            let gateway = Arc::new(SimGateway::new(1_000_000.0));
            if config.account.mode == "live" {
                warn!("no live connector configured, falling back to sim gateway");
                config.account.mode = "sim".to_string();
            }

            let app = App::build(
                config,
                Arc::clone(&gateway) as Arc<dyn TradingGateway>,
                gateway as Arc<dyn MarketDataFeed>,
            )?;
            app.run().await?;
        }

        Commands::Status { detailed } => {
            let config = Config::load_or_create(&cli.config)?;
            let database = Database::new(&config.store.db_path)?;
            database.run_migrations()?;

            let positions = gridpilot::db::position::load_all(database.connection())?;
            let open_sessions = gridpilot::db::grid::load_open_sessions(database.connection())?;
            let recent = gridpilot::db::trade::list_recent(database.connection(), 10)?;

            println!("account:        {}", config.account.account_id);
            println!("mode:           {}", config.account.mode);
            println!("positions:      {}", positions.len());
            println!("open sessions:  {}", open_sessions.len());
            println!("recent trades:  {}", recent.len());

            if detailed {
                for (instrument, name, durable) in &positions {
                    println!(
                        "  {} {} high={:.3} stop={:.3} profit_triggered={}",
                        instrument,
                        name,
                        durable.highest_price,
                        durable.stop_loss_price,
                        durable.profit_triggered
                    );
                }
                for session in &open_sessions {
                    println!(
                        "  grid {} {} center={:.3} locked={:.3} trades={}",
                        session.id,
                        session.instrument,
                        session.current_center,
                        session.locked_center,
                        session.trade_count
                    );
                }
                for trade in &recent {
                    println!(
                        "  {} {} {} {:.0}@{:.3} [{}]",
                        trade.created_at.as_deref().unwrap_or("-"),
                        trade.side,
                        trade.instrument,
                        trade.volume,
                        trade.price,
                        trade.strategy
                    );
                }
            }
        }
    }

    Ok(())
}
