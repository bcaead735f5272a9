use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fmt::Display;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

use tradegate_binance::BinanceFutures;
use tradegate_core::prelude::*;
use tradegate_core::utils::parse_iso8601;
use tradegate_exchange::{Stream, StreamItem};
use tradegate_monitoring::setup_logging;

#[derive(Parser)]
#[command(name = "tradegate")]
#[command(about = "Shared Binance USD-M futures streams and rate-governed REST calls")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the futures testnet endpoints
    #[arg(long, global = true)]
    testnet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live candles for a symbol
    Candles {
        symbol: String,
        #[arg(default_value = "1m")]
        timeframe: String,
    },
    /// Stream live aggregate trades for one or more symbols
    Trades {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Fetch closed candles starting at a time
    HistoryCandles {
        symbol: String,
        timeframe: String,
        /// RFC 3339 start time
        #[arg(long)]
        start: String,
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
    /// Fetch aggregate trades from a time or a trade id
    HistoryTrades {
        symbol: String,
        /// RFC 3339 start time
        #[arg(long, conflicts_with = "from_id")]
        start: Option<String>,
        #[arg(long)]
        from_id: Option<u64>,
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
    /// Watch updates for every order on the account
    Orders,
    /// Show version information
    Version,
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let config = match &cli.config {
        Some(path) if !path.exists() => anyhow::bail!("configuration file not found: {}", path.display()),
        Some(path) => GatewayConfig::from_files(&[path])
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None if cli.testnet => GatewayConfig::binance_futures_testnet(),
        None => GatewayConfig::binance_futures(),
    };
    Ok(config)
}

/// Prints items until the stream ends or Ctrl+C is pressed.
async fn follow<T: StreamItem + Display>(mut stream: Stream<T>) -> Result<()> {
    stream.open().await?;
    info!("Following {}", stream);

    loop {
        tokio::select! {
            item = stream.read() => match item {
                Ok(item) => println!("{}", item),
                Err(e) => {
                    warn!(error = %e, "Stream ended");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
                break;
            }
        }
    }

    stream.close().await?;
    Ok(())
}

async fn execute(gateway: &BinanceFutures, command: Commands) -> Result<()> {
    match command {
        Commands::Candles { symbol, timeframe } => {
            let timeframe: Timeframe = timeframe.parse()?;
            follow(gateway.candle_stream(&[(symbol, timeframe)])).await
        }
        Commands::Trades { symbols } => follow(gateway.trade_stream(symbols.as_slice())).await,
        Commands::HistoryCandles {
            symbol,
            timeframe,
            start,
            count,
        } => {
            let start = parse_iso8601(&start).context("invalid --start")?;
            let candles = gateway.candle_history(&symbol, timeframe.parse()?, start, count).await?;
            candles.iter().for_each(|candle| println!("{}", candle));
            Ok(())
        }
        Commands::HistoryTrades {
            symbol,
            start,
            from_id,
            count,
        } => {
            let cursor = match (start, from_id) {
                (_, Some(id)) => HistoryCursor::Id(id),
                (Some(start), None) => HistoryCursor::Time(parse_iso8601(&start).context("invalid --start")?),
                (None, None) => anyhow::bail!("either --start or --from-id is required"),
            };
            let trades = gateway.trade_history(&symbol, cursor, count).await?;
            trades.iter().for_each(|trade| println!("{}", trade));
            Ok(())
        }
        Commands::Orders => follow(gateway.all_order_updates()).await,
        Commands::Version => Ok(()),
    }
}

async fn run(command: Commands, config: GatewayConfig) -> Result<()> {
    let gateway = BinanceFutures::new(config)?;
    gateway.open().await?;
    info!(symbols = gateway.symbols().len(), "Gateway ready");

    let outcome = execute(&gateway, command).await;
    gateway.close().await?;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("TradeGate v{}", env!("CARGO_PKG_VERSION"));
        println!("Shared Binance USD-M futures streams and rate-governed REST calls");
        return Ok(());
    }

    let config = load_config(&cli)?;
    let _guard = setup_logging(&config.logging)?;

    info!("Starting TradeGate");
    run(cli.command, config).await
}
