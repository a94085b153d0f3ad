use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forecast_service::config::{load_config, to_toml};
use forecast_service::market::MarketDataUpload;
use forecast_service::service::ForecastService;
use forecast_service::types::{ModelId, NewModel, RunStatus, StockId};
use forecast_service::web::{start_api_server, AppState};

#[derive(Parser)]
#[command(name = "forecast-service")]
#[command(version)]
#[command(about = "Registry, training, inference and comparison of time-series forecasting models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API with the training watchdog
    Serve {
        /// Overrides server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the architecture catalog
    Architectures,
    /// Register a model from a JSON file
    Register {
        /// JSON document with architecture, name, version and configs
        #[arg(short, long)]
        file: String,
    },
    /// Load price bars and feature values from a JSON file
    Ingest {
        #[arg(short, long)]
        file: String,
    },
    /// Train (or retrain) a model and wait for the run to finish
    Train {
        model_id: ModelId,
    },
    /// Show a model with its training runs
    Status {
        model_id: ModelId,
    },
    /// Forecast a stock with a ready model
    Predict {
        model_id: ModelId,
        stock_id: StockId,
        /// Number of steps; defaults to inference.default_horizon
        #[arg(long)]
        horizon: Option<usize>,
        /// Forecast origin (RFC 3339); defaults to now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Compare stored predictions of several models against actuals
    Compare {
        stock_id: StockId,
        /// Comma-separated model ids
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<ModelId>,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(Some(&cli.config))?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", to_toml(&config)?);
        return Ok(());
    }

    let port = config.server.port;
    let service = ForecastService::open(config).await?;
    service.bootstrap().await?;

    match cli.command {
        Commands::Serve { port: override_port } => {
            run_server(service, override_port.unwrap_or(port)).await?;
        }
        Commands::Architectures => {
            print_json(&service.registry.architectures().await?)?;
        }
        Commands::Register { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?;
            let new_model: NewModel = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file))?;
            print_json(&service.registry.register(new_model).await?)?;
        }
        Commands::Ingest { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?;
            let upload: MarketDataUpload = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file))?;
            let bars = service.market.ingest(&upload).await?;
            info!("Stored {} bars for stock {}", bars, upload.stock_id);
        }
        Commands::Train { model_id } => {
            train(&service, model_id).await?;
        }
        Commands::Status { model_id } => {
            let model = service.registry.get(model_id).await?;
            let runs = service.registry.training_runs(model_id).await?;
            print_json(&serde_json::json!({ "model": model, "runs": runs }))?;
        }
        Commands::Predict { model_id, stock_id, horizon, as_of } => {
            let horizon = horizon.unwrap_or_else(|| service.engine.default_horizon());
            let result = service
                .engine
                .predict(model_id, stock_id, as_of.unwrap_or_else(Utc::now), horizon)
                .await?;
            print_json(&result)?;
        }
        Commands::Compare { stock_id, models, start, end } => {
            let now = Utc::now();
            let start = start.unwrap_or(now - Duration::days(30));
            let end = end.unwrap_or(now + Duration::days(5));
            print_json(&service.metrics.compare(stock_id, &models, start, end).await?)?;
        }
        Commands::ShowConfig => {}
    }

    Ok(())
}

async fn run_server(service: ForecastService, port: u16) -> Result<()> {
    let watchdog = service.spawn_watchdog();
    info!("Training watchdog started");

    let result = start_api_server(AppState::new(service), port).await;
    watchdog.abort();

    if let Err(e) = &result {
        error!("API server error: {}", e);
    }
    result
}

async fn train(service: &ForecastService, model_id: ModelId) -> Result<()> {
    let watchdog = service.spawn_watchdog();
    let ticket = service.orchestrator.submit(model_id, None).await?;
    info!("Submitted training run {} for model {}", ticket.run_id, model_id);

    let run = service.orchestrator.await_run(ticket.run_id).await?;
    watchdog.abort();

    print_json(&run)?;
    if run.status != RunStatus::Completed {
        anyhow::bail!(
            "training run {} failed: {}",
            run.id,
            run.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
