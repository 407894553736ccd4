mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "qa-hub", about = "QA services of the DevOps platform")]
struct Cli {
    #[arg(long)]
    config_file_path: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Sonar scan ingestion and ticket reconciliation
    SonarIngest,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config has no `{0}` section")]
    MissingSection(&'static str),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    SonarIngest(#[from] sonar_ingest::SonarIngestError),
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some("qa_hub"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

fn init_common(common: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let guard = init_logging(common.logging.as_ref());
    if let Some(metrics) = &common.metrics {
        init_metrics(metrics)?;
    }
    Ok(guard)
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config_file_path)?;
    let _sentry = init_common(&config.common)?;

    match cli.command {
        CliCommand::SonarIngest => {
            let sonar_config = config
                .sonar_ingest
                .ok_or(CliError::MissingSection("sonar_ingest"))?;

            tracing::info!("starting sonar-ingest");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(sonar_ingest::run(sonar_config))?;
        }
    }

    Ok(())
}
