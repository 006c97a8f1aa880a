//! GPU Agent - GPU utilization reporting for Compute Engine instances
//!
//! This agent forwards nvidia-smi readings to Cloud Monitoring:
//! - Preflight validation of the nvidia-smi tool
//! - Host identity resolution via the metadata server
//! - Periodic collect → encode → report cycles as custom time series
//! - Bearer token refresh on rejected credentials

mod config;
mod discovery;
mod error;
mod execution;
mod metrics;
mod reporting;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use config::{AgentConfig, Cli};
use discovery::HostIdentity;
use error::StartupError;
use execution::CommandTokenSource;
use metrics::{MetricsCollector, NvidiaSmi};
use reporting::{encode_batch, MetricsSink, MonitoringClient};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main agent state
struct Agent<C, S> {
    collector: C,
    sink: S,
    host: HostIdentity,
    interval: Duration,
}

impl Agent<NvidiaSmi, MonitoringClient<CommandTokenSource>> {
    /// Run preflight checks and resolve the host, ready to poll
    async fn start(config: &AgentConfig) -> Result<Self, StartupError> {
        info!("Running preflight checks...");
        let tool = execution::check_tool(&config.tool_path, config.tool_timeout()).await?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(StartupError::HttpClient)?;

        let host = HostIdentity::resolve(&client, &config.metadata_url).await?;

        let token_source = CommandTokenSource::new(config.token_argv()?, config.token_timeout());
        let sink = MonitoringClient::new(
            client,
            &config.monitoring_url,
            &host.project_id,
            token_source,
        );

        Ok(Agent::new(
            NvidiaSmi::new(tool, config.tool_timeout()),
            sink,
            host,
            config.interval(),
        ))
    }
}

impl<C: MetricsCollector, S: MetricsSink> Agent<C, S> {
    fn new(collector: C, sink: S, host: HostIdentity, interval: Duration) -> Self {
        Self {
            collector,
            sink,
            host,
            interval,
        }
    }

    /// One collect → encode → report pass, returning the number of reported series
    async fn run_cycle(&mut self) -> Result<usize> {
        let metrics = self
            .collector
            .collect()
            .await
            .context("Failed to collect GPU metrics")?;

        let batch = encode_batch(&metrics, &self.host, Utc::now());

        self.sink
            .report(&batch)
            .await
            .context("Failed to report GPU metrics")?;

        Ok(batch.len())
    }

    /// Poll forever; a failed cycle is logged and the next one runs on schedule
    async fn run(mut self) {
        info!("Starting polling loop (interval: {}s)", self.interval.as_secs());

        loop {
            match self.run_cycle().await {
                Ok(count) => debug!("Cycle complete - {} time series reported", count),
                Err(e) => error!("{:#}", e),
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

async fn startup(cli: &Cli) -> Result<Agent<NvidiaSmi, MonitoringClient<CommandTokenSource>>, StartupError> {
    let config = AgentConfig::from_cli(cli).await?;
    Agent::start(&config).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpu_agent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(StartupError::from(e).exit_code());
        }
    };
    info!("📈 GPU Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    if cli.per_core {
        warn!("--per-core is not implemented yet, reporting per-GPU metrics only");
    }

    let agent = match startup(&cli).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    agent.run().await;
}
