//! Verifi service binary.
//!
//! Runs the HTTP service, or performs a single aggregation or verification
//! from the command line.
//!
//! Usage:
//!   verifi                                   # run the service (default)
//!   verifi serve --listen 0.0.0.0:4000       # run the service (explicit)
//!   verifi stats                             # fetch archives + print statistics
//!   verifi verify --address 8.8.8.8 --lat 37.4 --lon -122.1

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verifi::config::{VerifiConfig, CONFIG_FILE};
use verifi::consensus::environment::LocalEnvironment;
use verifi::consensus::ConsensusEngine;
use verifi::fetcher::{HttpRetriever, SourceFetcher};
use verifi::geo::IpInfoLocator;
use verifi::orchestrator::Orchestrator;
use verifi::rpc::RpcState;
use verifi::statistics::StatisticsAggregator;
use verifi::verifier::LocationVerifier;
use verifi::workflow::{CreCli, WorkflowRunner};

/// Network-quality measurement verification and aggregation.
#[derive(Parser, Debug)]
#[command(
    name = "verifi",
    version,
    about = "Verifiable network-quality statistics"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Override the number of redundant execution contexts.
    #[arg(long, global = true)]
    redundancy: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service.
    Serve {
        /// Listen address (overrides the config file).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Fetch every archive, aggregate, and print the statistics as JSON.
    Stats,

    /// Verify a claimed location against a network address.
    Verify {
        /// Reporter network address.
        #[arg(long)]
        address: String,

        /// Claimed latitude.
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Claimed longitude.
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
    },
}

/// Components wired from configuration.
struct Service {
    fetcher: Arc<SourceFetcher>,
    orchestrator: Arc<Orchestrator>,
    verifier: Arc<LocationVerifier<LocalEnvironment>>,
}

impl Service {
    fn build(config: &VerifiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let env = Arc::new(LocalEnvironment::new(
            config.consensus.redundancy,
            config.context_timeout(),
        ));
        let engine = ConsensusEngine::new(env);

        let retriever = HttpRetriever::new(config.source_timeout())?;
        let fetcher = SourceFetcher::new(
            Arc::new(retriever),
            config.sources.archives.clone(),
            config.sources.gateways.clone(),
        );

        let runner = config
            .workflow
            .enabled
            .then(|| Arc::new(CreCli::new(&config.workflow)) as Arc<dyn WorkflowRunner>);
        let orchestrator = Orchestrator::standard(runner, StatisticsAggregator::new(engine.clone()));

        let token = config
            .verifier
            .geo_token
            .clone()
            .or_else(|| std::env::var("VERIFI_GEO_TOKEN").ok());
        let locator = IpInfoLocator::new(
            config.verifier.geo_base_url.clone(),
            token,
            Duration::from_secs(verifi::constants::GEO_TIMEOUT_SECS),
        )?;
        let verifier = LocationVerifier::new(engine, Arc::new(locator), config.verifier.threshold_km);

        tracing::info!(
            sources = config.sources.archives.len(),
            redundancy = config.consensus.redundancy,
            tiers = ?orchestrator.tier_names(),
            "service configured"
        );

        Ok(Service {
            fetcher: Arc::new(fetcher),
            orchestrator: Arc::new(orchestrator),
            verifier: Arc::new(verifier),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = VerifiConfig::load(&cli.config);
    if let Some(n) = cli.redundancy {
        config.consensus.redundancy = n;
    }

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| config.listen_addr());
            let service = Service::build(&config)?;
            let state = RpcState {
                fetcher: service.fetcher,
                orchestrator: service.orchestrator,
                verifier: service.verifier,
            };
            verifi::rpc::serve(addr, state)
                .await
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }

        Command::Stats => {
            let service = Service::build(&config)?;
            let report = service.fetcher.fetch_all().await;
            let outcome = service.orchestrator.run(&report.measurements).await?;
            tracing::info!(
                tier = outcome.tier.unwrap_or("none"),
                failed_sources = report.failures,
                "statistics ready"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.statistics)?);
        }

        Command::Verify { address, lat, lon } => {
            let service = Service::build(&config)?;
            let verdict = service
                .verifier
                .verify(Some(&address), Some(verifi::measurement::Coordinate::new(lat, lon)))
                .await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
    }

    Ok(())
}
