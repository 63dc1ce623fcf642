//! CONCORD — Consensus-synchronized Prediction Market Trading Engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores replica state from disk (or starts fresh), and runs the
//! local quorum of replicas through the decision pipeline with graceful
//! shutdown. A completed benchmarking run exits cleanly with status 0.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use concord::config::AppConfig;
use concord::markets::memory::{
    InMemoryContractCaller, InMemoryMarketSource, InMemoryMech, InMemoryTxSubmitter,
    SeededRandomness,
};
use concord::markets::MarketDataSource;
use concord::markets::subgraph::SubgraphClient;
use concord::pipeline::behaviours::Collaborators;
use concord::pipeline::{CycleOutcome, ReplicaRunner};
use concord::pipeline::runner::QuorumBus;
use concord::types::PredictionResponse;

const BANNER: &str = r#"
   ____ ___  _   _  ____ ___  ____  ____
  / ___/ _ \| \ | |/ ___/ _ \|  _ \|  _ \
 | |  | | | |  \| | |  | | | | |_) | | | |
 | |__| |_| | |\  | |__| |_| |  _ <| |_| |
  \____\___/|_| \_|\____\___/|_| \_\____/

  Consensus-Orchestrated N-replica CORrelated Decision engine
  v0.1.0 — Multi-Replica Agent
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        replicas = cfg.consensus.replica_count,
        quorum = cfg.consensus.quorum(),
        benchmarking = cfg.benchmarking.enabled,
        "CONCORD starting up"
    );

    // -- Collaborators ----------------------------------------------------

    let market_source: Arc<dyn MarketDataSource> = if cfg.market_source.enabled {
        match AppConfig::resolve_env(&cfg.market_source.endpoint_env) {
            Ok(endpoint) => {
                info!(endpoint = %endpoint, "Using the subgraph market source");
                Arc::new(
                    SubgraphClient::new(endpoint)
                        .context("Failed to build the subgraph client")?,
                )
            }
            Err(_) => {
                warn!(
                    env = %cfg.market_source.endpoint_env,
                    "Market source endpoint not set — running with an empty in-memory source"
                );
                Arc::new(InMemoryMarketSource::new(Vec::new()))
            }
        }
    } else {
        Arc::new(InMemoryMarketSource::new(Vec::new()))
    };

    // The on-chain layers are external collaborators; the in-memory
    // implementations keep the pipeline honest until they are wired.
    let contracts = Arc::new(InMemoryContractCaller::new(0, 0));
    let submitter = Arc::new(InMemoryTxSubmitter::settling());
    let placeholder_prediction = PredictionResponse::new(0.5, 0.5, 0.0, 0.0)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let mech = Arc::new(InMemoryMech::answering(placeholder_prediction));
    let randomness = Arc::new(SeededRandomness::new(&cfg.agent.name));

    // -- Replicas ---------------------------------------------------------

    let bus = QuorumBus::new();
    let tick = Duration::from_secs(cfg.agent.tick_interval_secs.max(1));
    let mut replicas = JoinSet::new();

    for replica_index in 0..cfg.consensus.replica_count {
        let mut replica_cfg = cfg.clone();
        replica_cfg.agent.data_dir =
            format!("{}/replica-{replica_index}", cfg.agent.data_dir);

        let collaborators = Collaborators {
            market_source: market_source.clone(),
            contracts: contracts.clone(),
            submitter: submitter.clone(),
            mech: mech.clone(),
            randomness: randomness.clone(),
        };

        let replica_id = format!("replica-{replica_index}");
        let bus = bus.clone();
        replicas.spawn(async move {
            let mut runner =
                ReplicaRunner::new(replica_id.clone(), replica_cfg, collaborators, bus)
                    .map_err(|e| anyhow::anyhow!("{replica_id}: {e}"))?;

            loop {
                match runner.run_cycle().await {
                    Ok(CycleOutcome::ExitBenchmarking) => {
                        info!(replica = %replica_id, "Benchmarking finished");
                        return Ok::<bool, anyhow::Error>(true);
                    }
                    Ok(CycleOutcome::Finished(terminal)) => {
                        info!(replica = %replica_id, terminal = %terminal, "Cycle complete");
                    }
                    Err(error) => {
                        error!(replica = %replica_id, %error, "Cycle failed");
                        if error.is_fatal() {
                            return Err(anyhow::anyhow!("{replica_id}: {error}"));
                        }
                    }
                }
                tokio::time::sleep(tick).await;
            }
        });
    }

    // -- Supervision ------------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut benchmarking_exited = false;
    loop {
        tokio::select! {
            joined = replicas.join_next() => {
                match joined {
                    Some(Ok(Ok(true))) => {
                        benchmarking_exited = true;
                    }
                    Some(Ok(Ok(false))) => {}
                    Some(Ok(Err(error))) => {
                        error!(%error, "Replica stopped with a fatal error");
                        replicas.abort_all();
                        anyhow::bail!("fatal replica error: {error}");
                    }
                    Some(Err(join_error)) => {
                        error!(%join_error, "Replica task panicked");
                        replicas.abort_all();
                        anyhow::bail!("replica task panicked: {join_error}");
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                replicas.abort_all();
                break;
            }
        }
    }

    if benchmarking_exited {
        info!("CONCORD benchmarking run complete. Exiting.");
    } else {
        info!("CONCORD shut down cleanly.");
    }
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("concord=info"));

    let json_logging = std::env::var("CONCORD_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
