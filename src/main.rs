mod api;
mod archive;
mod bus;
mod cli;
mod config;
mod detect;
mod enrich;
mod error;
mod incident;
mod logging;
mod model;
mod respond;
mod store;

#[cfg(test)]
mod tests;

use clap::Parser;
use log::LevelFilter;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use api::handlers::AppState;
use api::server::ApiServer;
use archive::{ArchiveWriter, FsObjectStore};
use bus::{InProcessBus, MessageBus};
use cli::{Cli, Commands, RulesCommands, RunArgs};
use config::Config;
use detect::rules::{load_rules, RuleSet};
use detect::Detector;
use enrich::{PodWatch, StaticPodWatch};
use error::{Result, SentryError};
use incident::IncidentStage;
use logging::init_logging;
use respond::kube::{KubeClient, KubePodWatch};
use respond::{OfflineOrchestrator, OrchestratorApi, Responder};
use store::incidents::{IncidentStore, SledIncidentStore};
use store::{CorrelationStore, MemoryCorrelationStore};

const STAGES: [&str; 5] = ["ingest", "enrich", "detect", "incident", "respond"];

/// Interval between pod watch poll cycles.
const POD_WATCH_INTERVAL: Duration = Duration::from_secs(30);

type StageFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// A stage that returns is either done or broken; both take the whole
/// process down so the scheduler can restart it cleanly.
fn spawn_stage(
    name: &'static str,
    future: StageFuture,
    fatal: Arc<watch::Sender<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = future.await {
            log::error!("stage {} failed: {}", name, e);
        }
        let _ = fatal.send(true);
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'info'", cli.log_level);
            LevelFilter::Info
        }
    };
    if let Err(e) = init_logging(log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let outcome = match &cli.command {
        Commands::Run(args) => run_stages(args).await,
        Commands::Rules { command } => run_rules_command(command),
    };

    if let Err(e) = outcome {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn parse_stages(raw: &str) -> Result<HashSet<String>> {
    if raw.trim() == "all" {
        return Ok(STAGES.iter().map(|s| s.to_string()).collect());
    }
    let mut stages = HashSet::new();
    for stage in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !STAGES.contains(&stage) {
            return Err(SentryError::Config(format!("unknown stage '{}'", stage)));
        }
        stages.insert(stage.to_string());
    }
    if stages.is_empty() {
        return Err(SentryError::Config("no stages selected".to_string()));
    }
    Ok(stages)
}

async fn run_stages(args: &RunArgs) -> Result<()> {
    let config = Config::from_env()?;
    let stages = parse_stages(&args.stages)?;
    let rule_set = load_rules(config.rules_dir.as_deref())?;

    let bus_handle: Arc<dyn MessageBus> = Arc::new(InProcessBus::default());
    let correlation: Arc<dyn CorrelationStore> = Arc::new(MemoryCorrelationStore::new());
    let incidents: Arc<dyn IncidentStore> = Arc::new(SledIncidentStore::open(&config.store_path)?);

    let (orchestrator, pod_watch): (Arc<dyn OrchestratorApi>, Arc<dyn PodWatch>) =
        match &config.kube {
            Some(settings) => {
                let client = Arc::new(KubeClient::new(settings)?);
                let watch_source = KubePodWatch::new(Arc::clone(&client), POD_WATCH_INTERVAL);
                (
                    client as Arc<dyn OrchestratorApi>,
                    Arc::new(watch_source) as Arc<dyn PodWatch>,
                )
            }
            None => {
                log::warn!("KUBE_API_URL not set, running without an orchestrator connection");
                (
                    Arc::new(OfflineOrchestrator) as Arc<dyn OrchestratorApi>,
                    Arc::new(StaticPodWatch) as Arc<dyn PodWatch>,
                )
            }
        };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let mut tasks = Vec::new();

    if stages.contains("ingest") {
        let object_store = Arc::new(FsObjectStore::new(config.archive_dir.clone()));
        let archive = Arc::new(ArchiveWriter::new(object_store, config.flush_interval));
        {
            let archive = Arc::clone(&archive);
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                archive.run(rx).await;
            }));
        }

        let state = Arc::new(AppState {
            bus: Arc::clone(&bus_handle),
            store: Arc::clone(&incidents),
            archive: Some(archive),
        });
        let address = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let server = ApiServer::new(address, state, config.tls.clone());
        let rx = shutdown_rx.clone();
        tasks.push(spawn_stage(
            "ingest",
            Box::pin(server.run(rx)),
            Arc::clone(&shutdown_tx),
        ));
    }

    if stages.contains("enrich") {
        let rx = shutdown_rx.clone();
        tasks.push(spawn_stage(
            "enrich",
            Box::pin(enrich::run_enricher(
                Arc::clone(&bus_handle),
                pod_watch,
                Duration::from_secs(config.max_window_secs),
                config.worker_pool,
                rx,
            )),
            Arc::clone(&shutdown_tx),
        ));
    }

    if stages.contains("detect") {
        let detector = Arc::new(Detector::new(
            Arc::clone(&bus_handle),
            Arc::clone(&correlation),
            rule_set,
        )?);
        let rx = shutdown_rx.clone();
        tasks.push(spawn_stage(
            "detect",
            Box::pin(detect::run_detector(
                detector,
                config.worker_pool,
                config.detect_tap_raw,
                rx,
            )),
            Arc::clone(&shutdown_tx),
        ));
    }

    if stages.contains("incident") {
        let stage = Arc::new(IncidentStage::new(
            Arc::clone(&incidents),
            Arc::clone(&bus_handle),
        ));
        let rx = shutdown_rx.clone();
        tasks.push(spawn_stage(
            "incident",
            Box::pin(incident::run_incident_stage(stage, config.worker_pool, rx)),
            Arc::clone(&shutdown_tx),
        ));
    }

    if stages.contains("respond") {
        let responder = Arc::new(Responder::new(
            orchestrator,
            Arc::clone(&incidents),
            config.protected_namespaces.clone(),
        ));
        let rx = shutdown_rx.clone();
        tasks.push(spawn_stage(
            "respond",
            Box::pin(respond::run_responder(
                responder,
                Arc::clone(&bus_handle),
                config.worker_pool,
                rx,
            )),
            Arc::clone(&shutdown_tx),
        ));
    }

    log::info!(
        "podsentry running stages: {}",
        {
            let mut names: Vec<&str> = stages.iter().map(String::as_str).collect();
            names.sort_unstable();
            names.join(",")
        }
    );

    // Run until a shutdown signal or a stage failure, then drain.
    let mut fatal_rx = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("shutdown signal received"),
        _ = fatal_rx.changed() => {}
    }
    let _ = shutdown_tx.send(true);

    tokio::time::sleep(config.drain_interval).await;
    for task in &tasks {
        task.abort();
    }
    log::info!("podsentry stopped");
    Ok(())
}

fn run_rules_command(command: &RulesCommands) -> Result<()> {
    match command {
        RulesCommands::Validate { path } => {
            let content = std::fs::read_to_string(path)?;
            let set: RuleSet = serde_yaml::from_str(&content)
                .map_err(|e| SentryError::Config(format!("{}: {}", path.display(), e)))?;

            let stateless = set.rules.len();
            let thresholds = set.thresholds.len();
            let sequences = set.sequences.len();

            detect::matcher::RuleEngine::new(set.rules)?;
            detect::correlator::Correlator::new(
                Arc::new(MemoryCorrelationStore::new()),
                set.thresholds,
                set.sequences,
            )?;

            println!(
                "{}: {} rules, {} thresholds, {} sequences compile cleanly",
                path.display(),
                stateless,
                thresholds,
                sequences
            );
            Ok(())
        }
        RulesCommands::Show => {
            let yaml = serde_yaml::to_string(&detect::rules::builtin_rules())
                .map_err(|e| SentryError::Config(e.to_string()))?;
            print!("{}", yaml);
            Ok(())
        }
    }
}
