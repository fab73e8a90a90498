use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::{broadcast, mpsc};
use marinergrid::api;
use marinergrid::config::Config;
use marinergrid::emergency;
use marinergrid::engine::{self, Engine};
use marinergrid::outbox::{self, HttpTransport, Outbox, Uploader};
use marinergrid::seed::{SeedFetcher, SeedStore, SeedWatcher};
use marinergrid::sources::TelemetryService;
use marinergrid::vector::{self, VectorStore};

#[derive(Debug, StructOpt)]
struct Cli {
    /// config file
    #[structopt(long = "config", short = "c", default_value = "config.yaml")]
    config_file: String,
}

#[rocket::main]
async fn main() -> () {
    std::env::var("RUST_LOG").map_err(|_| {
        std::env::set_var("RUST_LOG", "error,marinergrid=info");
    }).unwrap_or_default();
    env_logger::init();

    let args = Cli::from_args();
    let config = match Config::load(std::path::Path::new(&args.config_file)) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Error loading config `{}`, using defaults : {:?}", args.config_file, e);
            Config::default()
        }
    };

    let emergency = emergency::shared();
    let (events_tx, _events_rx) = broadcast::channel(1024);
    let (engine_tx, engine_rx) = mpsc::channel(1024);

    let seeds = Arc::new(SeedStore::new());
    let vectors = Arc::new(VectorStore::new(&config.vector));
    if let Err(e) = vectors.init() {
        log::error!("Vector store degraded, pattern alerts disabled : {:?}", e);
    }
    let outbox = match Outbox::open(&config.outbox.dir, config.outbox.max_attempts) {
        Ok(outbox) => Arc::new(outbox),
        Err(e) => {
            log::error!("Error opening outbox {} : {:?}", config.outbox.dir, e);
            return;
        }
    };

    let engine = Engine::new(&config, seeds.clone(), vectors.clone(), outbox.clone(), emergency.clone(), events_tx.clone());
    let status = engine.status();
    let alerts = engine.alerts();
    tokio::spawn(engine.run(engine_rx));
    tokio::spawn(engine::run_ticker(engine_tx.clone()));

    let watcher = SeedWatcher::new(seeds.clone(), config.seed.clone(), engine_tx.clone(), events_tx.clone());
    tokio::spawn(watcher.run());
    let fetcher = SeedFetcher::new(config.seed.fetch.clone(), &config.seed.dir, emergency.clone());
    tokio::spawn(fetcher.run());

    tokio::spawn(vector::run_flush(vectors.clone(), config.vector.flush_interval_secs, emergency.clone()));

    match &config.outbox.endpoint {
        Some(endpoint) => {
            let uploader = Arc::new(Uploader::new(
                outbox.clone(),
                Box::new(HttpTransport::new(endpoint)),
                config.outbox.clone(),
            ));
            tokio::spawn(outbox::run_sync_loop(
                uploader,
                emergency.clone(),
                config.outbox.sync_interval_secs,
                events_tx.clone(),
            ));
        }
        None => {
            log::info!("Outbox upload disabled : no endpoint configured");
        }
    }

    let service = TelemetryService::new(config.telemetry.clone(), engine_tx.clone(), events_tx.clone(), emergency.clone());
    tokio::spawn(service.run());

    match api::build(status, alerts, engine_tx).launch().await {
        Ok(_) => (),
        Err(e) => {
            log::error!("Error launching server : {:?}", e);
        }
    }
}
