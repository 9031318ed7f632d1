use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use clap::Parser;

use assessd::config::CliArgs;
use assessd::engine::AssessmentEngine;
use assessd::executor::Executor;
use assessd::models::Seed;
use assessd::sandbox::create_backend;
use assessd::store::Store;
use assessd::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli
        .to_config()
        .with_context(|| format!("Failed to load configuration from {}", cli.config_path))?;

    let store = Store::open(&config.storage)
        .await
        .context("Failed to open record store")?;
    if cli.flush_data {
        store.clear().await.context("Failed to flush record store")?;
        log::info!("Flushed record store");
    }

    let backend = create_backend(&config).context("Failed to create sandbox backend")?;
    // Not fatal: requests report the problem until the backend becomes usable
    if let Err(e) = backend.probe().await {
        log::warn!("Sandbox backend {} is not usable: {e}", backend.kind());
    }

    let executor = Arc::new(Executor::new(backend, &config.engine));
    let engine = web::Data::new(AssessmentEngine::new(
        Arc::new(store),
        executor,
        &config.engine,
    ));

    if let Some(seed_path) = &cli.seed_path {
        let file = std::fs::File::open(seed_path)
            .with_context(|| format!("Failed to open seed file {seed_path}"))?;
        let seed: Seed = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse seed file {seed_path}"))?;
        engine
            .seed(seed.assessments)
            .await
            .context("Failed to load seed data")?;
    }

    let server = build_server(config.server, engine).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    server_handle.stop(true).await;
    log::info!("Shutdown complete");
    Ok(())
}
