use std::sync::Arc;
use tracing::info;

use vigil_pipeline::{
    alerts::seed_rules,
    analysis::HttpAnalysisClient,
    config::Config,
    dispatch::LogDispatcher,
    metrics::register_metrics,
    pipeline::Pipeline,
    store::create_store,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    register_metrics();

    // Initialize store
    let store = create_store(&config.database).await?;
    store.init().await?;

    // Seed alert rules if a rules file is configured
    if let Some(ref path) = config.rules_path {
        seed_rules(store.as_ref(), path).await?;
    }

    let client = Arc::new(HttpAnalysisClient::new(&config.analysis)?);
    let dispatcher = Arc::new(LogDispatcher);

    let pipeline = Arc::new(Pipeline::new(
        store,
        client,
        dispatcher,
        config.pipeline.clone(),
    ));
    pipeline.clone().start();

    info!("Detection pipeline running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    pipeline.shutdown();
    info!("Shutdown complete");
    Ok(())
}
