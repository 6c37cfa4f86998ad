//! Labguard lab monitoring and self-healing daemon

use labguard::{Config, LabguardServer};

#[tokio::main]
async fn main() -> common::Result<()> {
    // Tracing is not initialized yet, so configuration errors go to stderr.
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    if config.logging.json() {
        common::logging::init_json_with_level(level);
    } else {
        common::logging::init_with_level(level);
    }

    tracing::info!(labs = config.labs.len(), "Labguard starting");

    LabguardServer::new(config).run().await
}
