mod config;
mod dialect;
mod hub;
mod nats;
mod normalizer;
mod provider;
mod retention;
mod session;
mod store;
mod supervisor;
mod types;
mod web_api;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::hub::SubscriberHub;
use crate::nats::Nats;
use crate::store::{PgStore, Store};
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    if let Err(e) = run().await {
        error!("fatal startup error: {e:?}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = config::AppConfig::load()?;
    info!(chains = config.chains.len(), "loaded configuration");

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let hub = Arc::new(SubscriberHub::new());

    let nats: Option<Arc<Nats>> = match &config.nats {
        Some(nats_cfg) => {
            let client = nats::connect(&nats_cfg.url, &nats_cfg.object_store_bucket).await?;
            Some(Arc::new(client))
        }
        None => None,
    };

    tokio::spawn(retention::run(Arc::clone(&store)));

    let web_state = web_api::AppState {
        store: Arc::clone(&store),
        hub: Arc::clone(&hub),
    };
    let port = config.port;
    tokio::spawn(async move {
        if let Err(e) = web_api::serve(web_state, port).await {
            error!("query surface stopped: {e:?}");
        }
    });

    let supervisor = Supervisor::new(store, hub, nats);
    supervisor
        .run(config.chains, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutdown complete");
    Ok(())
}
