use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::hub::SubscriberHub;
use crate::nats::Nats;
use crate::session::UpstreamSession;
use crate::store::Store;
use crate::types::{ChainConfig, SessionEvent};
use crate::{nats, types::ChainStatus};

/// Loads the chain list, starts one Upstream Session per chain, wires their
/// events to the Store and Subscriber Hub, and serves graceful shutdown
/// (spec.md §4.6).
pub struct Supervisor {
    store: Arc<dyn Store>,
    hub: Arc<SubscriberHub>,
    nats: Option<Arc<Nats>>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn Store>, hub: Arc<SubscriberHub>, nats: Option<Arc<Nats>>) -> Self {
        Self { store, hub, nats }
    }

    /// Runs every chain's session until `shutdown` resolves, then instructs
    /// every session to stop (canceling any pending reconnect timer) and
    /// waits for them to finish (spec.md §4.6, P4).
    pub async fn run(
        self,
        chains: Vec<ChainConfig>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        validate_chains(&chains)?;
        self.store.reconcile_chains(&chains).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for chain in chains {
            info!(chain_id = chain.id, chain = %chain.name, "starting session");
            let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(1024);

            let session = UpstreamSession::new(&chain, events_tx);
            handles.push(tokio::spawn(session.run(stop_rx.clone())));

            let store = Arc::clone(&self.store);
            let hub = Arc::clone(&self.hub);
            let nats = self.nats.clone();
            handles.push(tokio::spawn(consume_events(events_rx, store, hub, nats)));
        }

        shutdown.await;
        info!("shutdown requested, stopping sessions");
        let _ = stop_tx.send(true);

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Single-consumer per chain: preserves the in-order delivery guarantee
/// (spec.md §5 "within a single chain ... no reordering") by handing each
/// event to the Store then the Hub synchronously, one at a time.
async fn consume_events(
    mut events: mpsc::Receiver<SessionEvent>,
    store: Arc<dyn Store>,
    hub: Arc<SubscriberHub>,
    nats: Option<Arc<Nats>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Transaction(tx) => {
                if let Err(e) = store.upsert(&tx).await {
                    error!(hash = %tx.hash, error = %e, "store upsert failed");
                }
                hub.broadcast_tx(&tx).await;
                if let Some(nats) = &nats {
                    if let Err(e) = nats::publish_transaction(nats, &tx).await {
                        error!(hash = %tx.hash, error = %e, "nats publish failed");
                    }
                }
            }
            SessionEvent::Status { chain_id, status } => {
                log_status(chain_id, status);
                hub.broadcast_chain_status(chain_id, status).await;
            }
        }
    }
}

fn log_status(chain_id: u64, status: ChainStatus) {
    match status {
        ChainStatus::Connected => info!(chain_id, "chain connected"),
        ChainStatus::Disconnected => info!(chain_id, "chain disconnected"),
    }
}

fn validate_chains(chains: &[ChainConfig]) -> Result<()> {
    if chains.is_empty() {
        bail!("no chains configured");
    }
    for chain in chains {
        if !chain.ws_url.starts_with("wss://") {
            bail!("chain {} ws_url must start with wss://", chain.id);
        }
        if chain.name.is_empty() {
            bail!("chain {} name must be non-empty", chain.id);
        }
        if chain.id == 0 {
            bail!("chain id must be a positive integer");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_chain_list() {
        assert!(validate_chains(&[]).is_err());
    }

    #[test]
    fn rejects_non_wss_url() {
        let chains = vec![ChainConfig {
            id: 1,
            name: "ethereum".into(),
            ws_url: "ws://insecure".into(),
            rpc_url: None,
        }];
        assert!(validate_chains(&chains).is_err());
    }

    #[test]
    fn accepts_well_formed_chain() {
        let chains = vec![ChainConfig {
            id: 1,
            name: "ethereum".into(),
            ws_url: "wss://example/ws".into(),
            rpc_url: None,
        }];
        assert!(validate_chains(&chains).is_ok());
    }
}
