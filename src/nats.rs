use std::io::Cursor;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{self, object_store::ObjectStore, Context};
use async_nats::Client;
use tracing::{error, info};

use crate::types::PendingTx;

/// Optional best-effort republish of every ingested transaction to a NATS
/// JetStream object store, alongside the Store and Subscriber Hub sinks.
#[derive(Clone)]
pub struct Nats {
    pub client: Client,
    pub js: Context,
    pub object_store: ObjectStore,
}

pub async fn connect(url: &str, bucket: &str) -> Result<Nats> {
    let client = loop {
        match async_nats::connect(url).await {
            Ok(conn) => break conn,
            Err(e) => {
                error!("[NATS] connection failed: {e}, retrying...");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    };
    info!("[NATS] connected to {url}");

    let js = jetstream::new(client.clone());

    let object_store = match js.get_object_store(bucket).await {
        Ok(store) => store,
        Err(_) => {
            info!("[NATS] creating object store bucket '{bucket}'");
            js.create_object_store(jetstream::object_store::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await?
        }
    };
    info!(bucket, "NATS object store ready");

    Ok(Nats {
        client,
        js,
        object_store,
    })
}

pub async fn publish_transaction(nats: &Nats, tx: &PendingTx) -> Result<()> {
    let key = format!("tx:{}:{}", tx.chain_id, tx.hash);
    let bytes = serde_json::to_vec(tx)?;
    let mut cursor = Cursor::new(bytes);
    nats.object_store.put(key.as_str(), &mut cursor).await?;
    Ok(())
}
