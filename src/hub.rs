use std::collections::{HashMap, HashSet};
use std::sync::RwLock as StdRwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::types::{ChainStatus, PendingTx};

/// Depth of a subscriber's outbound queue. Producer sends are `try_send`;
/// once full, further messages for that subscriber are dropped rather than
/// blocking the broadcaster or any other subscriber (spec.md §5, P3).
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { timestamp: chrono::DateTime<chrono::Utc> },
    #[serde(rename = "subscribed")]
    Subscribed { chains: Vec<u64> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "transaction")]
    Transaction { data: PendingTx },
    #[serde(rename = "chainStatus", rename_all = "camelCase")]
    ChainStatus { chain_id: u64, status: ChainStatus },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { chains: Vec<u64> },
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Chains(HashSet<u64>),
}

impl Filter {
    fn matches(&self, chain_id: u64) -> bool {
        match self {
            Filter::All => true,
            Filter::Chains(ids) => ids.contains(&chain_id),
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    filter: StdRwLock<Filter>,
}

/// Accepts downstream WebSocket subscribers, tracks each one's chain
/// filter, and fans each `PendingTx`/chain-status event out to interested
/// subscribers without letting a slow one stall the others (spec.md §4.5).
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its id plus the receiving end
    /// of its outbound queue (a writer task owns the socket and drains it).
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let subscriber = Subscriber {
            tx,
            filter: StdRwLock::new(Filter::All),
        };
        self.subscribers.write().await.insert(id, subscriber);
        (id, rx)
    }

    /// Removes a subscriber on disconnect or on a hard send failure
    /// (spec.md §4.5: "a subscriber whose send fails is removed").
    pub async fn unregister(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn set_filter(&self, id: Uuid, filter: Filter) {
        if let Some(subscriber) = self.subscribers.read().await.get(&id) {
            *subscriber.filter.write().unwrap() = filter;
        }
    }

    /// P2: for all `tx` broadcast to subscriber `S`, `S.filter == "all" ||
    /// tx.chainId ∈ S.filter`.
    pub async fn broadcast_tx(&self, tx: &PendingTx) {
        let snapshot = self.subscribers.read().await;
        for (id, subscriber) in snapshot.iter() {
            let matches = subscriber.filter.read().unwrap().matches(tx.chain_id);
            if !matches {
                continue;
            }
            if subscriber
                .tx
                .try_send(ServerMessage::Transaction { data: tx.clone() })
                .is_err()
            {
                debug!(subscriber = %id, "outbound queue full or closed, dropping transaction");
            }
        }
    }

    pub async fn broadcast_chain_status(&self, chain_id: u64, status: ChainStatus) {
        let snapshot = self.subscribers.read().await;
        for (id, subscriber) in snapshot.iter() {
            if subscriber
                .tx
                .try_send(ServerMessage::ChainStatus { chain_id, status })
                .is_err()
            {
                debug!(subscriber = %id, "outbound queue full or closed, dropping chain status");
            }
        }
    }

    pub async fn send(&self, id: Uuid, message: ServerMessage) {
        if let Some(subscriber) = self.subscribers.read().await.get(&id) {
            let _ = subscriber.tx.try_send(message);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

/// Applies one inbound client message, returning the reply to send back
/// (spec.md §4.5 message table). Unrecognized messages are silently
/// ignored upstream (deserialization failure never reaches this function).
pub async fn handle_client_message(
    hub: &SubscriberHub,
    id: Uuid,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Subscribe { chains } => {
            hub.set_filter(id, Filter::Chains(chains.iter().copied().collect()))
                .await;
            Some(ServerMessage::Subscribed { chains })
        }
        ClientMessage::Unsubscribe => {
            hub.set_filter(id, Filter::All).await;
            Some(ServerMessage::Subscribed { chains: Vec::new() })
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxStatus;

    fn sample_tx(chain_id: u64) -> PendingTx {
        PendingTx {
            hash: "0xabc".into(),
            chain_id,
            from: "0x01".into(),
            to: None,
            value: "0".into(),
            gas_price: "0".into(),
            gas_limit: "21000".into(),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: "0x".into(),
            nonce: 0,
            tx_type: 0,
            timestamp: chrono::Utc::now(),
            status: TxStatus::Pending,
        }
    }

    #[tokio::test]
    async fn s3_subscriber_filter_isolates_chains() {
        let hub = SubscriberHub::new();
        let (a, mut a_rx) = hub.register().await;
        let (b, mut b_rx) = hub.register().await;

        hub.set_filter(a, Filter::Chains([1].into_iter().collect())).await;
        hub.set_filter(b, Filter::Chains([8453].into_iter().collect())).await;

        hub.broadcast_tx(&sample_tx(1)).await;

        let a_msg = a_rx.try_recv();
        assert!(matches!(a_msg, Ok(ServerMessage::Transaction { .. })));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn p3_slow_subscriber_does_not_stall_others() {
        let hub = SubscriberHub::new();
        let (_slow_id, _slow_rx_not_drained) = hub.register().await;
        let (fast_id, mut fast_rx) = hub.register().await;

        // Fill the slow subscriber's queue without draining it.
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH + 8 {
            hub.broadcast_tx(&sample_tx(1)).await;
        }

        // The fast subscriber still received every message — the slow
        // one's full queue never blocked the broadcaster.
        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_DEPTH + 8);
        let _ = fast_id;
    }

    #[tokio::test]
    async fn unsubscribe_clears_filter_back_to_all() {
        let hub = SubscriberHub::new();
        let (id, _rx) = hub.register().await;
        hub.set_filter(id, Filter::Chains([1].into_iter().collect())).await;
        let reply = handle_client_message(&hub, id, ClientMessage::Unsubscribe).await;
        assert!(matches!(reply, Some(ServerMessage::Subscribed { chains }) if chains.is_empty()));

        hub.broadcast_tx(&sample_tx(999)).await;
    }
}
