use serde::{Deserialize, Serialize};

/// The canonical normalized transaction record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingTx {
    pub hash: String,
    pub chain_id: u64,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub gas_price: String,
    pub gas_limit: String,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub input: String,
    pub nonce: u64,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Dropped,
}

/// Per-chain subscription dialect (spec.md §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    FullPending,
    FullMined,
    HashOnlyPending,
    HeadersThenFetch,
}

/// Immutable per-chain configuration loaded at startup (spec.md §3).
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub ws_url: String,
    pub rpc_url: Option<String>,
}

/// Chain-level liveness signal emitted by a Session (spec.md §4.3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Connected,
    Disconnected,
}

/// What a Session hands to the Supervisor (spec.md "Data flow").
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Transaction(PendingTx),
    Status { chain_id: u64, status: ChainStatus },
}
