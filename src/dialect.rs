use crate::types::Dialect;

/// The only per-chain knowledge the Session carries: well-known chain ids
/// mapped to their default subscription dialect (spec.md §4.3). Unknown
/// chains default to `HeadersThenFetch`.
pub fn for_chain(chain_id: u64) -> Dialect {
    match chain_id {
        // Ethereum mainnet, Sepolia: Alchemy-style full pending tx stream.
        1 | 11155111 => Dialect::FullPending,
        // Polygon, BSC: full mined tx stream (already-confirmed).
        137 | 56 => Dialect::FullMined,
        // Optimism, Arbitrum: hash-only pending stream, fetch full tx over HTTP.
        10 | 42161 => Dialect::HashOnlyPending,
        // Everything else: subscribe to new block headers and fetch the block.
        _ => Dialect::HeadersThenFetch,
    }
}

impl Dialect {
    /// The `eth_subscribe` params for this dialect (spec.md §4.3 table).
    pub fn subscribe_params(self) -> serde_json::Value {
        match self {
            Dialect::FullPending => {
                serde_json::json!(["alchemy_pendingTransactions", {"hashesOnly": false}])
            }
            Dialect::FullMined => {
                serde_json::json!(["alchemy_minedTransactions", {"hashesOnly": false}])
            }
            Dialect::HashOnlyPending => serde_json::json!(["newPendingTransactions"]),
            Dialect::HeadersThenFetch => serde_json::json!(["newHeads"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_chains_map_to_documented_dialects() {
        assert_eq!(for_chain(1), Dialect::FullPending);
        assert_eq!(for_chain(137), Dialect::FullMined);
        assert_eq!(for_chain(10), Dialect::HashOnlyPending);
    }

    #[test]
    fn unknown_chain_defaults_to_headers_then_fetch() {
        assert_eq!(for_chain(999_999), Dialect::HeadersThenFetch);
    }
}
