use anyhow::{bail, Context, Result};

use crate::provider::endpoint_for_any;
use crate::types::ChainConfig;

/// Top-level process configuration, loaded once at startup and immutable
/// for the lifetime of the process (spec.md §3, §6).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub chains: Vec<ChainConfig>,
    pub database_url: String,
    pub nats: Option<NatsConfig>,
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub object_store_bucket: String,
}

impl AppConfig {
    /// Loads `PORT`, `CHAIN_{i}_*`, `PROVIDER`/`PROVIDERS`,
    /// `<PROVIDER>_API_KEY`, `DATABASE_URL`, `NATS_*` (spec.md §6).
    pub fn load() -> Result<Self> {
        let port = env_or("PORT", "8080")
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        let nats = if env_flag("NATS_ENABLED") {
            Some(NatsConfig {
                url: std::env::var("NATS_URL").context("NATS_URL is required when NATS_ENABLED")?,
                object_store_bucket: env_or("NATS_OBJECT_STORE_BUCKET", "mempool-fanout"),
            })
        } else {
            None
        };

        let chains = load_chains()?;
        if chains.is_empty() {
            bail!("no chains configured: set CHAIN_1_NAME and CHAIN_1_ID at minimum");
        }

        Ok(Self {
            port,
            chains,
            database_url,
            nats,
        })
    }
}

fn load_chains() -> Result<Vec<ChainConfig>> {
    let providers: Vec<String> = std::env::var("PROVIDER")
        .or_else(|_| std::env::var("PROVIDERS"))
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let mut chains = Vec::new();
    let mut i = 1u32;
    loop {
        let name = match std::env::var(format!("CHAIN_{i}_NAME")) {
            Ok(v) => v,
            Err(_) => break,
        };
        let id: u64 = match std::env::var(format!("CHAIN_{i}_ID")) {
            Ok(v) => v
                .parse()
                .with_context(|| format!("CHAIN_{i}_ID must be a positive integer"))?,
            Err(_) => break,
        };
        if name.is_empty() {
            bail!("CHAIN_{i}_NAME must be non-empty");
        }
        if id == 0 {
            bail!("CHAIN_{i}_ID must be a positive integer");
        }

        let explicit_ws = std::env::var(format!("CHAIN_{i}_WS_URL")).ok();
        let explicit_rpc = std::env::var(format!("CHAIN_{i}_RPC_URL")).ok();

        let (ws_url, rpc_url) = if let Some(ws_url) = explicit_ws {
            (ws_url, explicit_rpc)
        } else {
            if providers.is_empty() {
                bail!(
                    "CHAIN_{i}_WS_URL not set and no PROVIDER/PROVIDERS configured for chain {id}"
                );
            }
            let endpoint = endpoint_for_any(&providers, id, |p| {
                std::env::var(format!("{}_API_KEY", p.to_uppercase())).ok()
            })
            .with_context(|| format!("no usable provider endpoint for chain {id}"))?;
            (endpoint.ws_url, explicit_rpc.or(endpoint.http_url))
        };

        if !ws_url.starts_with("wss://") {
            bail!("CHAIN_{i}_WS_URL (chain {id}) must start with wss://");
        }

        chains.push(ChainConfig {
            id,
            name,
            ws_url,
            rpc_url,
        });
        i += 1;
    }

    Ok(chains)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them so they don't interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear(keys: &[&str]) {
        for k in keys {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn rejects_non_wss_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["CHAIN_1_NAME", "CHAIN_1_ID", "CHAIN_1_WS_URL", "CHAIN_2_NAME"]);
        std::env::set_var("CHAIN_1_NAME", "ethereum");
        std::env::set_var("CHAIN_1_ID", "1");
        std::env::set_var("CHAIN_1_WS_URL", "ws://insecure.example");

        let err = load_chains().unwrap_err();
        assert!(err.to_string().contains("wss://"));

        clear(&["CHAIN_1_NAME", "CHAIN_1_ID", "CHAIN_1_WS_URL"]);
    }

    #[test]
    fn loads_until_first_missing_pair() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&[
            "CHAIN_1_NAME",
            "CHAIN_1_ID",
            "CHAIN_1_WS_URL",
            "CHAIN_2_NAME",
            "CHAIN_2_ID",
        ]);
        std::env::set_var("CHAIN_1_NAME", "ethereum");
        std::env::set_var("CHAIN_1_ID", "1");
        std::env::set_var("CHAIN_1_WS_URL", "wss://example/ws");

        let chains = load_chains().unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].id, 1);

        clear(&["CHAIN_1_NAME", "CHAIN_1_ID", "CHAIN_1_WS_URL"]);
    }
}
