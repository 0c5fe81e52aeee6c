use thiserror::Error;

/// Resolved upstream endpoint (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ws_url: String,
    pub http_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum UnsupportedChain {
    #[error("provider `{provider}` has no known endpoint for chain {chain_id}")]
    NoEndpoint { provider: String, chain_id: u64 },
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
}

/// Given (provider, chainId, apiKey) produce a `wsUrl`/`httpUrl` pair, or
/// `UnsupportedChain`. `custom` short-circuits to a caller-supplied URL
/// (the `apiKey` slot doubles as the literal URL in that case).
pub fn endpoint_for(
    provider: &str,
    chain_id: u64,
    api_key: &str,
) -> Result<Endpoint, UnsupportedChain> {
    match provider {
        "custom" => Ok(Endpoint {
            ws_url: api_key.to_string(),
            http_url: None,
        }),
        "alchemy" => {
            let network = alchemy_network(chain_id).ok_or_else(|| UnsupportedChain::NoEndpoint {
                provider: provider.to_string(),
                chain_id,
            })?;
            Ok(Endpoint {
                ws_url: format!("wss://{network}.g.alchemy.com/v2/{api_key}"),
                http_url: Some(format!("https://{network}.g.alchemy.com/v2/{api_key}")),
            })
        }
        "infura" => {
            let network = infura_network(chain_id).ok_or_else(|| UnsupportedChain::NoEndpoint {
                provider: provider.to_string(),
                chain_id,
            })?;
            Ok(Endpoint {
                ws_url: format!("wss://{network}.infura.io/ws/v3/{api_key}"),
                http_url: Some(format!("https://{network}.infura.io/v3/{api_key}")),
            })
        }
        other => Err(UnsupportedChain::UnknownProvider(other.to_string())),
    }
}

/// Try each provider in declared order; the first one that resolves wins.
pub fn endpoint_for_any(
    providers: &[String],
    chain_id: u64,
    api_key_for: impl Fn(&str) -> Option<String>,
) -> Result<Endpoint, UnsupportedChain> {
    let mut last_err = None;
    for provider in providers {
        let key = api_key_for(provider).unwrap_or_default();
        match endpoint_for(provider, chain_id, &key) {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| UnsupportedChain::UnknownProvider("<none configured>".into())))
}

fn alchemy_network(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("eth-mainnet"),
        11155111 => Some("eth-sepolia"),
        137 => Some("polygon-mainnet"),
        42161 => Some("arb-mainnet"),
        10 => Some("opt-mainnet"),
        8453 => Some("base-mainnet"),
        _ => None,
    }
}

fn infura_network(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("mainnet"),
        11155111 => Some("sepolia"),
        137 => Some("polygon-mainnet"),
        42161 => Some("arbitrum-mainnet"),
        10 => Some("optimism-mainnet"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_provider_short_circuits() {
        let endpoint = endpoint_for("custom", 1, "wss://my-node.example/ws").unwrap();
        assert_eq!(endpoint.ws_url, "wss://my-node.example/ws");
        assert!(endpoint.http_url.is_none());
    }

    #[test]
    fn alchemy_known_chain() {
        let endpoint = endpoint_for("alchemy", 1, "KEY").unwrap();
        assert_eq!(endpoint.ws_url, "wss://eth-mainnet.g.alchemy.com/v2/KEY");
    }

    #[test]
    fn unknown_chain_for_provider_is_unsupported() {
        let err = endpoint_for("alchemy", 999_999, "KEY").unwrap_err();
        assert!(matches!(err, UnsupportedChain::NoEndpoint { .. }));
    }

    #[test]
    fn failover_tries_providers_in_order() {
        let providers = vec!["alchemy".to_string(), "infura".to_string()];
        let endpoint = endpoint_for_any(&providers, 999_999, |p| {
            if p == "infura" {
                Some("KEY".to_string())
            } else {
                None
            }
        });
        // alchemy has no endpoint for this chain id either, both fail.
        assert!(endpoint.is_err());

        let providers = vec!["alchemy".to_string(), "infura".to_string()];
        let endpoint = endpoint_for_any(&providers, 1, |_| Some("KEY".to_string())).unwrap();
        assert_eq!(endpoint.ws_url, "wss://eth-mainnet.g.alchemy.com/v2/KEY");
    }
}
