use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::types::{ChainConfig, PendingTx, TxStatus};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub chain_id: Option<u64>,
    pub from_prefix: Option<String>,
    pub to_prefix: Option<String>,
    pub status: Option<TxStatus>,
    pub order_by: OrderBy,
    pub descending: bool,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Timestamp,
    GasPrice,
    Nonce,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub by_status: HashMap<String, i64>,
    pub by_chain: HashMap<u64, i64>,
    pub top_senders_last_hour: Vec<(String, i64)>,
    #[serde(rename = "countLast5min")]
    pub count_last_5_min: i64,
}

/// At-least-once persistence of `PendingTx` keyed by `hash` (spec.md §4.4).
/// Implementation choices for indexing/queries are ours; the external
/// retention sweeper calls `delete_older_than` on a schedule.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert(&self, tx: &PendingTx) -> Result<()>;
    async fn find(&self, hash: &str) -> Result<Option<PendingTx>>;
    async fn find_page(&self, query: &PageQuery) -> Result<(Vec<PendingTx>, i64)>;
    async fn aggregate(&self, chain_id: Option<u64>) -> Result<Aggregate>;
    async fn delete_older_than(&self, ts: DateTime<Utc>) -> Result<u64>;
    async fn reconcile_chains(&self, chains: &[ChainConfig]) -> Result<()>;
    async fn list_chains(&self) -> Result<Vec<ChainConfig>>;
}

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .context("connecting to postgres")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {:?}", e);
            }
        });

        client.batch_execute(SCHEMA).await.context("applying schema")?;
        info!("postgres store ready");

        Ok(Self { client })
    }
}

#[async_trait]
impl Store for PgStore {
    /// I1 (unique hash) and I4 (monotone status) both live in this single
    /// `ON CONFLICT` clause: a `CASE` expression that only ever moves
    /// `pending -> confirmed`, never back.
    async fn upsert(&self, tx: &PendingTx) -> Result<()> {
        let query = r#"
            INSERT INTO pending_transactions (
                hash, chain_id, sender, recipient, value, gas_price, gas_limit,
                max_fee_per_gas, max_priority_fee_per_gas, input_data, nonce,
                tx_type, observed_at, status
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (hash) DO UPDATE SET
                status = CASE
                    WHEN pending_transactions.status = 'confirmed' THEN 'confirmed'
                    ELSE EXCLUDED.status
                END
        "#;
        let status = status_str(tx.status);
        self.client
            .execute(
                query,
                &[
                    &tx.hash,
                    &(tx.chain_id as i64),
                    &tx.from,
                    &tx.to,
                    &tx.value,
                    &tx.gas_price,
                    &tx.gas_limit,
                    &tx.max_fee_per_gas,
                    &tx.max_priority_fee_per_gas,
                    &tx.input,
                    &(tx.nonce as i64),
                    &(tx.tx_type as i16),
                    &tx.timestamp,
                    &status,
                ],
            )
            .await
            .context("upserting transaction")?;
        Ok(())
    }

    async fn find(&self, hash: &str) -> Result<Option<PendingTx>> {
        let row = self
            .client
            .query_opt(
                "SELECT hash, chain_id, sender, recipient, value, gas_price, gas_limit, \
                 max_fee_per_gas, max_priority_fee_per_gas, input_data, nonce, tx_type, \
                 observed_at, status FROM pending_transactions WHERE hash = $1",
                &[&hash],
            )
            .await
            .context("querying transaction by hash")?;
        Ok(row.map(row_to_tx))
    }

    async fn find_page(&self, query: &PageQuery) -> Result<(Vec<PendingTx>, i64)> {
        let limit = query.limit.min(100).max(1) as i64;
        let offset = query.offset as i64;

        let order_col = match query.order_by {
            OrderBy::Timestamp => "observed_at",
            OrderBy::GasPrice => "gas_price::numeric",
            OrderBy::Nonce => "nonce",
        };
        let direction = if query.descending { "DESC" } else { "ASC" };

        let mut conditions = Vec::new();
        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
        let chain_id_i64 = query.chain_id.map(|c| c as i64);
        if let Some(c) = &chain_id_i64 {
            conditions.push(format!("chain_id = ${}", params.len() + 1));
            params.push(c);
        }
        if let Some(prefix) = &query.from_prefix {
            conditions.push(format!("sender LIKE ${}", params.len() + 1));
            params.push(prefix);
        }
        if let Some(prefix) = &query.to_prefix {
            conditions.push(format!("recipient LIKE ${}", params.len() + 1));
            params.push(prefix);
        }
        let status_str_val = query.status.map(status_str);
        if let Some(s) = &status_str_val {
            conditions.push(format!("status = ${}", params.len() + 1));
            params.push(s);
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT count(*) FROM pending_transactions {where_clause}");
        let total: i64 = self
            .client
            .query_one(&count_sql, &params)
            .await
            .context("counting transactions")?
            .get(0);

        let select_sql = format!(
            "SELECT hash, chain_id, sender, recipient, value, gas_price, gas_limit, \
             max_fee_per_gas, max_priority_fee_per_gas, input_data, nonce, tx_type, \
             observed_at, status FROM pending_transactions {where_clause} \
             ORDER BY {order_col} {direction} LIMIT {limit} OFFSET {offset}"
        );
        let rows = self
            .client
            .query(&select_sql, &params)
            .await
            .context("paging transactions")?;

        Ok((rows.into_iter().map(row_to_tx).collect(), total))
    }

    async fn aggregate(&self, chain_id: Option<u64>) -> Result<Aggregate> {
        let chain_filter = chain_id.map(|c| c as i64);

        let by_status_rows = if let Some(c) = chain_filter {
            self.client
                .query(
                    "SELECT status, count(*) FROM pending_transactions WHERE chain_id = $1 GROUP BY status",
                    &[&c],
                )
                .await
        } else {
            self.client
                .query(
                    "SELECT status, count(*) FROM pending_transactions GROUP BY status",
                    &[],
                )
                .await
        }
        .context("aggregating by_status")?;
        let by_status = by_status_rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, i64>(1)))
            .collect();

        let by_chain_rows = self
            .client
            .query("SELECT chain_id, count(*) FROM pending_transactions GROUP BY chain_id", &[])
            .await
            .context("aggregating by_chain")?;
        let by_chain = by_chain_rows
            .into_iter()
            .map(|r| (r.get::<_, i64>(0) as u64, r.get::<_, i64>(1)))
            .collect();

        let top_senders_sql = if chain_filter.is_some() {
            "SELECT sender, count(*) FROM pending_transactions \
             WHERE chain_id = $1 AND observed_at > now() - interval '1 hour' \
             GROUP BY sender ORDER BY count(*) DESC LIMIT 10"
        } else {
            "SELECT sender, count(*) FROM pending_transactions \
             WHERE observed_at > now() - interval '1 hour' \
             GROUP BY sender ORDER BY count(*) DESC LIMIT 10"
        };
        let top_senders_rows = if let Some(c) = chain_filter {
            self.client.query(top_senders_sql, &[&c]).await
        } else {
            self.client.query(top_senders_sql, &[]).await
        }
        .context("aggregating top_senders_last_hour")?;
        let top_senders_last_hour = top_senders_rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, i64>(1)))
            .collect();

        let count_sql = if chain_filter.is_some() {
            "SELECT count(*) FROM pending_transactions WHERE chain_id = $1 AND observed_at > now() - interval '5 minutes'"
        } else {
            "SELECT count(*) FROM pending_transactions WHERE observed_at > now() - interval '5 minutes'"
        };
        let count_last_5_min: i64 = if let Some(c) = chain_filter {
            self.client.query_one(count_sql, &[&c]).await
        } else {
            self.client.query_one(count_sql, &[]).await
        }
        .context("aggregating count_last_5min")?
        .get(0);

        Ok(Aggregate {
            by_status,
            by_chain,
            top_senders_last_hour,
            count_last_5_min,
        })
    }

    async fn delete_older_than(&self, ts: DateTime<Utc>) -> Result<u64> {
        let deleted = self
            .client
            .execute("DELETE FROM pending_transactions WHERE observed_at < $1", &[&ts])
            .await
            .context("deleting retained records")?;
        Ok(deleted)
    }

    async fn reconcile_chains(&self, chains: &[ChainConfig]) -> Result<()> {
        for chain in chains {
            self.client
                .execute(
                    "INSERT INTO chains (chain_id, name, ws_url, rpc_url) VALUES ($1,$2,$3,$4) \
                     ON CONFLICT (chain_id) DO UPDATE SET name = EXCLUDED.name, \
                     ws_url = EXCLUDED.ws_url, rpc_url = EXCLUDED.rpc_url",
                    &[
                        &(chain.id as i64),
                        &chain.name,
                        &chain.ws_url,
                        &chain.rpc_url,
                    ],
                )
                .await
                .context("reconciling chain table")?;
        }
        Ok(())
    }

    async fn list_chains(&self) -> Result<Vec<ChainConfig>> {
        let rows = self
            .client
            .query("SELECT chain_id, name, ws_url, rpc_url FROM chains ORDER BY chain_id", &[])
            .await
            .context("listing chains")?;
        Ok(rows
            .into_iter()
            .map(|r| ChainConfig {
                id: r.get::<_, i64>(0) as u64,
                name: r.get(1),
                ws_url: r.get(2),
                rpc_url: r.get(3),
            })
            .collect())
    }
}

fn status_str(status: TxStatus) -> String {
    match status {
        TxStatus::Pending => "pending",
        TxStatus::Confirmed => "confirmed",
        TxStatus::Dropped => "dropped",
    }
    .to_string()
}

fn row_to_tx(row: tokio_postgres::Row) -> PendingTx {
    let status = match row.get::<_, String>(13).as_str() {
        "confirmed" => TxStatus::Confirmed,
        "dropped" => TxStatus::Dropped,
        _ => TxStatus::Pending,
    };
    PendingTx {
        hash: row.get(0),
        chain_id: row.get::<_, i64>(1) as u64,
        from: row.get(2),
        to: row.get(3),
        value: row.get(4),
        gas_price: row.get(5),
        gas_limit: row.get(6),
        max_fee_per_gas: row.get(7),
        max_priority_fee_per_gas: row.get(8),
        input: row.get(9),
        nonce: row.get::<_, i64>(10) as u64,
        tx_type: row.get::<_, i16>(11) as u8,
        timestamp: row.get(12),
        status,
    }
}
