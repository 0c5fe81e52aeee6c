use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::hub::{handle_client_message, ClientMessage, ServerMessage, SubscriberHub};
use crate::store::{Aggregate, OrderBy, PageQuery, Store};
use crate::types::{PendingTx, TxStatus};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<SubscriberHub>,
}

/// Thin HTTP query surface over the Store plus the downstream WebSocket
/// fan-out endpoint (spec.md C7, §4.5). This is an external collaborator of
/// the ingestion-and-fan-out core: it only reads from the Store and
/// forwards WS traffic to the Hub.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/v1/transactions", get(list_transactions_handler))
        .route("/api/v1/transactions/:hash", get(get_transaction_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/chains", get(list_chains_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let bind_address = format!("0.0.0.0:{port}");
    info!(bind_address, "starting query surface + websocket hub");
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    chain_id: Option<u64>,
    from_prefix: Option<String>,
    to_prefix: Option<String>,
    status: Option<String>,
    order_by: Option<String>,
    order: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Page {
    rows: Vec<PendingTx>,
    total: i64,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn to_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

async fn list_transactions_handler(
    State(state): State<AppState>,
    Query(q): Query<TransactionsQuery>,
) -> Result<Json<Page>, (StatusCode, Json<ApiError>)> {
    let status = match q.status.as_deref() {
        None => None,
        Some("pending") => Some(TxStatus::Pending),
        Some("confirmed") => Some(TxStatus::Confirmed),
        Some("dropped") => Some(TxStatus::Dropped),
        Some(other) => {
            return Err(to_error(
                StatusCode::BAD_REQUEST,
                format!("unknown status `{other}`"),
            ))
        }
    };
    let order_by = match q.order_by.as_deref() {
        None | Some("timestamp") => OrderBy::Timestamp,
        Some("gasPrice") => OrderBy::GasPrice,
        Some("nonce") => OrderBy::Nonce,
        Some(other) => {
            return Err(to_error(
                StatusCode::BAD_REQUEST,
                format!("unknown order_by `{other}`"),
            ))
        }
    };
    let descending = matches!(q.order.as_deref(), Some("desc"));

    let query = PageQuery {
        chain_id: q.chain_id,
        from_prefix: q.from_prefix,
        to_prefix: q.to_prefix,
        status,
        order_by,
        descending,
        limit: q.limit.unwrap_or(25),
        offset: q.offset.unwrap_or(0),
    };

    let (rows, total) = state.store.find_page(&query).await.map_err(|e| {
        error!(error = %e, "find_page failed");
        to_error(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
    })?;

    Ok(Json(Page { rows, total }))
}

async fn get_transaction_handler(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<PendingTx>, (StatusCode, Json<ApiError>)> {
    match state.store.find(&hash).await {
        Ok(Some(tx)) => Ok(Json(tx)),
        Ok(None) => Err(to_error(StatusCode::NOT_FOUND, "transaction not found")),
        Err(e) => {
            error!(error = %e, "find failed");
            Err(to_error(StatusCode::INTERNAL_SERVER_ERROR, "query failed"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    chain_id: Option<u64>,
}

async fn stats_handler(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<Aggregate>, (StatusCode, Json<ApiError>)> {
    state
        .store
        .aggregate(q.chain_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "aggregate failed");
            to_error(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
        })
}

async fn list_chains_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let chains = state.store.list_chains().await.map_err(|e| {
        error!(error = %e, "list_chains failed");
        to_error(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
    })?;
    let body: Vec<_> = chains
        .into_iter()
        .map(|c| json!({"id": c.id, "name": c.name}))
        .collect();
    Ok(Json(json!(body)))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drives one downstream subscriber's connection (spec.md §4.5): a reader
/// half parses client messages into `Filter` changes, a writer half drains
/// the subscriber's Hub-assigned queue onto the socket. Either half ending
/// (client message error, socket closed, send failure) tears down the
/// subscriber registration.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut outbound) = state.hub.register().await;
    let (mut sink, mut stream) = socket.split();

    sink.send(WsMessage::Text(
        serde_json::to_string(&ServerMessage::Connected {
            timestamp: chrono::Utc::now(),
        })
        .unwrap(),
    ))
    .await
    .ok();

    let hub_for_reader = Arc::clone(&state.hub);
    let reader = async move {
        while let Some(Ok(msg)) = stream.next().await {
            let WsMessage::Text(text) = msg else { continue };
            let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                continue; // anything unrecognized is silently ignored
            };
            if let Some(reply) = handle_client_message(&hub_for_reader, id, client_msg).await {
                hub_for_reader.send(id, reply).await;
            }
        }
    };

    let writer = async move {
        while let Some(message) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break; // hard send failure: subscriber removed below
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }

    state.hub.unregister(id).await;
}
