//! FumbleChain client REST API.
//!
//! A thin HTTP surface over the node: chain and pool queries, wallet
//! balances, and submission of transactions, block templates and mined
//! blocks. Accepted submissions are broadcast to the p2p network.
//!
//! Errors surface as bare status codes; rejection reasons only reach the
//! logs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use fumblechain_core::{Block, Transaction};
use fumblechain_network::{Peer, PeerManager};

/// Builds the API router around a peer manager handle.
pub fn router(manager: Arc<PeerManager>) -> Router {
    Router::new()
        .route("/peers", get(get_peers))
        .route("/transaction_pool", get(get_transaction_pool))
        .route("/transaction/:tx_id", get(get_transaction))
        .route("/transaction", post(create_transaction))
        .route("/blockchain", get(get_blockchain))
        .route("/block/:block_id", get(get_block))
        .route("/block/new", post(post_new_block))
        .route("/block", post(create_block))
        .route("/wallet/:address/balance", get(get_wallet_balance))
        .route("/wallet/:address/secure_balance", get(get_secure_wallet_balance))
        .route("/magic", get(get_magic))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serves the API on the given port until the server fails.
pub async fn serve(manager: Arc<PeerManager>, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("client api listening on port {port}");
    axum::serve(listener, router(manager)).await
}

/// Wraps an already-canonical JSON string in a response.
fn json_body(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[derive(Serialize)]
struct PeersResponse {
    peers: Vec<Peer>,
}

async fn get_peers(State(manager): State<Arc<PeerManager>>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: manager.peers(),
    })
}

#[derive(Serialize)]
struct PoolResponse {
    transactions: Vec<Transaction>,
}

async fn get_transaction_pool(State(manager): State<Arc<PeerManager>>) -> Json<PoolResponse> {
    let transactions = manager.chain().transaction_pool.iter().cloned().collect();
    Json(PoolResponse { transactions })
}

async fn get_transaction(
    State(manager): State<Arc<PeerManager>>,
    Path(tx_id): Path<String>,
) -> Response {
    match manager.chain().get_transaction(&tx_id) {
        Some(tx) => json_body(StatusCode::OK, tx.to_json()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_blockchain(State(manager): State<Arc<PeerManager>>) -> Response {
    json_body(StatusCode::OK, manager.chain().to_json())
}

async fn get_block(
    State(manager): State<Arc<PeerManager>>,
    Path(block_id): Path<String>,
) -> Response {
    let Ok(index) = block_id.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match manager.chain().block_from_index(index) {
        Some(block) => json_body(StatusCode::OK, block.to_json()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Serialize)]
struct BalanceResponse {
    address: String,
    balance: f64,
}

async fn get_wallet_balance(
    State(manager): State<Arc<PeerManager>>,
    Path(address): Path<String>,
) -> Response {
    match manager.chain().wallet_balance(&address) {
        Some(balance) => Json(BalanceResponse { address, balance }).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_secure_wallet_balance(
    State(manager): State<Arc<PeerManager>>,
    Path(address): Path<String>,
) -> Response {
    match manager.chain().secure_wallet_balance(&address) {
        Some(balance) => Json(BalanceResponse { address, balance }).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_transaction(State(manager): State<Arc<PeerManager>>, body: String) -> Response {
    let Ok(tx) = Transaction::from_json(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let result = manager.chain_mut().add_transaction(tx.clone());
    match result {
        Ok(()) => {
            manager.broadcast_tx(&tx);
            json_body(StatusCode::CREATED, tx.to_json())
        }
        Err(e) => {
            debug!("failed to add tx: {e}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn post_new_block(State(manager): State<Arc<PeerManager>>, body: String) -> Response {
    let Ok(coinbase) = Transaction::from_json(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let block = manager.chain().new_block(Some(&coinbase));
    json_body(StatusCode::CREATED, block.to_json())
}

async fn create_block(State(manager): State<Arc<PeerManager>>, body: String) -> Response {
    let Ok(block) = Block::from_json(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let result = manager.chain_mut().discard_block(block.clone());
    match result {
        Ok(()) => {
            manager.broadcast_block(&block);
            debug!("block {} added", block.index);
            json_body(StatusCode::CREATED, block.to_json())
        }
        Err(e) => {
            debug!("failed to add block: {e}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

#[derive(Serialize)]
struct MagicResponse {
    magic: u32,
}

async fn get_magic(State(manager): State<Arc<PeerManager>>) -> Json<MagicResponse> {
    Json(MagicResponse {
        magic: manager.chain().magic,
    })
}
