use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::collections::HashMap;
use std::str::FromStr;

use crate::blockchain::{Address, Block, Transaction};
use crate::node::{Node, WalletInfo};

/// Shared node handle
pub type NodeData = web::Data<Node>;

/// Request for the transact endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactRequest {
    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: u64,
}

/// Body of every error response
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Why the request failed
    pub error: String,
}

impl ErrorResponse {
    fn new(error: impl ToString) -> Self {
        ErrorResponse {
            error: error.to_string(),
        }
    }
}

/// Get the full blockchain
///
/// Returns every block, oldest first
#[utoipa::path(
    get,
    path = "/api/blocks",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = Vec<Block>)
    )
)]
pub async fn get_blocks(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.chain())
}

/// Get the chain length
#[utoipa::path(
    get,
    path = "/api/blocks/length",
    responses(
        (status = 200, description = "Number of blocks including genesis", body = usize)
    )
)]
pub async fn get_blocks_length(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.chain_len())
}

/// Get a page of blocks
///
/// Pages hold five blocks, newest first; page 1 is the newest
#[utoipa::path(
    get,
    path = "/api/blocks/{page}",
    params(
        ("page" = usize, Path, description = "Page number starting at 1")
    ),
    responses(
        (status = 200, description = "Blocks retrieved successfully", body = Vec<Block>)
    )
)]
pub async fn get_blocks_page(node: NodeData, page: web::Path<usize>) -> impl Responder {
    HttpResponse::Ok().json(node.blocks_page(page.into_inner()))
}

/// Send coins from the node wallet
///
/// Folds into the wallet's pending transaction when there is one
#[utoipa::path(
    post,
    path = "/api/transact",
    request_body = TransactRequest,
    responses(
        (status = 200, description = "Transaction added to the pool", body = Transaction),
        (status = 400, description = "Invalid transaction", body = ErrorResponse)
    )
)]
pub async fn transact(node: NodeData, request: web::Json<TransactRequest>) -> impl Responder {
    let TransactRequest { recipient, amount } = request.into_inner();

    let recipient = match Address::from_str(&recipient) {
        Ok(address) => address,
        Err(err) => return HttpResponse::BadRequest().json(ErrorResponse::new(err)),
    };

    match node.transact(recipient, amount) {
        Ok(transaction) => HttpResponse::Ok().json(transaction),
        Err(err) => HttpResponse::BadRequest().json(ErrorResponse::new(err)),
    }
}

/// Get the transaction pool
///
/// Returns pending transactions keyed by id
#[utoipa::path(
    get,
    path = "/api/transaction-pool-map",
    responses(
        (status = 200, description = "Pool retrieved successfully", body = HashMap<String, Transaction>)
    )
)]
pub async fn get_transaction_pool_map(node: NodeData) -> impl Responder {
    let pool: HashMap<String, Transaction> = node.pool();
    HttpResponse::Ok().json(pool)
}

/// Mine the pending transactions
///
/// Mines a block with the valid pool contents and a reward for the node wallet
#[utoipa::path(
    get,
    path = "/api/mine-transactions",
    responses(
        (status = 200, description = "Block mined successfully", body = Block),
        (status = 500, description = "Mining failed", body = ErrorResponse)
    )
)]
pub async fn mine_transactions(node: NodeData) -> impl Responder {
    match node.mine_transactions().await {
        Ok(block) => HttpResponse::Ok().json(block),
        Err(err) => {
            error!("Mining failed: {}", err);
            HttpResponse::InternalServerError().json(ErrorResponse::new(err))
        }
    }
}

/// Get the node wallet
#[utoipa::path(
    get,
    path = "/api/wallet-info",
    responses(
        (status = 200, description = "Wallet address and balance", body = WalletInfo)
    )
)]
pub async fn get_wallet_info(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.wallet_info())
}

/// Get every address seen on the chain
#[utoipa::path(
    get,
    path = "/api/known-addresses",
    responses(
        (status = 200, description = "Addresses credited on the chain", body = Vec<Address>)
    )
)]
pub async fn get_known_addresses(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.known_addresses())
}
