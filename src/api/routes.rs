use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/blocks", web::get().to(handlers::get_blocks))
            .route("/blocks/length", web::get().to(handlers::get_blocks_length))
            .route("/blocks/{page}", web::get().to(handlers::get_blocks_page))
            .route("/transact", web::post().to(handlers::transact))
            .route(
                "/transaction-pool-map",
                web::get().to(handlers::get_transaction_pool_map),
            )
            .route(
                "/mine-transactions",
                web::get().to(handlers::mine_transactions),
            )
            .route("/wallet-info", web::get().to(handlers::get_wallet_info))
            .route("/known-addresses", web::get().to(handlers::get_known_addresses)),
    );
}
