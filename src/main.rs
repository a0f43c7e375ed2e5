use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

use cryptochain::api;
use cryptochain::blockchain::{self, storage::ChainStorage, Wallet};
use cryptochain::config::NodeConfig;
use cryptochain::node::{self, LogBroadcaster, Node};

// Load the node wallet from the configured key, or create a fresh one
fn load_wallet(config: &NodeConfig) -> anyhow::Result<Wallet> {
    match &config.wallet_secret_key {
        Some(secret) => {
            let wallet = Wallet::from_secret_key(secret).context("Invalid wallet secret key")?;
            info!("Loaded wallet with address: {}", wallet.address());
            Ok(wallet)
        }
        None => {
            let wallet = Wallet::new();
            info!("Created wallet with address: {}", wallet.address());
            warn!("Set WALLET_SECRET_KEY to keep this wallet across restarts");
            Ok(wallet)
        }
    }
}

// Open persistent storage when a data directory is configured
fn initialize_node(config: &NodeConfig, wallet: Wallet) -> anyhow::Result<Node> {
    let broadcaster = Arc::new(LogBroadcaster);

    let Some(data_dir) = &config.data_dir else {
        info!("No DATA_DIR set, keeping the chain in memory");
        return Ok(Node::new(wallet, broadcaster));
    };

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let storage = ChainStorage::new(data_dir)
        .with_context(|| format!("Failed to open storage at {}", data_dir.display()))?;

    let node = Node::with_storage(wallet, broadcaster, storage)?;
    info!("Using storage at {}", data_dir.display());
    Ok(node)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_blocks,
        api::handlers::get_blocks_length,
        api::handlers::get_blocks_page,
        api::handlers::transact,
        api::handlers::get_transaction_pool_map,
        api::handlers::mine_transactions,
        api::handlers::get_wallet_info,
        api::handlers::get_known_addresses
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::crypto::Address,
            node::WalletInfo,
            api::handlers::TransactRequest,
            api::handlers::ErrorResponse
        )
    ),
    tags(
        (name = "cryptochain", description = "Cryptochain node endpoints")
    ),
    info(
        title = "Cryptochain API",
        version = "0.1.0",
        description = "Proof of work cryptocurrency node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env().context("Invalid configuration")?;
    let wallet = load_wallet(&config)?;
    let node = web::Data::new(initialize_node(&config, wallet)?);

    let (host, port) = config.bind_address();
    info!("Starting HTTP server at http://{}:{}", host, port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host, port))
    .context("Failed to bind HTTP server")?
    .run()
    .await?;

    Ok(())
}
