use confab::{ChatServer, ServerConfig};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string());

    info!("Starting confab relay on {bind_addr}...");

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    let server = ChatServer::new(config);

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
