//! Standalone relay server.
//!
//! Configuration comes from the environment (`VELLUM_BIND_ADDR`,
//! `VELLUM_VOLATILE_CAPACITY`, `VELLUM_COMMAND_BUFFER`); logging from
//! `RUST_LOG`.

use vellum_collab::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting Vellum relay on {}...", config.bind_addr);

    RelayServer::new(config).run().await
}
