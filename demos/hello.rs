//! Example: Broadcast a log line through a relay
//!
//! Connects to the relay named by `M2M_URL` (default `ws://127.0.0.1:8080/m2m/`),
//! logs in when `M2M_USERNAME`/`M2M_PASSWORD` are set, broadcasts
//! "Hello, World" and waits for the relay to acknowledge it.
//!
//! Run with: `cargo run --example hello`

use m2m_client::utils::logging::init_logging;
use m2m_client::{Client, M2mConfig};
use tracing::Level;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = M2mConfig::from_env()?;
    config.logging.log_level = Level::DEBUG;
    init_logging(&config.logging)?;

    let client = Client::connect_url(&config).await?;
    println!("Connected as {:?}", client.identity());

    let result = client.log("Hello, World").wait().await;
    match &result {
        Ok(reply) => println!("Relay replied: {reply:?}"),
        Err(e) => eprintln!("Log command failed: {e}"),
    }

    client.close().await;
    result?;
    Ok(())
}
