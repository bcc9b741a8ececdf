use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;
use tcpmsg::{Client, ClientConfig, Handler, Session};

struct PrintPushes;

impl Handler for PrintPushes {
    fn on_push(&self, _session: &Arc<Session>, body: Bytes) -> i16 {
        info!("Server pushed {} bytes", body.len());
        0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:6969".to_string());
    info!("Starting tcpmsg client for {}...", addr);

    let config = ClientConfig::new(addr).with_retry_interval(Duration::from_secs(1));
    let client = Client::new(config, Arc::new(PrintPushes))?;
    client.start().await?;

    info!("Sending push...");
    let en = client.push("Hello from tcpmsg client!").await;
    info!("Push result: {}", en);

    for i in 0..5 {
        let reply = client.request(format!("request #{}", i)).await;
        if reply.succeed() {
            info!("Reply: {}", String::from_utf8_lossy(&reply.data));
        } else {
            info!("Request failed with code {}", reply.en);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Some(session) = client.session() {
        session.ping().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("RTT: {:?}", session.rtt());
    }

    info!("Closing connection...");
    client.stop().await;

    info!("Client example completed successfully!");
    Ok(())
}
