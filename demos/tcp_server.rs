use std::error::Error;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::info;
use tcpmsg::{Handler, Reply, Server, ServerConfig, Session};

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_open(&self, session: &Arc<Session>) {
        info!("Session {}: opened from {}", session.id(), session.peer_addr());
    }

    fn on_close(&self, session: &Arc<Session>, forced: bool) {
        info!("Session {}: closed (forced: {})", session.id(), forced);
    }

    fn on_req(&self, session: Arc<Session>, body: Bytes) -> BoxFuture<'static, Reply> {
        Box::pin(async move {
            match std::str::from_utf8(&body) {
                Ok(text) => info!("Session {}: request: {}", session.id(), text),
                Err(_) => info!("Session {}: request ({} bytes)", session.id(), body.len()),
            }
            Reply::ok(body)
        })
    }

    fn on_push(&self, session: &Arc<Session>, body: Bytes) -> i16 {
        info!("Session {}: push ({} bytes)", session.id(), body.len());
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
    info!("Starting tcpmsg echo server on {}...", addr);

    let server = Server::bind(ServerConfig::new(addr), Arc::new(EchoHandler)).await?;

    let runner = server.clone();
    let accept = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.stop().await;
    accept.await??;

    Ok(())
}
