//! Chat client example for wslink
//!
//! Connects to a wslink server, listens on a chat topic, posts one message
//! through an RPC call and prints what comes back.
//!
//! ```text
//! cargo run --example chat_client -- ws://localhost:1234/ws
//! ```
//!
//! `WSLINK_SECRET` and `WSLINK_MAX_MSG_SIZE` override the defaults.

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wslink::{ConnectionEvent, SessionBuilder, SessionConfig, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let url = std::env::args().nth(1).unwrap_or_else(|| "ws://localhost:1234/ws".to_string());

    println!("wslink chat client");
    println!("==================");
    println!("Connecting to {} ...", url);

    let (session, mut events) = SessionBuilder::new(&url).with_config(SessionConfig::from_env()).connect().await?;
    println!("Connected as client {}", session.client_id().unwrap_or_default());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Ready { client_id } => println!("[event] ready as {}", client_id),
                ConnectionEvent::Error(e) => println!("[event] error: {}", e),
                ConnectionEvent::Closed { locally } => {
                    println!("[event] closed ({})", if locally { "by us" } else { "by server" });
                }
            }
        }
    });

    let subscription = session.subscribe("wslink.communication.channel", |payload: &[Value]| {
        for message in payload {
            match message.as_str() {
                Some(text) => println!("<< {}", text),
                None => println!("<< {:?}", message),
            }
        }
    })?;

    let reply = session
        .call("wslink.say.hello", vec![Value::from("Hello from Rust")], BTreeMap::new())?
        .await;
    match reply {
        Ok(value) => println!("Server replied: {:?}", value),
        Err(e) => println!("Call failed: {}", e),
    }

    // give published messages a moment to arrive
    tokio::time::sleep(Duration::from_secs(2)).await;

    subscription.unsubscribe()?;
    session.close().await?;
    println!("Session closed");
    Ok(())
}
