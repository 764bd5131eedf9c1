//! etc desktop - headless entry point
//!
//! Restores the stored session, opens the notifications stream and prints
//! client events until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use etc_desktop_lib::{commands, config::ClientConfig, events::BroadcastSink, logging, SessionClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid configuration")?;
    logging::init(&config.data_dir);
    info!("etc desktop starting...");

    let events = Arc::new(BroadcastSink::new(256));
    let mut rx = events.subscribe();
    let client = SessionClient::new(config, events).context("failed to build HTTP client")?;

    let status = commands::check_api_status(&client).await;
    info!("Service online: {} ({:?})", status.online, status.status);

    let user = commands::get_init_user(&client).await;
    if user.is_null() {
        warn!("No stored session; sign in with ETC_REFRESH_TOKEN to continue");
        if let Ok(token) = std::env::var("ETC_REFRESH_TOKEN") {
            let result = commands::token_login(&client, &token).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&user)?);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    commands::stop_presence(&client);
    info!("Shutting down");
    Ok(())
}
