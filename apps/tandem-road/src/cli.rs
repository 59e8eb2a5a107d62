use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientEvent, ServerEvent, SIGNALING_PATH};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "tandem-road")]
#[command(about = "Tandem Road signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on (overrides TANDEM_ROAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (overrides TANDEM_ROAD_BIND)
    #[arg(long)]
    pub bind: Option<std::net::IpAddr>,
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room as a throwaway participant and print every event received
    Debug {
        /// Relay URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Send `ready` after being admitted as guest
        #[arg(long)]
        ready: bool,
    },
}

pub async fn run_debug_client(url: String, room: String, ready: bool) -> Result<()> {
    let ws_url = format!("{}{}", url.trim_end_matches('/'), SIGNALING_PATH);
    debug!("Connecting to {} for room {}", ws_url, room);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = serde_json::to_string(&ClientEvent::Join { room: room.clone() })?;
    write.send(Message::Text(join.into())).await?;

    while let Some(frame) = read.next().await {
        let text = match frame.context("relay connection failed")? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        println!("{}", text.as_str());

        let event: ServerEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!("Unrecognised relay event: {}", e);
                continue;
            }
        };
        match event {
            ServerEvent::Joined { .. } if ready => {
                let ready = serde_json::to_string(&ClientEvent::Ready { room: room.clone() })?;
                write.send(Message::Text(ready.into())).await?;
            }
            ServerEvent::Full => break,
            _ => {}
        }
    }

    Ok(())
}
