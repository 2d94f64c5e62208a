use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info};

use crate::protocol::{generate_id, ChatPayload, ClientEvent, ServerEvent};

#[derive(Parser)]
#[command(name = "peddlenet-relay")]
#[command(about = "WebRTC signaling relay for ephemeral peer-to-peer chat rooms")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Debug WebSocket client for poking at a running relay
    Debug {
        /// WebSocket URL of the relay
        #[arg(long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Room to join
        #[arg(long, default_value = "debug-room")]
        room: String,

        /// Display name to announce
        #[arg(long, default_value = "debug-probe")]
        name: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand)]
pub enum DebugCommands {
    /// Join the room and print the current roster
    Peers,
    /// Send a chat message and wait for the delivery ack
    Send {
        /// Message text
        text: String,
    },
    /// Stay joined and print every event the relay pushes
    Watch,
}

pub async fn run_debug_client(
    url: String,
    room: String,
    name: String,
    command: DebugCommands,
) -> Result<()> {
    info!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect: {}", e);
            return Err(anyhow!("WebSocket connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout");
            return Err(anyhow!("Connection timeout after 5 seconds"));
        }
    };

    info!("Connected to relay");
    let (mut write, mut read) = ws_stream.split();

    let join = serde_json::to_string(&ClientEvent::JoinRoom {
        room_id: room.clone(),
        peer_id: format!("debug-{}", generate_id()),
        display_name: name,
    })?;
    write.send(Message::Text(join.into())).await?;

    // The relay answers a join with the roster first, then buffered history.
    let peers = loop {
        let message = match timeout(Duration::from_secs(5), read.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => return Err(anyhow!("WebSocket error: {}", e)),
            Ok(None) => return Err(anyhow!("Connection closed before the join completed")),
            Err(_) => return Err(anyhow!("Timed out waiting for the room roster")),
        };
        let text = match message {
            Message::Text(text) => text,
            _ => continue,
        };
        match serde_json::from_str::<ServerEvent>(&text)? {
            ServerEvent::RoomPeers { peers, .. } => break peers,
            ServerEvent::Error { code, message } => {
                return Err(anyhow!("Relay rejected the join: {:?}: {}", code, message));
            }
            _ => continue,
        }
    };

    println!(
        "Joined room '{}' with {} peer(s) already present",
        room,
        peers.len()
    );

    match command {
        DebugCommands::Peers => {
            if peers.is_empty() {
                println!("  (no other peers in the room)");
            }
            for peer in &peers {
                println!(
                    "  {} ({}) connection {}",
                    peer.display_name, peer.peer_id, peer.connection_id
                );
            }
        }
        DebugCommands::Send { text } => {
            let event = serde_json::to_string(&ClientEvent::ChatMessage {
                room_id: room.clone(),
                message: ChatPayload {
                    content: text,
                    id: None,
                },
            })?;
            write.send(Message::Text(event.into())).await?;

            loop {
                let message = match timeout(Duration::from_secs(10), read.next()).await {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(e))) => return Err(anyhow!("WebSocket error: {}", e)),
                    Ok(None) => return Err(anyhow!("Connection closed before the ack arrived")),
                    Err(_) => return Err(anyhow!("Timed out waiting for the delivery ack")),
                };
                let text = match message {
                    Message::Text(text) => text,
                    _ => continue,
                };
                match serde_json::from_str::<ServerEvent>(&text)? {
                    ServerEvent::MessageDelivered { message_id, .. } => {
                        println!("Delivered as {}", message_id);
                        break;
                    }
                    ServerEvent::Error { code, message } => {
                        return Err(anyhow!(
                            "Relay rejected the message: {:?}: {}",
                            code,
                            message
                        ));
                    }
                    _ => continue,
                }
            }
        }
        DebugCommands::Watch => {
            println!("Watching events (Ctrl+C to stop)...");
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => println!("{}", text),
                    Ok(Message::Close(_)) => {
                        println!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    write.send(Message::Close(None)).await.ok();
    Ok(())
}
