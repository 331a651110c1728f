// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bluechat command line client

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluechat::bluetooth::BluezRadio;
use bluechat::{Config, ConnectionAttempt, ConnectionOutcome, Controller, Peer};

#[derive(Parser)]
#[command(name = "bluechat")]
#[command(about = "Chat with a nearby device over Bluetooth", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file to use instead of the default one
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover nearby devices
    Scan,
    /// List bonded devices
    Paired,
    /// Wait for a peer to connect
    Listen,
    /// Connect to a peer
    Connect {
        /// Bluetooth address, e.g. AA:BB:CC:DD:EE:FF
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bluechat=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting bluechat v{}...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    let radio = Arc::new(BluezRadio::new().await?);
    let controller = Controller::new(radio, config).await;

    let mut errors = controller.errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(message) => eprintln!("! {}", message),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = match cli.command {
        Commands::Scan => scan(&controller).await,
        Commands::Paired => {
            controller.update_paired_devices().await;
            for peer in controller.bonded_peers() {
                println!("{}", peer);
            }
            Ok(())
        }
        Commands::Listen => {
            let attempt = controller.start_bluetooth_server().await;
            println!("Waiting for a peer...");
            chat(&controller, attempt).await
        }
        Commands::Connect { address } => {
            let peer = Peer::new(None, address);
            let attempt = controller.connect_to_device(&peer).await;
            println!("Connecting to {}...", peer);
            chat(&controller, attempt).await
        }
    };

    controller.release().await;
    info!("bluechat stopped");
    result
}

/// Print devices as discovery finds them until the cycle ends.
async fn scan(controller: &Controller) -> Result<()> {
    let mut rx = controller.subscribe();
    controller.start_device_discovery().await;

    let mut shown = 0;
    loop {
        let state = rx.borrow_and_update().clone();
        for peer in state.discovered_peers().iter().skip(shown) {
            println!("{}", peer);
        }
        shown = state.discovered_peers().len();

        if !state.is_discovering() {
            break;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                controller.stop_device_discovery().await;
                break;
            }
        }
    }

    Ok(())
}

/// Relay stdin lines to the peer and print what it sends.
async fn chat(controller: &Controller, mut attempt: ConnectionAttempt) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            outcome = attempt.next() => match outcome {
                Some(ConnectionOutcome::Established) => {
                    if let Some(peer) = controller.state().session_peer {
                        println!("Connected to {}", peer);
                    }
                }
                Some(ConnectionOutcome::MessageReceived(message)) => {
                    println!("{}: {}", message.sender_name, message.text);
                }
                Some(ConnectionOutcome::Failed) | None => {
                    println!("Session ended");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(text) if text.trim().is_empty() => {}
                Some(text) => {
                    if !controller.state().connected {
                        println!("Not connected");
                    } else {
                        controller.send_message(&text).await;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    attempt.cancel().await;
    Ok(())
}
