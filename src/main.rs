use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use partsync::client::{ClientOptions, SyncClient};
use partsync::config::DEFAULT_PORT;
use partsync::protocol::{Envelope, LockRequest, LockType, UnlockRequest};
use partsync::relay::server::{self, RelayOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "partsync", version, about = "Diff-based sync for shared project trees")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT, env = "PARTSYNC_PORT")]
        port: u16,
        /// Path of the relay store
        #[arg(long, default_value = "partsync.db", env = "PARTSYNC_DB")]
        db: PathBuf,
    },
    /// Watch a project directory and sync it through a relay
    Start {
        #[arg(long, default_value = "ws://localhost:3777", env = "PARTSYNC_SERVER")]
        server: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Display name attached to diffs and locks
        #[arg(long, env = "PARTSYNC_NAME")]
        name: Option<String>,
        /// Extra ignore patterns on top of the defaults
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },
    /// Query a relay's health endpoint
    Status {
        #[arg(long, default_value = "http://localhost:3777", env = "PARTSYNC_HTTP")]
        server: String,
    },
    /// Acquire a soft lock on a file
    Lock {
        file: String,
        #[arg(long, default_value = "ws://localhost:3777", env = "PARTSYNC_SERVER")]
        server: String,
        #[arg(long, env = "PARTSYNC_NAME")]
        name: Option<String>,
    },
    /// Release a soft lock on a file
    Unlock {
        file: String,
        #[arg(long, default_value = "ws://localhost:3777", env = "PARTSYNC_SERVER")]
        server: String,
        #[arg(long, env = "PARTSYNC_NAME")]
        name: Option<String>,
    },
}

fn default_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,partsync=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Serve { port, db } => server::run(RelayOptions { port, db_path: db }).await,
        Command::Start {
            server,
            dir,
            name,
            ignore,
        } => {
            let dir = dir.canonicalize().context("resolving project directory")?;
            SyncClient::run(ClientOptions {
                server_url: server,
                dir,
                name: name.unwrap_or_else(default_name),
                ignore,
            })
            .await
        }
        Command::Status { server } => status(&server).await,
        Command::Lock { file, server, name } => {
            lock_command(&server, &name.unwrap_or_else(default_name), &file, true).await
        }
        Command::Unlock { file, server, name } => {
            lock_command(&server, &name.unwrap_or_else(default_name), &file, false).await
        }
    }
}

async fn status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("requesting {url}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// One-shot lock or unlock: connect, send, wait for the lock broadcast,
/// print the table.
async fn lock_command(server: &str, name: &str, file: &str, acquire: bool) -> anyhow::Result<()> {
    let url = format!(
        "{}/ws?clientName={}",
        server.trim_end_matches('/'),
        name.replace(' ', "%20")
    );
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {server}"))?;
    let (mut write, mut read) = stream.split();

    let request = if acquire {
        Envelope::FileLock(LockRequest {
            file: file.to_string(),
            lock_type: LockType::Editing,
        })
    } else {
        Envelope::FileUnlock(UnlockRequest {
            file: file.to_string(),
        })
    };
    write.send(Message::Text(request.encode()?.into())).await?;

    let wait = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = read.next().await {
            if let Message::Text(text) = message {
                if let Ok(Envelope::FileLockChanged(locks)) = Envelope::decode(text.as_str()) {
                    return Some(locks);
                }
            }
        }
        None
    })
    .await;

    match wait {
        Ok(Some(locks)) => {
            match locks.iter().find(|l| l.file == file) {
                Some(lock) if acquire && lock.locked_by == name => {
                    println!("locked {} as {}", file, name)
                }
                Some(lock) => println!("{} is locked by {}", file, lock.locked_by),
                None if acquire => println!("lock on {} not granted", file),
                None => println!("unlocked {}", file),
            }
            if !locks.is_empty() {
                println!("-- current locks --");
                for lock in locks {
                    println!("{}\t{}\t{:?}", lock.file, lock.locked_by, lock.lock_type);
                }
            }
            Ok(())
        }
        Ok(None) => anyhow::bail!("relay closed the connection"),
        Err(_) => anyhow::bail!("timed out waiting for lock broadcast"),
    }
}
