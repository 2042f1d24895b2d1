//! Courier CLI
//!
//! Thin wrapper around courier-core for managing device keys, sealing and
//! opening envelopes by hand, and replaying recorded real-time event streams.
//!
//! ## Usage
//!
//! ```bash
//! # Generate the device key pair (no-op if one exists)
//! courier keys generate
//!
//! # Show the current public key and rotation history
//! courier keys show
//!
//! # Rotate to a fresh key pair; old messages stay readable
//! courier keys rotate
//!
//! # Wipe every key of this device
//! courier keys clear --force
//!
//! # Seal a message for a recipient (envelope JSON on stdout)
//! courier encrypt --to <base64 public key> "hello"
//!
//! # Open an envelope from a sender (envelope JSON on stdin)
//! courier decrypt --from <base64 public key> < envelope.json
//!
//! # Replay a JSON-lines event log and print the conversation list
//! courier replay events.jsonl --self alice --peer bob=<base64 public key>
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_core::{
    decode_public_key, encode_public_key, logging, CipherEngine, CourierConfig, EncryptedEnvelope,
    KeyStore, OfflineRest, RedbSecretStore, RotationOutcome, Session, StaticDirectory, UserId,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Courier - end-to-end encrypted messaging core
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - end-to-end encrypted messaging core")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.courier/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file (default: <data dir>/config.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Device key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Seal a message for a recipient and print the envelope as JSON
    Encrypt {
        /// Recipient public key (base64)
        #[arg(long)]
        to: String,
        /// Message text (read from stdin if omitted)
        message: Option<String>,
    },

    /// Open an envelope and print the plaintext
    Decrypt {
        /// Expected sender public key (base64)
        #[arg(long)]
        from: String,
        /// Envelope JSON file (read from stdin if omitted)
        envelope: Option<PathBuf>,
    },

    /// Replay a JSON-lines log of real-time events and print the result
    Replay {
        /// File with one `{"event": ..., "data": ...}` object per line
        events: PathBuf,
        /// Account the events were received by
        #[arg(long = "self")]
        self_id: String,
        /// Known sender keys as `user=<base64 public key>` (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Mark these conversations read after replaying (repeatable)
        #[arg(long = "read")]
        mark_read: Vec<String>,
        /// Print the conversation list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum KeysAction {
    /// Generate the device key pair if none exists
    Generate,
    /// Show the current public key and history
    Show,
    /// Rotate to a fresh key pair
    Rotate,
    /// Irreversibly wipe all device keys
    Clear {
        /// Confirm wiping (required)
        #[arg(long)]
        force: bool,
    },
}

/// One line of a replay log.
#[derive(Deserialize)]
struct ReplayLine {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Get the default data directory (~/.courier/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
        .join("data")
}

fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<CourierConfig> {
    match explicit {
        Some(path) => CourierConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let implicit = data_dir.join("config.json");
            if implicit.exists() {
                debug!(path = %implicit.display(), "Using config from data directory");
                Ok(CourierConfig::from_json_file(&implicit)?)
            } else {
                Ok(CourierConfig::default())
            }
        }
    }
}

fn open_key_store(data_dir: &Path, config: &CourierConfig) -> Result<Arc<KeyStore>> {
    let path = data_dir.join(&config.key_db_file);
    let backend = RedbSecretStore::open(&path)
        .with_context(|| format!("Failed to open key database {}", path.display()))?;
    let keys = KeyStore::open(Arc::new(backend), config.key_history_limit)?;
    Ok(Arc::new(keys))
}

fn parse_peer(peer: &str) -> Result<(UserId, [u8; 32])> {
    let (user, key) = peer
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid peer '{}': expected user=<base64 key>", peer))?;
    let key = decode_public_key(key).with_context(|| format!("Invalid key for peer '{}'", user))?;
    Ok((UserId::new(user), key))
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input)
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let config = load_config(cli.config.as_deref(), &data_dir)?;

    match cli.command {
        Commands::Keys { action } => {
            let keys = open_key_store(&data_dir, &config)?;
            match action {
                KeysAction::Generate => match keys.current() {
                    Some(current) => {
                        println!("Key pair already exists.");
                        println!("  Public key: {}", encode_public_key(current.public_key()));
                    }
                    None => {
                        let pair = KeyStore::generate_key_pair()?;
                        let public_key = *pair.public_key();
                        keys.rotate(pair)?;
                        println!("Generated key pair.");
                        println!("  Public key: {}", encode_public_key(&public_key));
                    }
                },

                KeysAction::Show => match keys.current() {
                    Some(current) => {
                        println!("Device key:");
                        println!("  Public key: {}", encode_public_key(current.public_key()));
                        println!("  Fingerprint: {}", current.fingerprint());
                        println!("  Created: {}", format_millis(current.created_at()));
                        let history = keys.history();
                        println!("  History: {} superseded key(s)", history.len());
                        for pair in history {
                            println!(
                                "    {} (created {})",
                                pair.fingerprint(),
                                format_millis(pair.created_at())
                            );
                        }
                    }
                    None => {
                        println!("No key pair. Run `courier keys generate`.");
                    }
                },

                KeysAction::Rotate => {
                    let pair = KeyStore::generate_key_pair()?;
                    let public_key = *pair.public_key();
                    match keys.rotate(pair)? {
                        RotationOutcome::Installed { archived } => {
                            info!(archived, "Rotated device key");
                            println!("Rotated key pair.");
                            println!("  Public key: {}", encode_public_key(&public_key));
                            println!("  History: {} superseded key(s)", keys.history().len());
                        }
                        RotationOutcome::Unchanged => {
                            println!("Key pair unchanged.");
                        }
                    }
                }

                KeysAction::Clear { force } => {
                    if !force {
                        println!("WARNING: Clearing keys is IRREVERSIBLE!");
                        println!();
                        println!("Every message sealed to this device becomes unreadable.");
                        println!();
                        println!("To confirm, run: courier keys clear --force");
                        return Ok(());
                    }
                    keys.clear()?;
                    println!("Keys cleared.");
                }
            }
        }

        Commands::Encrypt { to, message } => {
            let recipient = decode_public_key(&to).context("Invalid recipient key")?;
            let plaintext = match message {
                Some(message) => message,
                None => read_stdin()?,
            };
            let cipher = CipherEngine::new(open_key_store(&data_dir, &config)?);
            let envelope = cipher.encrypt(plaintext.as_bytes(), &recipient)?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }

        Commands::Decrypt { from, envelope } => {
            let sender = decode_public_key(&from).context("Invalid sender key")?;
            let raw = match envelope {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => read_stdin()?,
            };
            let envelope: EncryptedEnvelope =
                serde_json::from_str(&raw).context("Invalid envelope JSON")?;
            let cipher = CipherEngine::new(open_key_store(&data_dir, &config)?);
            println!("{}", cipher.open_text(&envelope, &sender)?);
        }

        Commands::Replay {
            events,
            self_id,
            peers,
            mark_read,
            json,
        } => {
            let directory = StaticDirectory::new();
            for peer in &peers {
                let (user, key) = parse_peer(peer)?;
                directory.publish(user, key);
            }

            let session = Session::new(
                UserId::new(self_id),
                open_key_store(&data_dir, &config)?,
                Arc::new(OfflineRest),
                Arc::new(directory),
                config,
            )?;

            let log = std::fs::read_to_string(&events)
                .with_context(|| format!("Failed to read {}", events.display()))?;
            let mut applied = 0usize;
            for (number, line) in log.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let entry: ReplayLine = serde_json::from_str(line)
                    .with_context(|| format!("Line {}: invalid JSON", number + 1))?;
                match session.router().dispatch_named(&entry.event, entry.data).await {
                    Ok(outcome) => {
                        debug!(line = number + 1, event = %entry.event, ?outcome, "Replayed");
                        applied += 1;
                    }
                    Err(e) => warn!(line = number + 1, event = %entry.event, error = %e, "Event rejected"),
                }
            }
            info!(applied, "Replay finished");

            for conversation in &mark_read {
                session.mark_conversation_read(&conversation.as_str().into());
            }

            let conversations = session.conversations();
            if json {
                println!("{}", serde_json::to_string_pretty(&conversations)?);
            } else if conversations.is_empty() {
                println!("No conversations.");
            } else {
                for conversation in conversations {
                    let marker = if conversation.is_typing { " (typing)" } else { "" };
                    println!(
                        "{} [{}] unread: {}{}",
                        conversation.name,
                        conversation.id,
                        conversation.unread_count,
                        marker
                    );
                    if let Some(preview) = conversation.preview {
                        println!("  {}", preview);
                    }
                }
            }
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("Data directory: {}", data_dir.display());
        }
    }

    Ok(())
}
