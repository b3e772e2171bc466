//! parley: terminal front end for the parley chat session core
//!
//! Usage:
//!   parley login alice --password ...
//!   parley search bob --open
//!   parley chat bob

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parley_core::{ChatClient, ClientConfig, Message, SendOutcome, SessionError, User};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "parley", version, about = "One-to-one chat from the terminal")]
struct Cli {
    /// Config file (default: <config_dir>/parley/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and connect
    Login {
        username: String,
        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// List all registered users
    Users,
    /// Look up a user by username
    Search {
        username: String,
        /// Add the user to your chats and select it
        #[arg(long)]
        open: bool,
    },
    /// Select one of your existing chats
    Select { username: String },
    /// Show your chats and the current selection
    Status,
    /// Print the conversation with a peer
    History { username: String },
    /// Interactive chat with the selected (or given) peer
    Chat { username: Option<String> },
    /// Forget credentials and chat state
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => ClientConfig::default_path().context("No config directory on this platform")?,
    };
    let config = ClientConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    debug!("State file: {:?}", config.state_path);

    let client = ChatClient::from_config(&config).context("Failed to build client")?;
    let result = run(&client, cli.command).await;
    client.shutdown().await;

    match result {
        Err(e) if e.downcast_ref::<SessionError>().is_some_and(|e| e.is_terminal()) => {
            bail!("{}. Run `parley login <username>` first.", e)
        }
        other => other,
    }
}

async fn run(client: &ChatClient, command: Command) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let me = client.login(&username, &password).await?;
            println!("Welcome, {}!", display_name(&me));
        }
        Command::Users => {
            for user in client.list_users().await? {
                println!("{:<20} {}", user.username, user.fullname);
            }
        }
        Command::Search { username, open } => {
            let user = client.search_user(&username).await?;
            println!("{:<20} {}", user.username, user.fullname);
            if open {
                client.open_chat(user).await?;
            }
        }
        Command::Select { username } => {
            let peer = client.select(&username).await?;
            println!("Chatting with {}", display_name(&peer));
        }
        Command::Status => {
            let state = client.snapshot().await;
            if state.identity.username.is_empty() {
                println!("Not logged in");
                return Ok(());
            }
            println!("Logged in as {}", display_name(&state.identity));
            let selected = state.selected_peer.as_ref().map(|p| p.username.as_str());
            for peer in &state.peers {
                let marker = if Some(peer.username.as_str()) == selected { "*" } else { " " };
                println!(
                    "{} {:<20} {} message(s)",
                    marker,
                    peer.fullname,
                    state.history(&peer.username).len()
                );
            }
        }
        Command::History { username } => {
            let me = client.snapshot().await.identity.username;
            for message in client.history(&username).await {
                print_message(&me, &message);
            }
        }
        Command::Chat { username } => chat(client, username).await?,
        Command::Logout => {
            client.logout().await?;
            println!("Logged out");
        }
    }
    Ok(())
}

async fn chat(client: &ChatClient, username: Option<String>) -> Result<()> {
    client.resume().await.context("Could not connect")?;

    if let Some(username) = username {
        if client.select(&username).await.is_err() {
            let user = client.search_user(&username).await?;
            client.open_chat(user).await?;
        }
    }

    let state = client.snapshot().await;
    let me = state.identity.username.clone();
    match &state.selected_peer {
        Some(peer) => {
            println!("Chat with {} (Ctrl-C to quit)", display_name(peer));
            for message in state.history(&peer.username) {
                print_message(&me, message);
            }
        }
        None => println!("No chat selected yet; waiting for messages (Ctrl-C to quit)"),
    }

    let cancel = CancellationToken::new();
    let mut inbound = client.messages();
    let printer = {
        let cancel = cancel.clone();
        let me = me.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = inbound.recv() => match received {
                        Ok(message) => print_message(&me, &message),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Skipped {} messages", n);
                        }
                        Err(_) => break,
                    },
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match client.send(&line).await {
                    Ok(SendOutcome::Sent(_)) | Ok(SendOutcome::Skipped) => {}
                    Err(SessionError::NotConnected) => eprintln!("(not connected, message dropped)"),
                    Err(e) => {
                        cancel.cancel();
                        return Err(e.into());
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = printer.await;
    Ok(())
}

fn display_name(user: &User) -> &str {
    if user.fullname.is_empty() {
        &user.username
    } else {
        &user.fullname
    }
}

fn print_message(me: &str, message: &Message) {
    let who = if message.from == me {
        "you"
    } else {
        message.from.as_str()
    };
    println!("[{}] {}", who, message.content);
}
