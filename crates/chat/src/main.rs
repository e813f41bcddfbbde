//! LanChat
//!
//! Peer-to-peer chat for the local network.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chat::config::{default_config_path, Config, LoggingConfig};
use chat::protocol::ChatKey;
use chat::session::{ActionSource, Decision, PeerSelector, SessionAction, SessionId};
use chat::{ChatNode, DirectoryError};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

const RULE: &str = "----------------------------------------";

/// LanChat - discover peers on the LAN and chat with them.
#[derive(Parser, Debug)]
#[command(name = "lanchat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Join the network and open the interactive menu
    Start {
        /// Name to announce (prompted for when not configured)
        #[arg(long, short)]
        username: Option<String>,

        /// TCP port for incoming chats (random high port when unset)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print a new shared key to distribute to your peers
    Keygen,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Keygen => {
            println!("{}", ChatKey::generate().to_base64());
            eprintln!("Share this key with your peers and set it as security.shared_key.");
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
        Commands::Start { username, port } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            if let Some(port) = port {
                config.network.listen_port = port;
            }

            let _guard = init_tracing(&config.logging, cli.verbose)?;
            tracing::info!("Using config file: {:?}", config_path);
            config.validate()?;

            let mut console = Console::new();
            let username = match username.filter(|u| !u.trim().is_empty()) {
                Some(name) => name.trim().to_string(),
                None => choose_username(&config, &mut console).await?,
            };

            let mut node = ChatNode::new(config, username)?;
            node.start().await?;
            run_interactive(&node, &mut console).await;
            node.stop().await?;
        }
    }

    Ok(())
}

/// Initialize tracing to stderr, or to `logging.file` when set.
///
/// The returned guard must live as long as logging is needed.
fn init_tracing(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        "debug".to_string()
    } else {
        logging.level.to_lowercase()
    };

    match logging.file.as_deref().filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter.as_str())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter.as_str())
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Username from config, else from the operator, else a random fallback.
async fn choose_username(config: &Config, console: &mut Console) -> anyhow::Result<String> {
    let configured = config.identity.username.trim();
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }

    let entered = console.prompt("Enter your username: ").await?;
    Ok(match entered.map(|s| s.trim().to_string()) {
        Some(name) if !name.is_empty() => name,
        _ => fallback_username(),
    })
}

fn fallback_username() -> String {
    format!("User{}", rand::thread_rng().gen_range(1000..=9999))
}

/// Line-oriented operator input.
struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Prints `text` and reads one line. `None` at end of input.
    async fn prompt(&mut self, text: &str) -> anyhow::Result<Option<String>> {
        print!("{}", text);
        std::io::stdout().flush()?;
        Ok(self.lines.next_line().await?)
    }
}

/// Main menu loop. Returns when the operator quits, input ends or Ctrl-C.
async fn run_interactive(node: &ChatNode, console: &mut Console) {
    println!(
        "[INFO] {} is online, accepting chats on port {}",
        node.username(),
        node.listen_port()
    );

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("\n{}", event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Dropped {} notifications", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = main_menu(node, console) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n[INFO] Interrupted by user.");
        }
    }
}

async fn main_menu(node: &ChatNode, console: &mut Console) {
    loop {
        println!("\n{}", RULE);
        println!("[MAIN MENU]");
        println!("1. List online users");
        println!("2. Request connection");
        println!("3. Handle connection requests");
        println!("4. Open active chat");
        println!("5. Show statistics");
        println!("6. Quit");
        println!("{}", RULE);

        let choice = match console.prompt("Choose an option: ").await {
            Ok(Some(choice)) => choice,
            Ok(None) => break,
            Err(e) => {
                println!("[ERROR] {}", e);
                break;
            }
        };

        let result = match choice.trim() {
            "1" => {
                list_users(node);
                Ok(())
            }
            "2" => request_connection(node, console).await,
            "3" => handle_requests(node, console).await,
            "4" => open_chat(node, console).await,
            "5" => {
                show_stats(node);
                Ok(())
            }
            "6" => {
                println!("\n[INFO] Leaving LanChat. Goodbye!");
                break;
            }
            _ => {
                println!("[ERROR] Invalid option.");
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("[ERROR] {:#}", e);
        }
    }
}

fn list_users(node: &ChatNode) {
    println!("\n[ONLINE USERS]");
    let peers = node.directory().list_peers();
    if peers.is_empty() {
        println!("[INFO] No users online.");
    }
    for (idx, peer) in peers.iter().enumerate() {
        println!("{}. {}", idx + 1, peer);
    }
    println!("{}", RULE);
}

async fn request_connection(node: &ChatNode, console: &mut Console) -> anyhow::Result<()> {
    list_users(node);
    let Some(input) = console
        .prompt("Select a user number or name to connect to: ")
        .await?
    else {
        return Ok(());
    };

    let peer = node
        .sessions()
        .request_connection(&PeerSelector::parse(&input))
        .await?;
    println!(
        "[INFO] Connection request sent to {}. Waiting for their response.",
        peer.name
    );
    Ok(())
}

async fn handle_requests(node: &ChatNode, console: &mut Console) -> anyhow::Result<()> {
    let sessions = node.sessions();
    let requests = sessions.pending_requests();
    if requests.is_empty() {
        println!("\n[INFO] You have no pending requests.");
        return Ok(());
    }
    for (idx, request) in requests.iter().enumerate() {
        println!("{}. {}", idx + 1, request);
    }

    let Some(input) = console
        .prompt("Select a request to handle or 0 to go back: ")
        .await?
    else {
        return Ok(());
    };
    let index = parse_index(&input)?;
    if index == 0 {
        return Ok(());
    }

    let name = requests
        .get(index - 1)
        .map(|r| r.requester_name.clone())
        .ok_or(DirectoryError::InvalidSelection {
            index,
            len: requests.len(),
        })?;

    let answer = console
        .prompt(&format!("Accept connection from {}? (y/n): ", name))
        .await?
        .unwrap_or_default();
    let decision = parse_decision(&answer);

    match sessions.resolve_request(index, decision).await? {
        Some(id) => {
            println!("[INFO] Connection accepted with {}.", name);
            chat_loop(node, console, id).await?;
        }
        None => println!("[INFO] Connection rejected with {}.", name),
    }
    Ok(())
}

async fn open_chat(node: &ChatNode, console: &mut Console) -> anyhow::Result<()> {
    let active = node.sessions().sessions();
    if active.is_empty() {
        println!("\n[INFO] No active chats.");
        return Ok(());
    }
    for (idx, info) in active.iter().enumerate() {
        println!("{}. {}", idx + 1, info);
    }

    let Some(input) = console.prompt("Select a chat or 0 to go back: ").await? else {
        return Ok(());
    };
    let index = parse_index(&input)?;
    if index == 0 {
        return Ok(());
    }
    let info = active
        .get(index - 1)
        .with_context(|| format!("Invalid selection {}", index))?;
    chat_loop(node, console, info.id).await
}

async fn chat_loop(node: &ChatNode, console: &mut Console, id: SessionId) -> anyhow::Result<()> {
    let sessions = node.sessions();
    let peer = sessions.get(id)?.peer_name().to_string();

    let mut prompt = ChatPrompt {
        console,
        peer: peer.clone(),
    };
    sessions.run_session(id, &mut prompt).await?;
    println!("\n[INFO] Chat with {} ended.", peer);
    Ok(())
}

fn show_stats(node: &ChatNode) {
    let stats = node.directory().stats();
    println!("\n[STATISTICS]");
    println!("Messages sent:     {}", stats.sent);
    println!("Messages received: {}", stats.received);
    println!("Users online:      {}", node.directory().peer_count());
    println!("Pending requests:  {}", node.directory().request_count());
    println!("Active chats:      {}", node.sessions().session_count());
    println!("{}", RULE);
}

/// Chat submenu feeding the session's send loop.
struct ChatPrompt<'a> {
    console: &'a mut Console,
    peer: String,
}

impl ActionSource for ChatPrompt<'_> {
    async fn next_action(&mut self) -> Option<SessionAction> {
        loop {
            println!("\n1. Send message");
            println!("2. Send alarm message");
            println!("3. Send emergency message");
            println!("4. Leave chat");

            let choice = self.console.prompt("Choose an option: ").await.ok()??;
            match parse_chat_choice(&choice) {
                Some(ChatChoice::Message) => {
                    let text = self
                        .console
                        .prompt(&format!("[{}]> Type your message: ", self.peer))
                        .await
                        .ok()??;
                    return Some(SessionAction::Send(text));
                }
                Some(ChatChoice::Action(action)) => return Some(action),
                None => println!("[ERROR] Invalid option."),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ChatChoice {
    Message,
    Action(SessionAction),
}

fn parse_chat_choice(input: &str) -> Option<ChatChoice> {
    match input.trim() {
        "1" => Some(ChatChoice::Message),
        "2" => Some(ChatChoice::Action(SessionAction::Alarm)),
        "3" => Some(ChatChoice::Action(SessionAction::Emergency)),
        "4" => Some(ChatChoice::Action(SessionAction::End)),
        _ => None,
    }
}

fn parse_index(input: &str) -> anyhow::Result<usize> {
    input
        .trim()
        .parse()
        .with_context(|| format!("Invalid selection: {:?}", input.trim()))
}

fn parse_decision(input: &str) -> Decision {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" | "s" | "si" => Decision::Accept,
        _ => Decision::Reject,
    }
}
