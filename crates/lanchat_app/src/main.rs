mod console;

use std::future::Future;
use std::io::Write;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lanchat_core::LanChatConfig;
use lanchat_core::logging;
use lanchat_network::{ChatNode, NodeIdentity};

use console::Command;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    LanChatConfig::ensure_dirs().context("Failed to create config directories")?;
    let mut config = LanChatConfig::load().context("Failed to load config")?;

    let _log_guard = logging::init_logging(&config.log_level).context("Failed to initialize logging")?;
    info!("Starting LanChat v{VERSION}");
    config.validate()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // First run: ask for a nickname and remember it.
    let nickname = match config.nickname().map(str::to_string) {
        Some(nickname) => nickname,
        None => {
            let Some(nickname) = prompt_nickname(&mut lines, tokio::signal::ctrl_c()).await? else {
                info!("Interrupted before a nickname was chosen");
                return Ok(());
            };
            config.set_nickname(&nickname)?;
            config.save().context("Failed to save nickname")?;
            nickname
        }
    };

    let identity = NodeIdentity::generate(&nickname);
    let mut node = ChatNode::start(identity, config.network.clone())
        .await
        .context("Failed to start chat node")?;

    println!(
        "LanChat v{VERSION}: chatting as {nickname} on {}. {}",
        node.local_addr(),
        console::HELP
    );

    let printer = spawn_printer(&node);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match console::parse(&line) {
                    Command::Say(text) => {
                        if let Err(e) = node.submit(text, &nickname) {
                            println!("! {e}");
                        }
                    }
                    Command::Peers => println!("{}", console::render_peers(&node.peers())),
                    Command::Help => println!("{}", console::HELP),
                    Command::Quit => break,
                    Command::Unknown(cmd) => println!("! Unknown command /{cmd}. {}", console::HELP),
                    Command::Empty => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    node.stop().await;
    printer.abort();
    info!("LanChat stopped");
    Ok(())
}

/// Ask until a non-blank nickname is entered. `None` if `interrupt`
/// completes first.
async fn prompt_nickname<R, I>(lines: &mut Lines<R>, interrupt: I) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    tokio::pin!(interrupt);
    loop {
        print!("Nickname: ");
        std::io::stdout().flush()?;
        let line = tokio::select! {
            biased;
            _ = &mut interrupt => return Ok(None),
            line = lines.next_line() => line?,
        };
        match line {
            Some(line) if !line.trim().is_empty() => return Ok(Some(line.trim().to_string())),
            Some(_) => println!("A nickname is required."),
            None => bail!("No nickname given"),
        }
    }
}

/// Print delivery and peer events as they arrive.
fn spawn_printer(node: &ChatNode) -> JoinHandle<()> {
    let mut events = node.subscribe();
    let mut peer_events = node.subscribe_peers();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => println!("{}", console::render_event(&event)),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Display fell behind by {missed} messages");
                        println!("! {missed} messages were not shown");
                    }
                    Err(RecvError::Closed) => break,
                },
                event = peer_events.recv() => match event {
                    Ok(event) => println!("{}", console::render_peer_event(&event)),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
