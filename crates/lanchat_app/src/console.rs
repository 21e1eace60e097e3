//! Line-oriented rendering and command parsing for the terminal front end.

use chrono::{DateTime, Local, TimeZone};
use lanchat_network::{ChatMessage, DeliveryEvent, PeerEvent, PeerInfo, PeerState};

pub const HELP: &str = "Commands: /peers lists known peers, /help shows this text, /quit leaves the chat.";

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Plain text to send.
    Say(&'a str),
    Peers,
    Help,
    Quit,
    /// A slash command we do not know.
    Unknown(&'a str),
    /// Blank input.
    Empty,
}

pub fn parse(line: &str) -> Command<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Empty;
    }
    // A leading double slash sends the rest literally.
    if let Some(literal) = trimmed.strip_prefix("//") {
        return Command::Say(literal);
    }
    match trimmed.strip_prefix('/') {
        Some("peers") => Command::Peers,
        Some("help") => Command::Help,
        Some("quit") | Some("exit") => Command::Quit,
        Some(other) => Command::Unknown(other),
        None => Command::Say(line.trim_end_matches(['\r', '\n'])),
    }
}

/// `nickname (HH:MM:SS): content` in local time.
pub fn render_message(message: &ChatMessage) -> String {
    render_message_in(message, &Local)
}

pub fn render_message_in<Tz: TimeZone>(message: &ChatMessage, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let time = DateTime::from_timestamp(message.timestamp, 0)
        .map(|at| at.with_timezone(tz).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    format!("{} ({time}): {}", message.nickname, message.content)
}

/// Appends print as-is; insertions are flagged so the reader knows the line
/// belongs further up.
pub fn render_event(event: &DeliveryEvent) -> String {
    match event {
        DeliveryEvent::Appended { message, .. } => render_message(message),
        DeliveryEvent::Inserted { index, message } => {
            format!("[late, #{}] {}", index + 1, render_message(message))
        }
    }
}

pub fn render_peer_event(event: &PeerEvent) -> String {
    match event {
        PeerEvent::Joined { addr } => format!("* peer {addr} joined"),
        PeerEvent::Recovered { addr } => format!("* peer {addr} is back"),
        PeerEvent::Identified { addr, nickname } => format!("* {nickname} is at {addr}"),
        PeerEvent::Stale { addr } => format!("* peer {addr} went quiet"),
        PeerEvent::Gone { addr } => format!("* peer {addr} left"),
    }
}

pub fn render_peers(peers: &[PeerInfo]) -> String {
    if peers.is_empty() {
        return "No peers yet.".to_string();
    }
    let mut out = format!("{} peer(s):", peers.len());
    for peer in peers {
        let state = match peer.state {
            PeerState::Alive => "alive",
            PeerState::Stale => "stale",
            PeerState::Gone => "gone",
        };
        let name = peer.nickname.as_deref().unwrap_or("?");
        out.push_str(&format!("\n  {name} @ {} [{state}]", peer.addr));
    }
    out
}
