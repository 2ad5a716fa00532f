// Console front end for the headless runner.
//
// Stdin lines become chat commands and chat updates are rendered as plain
// text lines. Everything here is generic over the reader and writer so it
// can be tested without a terminal.

use anyhow::{bail, Context};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use mealmate_chat::{ChatCommand, ChatUpdate, ConnectionStatus};
use mealmate_core::protocol::{ChatMessage, MessageKind};
use mealmate_core::settlement::{NavigationMode, Navigator};

pub const USAGE: &str = "usage: mealmate <chat|watch|settle> <meeting-id> [--wait]";

/// What the runner was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Open the meeting's chat in the console.
    Chat(u64),
    /// Follow the meeting's live state until it ends.
    Watch(u64),
    /// Ask the server where the settlement flow stands.
    Settle(u64),
    /// As `Settle`, then stay on a wait screen until the flow moves on.
    SettleWait(u64),
}

impl Mode {
    pub fn meeting_id(self) -> u64 {
        match self {
            Mode::Chat(id) | Mode::Watch(id) | Mode::Settle(id) | Mode::SettleWait(id) => id,
        }
    }

    /// Route the guard must allow before the mode starts.
    pub fn route(self) -> String {
        match self {
            Mode::Chat(id) => format!("/meetings/{id}/chat"),
            Mode::Watch(id) | Mode::Settle(id) | Mode::SettleWait(id) => {
                format!("/meetings/{id}")
            }
        }
    }
}

/// Parse the arguments after the program name.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> anyhow::Result<Mode> {
    let (mode, id, wait) = match args {
        [mode, id] => (mode.as_ref(), id.as_ref(), false),
        [mode, id, flag] if flag.as_ref() == "--wait" => (mode.as_ref(), id.as_ref(), true),
        _ => bail!("{USAGE}"),
    };
    let id: u64 = id
        .parse()
        .with_context(|| format!("invalid meeting id `{id}`"))?;
    match (mode, wait) {
        ("chat", false) => Ok(Mode::Chat(id)),
        ("watch", false) => Ok(Mode::Watch(id)),
        ("settle", false) => Ok(Mode::Settle(id)),
        ("settle", true) => Ok(Mode::SettleWait(id)),
        (_, true) => bail!("--wait only applies to settle\n{USAGE}"),
        (other, false) => bail!("unknown mode `{other}`\n{USAGE}"),
    }
}

/// Map one console line to a chat command. Blank lines map to nothing.
pub fn parse_line(line: &str) -> Option<ChatCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "/older" => Some(ChatCommand::LoadOlder),
        "/retry" => Some(ChatCommand::Retry),
        "/quit" => Some(ChatCommand::Close),
        text => match text.strip_prefix("/image ") {
            Some(url) => Some(ChatCommand::image(url.trim())),
            None => Some(ChatCommand::text(text)),
        },
    }
}

pub fn format_message(message: &ChatMessage) -> String {
    let time = message.created_at.format("%H:%M");
    let unread = match message.unread_count {
        Some(n) if n > 0 => format!(" ({n})"),
        _ => String::new(),
    };
    match (message.kind, &message.sender) {
        (MessageKind::System, _) => format!("[{time}] * {}", message.body),
        (MessageKind::Image, Some(sender)) => {
            format!("[{time}] {}: <image> {}{unread}", sender.name, message.body)
        }
        (MessageKind::Image, None) => format!("[{time}] <image> {}{unread}", message.body),
        (MessageKind::Text, Some(sender)) => {
            format!("[{time}] {}: {}{unread}", sender.name, message.body)
        }
        (MessageKind::Text, None) => format!("[{time}] {}{unread}", message.body),
    }
}

/// Console lines for an update; scroll and composer bookkeeping print nothing.
pub fn render(update: &ChatUpdate) -> Vec<String> {
    match update {
        ChatUpdate::Status(status) => {
            let label = match status {
                ConnectionStatus::Connecting => "connecting",
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Disconnected => "disconnected, retrying",
                ConnectionStatus::Error => "connection error",
            };
            vec![format!("-- {label}")]
        }
        ChatUpdate::HistoryLoaded { messages, has_more } => {
            let mut lines = Vec::with_capacity(messages.len() + 1);
            if *has_more {
                lines.push("-- earlier messages available (/older)".to_string());
            }
            lines.extend(messages.iter().map(format_message));
            lines
        }
        ChatUpdate::OlderLoaded { messages, has_more } => {
            let mut lines = vec![format!("-- {} earlier messages", messages.len())];
            lines.extend(messages.iter().map(format_message));
            if !has_more {
                lines.push("-- start of conversation".to_string());
            }
            lines
        }
        ChatUpdate::LoadingOlder(true) => vec!["-- loading earlier messages".to_string()],
        ChatUpdate::MessageAdded(message) => vec![format_message(message)],
        ChatUpdate::Notice(text) => vec![format!("!! {text}")],
        ChatUpdate::FetchFailed(reason) => {
            vec![format!("!! could not load messages: {reason} (/retry)")]
        }
        ChatUpdate::LoadingOlder(false)
        | ChatUpdate::UnreadUpdated(_)
        | ChatUpdate::ScrollToBottom
        | ChatUpdate::ScrollTo(_)
        | ChatUpdate::ComposerCleared
        | ChatUpdate::NoticeCleared => Vec::new(),
    }
}

/// Pump console input into `cmd_tx` and render `ui_rx` until the chat
/// session ends. End of input closes the chat.
pub async fn run_console<R, W>(
    input: R,
    mut output: W,
    mut ui_rx: mpsc::Receiver<ChatUpdate>,
    cmd_tx: mpsc::Sender<ChatCommand>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let command = match line.context("failed to read console input")? {
                    Some(line) => parse_line(&line),
                    None => {
                        debug!("Console input closed");
                        input_open = false;
                        Some(ChatCommand::Close)
                    }
                };
                if let Some(command) = command {
                    if command == ChatCommand::Close {
                        input_open = false;
                    }
                    if cmd_tx.send(command).await.is_err() {
                        break;
                    }
                }
            }
            update = ui_rx.recv() => {
                let Some(update) = update else {
                    info!("Chat session ended");
                    break;
                };
                for line in render(&update) {
                    output.write_all(line.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
                output.flush().await?;
            }
        }
    }

    Ok(())
}

/// Navigator that records where the settlement flow sends the user.
#[derive(Debug, Default)]
pub struct ConsoleNavigator {
    pub visits: Vec<(String, NavigationMode)>,
}

impl ConsoleNavigator {
    /// Path of the latest navigation.
    pub fn current(&self) -> Option<&str> {
        self.visits.last().map(|(path, _)| path.as_str())
    }
}

impl Navigator for ConsoleNavigator {
    fn navigate(&mut self, path: &str, mode: NavigationMode) {
        info!(path, ?mode, "Navigate");
        self.visits.push((path.to_string(), mode));
    }
}
