// Chat session: the state machine behind one meeting's chat screen.
//
// `run` multiplexes transport events, user commands, results of spawned
// REST calls and two timers (read-cursor debounce, notice expiry) in a
// single select loop. All state lives in `ChatSession`; spawned tasks only
// report back through the task channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mealmate_core::api::{ApiError, ChatApi};
use mealmate_core::config::ChatConfig;
use mealmate_core::poll::sleep_until_opt;
use mealmate_core::protocol::{
    ChatMessage, MessageKind, MessagePage, OutgoingMessage, UnreadCount,
};

use crate::cursor::ReadCursor;
use crate::event::{decode_event, publish_destination, ChatEvent};
use crate::log::{MessageLog, ScrollAnchor, Viewport};
use crate::send_guard::SendGuard;
use crate::transport::{TransportCommand, TransportEvent};

pub const NOT_CONNECTED_NOTICE: &str = "Not connected. Your message was not sent.";
pub const DUPLICATE_NOTICE: &str = "That message was just sent.";
pub const SYSTEM_KIND_NOTICE: &str = "System messages cannot be sent.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub page_size: u32,
    pub read_debounce: Duration,
    pub read_retry: Duration,
    pub duplicate_window: Duration,
    pub notice_duration: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        ChatSettings {
            page_size: config.page_size,
            read_debounce: Duration::from_millis(config.read_debounce_ms),
            read_retry: Duration::from_millis(config.read_retry_ms),
            duplicate_window: Duration::from_millis(config.duplicate_window_ms),
            notice_duration: Duration::from_millis(config.notice_ms),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        ChatSettings::from_config(&ChatConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Input from the chat screen.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Publish `text` as a `kind` message. Image messages carry the uploaded
    /// image's URL as their text.
    Send { kind: MessageKind, text: String },
    LoadOlder,
    /// Re-run the initial history load after a failure.
    Retry,
    ViewportChanged(Viewport),
    /// The message list was laid out again with a new total height.
    ContentResized { scroll_height: f64 },
    Close,
}

impl ChatCommand {
    pub fn text(text: impl Into<String>) -> Self {
        ChatCommand::Send {
            kind: MessageKind::Text,
            text: text.into(),
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ChatCommand::Send {
            kind: MessageKind::Image,
            text: url.into(),
        }
    }
}

/// Output to the chat screen.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Status(ConnectionStatus),
    /// Full log after the initial load, ascending.
    HistoryLoaded { messages: Vec<ChatMessage>, has_more: bool },
    /// Messages merged in from an older page, ascending.
    OlderLoaded { messages: Vec<ChatMessage>, has_more: bool },
    LoadingOlder(bool),
    MessageAdded(ChatMessage),
    UnreadUpdated(Vec<UnreadCount>),
    ScrollToBottom,
    ScrollTo(f64),
    ComposerCleared,
    Notice(String),
    NoticeCleared,
    FetchFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePurpose {
    Initial,
    Older,
    /// Newest page fetched after a reconnect to fill the gap.
    CatchUp,
}

/// Completion of a spawned REST call.
#[derive(Debug)]
pub enum TaskResult {
    Page {
        purpose: PagePurpose,
        result: Result<MessagePage, ApiError>,
    },
    ReadCursor {
        value: u64,
        result: Result<(), ApiError>,
    },
}

pub struct ChatSession<A> {
    meeting_id: u64,
    api: Arc<A>,
    settings: ChatSettings,
    transport_tx: mpsc::Sender<TransportCommand>,
    ui_tx: mpsc::Sender<ChatUpdate>,
    task_tx: mpsc::Sender<TaskResult>,
    tasks: Vec<JoinHandle<()>>,
    active: bool,

    status: ConnectionStatus,
    /// The STOMP session is up. A server-pushed error moves `status` to
    /// `Error` without taking the link down.
    link_up: bool,
    has_connected: bool,

    log: MessageLog,
    next_cursor: Option<u64>,
    has_more: bool,
    loading_initial: bool,
    loading_older: bool,

    viewport: Viewport,
    pending_anchor: Option<ScrollAnchor>,

    cursor: ReadCursor,
    cursor_deadline: Option<Instant>,

    send_guard: SendGuard,
    /// clientMessageId -> text, until the server acknowledges.
    pending_sends: HashMap<String, String>,

    notice: Option<String>,
    notice_deadline: Option<Instant>,
}

impl<A> ChatSession<A>
where
    A: ChatApi + 'static,
{
    /// Build a session; the returned receiver must be handed to [`run`].
    pub fn new(
        meeting_id: u64,
        api: Arc<A>,
        settings: ChatSettings,
        transport_tx: mpsc::Sender<TransportCommand>,
        ui_tx: mpsc::Sender<ChatUpdate>,
    ) -> (Self, mpsc::Receiver<TaskResult>) {
        let (task_tx, task_rx) = mpsc::channel(16);
        let send_guard = SendGuard::new(settings.duplicate_window);
        let session = ChatSession {
            meeting_id,
            api,
            settings,
            transport_tx,
            ui_tx,
            task_tx,
            tasks: Vec::new(),
            active: true,
            status: ConnectionStatus::Connecting,
            link_up: false,
            has_connected: false,
            log: MessageLog::new(),
            next_cursor: None,
            has_more: false,
            loading_initial: false,
            loading_older: false,
            viewport: Viewport::default(),
            pending_anchor: None,
            cursor: ReadCursor::new(),
            cursor_deadline: None,
            send_guard,
            pending_sends: HashMap::new(),
            notice: None,
            notice_deadline: None,
        };
        (session, task_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn cursor(&self) -> &ReadCursor {
        &self.cursor
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn pending_send_count(&self) -> usize {
        self.pending_sends.len()
    }

    async fn emit(&self, update: ChatUpdate) {
        let _ = self.ui_tx.send(update).await;
    }

    /// Announce the initial status and request the newest page.
    pub async fn start(&mut self) {
        self.emit(ChatUpdate::Status(self.status)).await;
        self.load_initial();
    }

    async fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(meeting_id = self.meeting_id, ?status, "Chat connection status");
            self.status = status;
            self.emit(ChatUpdate::Status(status)).await;
        }
    }

    async fn show_notice(&mut self, text: &str) {
        self.notice = Some(text.to_string());
        self.notice_deadline = Some(Instant::now() + self.settings.notice_duration);
        self.emit(ChatUpdate::Notice(text.to_string())).await;
    }

    pub async fn clear_notice(&mut self) {
        self.notice_deadline = None;
        if self.notice.take().is_some() {
            self.emit(ChatUpdate::NoticeCleared).await;
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.link_up = false;
                self.set_status(ConnectionStatus::Connecting).await;
            }
            TransportEvent::Connected => {
                if self.has_connected {
                    info!(
                        meeting_id = self.meeting_id,
                        "Chat reconnected, fetching missed messages"
                    );
                    self.spawn_page_fetch(PagePurpose::CatchUp, None);
                }
                self.has_connected = true;
                self.link_up = true;
                self.set_status(ConnectionStatus::Connected).await;
            }
            TransportEvent::Disconnected { reason } => {
                info!(meeting_id = self.meeting_id, "Chat disconnected: {reason}");
                self.link_up = false;
                self.set_status(ConnectionStatus::Disconnected).await;
            }
            TransportEvent::Error { message } => {
                warn!(meeting_id = self.meeting_id, "Chat transport error: {message}");
                self.set_status(ConnectionStatus::Error).await;
                self.show_notice(&message).await;
            }
            TransportEvent::Inbound { channel, body } => match decode_event(channel, &body) {
                Ok(event) => self.handle_chat_event(event).await,
                Err(e) => warn!(meeting_id = self.meeting_id, "Ignoring push: {e}"),
            },
        }
    }

    async fn handle_chat_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::MessageCreated(message) => self.on_live_message(message).await,
            ChatEvent::UnreadCountUpdated(updates) => {
                if self.log.apply_unread(&updates) > 0 {
                    self.emit(ChatUpdate::UnreadUpdated(updates)).await;
                }
            }
            ChatEvent::SendAck(ack) => {
                if self.pending_sends.remove(&ack.client_message_id).is_some() {
                    debug!(
                        client_message_id = %ack.client_message_id,
                        message_id = ?ack.message_id,
                        "Send acknowledged"
                    );
                }
            }
            ChatEvent::ServerError(err) => {
                warn!(
                    meeting_id = self.meeting_id,
                    code = ?err.code,
                    "Chat server error: {}",
                    err.message
                );
                self.set_status(ConnectionStatus::Error).await;
                self.show_notice(&err.message).await;
            }
            ChatEvent::Pong => debug!(meeting_id = self.meeting_id, "Pong"),
        }
    }

    async fn on_live_message(&mut self, message: ChatMessage) {
        let pinned = self.viewport.is_pinned();
        let id = message.id;
        if !self.log.insert(message.clone()) {
            debug!(message_id = id, "Duplicate push ignored");
            return;
        }
        self.emit(ChatUpdate::MessageAdded(message)).await;
        if pinned {
            self.emit(ChatUpdate::ScrollToBottom).await;
            self.mark_newest_read();
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Send { kind, text } => self.send(kind, &text).await,
            ChatCommand::LoadOlder => self.load_older().await,
            ChatCommand::Retry => self.load_initial(),
            ChatCommand::ViewportChanged(viewport) => {
                self.viewport = viewport;
                if viewport.is_pinned() {
                    self.mark_newest_read();
                }
            }
            ChatCommand::ContentResized { scroll_height } => {
                self.on_content_resized(scroll_height).await;
            }
            ChatCommand::Close => self.shutdown().await,
        }
    }

    async fn send(&mut self, kind: MessageKind, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if kind == MessageKind::System {
            warn!(meeting_id = self.meeting_id, "Refusing to publish a system message");
            self.show_notice(SYSTEM_KIND_NOTICE).await;
            return;
        }
        if !self.link_up {
            self.show_notice(NOT_CONNECTED_NOTICE).await;
            return;
        }
        if !self.send_guard.admit(text, Instant::now()) {
            debug!(meeting_id = self.meeting_id, "Duplicate send suppressed");
            self.show_notice(DUPLICATE_NOTICE).await;
            return;
        }

        let client_message_id = Uuid::new_v4().to_string();
        let outgoing = OutgoingMessage {
            client_message_id: client_message_id.clone(),
            kind,
            content: text.to_string(),
        };
        let body = match serde_json::to_string(&outgoing) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode outgoing message: {e}");
                return;
            }
        };
        let publish = TransportCommand::Publish {
            destination: publish_destination(self.meeting_id),
            body,
        };
        if self.transport_tx.send(publish).await.is_err() {
            self.show_notice(NOT_CONNECTED_NOTICE).await;
            return;
        }
        self.pending_sends.insert(client_message_id, text.to_string());
        self.emit(ChatUpdate::ComposerCleared).await;
    }

    fn load_initial(&mut self) {
        if self.loading_initial {
            return;
        }
        self.loading_initial = true;
        self.spawn_page_fetch(PagePurpose::Initial, None);
    }

    async fn load_older(&mut self) {
        if self.loading_older || self.loading_initial || !self.has_more {
            return;
        }
        let Some(cursor) = self.next_cursor else {
            return;
        };
        self.loading_older = true;
        self.emit(ChatUpdate::LoadingOlder(true)).await;
        self.spawn_page_fetch(PagePurpose::Older, Some(cursor));
    }

    async fn on_content_resized(&mut self, scroll_height: f64) {
        if let Some(anchor) = self.pending_anchor.take() {
            let top = anchor.compensate(scroll_height);
            self.viewport.scroll_top = top;
            self.viewport.scroll_height = scroll_height;
            self.emit(ChatUpdate::ScrollTo(top)).await;
            return;
        }
        let pinned = self.viewport.is_pinned();
        self.viewport.scroll_height = scroll_height;
        if pinned {
            self.viewport.scroll_top = (scroll_height - self.viewport.client_height).max(0.0);
            self.emit(ChatUpdate::ScrollToBottom).await;
        }
    }

    // -----------------------------------------------------------------------
    // Spawned REST calls
    // -----------------------------------------------------------------------

    fn spawn_page_fetch(&mut self, purpose: PagePurpose, cursor: Option<u64>) {
        let api = Arc::clone(&self.api);
        let tx = self.task_tx.clone();
        let meeting_id = self.meeting_id;
        let size = self.settings.page_size;
        debug!(meeting_id, ?purpose, ?cursor, "Fetching message page");
        self.track(tokio::spawn(async move {
            let result = api.fetch_messages(meeting_id, cursor, size).await;
            let _ = tx.send(TaskResult::Page { purpose, result }).await;
        }));
    }

    fn spawn_read_sync(&mut self, value: u64) {
        let api = Arc::clone(&self.api);
        let tx = self.task_tx.clone();
        let meeting_id = self.meeting_id;
        self.track(tokio::spawn(async move {
            let result = api.update_read_cursor(meeting_id, value).await;
            let _ = tx.send(TaskResult::ReadCursor { value, result }).await;
        }));
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|h| !h.is_finished());
        self.tasks.push(handle);
    }

    pub async fn handle_task_result(&mut self, result: TaskResult) {
        if !self.active {
            return;
        }
        match result {
            TaskResult::Page { purpose, result } => self.on_page(purpose, result).await,
            TaskResult::ReadCursor { value, result } => {
                let ok = match &result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            meeting_id = self.meeting_id,
                            value,
                            "Read cursor update failed: {e}"
                        );
                        false
                    }
                };
                let again = self.cursor.finish(value, ok);
                if !ok {
                    if self.cursor_deadline.is_none() {
                        self.cursor_deadline = Some(Instant::now() + self.settings.read_retry);
                    }
                } else if again && self.cursor_deadline.is_none() {
                    self.cursor_deadline = Some(Instant::now() + self.settings.read_debounce);
                }
            }
        }
    }

    async fn on_page(&mut self, purpose: PagePurpose, result: Result<MessagePage, ApiError>) {
        match purpose {
            PagePurpose::Initial => {
                self.loading_initial = false;
                match result {
                    Ok(page) => {
                        self.next_cursor = page.next_cursor;
                        self.has_more = page.has_next;
                        self.log.replace_with_page(page.messages);
                        info!(
                            meeting_id = self.meeting_id,
                            count = self.log.len(),
                            "Chat history loaded"
                        );
                        self.emit(ChatUpdate::HistoryLoaded {
                            messages: self.log.messages().to_vec(),
                            has_more: self.has_more,
                        })
                        .await;
                        self.emit(ChatUpdate::ScrollToBottom).await;
                        self.mark_newest_read();
                    }
                    Err(e) => {
                        warn!(meeting_id = self.meeting_id, "Initial history load failed: {e}");
                        self.emit(ChatUpdate::FetchFailed(e.to_string())).await;
                    }
                }
            }
            PagePurpose::Older => {
                self.loading_older = false;
                self.emit(ChatUpdate::LoadingOlder(false)).await;
                match result {
                    Ok(page) => {
                        self.next_cursor = page.next_cursor;
                        self.has_more = page.has_next;
                        let added = self.log.prepend_older(page.messages);
                        debug!(
                            meeting_id = self.meeting_id,
                            added = added.len(),
                            "Older page merged"
                        );
                        if !added.is_empty() {
                            self.pending_anchor = Some(self.viewport.anchor());
                        }
                        self.emit(ChatUpdate::OlderLoaded {
                            messages: added,
                            has_more: self.has_more,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(meeting_id = self.meeting_id, "Older page load failed: {e}");
                        self.emit(ChatUpdate::FetchFailed(e.to_string())).await;
                    }
                }
            }
            PagePurpose::CatchUp => match result {
                Ok(page) => {
                    let pinned = self.viewport.is_pinned();
                    let added = self.log.merge(page.messages);
                    if added.is_empty() {
                        return;
                    }
                    info!(
                        meeting_id = self.meeting_id,
                        added = added.len(),
                        "Merged messages missed while offline"
                    );
                    for message in added {
                        self.emit(ChatUpdate::MessageAdded(message)).await;
                    }
                    if pinned {
                        self.emit(ChatUpdate::ScrollToBottom).await;
                        self.mark_newest_read();
                    }
                }
                Err(e) => warn!(meeting_id = self.meeting_id, "Catch-up fetch failed: {e}"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Read cursor
    // -----------------------------------------------------------------------

    fn mark_newest_read(&mut self) {
        if let Some(newest) = self.log.newest_id() {
            if self.cursor.advance(newest) {
                self.cursor_deadline = Some(Instant::now() + self.settings.read_debounce);
            }
        }
    }

    pub fn on_cursor_deadline(&mut self) {
        self.cursor_deadline = None;
        if let Some(value) = self.cursor.begin_sync() {
            debug!(meeting_id = self.meeting_id, value, "Syncing read cursor");
            self.spawn_read_sync(value);
        }
    }

    /// Stop background work and ask the transport to disconnect.
    pub async fn shutdown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        self.cursor_deadline = None;
        self.notice_deadline = None;
        let _ = self.transport_tx.send(TransportCommand::Shutdown).await;
        info!(meeting_id = self.meeting_id, "Chat session closed");
    }
}

/// Run the chat session until the screen closes or the transport goes away.
pub async fn run<A>(
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut cmd_rx: mpsc::Receiver<ChatCommand>,
    mut task_rx: mpsc::Receiver<TaskResult>,
    mut session: ChatSession<A>,
) where
    A: ChatApi + 'static,
{
    info!(meeting_id = session.meeting_id, "Chat session started");
    session.start().await;

    loop {
        tokio::select! {
            event = transport_rx.recv() => match event {
                Some(event) => session.handle_transport_event(event).await,
                None => {
                    info!("Transport channel closed, ending chat session");
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ChatCommand::Close) | None => break,
                Some(cmd) => session.handle_command(cmd).await,
            },
            Some(result) = task_rx.recv() => session.handle_task_result(result).await,
            _ = sleep_until_opt(session.cursor_deadline) => session.on_cursor_deadline(),
            _ = sleep_until_opt(session.notice_deadline) => session.clear_notice().await,
        }
    }

    session.shutdown().await;
}
