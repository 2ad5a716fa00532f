// Drives the full chat session loop with a scripted REST backend and a
// hand-fed transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mealmate_chat::event::Channel;
use mealmate_chat::session::{
    ChatCommand, ChatSession, ChatSettings, ChatUpdate, NOT_CONNECTED_NOTICE,
};
use mealmate_chat::transport::{TransportCommand, TransportEvent};
use mealmate_core::api::{ApiError, ChatApi};
use mealmate_core::protocol::{ChatMessage, MessageKind, MessagePage};

fn msg(id: u64) -> ChatMessage {
    ChatMessage {
        id,
        kind: MessageKind::Text,
        body: format!("m{id}"),
        sender: None,
        created_at: NaiveDate::from_ymd_opt(2026, 5, 2)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap(),
        unread_count: None,
    }
}

#[derive(Default)]
struct ScriptedChatApi {
    pages: Mutex<VecDeque<MessagePage>>,
    /// Number of read-cursor updates to fail before succeeding.
    failing_reads: Mutex<usize>,
    reads: Mutex<Vec<u64>>,
}

#[async_trait]
impl ChatApi for ScriptedChatApi {
    async fn fetch_messages(
        &self,
        _meeting_id: u64,
        _cursor: Option<u64>,
        _size: u32,
    ) -> Result<MessagePage, ApiError> {
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::MissingData {
                path: "/api/meetings/1/chat/messages".into(),
            })
    }

    async fn update_read_cursor(
        &self,
        _meeting_id: u64,
        last_read_id: u64,
    ) -> Result<(), ApiError> {
        self.reads.lock().unwrap().push(last_read_id);
        let mut failing = self.failing_reads.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(ApiError::Status {
                status: 503,
                message: "unavailable".into(),
                detail: None,
            });
        }
        Ok(())
    }
}

struct Running {
    api: Arc<ScriptedChatApi>,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::Sender<ChatCommand>,
    transport: mpsc::Receiver<TransportCommand>,
    ui: mpsc::Receiver<ChatUpdate>,
    handle: JoinHandle<()>,
}

fn start(api: ScriptedChatApi) -> Running {
    let api = Arc::new(api);
    let (transport_tx, transport) = mpsc::channel(16);
    let (ui_tx, ui) = mpsc::channel(256);
    let (session, task_rx) =
        ChatSession::new(1, Arc::clone(&api), ChatSettings::default(), transport_tx, ui_tx);
    let (events, event_rx) = mpsc::channel(16);
    let (commands, cmd_rx) = mpsc::channel(16);
    let handle = tokio::spawn(mealmate_chat::run(event_rx, cmd_rx, task_rx, session));
    Running {
        api,
        events,
        commands,
        transport,
        ui,
        handle,
    }
}

fn drain(rx: &mut mpsc::Receiver<ChatUpdate>) -> Vec<ChatUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        out.push(update);
    }
    out
}

fn push(id: u64) -> TransportEvent {
    TransportEvent::Inbound {
        channel: Channel::Messages,
        body: serde_json::to_string(&msg(id)).unwrap(),
    }
}

#[tokio::test]
async fn read_cursor_is_debounced_and_monotonic() {
    tokio::time::pause();
    let api = ScriptedChatApi::default();
    api.pages.lock().unwrap().push_back(MessagePage {
        messages: vec![msg(3), msg(2), msg(1)],
        next_cursor: None,
        has_next: false,
    });
    let mut r = start(api);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*r.api.reads.lock().unwrap(), vec![3]);

    r.events.send(TransportEvent::Connected).await.unwrap();
    r.events.send(push(4)).await.unwrap();
    r.events.send(push(5)).await.unwrap();
    // An older id arriving late never moves the cursor back.
    r.events.send(push(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(*r.api.reads.lock().unwrap(), vec![3, 5]);
    let updates = drain(&mut r.ui);
    assert!(updates.contains(&ChatUpdate::MessageAdded(msg(5))));
    r.commands.send(ChatCommand::Close).await.unwrap();
    r.handle.await.unwrap();
}

#[tokio::test]
async fn failed_read_update_is_retried() {
    tokio::time::pause();
    let api = ScriptedChatApi::default();
    api.pages.lock().unwrap().push_back(MessagePage {
        messages: vec![msg(8)],
        next_cursor: None,
        has_next: false,
    });
    *api.failing_reads.lock().unwrap() = 1;
    let r = start(api);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*r.api.reads.lock().unwrap(), vec![8]);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(*r.api.reads.lock().unwrap(), vec![8, 8]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(r.api.reads.lock().unwrap().len(), 2, "no further updates once synced");
}

#[tokio::test]
async fn notice_expires() {
    tokio::time::pause();
    let mut r = start(ScriptedChatApi::default());

    r.commands
        .send(ChatCommand::text("hi"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut r.ui).contains(&ChatUpdate::Notice(NOT_CONNECTED_NOTICE.into())));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(drain(&mut r.ui).contains(&ChatUpdate::NoticeCleared));
}

#[tokio::test]
async fn close_shuts_down_transport() {
    let mut r = start(ScriptedChatApi::default());
    r.commands.send(ChatCommand::Close).await.unwrap();
    r.handle.await.unwrap();
    let mut saw_shutdown = false;
    while let Ok(cmd) = r.transport.try_recv() {
        saw_shutdown |= cmd == TransportCommand::Shutdown;
    }
    assert!(saw_shutdown);
}

#[tokio::test]
async fn session_ends_when_transport_goes_away() {
    let r = start(ScriptedChatApi::default());
    drop(r.events);
    tokio::time::timeout(Duration::from_secs(5), r.handle)
        .await
        .expect("session should end")
        .unwrap();
}
