// Settlement navigator.
//
// The settlement workflow (receipt upload, OCR, item edit, menu selection,
// waiting, result, completed) is driven entirely by the server, which reports
// the next step as a `nextAction`. The client only maps that to a route.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::api::{ApiError, SettlementApi};
use crate::poll::{self, PollScheduler};

/// Server error code meaning an OCR job for the receipt is already running.
pub const OCR_ALREADY_IN_PROGRESS: &str = "OCR_ALREADY_IN_PROGRESS";

/// The server's verdict on where the user should be in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementAction {
    GoReceiptUpload,
    GoOcrLoading,
    GoOcrFailed,
    GoItemEdit,
    GoMenuSelection,
    GoWaiting,
    GoResult,
    GoCompleted,
    /// Nothing to do in the settlement flow; go back to the meeting and
    /// explain why in a modal.
    GoMeetingDetailWithModal,
}

impl SettlementAction {
    pub const ALL: [SettlementAction; 9] = [
        SettlementAction::GoReceiptUpload,
        SettlementAction::GoOcrLoading,
        SettlementAction::GoOcrFailed,
        SettlementAction::GoItemEdit,
        SettlementAction::GoMenuSelection,
        SettlementAction::GoWaiting,
        SettlementAction::GoResult,
        SettlementAction::GoCompleted,
        SettlementAction::GoMeetingDetailWithModal,
    ];

    /// Screens that sit and poll until the server moves the flow on.
    pub fn is_waiting(self) -> bool {
        matches!(self, SettlementAction::GoOcrLoading | SettlementAction::GoWaiting)
    }
}

/// Body of `GET /api/meetings/{id}/settlement/state`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementState {
    pub next_action: SettlementAction,
    #[serde(default)]
    pub settlement_id: Option<u64>,
}

/// Where an action leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRoute {
    pub path: String,
    /// The caller must show the "nothing to settle" modal after navigating.
    pub show_modal: bool,
}

/// History semantics for a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationMode {
    Push,
    /// Replace the current entry so the user cannot go "back" into a stale
    /// mid-flow screen.
    Replace,
}

/// Whatever owns the router.
pub trait Navigator {
    fn navigate(&mut self, path: &str, mode: NavigationMode);
}

/// Total, pure mapping from action to route.
pub fn route_for_action(meeting_id: u64, action: SettlementAction) -> SettlementRoute {
    let base = format!("/meetings/{meeting_id}/settlement");
    let sub = match action {
        SettlementAction::GoReceiptUpload => "upload",
        SettlementAction::GoOcrLoading => "ocr/loading",
        SettlementAction::GoOcrFailed => "ocr/failed",
        SettlementAction::GoItemEdit => "items/edit",
        SettlementAction::GoMenuSelection => "selection",
        SettlementAction::GoWaiting => "waiting",
        SettlementAction::GoResult => "result",
        SettlementAction::GoCompleted => "completed",
        SettlementAction::GoMeetingDetailWithModal => {
            return SettlementRoute {
                path: format!("/meetings/{meeting_id}"),
                show_modal: true,
            };
        }
    };
    SettlementRoute {
        path: format!("{base}/{sub}"),
        show_modal: false,
    }
}

/// Navigate for `action`, invoking `on_modal` only for the modal action.
pub fn go<N, F>(
    navigator: &mut N,
    meeting_id: u64,
    action: SettlementAction,
    mode: NavigationMode,
    on_modal: F,
) where
    N: Navigator + ?Sized,
    F: FnOnce(),
{
    let route = route_for_action(meeting_id, action);
    debug!(meeting_id, ?action, path = %route.path, "Settlement navigation");
    navigator.navigate(&route.path, mode);
    if route.show_modal {
        on_modal();
    }
}

/// Fetch the current settlement state and navigate to the matching route.
pub async fn route_by_state<A, N, F>(
    api: &A,
    navigator: &mut N,
    meeting_id: u64,
    mode: NavigationMode,
    on_modal: F,
) -> Result<SettlementAction, ApiError>
where
    A: SettlementApi + ?Sized,
    N: Navigator + ?Sized,
    F: FnOnce(),
{
    let state = api.fetch_settlement_state(meeting_id).await?;
    go(navigator, meeting_id, state.next_action, mode, on_modal);
    Ok(state.next_action)
}

/// Stay on the wait screen for `current`, polling the settlement state every
/// `interval`. A new waiting action replaces the route and keeps polling; the
/// first non-waiting action is navigated to (calling `on_modal` for the modal
/// action) and returned. Fetch failures are logged and polling continues.
///
/// Returns `current` untouched when it is not a wait screen.
pub async fn follow_wait_screen<A, N, F>(
    api: &A,
    navigator: &mut N,
    meeting_id: u64,
    current: SettlementAction,
    interval: Duration,
    on_modal: F,
) -> SettlementAction
where
    A: SettlementApi + ?Sized,
    N: Navigator + ?Sized,
    F: FnOnce(),
{
    if !current.is_waiting() {
        return current;
    }
    let mut current = current;

    let (_visible, visibility) = watch::channel(true);
    let (tx, mut rx) = mpsc::channel(4);
    let poller = poll::run_poller(
        "settlement-wait",
        move || api.fetch_settlement_state(meeting_id),
        |_: &SettlementState| None,
        PollScheduler::fixed(interval),
        visibility,
        tx,
    );
    tokio::pin!(poller);

    loop {
        tokio::select! {
            _ = &mut poller => return current,
            state = rx.recv() => {
                let Some(state) = state else {
                    return current;
                };
                if state.next_action == current {
                    continue;
                }
                info!(meeting_id, from = ?current, to = ?state.next_action, "Settlement moved on");
                current = state.next_action;
                if current.is_waiting() {
                    go(navigator, meeting_id, current, NavigationMode::Replace, || {});
                    continue;
                }
                go(navigator, meeting_id, current, NavigationMode::Replace, on_modal);
                return current;
            }
        }
    }
}

/// Classify an error by the code embedded in its message or detail text.
pub fn error_has_code(err: &ApiError, code: &str) -> bool {
    err.has_code(code)
}

/// Start OCR for the uploaded receipt and move to the loading screen.
/// A job that is already running counts as started.
pub async fn start_ocr<A, N>(api: &A, navigator: &mut N, meeting_id: u64) -> Result<(), ApiError>
where
    A: SettlementApi + ?Sized,
    N: Navigator + ?Sized,
{
    match api.start_ocr(meeting_id).await {
        Ok(()) => {}
        Err(e) if error_has_code(&e, OCR_ALREADY_IN_PROGRESS) => {
            info!(meeting_id, "OCR already running, joining it");
        }
        Err(e) => return Err(e),
    }
    go(
        navigator,
        meeting_id,
        SettlementAction::GoOcrLoading,
        NavigationMode::Replace,
        || {},
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNavigator {
        visits: Vec<(String, NavigationMode)>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&mut self, path: &str, mode: NavigationMode) {
            self.visits.push((path.to_string(), mode));
        }
    }

    struct FakeApi {
        action: SettlementAction,
        ocr_error: Option<(u16, &'static str)>,
    }

    #[async_trait]
    impl SettlementApi for FakeApi {
        async fn fetch_settlement_state(
            &self,
            _meeting_id: u64,
        ) -> Result<SettlementState, ApiError> {
            Ok(SettlementState {
                next_action: self.action,
                settlement_id: None,
            })
        }

        async fn start_ocr(&self, _meeting_id: u64) -> Result<(), ApiError> {
            match self.ocr_error {
                Some((status, detail)) => Err(ApiError::Status {
                    status,
                    message: "conflict".into(),
                    detail: Some(detail.into()),
                }),
                None => Ok(()),
            }
        }
    }

    /// Answers each state fetch with the next scripted action.
    struct SequenceApi {
        actions: Mutex<Vec<SettlementAction>>,
        fetches: Mutex<usize>,
    }

    impl SequenceApi {
        fn new(actions: Vec<SettlementAction>) -> Self {
            SequenceApi {
                actions: Mutex::new(actions),
                fetches: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl SettlementApi for SequenceApi {
        async fn fetch_settlement_state(
            &self,
            _meeting_id: u64,
        ) -> Result<SettlementState, ApiError> {
            *self.fetches.lock().unwrap() += 1;
            let mut actions = self.actions.lock().unwrap();
            if actions.is_empty() {
                return Err(ApiError::MissingData {
                    path: "/api/meetings/1/settlement/state".into(),
                });
            }
            Ok(SettlementState {
                next_action: actions.remove(0),
                settlement_id: Some(1),
            })
        }

        async fn start_ocr(&self, _meeting_id: u64) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[test]
    fn ocr_failed_route() {
        let route = route_for_action(42, SettlementAction::GoOcrFailed);
        assert_eq!(route.path, "/meetings/42/settlement/ocr/failed");
        assert!(!route.show_modal);
    }

    #[test]
    fn mapping_is_total_and_unique() {
        let mut seen = HashSet::new();
        for action in SettlementAction::ALL {
            let route = route_for_action(7, action);
            assert!(seen.insert(route.path.clone()), "duplicate path {}", route.path);
            if action == SettlementAction::GoMeetingDetailWithModal {
                assert_eq!(route.path, "/meetings/7");
                assert!(route.show_modal);
            } else {
                assert!(route.path.starts_with("/meetings/7/settlement/"));
                assert!(!route.show_modal);
            }
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn modal_action_navigates_and_invokes_callback() {
        let mut nav = RecordingNavigator::default();
        let mut shown = false;
        go(
            &mut nav,
            5,
            SettlementAction::GoMeetingDetailWithModal,
            NavigationMode::Push,
            || shown = true,
        );
        assert!(shown);
        assert_eq!(nav.visits, vec![("/meetings/5".to_string(), NavigationMode::Push)]);
    }

    #[test]
    fn regular_action_does_not_invoke_callback() {
        let mut nav = RecordingNavigator::default();
        let mut shown = false;
        go(
            &mut nav,
            5,
            SettlementAction::GoWaiting,
            NavigationMode::Push,
            || shown = true,
        );
        assert!(!shown);
        assert_eq!(nav.visits[0].0, "/meetings/5/settlement/waiting");
    }

    #[test]
    fn wire_names_are_screaming_snake_case() {
        let state: SettlementState =
            serde_json::from_str(r#"{"nextAction":"GO_MEETING_DETAIL_WITH_MODAL"}"#).unwrap();
        assert_eq!(state.next_action, SettlementAction::GoMeetingDetailWithModal);
        let unknown = serde_json::from_str::<SettlementState>(r#"{"nextAction":"GO_SOMEWHERE"}"#);
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn route_by_state_replaces_history() {
        let api = FakeApi {
            action: SettlementAction::GoItemEdit,
            ocr_error: None,
        };
        let mut nav = RecordingNavigator::default();
        let action = route_by_state(&api, &mut nav, 42, NavigationMode::Replace, || {})
            .await
            .unwrap();
        assert_eq!(action, SettlementAction::GoItemEdit);
        assert_eq!(
            nav.visits,
            vec![(
                "/meetings/42/settlement/items/edit".to_string(),
                NavigationMode::Replace
            )]
        );
    }

    #[tokio::test]
    async fn start_ocr_treats_in_progress_as_success() {
        let api = FakeApi {
            action: SettlementAction::GoOcrLoading,
            ocr_error: Some((409, "ocr_already_in_progress")),
        };
        let mut nav = RecordingNavigator::default();
        start_ocr(&api, &mut nav, 3).await.unwrap();
        assert_eq!(nav.visits[0].0, "/meetings/3/settlement/ocr/loading");
    }

    #[tokio::test]
    async fn start_ocr_surfaces_other_errors() {
        let api = FakeApi {
            action: SettlementAction::GoOcrLoading,
            ocr_error: Some((500, "RECEIPT_NOT_FOUND")),
        };
        let mut nav = RecordingNavigator::default();
        assert!(start_ocr(&api, &mut nav, 3).await.is_err());
        assert!(nav.visits.is_empty());
    }

    #[test]
    fn only_ocr_loading_and_waiting_are_wait_screens() {
        let waiting: Vec<_> = SettlementAction::ALL
            .into_iter()
            .filter(|a| a.is_waiting())
            .collect();
        assert_eq!(waiting, vec![SettlementAction::GoOcrLoading, SettlementAction::GoWaiting]);
    }

    #[tokio::test]
    async fn wait_screen_polls_until_the_flow_moves_on() {
        tokio::time::pause();
        let api = SequenceApi::new(vec![
            SettlementAction::GoWaiting,
            SettlementAction::GoWaiting,
            SettlementAction::GoResult,
        ]);
        let mut nav = RecordingNavigator::default();
        let start = tokio::time::Instant::now();

        let action = follow_wait_screen(
            &api,
            &mut nav,
            8,
            SettlementAction::GoWaiting,
            Duration::from_secs(3),
            || panic!("no modal expected"),
        )
        .await;

        assert_eq!(action, SettlementAction::GoResult);
        assert_eq!(*api.fetches.lock().unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(
            nav.visits,
            vec![(
                "/meetings/8/settlement/result".to_string(),
                NavigationMode::Replace
            )]
        );
    }

    #[tokio::test]
    async fn ocr_loading_hands_over_to_waiting_then_item_edit() {
        tokio::time::pause();
        let api = SequenceApi::new(vec![
            SettlementAction::GoOcrLoading,
            SettlementAction::GoWaiting,
            SettlementAction::GoItemEdit,
        ]);
        let mut nav = RecordingNavigator::default();

        let action = follow_wait_screen(
            &api,
            &mut nav,
            2,
            SettlementAction::GoOcrLoading,
            Duration::from_secs(1),
            || {},
        )
        .await;

        assert_eq!(action, SettlementAction::GoItemEdit);
        let paths: Vec<&str> = nav.visits.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            ["/meetings/2/settlement/waiting", "/meetings/2/settlement/items/edit"]
        );
    }

    #[tokio::test]
    async fn wait_screen_ending_in_modal_invokes_callback() {
        tokio::time::pause();
        let api = SequenceApi::new(vec![SettlementAction::GoMeetingDetailWithModal]);
        let mut nav = RecordingNavigator::default();
        let mut shown = false;

        let action = follow_wait_screen(
            &api,
            &mut nav,
            4,
            SettlementAction::GoWaiting,
            Duration::from_secs(1),
            || shown = true,
        )
        .await;

        assert_eq!(action, SettlementAction::GoMeetingDetailWithModal);
        assert!(shown);
        assert_eq!(nav.visits[0].0, "/meetings/4");
    }

    #[tokio::test]
    async fn non_waiting_action_returns_without_polling() {
        let api = SequenceApi::new(vec![]);
        let mut nav = RecordingNavigator::default();
        let action = follow_wait_screen(
            &api,
            &mut nav,
            4,
            SettlementAction::GoResult,
            Duration::from_secs(1),
            || {},
        )
        .await;
        assert_eq!(action, SettlementAction::GoResult);
        assert_eq!(*api.fetches.lock().unwrap(), 0);
        assert!(nav.visits.is_empty());
    }
}
