// Polling scheduler for screens that follow server state without a push
// channel.
//
// Wait screens (vote wait, settlement wait, OCR loading) poll at a fixed
// interval and stop only when their owner drops them. The meeting-detail
// screen paces itself by workflow phase and pauses while the document is
// hidden, re-fetching immediately when it becomes visible again.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiError, MeetingApi};
use crate::config::PollingConfig;
use crate::protocol::{MeetingLiveState, MeetingPhase};

/// Per-phase intervals for the meeting-detail poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseIntervals {
    pub voting: Duration,
    pub settling: Duration,
    pub idle: Duration,
}

impl PhaseIntervals {
    pub fn from_config(config: &PollingConfig) -> Self {
        PhaseIntervals {
            voting: Duration::from_millis(config.voting_interval_ms),
            settling: Duration::from_millis(config.settling_interval_ms),
            idle: Duration::from_millis(config.idle_interval_ms),
        }
    }

    /// `None` means the phase is terminal and polling should stop.
    pub fn for_phase(&self, phase: MeetingPhase) -> Option<Duration> {
        match phase {
            MeetingPhase::Voting => Some(self.voting),
            MeetingPhase::Settling => Some(self.settling),
            MeetingPhase::Recruiting | MeetingPhase::Confirmed => Some(self.idle),
            MeetingPhase::Completed | MeetingPhase::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    Fixed(Duration),
    Phased(PhaseIntervals),
}

/// Explicit scheduler state: the next delay is a function of the policy,
/// the last observed phase and document visibility.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    policy: PollPolicy,
    phase: Option<MeetingPhase>,
    visible: bool,
}

impl PollScheduler {
    /// Wait screens (vote wait, settlement wait, OCR loading).
    pub fn fixed(interval: Duration) -> Self {
        PollScheduler {
            policy: PollPolicy::Fixed(interval),
            phase: None,
            visible: true,
        }
    }

    /// The meeting-detail screen.
    pub fn phased(intervals: PhaseIntervals) -> Self {
        PollScheduler {
            policy: PollPolicy::Phased(intervals),
            phase: None,
            visible: true,
        }
    }

    pub fn phase(&self) -> Option<MeetingPhase> {
        self.phase
    }

    pub fn observe(&mut self, phase: MeetingPhase) {
        if self.phase != Some(phase) {
            debug!(?phase, "Meeting phase changed");
        }
        self.phase = Some(phase);
    }

    /// Record document visibility. Returns true when polling should fetch
    /// right away (a phased poller just became visible).
    pub fn set_visible(&mut self, visible: bool) -> bool {
        let was_visible = self.visible;
        self.visible = visible;
        matches!(self.policy, PollPolicy::Phased(_)) && visible && !was_visible
    }

    /// Whether fetching is allowed right now.
    pub fn is_active(&self) -> bool {
        match self.policy {
            PollPolicy::Fixed(_) => true,
            PollPolicy::Phased(_) => self.visible,
        }
    }

    /// Phased polling ends once the meeting reaches a terminal phase.
    pub fn is_finished(&self) -> bool {
        match (self.policy, self.phase) {
            (PollPolicy::Phased(intervals), Some(phase)) => intervals.for_phase(phase).is_none(),
            _ => false,
        }
    }

    /// Delay until the next fetch, or `None` while paused or finished.
    pub fn next_delay(&self) -> Option<Duration> {
        match self.policy {
            PollPolicy::Fixed(interval) => Some(interval),
            PollPolicy::Phased(intervals) => {
                if !self.visible {
                    return None;
                }
                match self.phase {
                    Some(phase) => intervals.for_phase(phase),
                    None => Some(intervals.idle),
                }
            }
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Poll `fetch` on `scheduler`'s clock and forward every result on `tx`.
///
/// `phase_of` tells a phased scheduler which phase a result reports; fixed
/// pollers can return `None`. Fetch errors are logged and polling continues.
/// The loop ends when a phased poller sees a terminal phase, when `tx`'s
/// receiver is dropped, or when the visibility sender is dropped (the screen
/// unmounted).
pub async fn run_poller<T, F, Fut, P>(
    label: &'static str,
    mut fetch: F,
    phase_of: P,
    mut scheduler: PollScheduler,
    mut visibility: watch::Receiver<bool>,
    tx: mpsc::Sender<T>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    P: Fn(&T) -> Option<MeetingPhase>,
{
    scheduler.set_visible(*visibility.borrow_and_update());
    let mut next_at = scheduler.is_active().then(Instant::now);
    info!(poller = label, "Poller started");

    loop {
        tokio::select! {
            _ = sleep_until_opt(next_at) => {
                match fetch().await {
                    Ok(value) => {
                        if let Some(phase) = phase_of(&value) {
                            scheduler.observe(phase);
                        }
                        if tx.send(value).await.is_err() {
                            debug!(poller = label, "Receiver dropped");
                            return;
                        }
                    }
                    Err(e) => warn!(poller = label, "Fetch failed: {}", e),
                }
                if scheduler.is_finished() {
                    info!(
                        poller = label,
                        phase = ?scheduler.phase(),
                        "Terminal phase reached, polling stopped"
                    );
                    return;
                }
                next_at = scheduler.next_delay().map(|d| Instant::now() + d);
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    debug!(poller = label, "Visibility sender dropped, poller exiting");
                    return;
                }
                let visible = *visibility.borrow_and_update();
                if scheduler.set_visible(visible) {
                    debug!(poller = label, "Document visible again, fetching now");
                    next_at = Some(Instant::now());
                } else if !scheduler.is_active() {
                    debug!(poller = label, "Document hidden, polling paused");
                    next_at = None;
                }
            }
        }
    }
}

/// Poll a meeting's live state and forward every snapshot on `tx`.
pub async fn run_live_state_poller<A>(
    api: &A,
    meeting_id: u64,
    scheduler: PollScheduler,
    visibility: watch::Receiver<bool>,
    tx: mpsc::Sender<MeetingLiveState>,
) where
    A: MeetingApi + ?Sized,
{
    debug!(meeting_id, "Following live state");
    run_poller(
        "live-state",
        move || api.fetch_live_state(meeting_id),
        |state: &MeetingLiveState| Some(state.phase),
        scheduler,
        visibility,
        tx,
    )
    .await;
}
