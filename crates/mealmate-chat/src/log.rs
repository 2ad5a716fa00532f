// Ordered message log and scroll bookkeeping.
//
// The log is kept sorted by ascending message id with no duplicates, no
// matter in which order pages and live pushes arrive.

use mealmate_core::protocol::{ChatMessage, UnreadCount};

/// Distance from the bottom, in pixels, within which the view counts as
/// pinned to the newest message.
pub const PIN_THRESHOLD_PX: f64 = 24.0;

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.position(id).is_ok()
    }

    pub fn newest_id(&self) -> Option<u64> {
        self.messages.last().map(|m| m.id)
    }

    pub fn oldest_id(&self) -> Option<u64> {
        self.messages.first().map(|m| m.id)
    }

    fn position(&self, id: u64) -> Result<usize, usize> {
        self.messages.binary_search_by_key(&id, |m| m.id)
    }

    /// Insert one message at its ordered position. Returns false if the id
    /// is already present.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        match self.position(message.id) {
            Ok(_) => false,
            Err(pos) => {
                self.messages.insert(pos, message);
                true
            }
        }
    }

    /// Merge messages in any order; returns the ones actually added, ascending.
    pub fn merge<I>(&mut self, messages: I) -> Vec<ChatMessage>
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        let mut added: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| self.insert(m.clone()))
            .collect();
        added.sort_by_key(|m| m.id);
        added
    }

    /// Replace the log with a newest-first page from the server.
    ///
    /// Messages newer than the page's newest entry can only have come from
    /// live pushes that beat the fetch, so they are kept.
    pub fn replace_with_page(&mut self, newest_first: Vec<ChatMessage>) {
        let page_newest = newest_first.iter().map(|m| m.id).max();
        let live: Vec<ChatMessage> = match page_newest {
            Some(newest) => self
                .messages
                .drain(..)
                .filter(|m| m.id > newest)
                .collect(),
            None => std::mem::take(&mut self.messages),
        };
        self.messages.clear();
        self.merge(newest_first);
        self.merge(live);
    }

    /// Merge an older, newest-first page.
    pub fn prepend_older(&mut self, newest_first: Vec<ChatMessage>) -> Vec<ChatMessage> {
        self.merge(newest_first.into_iter().rev())
    }

    /// Apply unread-count updates; returns how many messages changed.
    pub fn apply_unread(&mut self, updates: &[UnreadCount]) -> usize {
        let mut changed = 0;
        for update in updates {
            if let Ok(pos) = self.position(update.message_id) {
                let message = &mut self.messages[pos];
                if message.unread_count != Some(update.unread_count) {
                    message.unread_count = Some(update.unread_count);
                    changed += 1;
                }
            }
        }
        changed
    }
}

/// Last reported scroll geometry of the message list.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl Viewport {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_pinned(&self) -> bool {
        self.distance_from_bottom() <= PIN_THRESHOLD_PX
    }

    pub fn anchor(&self) -> ScrollAnchor {
        ScrollAnchor {
            scroll_top: self.scroll_top,
            scroll_height: self.scroll_height,
        }
    }
}

/// Scroll position captured before older messages are prepended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub scroll_top: f64,
    pub scroll_height: f64,
}

impl ScrollAnchor {
    /// Scroll offset that keeps the same content under the viewport after
    /// the list grew to `new_scroll_height`.
    pub fn compensate(&self, new_scroll_height: f64) -> f64 {
        self.scroll_top + (new_scroll_height - self.scroll_height).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mealmate_core::protocol::MessageKind;
    use proptest::prelude::*;

    fn msg(id: u64) -> ChatMessage {
        ChatMessage {
            id,
            kind: MessageKind::Text,
            body: format!("message {id}"),
            sender: None,
            created_at: NaiveDate::from_ymd_opt(2026, 3, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            unread_count: None,
        }
    }

    fn ids(log: &MessageLog) -> Vec<u64> {
        log.messages().iter().map(|m| m.id).collect()
    }

    #[test]
    fn older_page_merges_below_existing() {
        let mut log = MessageLog::new();
        log.replace_with_page(vec![msg(12), msg(11), msg(10)]);
        let added = log.prepend_older(vec![msg(10), msg(9), msg(8)]);
        assert_eq!(ids(&log), vec![8, 9, 10, 11, 12]);
        assert_eq!(added.iter().map(|m| m.id).collect::<Vec<_>>(), vec![8, 9]);
    }

    #[test]
    fn live_push_is_deduplicated() {
        let mut log = MessageLog::new();
        log.replace_with_page(vec![msg(3), msg(2)]);
        assert!(log.insert(msg(4)));
        assert!(!log.insert(msg(4)));
        assert_eq!(ids(&log), vec![2, 3, 4]);
    }

    #[test]
    fn out_of_order_insert_keeps_order() {
        let mut log = MessageLog::new();
        log.insert(msg(5));
        log.insert(msg(2));
        log.insert(msg(9));
        log.insert(msg(7));
        assert_eq!(ids(&log), vec![2, 5, 7, 9]);
        assert_eq!(log.oldest_id(), Some(2));
        assert_eq!(log.newest_id(), Some(9));
    }

    #[test]
    fn replace_keeps_live_messages_newer_than_page() {
        let mut log = MessageLog::new();
        log.insert(msg(21));
        log.insert(msg(3));
        log.replace_with_page(vec![msg(20), msg(19)]);
        assert_eq!(ids(&log), vec![19, 20, 21]);
    }

    #[test]
    fn replace_with_empty_page_keeps_live_messages() {
        let mut log = MessageLog::new();
        log.insert(msg(1));
        log.replace_with_page(Vec::new());
        assert_eq!(ids(&log), vec![1]);
    }

    #[test]
    fn unread_updates_touch_known_messages_only() {
        let mut log = MessageLog::new();
        log.replace_with_page(vec![msg(2), msg(1)]);
        let changed = log.apply_unread(&[
            UnreadCount {
                message_id: 1,
                unread_count: 3,
            },
            UnreadCount {
                message_id: 99,
                unread_count: 1,
            },
        ]);
        assert_eq!(changed, 1);
        assert_eq!(log.messages()[0].unread_count, Some(3));
        assert_eq!(
            log.apply_unread(&[UnreadCount {
                message_id: 1,
                unread_count: 3
            }]),
            0
        );
    }

    #[test]
    fn pinned_within_threshold() {
        let at_bottom = Viewport {
            scroll_top: 600.0,
            scroll_height: 1000.0,
            client_height: 400.0,
        };
        assert!(at_bottom.is_pinned());
        let near = Viewport {
            scroll_top: 580.0,
            ..at_bottom
        };
        assert!(near.is_pinned());
        let away = Viewport {
            scroll_top: 500.0,
            ..at_bottom
        };
        assert!(!away.is_pinned());
        assert!(Viewport::default().is_pinned());
    }

    #[test]
    fn anchor_compensates_growth() {
        let viewport = Viewport {
            scroll_top: 0.0,
            scroll_height: 1000.0,
            client_height: 400.0,
        };
        let anchor = viewport.anchor();
        assert_eq!(anchor.compensate(1600.0), 600.0);
        assert_eq!(anchor.compensate(900.0), 0.0);
    }

    #[derive(Debug, Clone)]
    enum Arrival {
        Initial(Vec<u64>),
        Older(Vec<u64>),
        Live(u64),
        Batch(Vec<u64>),
    }

    fn newest_first(ids: &[u64]) -> Vec<ChatMessage> {
        let mut ids = ids.to_vec();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        ids.into_iter().map(msg).collect()
    }

    fn arrival() -> impl Strategy<Value = Arrival> {
        let page = || proptest::collection::vec(1u64..200, 0..12);
        prop_oneof![
            page().prop_map(Arrival::Initial),
            page().prop_map(Arrival::Older),
            (1u64..200).prop_map(Arrival::Live),
            page().prop_map(Arrival::Batch),
        ]
    }

    proptest! {
        #[test]
        fn any_arrival_order_keeps_ids_strictly_ascending(
            arrivals in proptest::collection::vec(arrival(), 1..24)
        ) {
            let mut log = MessageLog::new();
            for arrival in arrivals {
                match arrival {
                    Arrival::Initial(ids) => log.replace_with_page(newest_first(&ids)),
                    Arrival::Older(ids) => {
                        log.prepend_older(newest_first(&ids));
                        for id in ids {
                            prop_assert!(log.contains(id));
                        }
                    }
                    Arrival::Live(id) => {
                        log.insert(msg(id));
                        prop_assert!(log.contains(id));
                    }
                    Arrival::Batch(ids) => {
                        let added = log.merge(ids.iter().copied().map(msg));
                        let added = added.iter().map(|m| m.id).collect::<Vec<_>>();
                        prop_assert!(added.windows(2).all(|w| w[0] < w[1]));
                    }
                }
                let order = ids(&log);
                prop_assert!(order.windows(2).all(|w| w[0] < w[1]), "not ascending: {order:?}");
            }
        }
    }
}
