// Read-cursor bookkeeping.
//
// `pending` is the newest id the user has seen, `synced` the newest id the
// server has acknowledged. Both only move forward. At most one update is in
// flight; anything that arrives meanwhile is picked up by the next sync.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadCursor {
    synced: u64,
    pending: u64,
    in_flight: bool,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synced(&self) -> u64 {
        self.synced
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Record that `id` has been seen. Returns true if the cursor moved.
    pub fn advance(&mut self, id: u64) -> bool {
        if id > self.pending {
            self.pending = id;
            true
        } else {
            false
        }
    }

    /// Start a sync if one is needed and none is running. Returns the value
    /// to send.
    pub fn begin_sync(&mut self) -> Option<u64> {
        if self.in_flight || self.pending <= self.synced {
            return None;
        }
        self.in_flight = true;
        Some(self.pending)
    }

    /// Finish the sync that sent `value`. Returns true when another sync is
    /// still needed (newer ids arrived, or the update failed).
    pub fn finish(&mut self, value: u64, ok: bool) -> bool {
        self.in_flight = false;
        if ok {
            self.synced = self.synced.max(value);
        }
        self.pending > self.synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn advance_is_monotonic() {
        let mut c = ReadCursor::new();
        assert!(c.advance(10));
        assert!(!c.advance(7));
        assert!(!c.advance(10));
        assert_eq!(c.pending(), 10);
    }

    #[test]
    fn single_flight() {
        let mut c = ReadCursor::new();
        c.advance(5);
        assert_eq!(c.begin_sync(), Some(5));
        c.advance(8);
        assert_eq!(c.begin_sync(), None, "one update at a time");
        assert!(c.finish(5, true), "8 still pending");
        assert_eq!(c.synced(), 5);
        assert_eq!(c.begin_sync(), Some(8));
        assert!(!c.finish(8, true));
        assert_eq!(c.begin_sync(), None);
    }

    #[test]
    fn failure_keeps_synced_and_requests_retry() {
        let mut c = ReadCursor::new();
        c.advance(3);
        assert_eq!(c.begin_sync(), Some(3));
        assert!(c.finish(3, false));
        assert_eq!(c.synced(), 0);
        assert!(!c.in_flight());
        assert_eq!(c.begin_sync(), Some(3));
    }

    #[test]
    fn stale_success_never_moves_synced_backwards() {
        let mut c = ReadCursor::new();
        c.advance(9);
        c.begin_sync();
        c.finish(9, true);
        c.finish(4, true);
        assert_eq!(c.synced(), 9);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Seen(u64),
        Sync,
        Reply(bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u64..500).prop_map(Step::Seen),
            Just(Step::Sync),
            any::<bool>().prop_map(Step::Reply),
        ]
    }

    proptest! {
        #[test]
        fn cursor_never_regresses_or_overlaps(
            steps in proptest::collection::vec(step(), 1..64)
        ) {
            let mut c = ReadCursor::new();
            let mut sending: Option<u64> = None;
            let mut last_sent = 0u64;

            for step in steps {
                let (synced, pending) = (c.synced(), c.pending());
                match step {
                    Step::Seen(id) => {
                        c.advance(id);
                    }
                    Step::Sync => {
                        if let Some(value) = c.begin_sync() {
                            prop_assert!(sending.is_none(), "second update while one in flight");
                            prop_assert!(value > synced);
                            prop_assert!(value >= last_sent);
                            sending = Some(value);
                            last_sent = value;
                        }
                    }
                    Step::Reply(ok) => {
                        if let Some(value) = sending.take() {
                            c.finish(value, ok);
                        }
                    }
                }
                prop_assert!(c.synced() >= synced);
                prop_assert!(c.pending() >= pending);
                prop_assert!(c.synced() <= c.pending());
                prop_assert_eq!(c.in_flight(), sending.is_some());
            }
        }
    }
}
