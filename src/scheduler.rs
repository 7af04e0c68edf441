//! C8 Download Scheduler: a bounded, cost-weighted queue feeding
//! a worker pool, plus the bookkeeping a backoff/skip run needs.
//! Grounded on `ServerDownloadThread.h`'s `EQueueAction`/`EFileClient`
//! enums, `postponeQuitStop`, `insertFullQueueEarliest`, and `IdRange`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Mirrors the source's `EQueueAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Fileclient(Fileclient),
    Quit,
    StartSnapshot,
    StopSnapshot,
    Skip,
}

/// Mirrors the source's `EFileClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fileclient {
    Full,
    Chunked,
}

fn action_cost(action: Action) -> usize {
    match action {
        Action::Fileclient(Fileclient::Full) => 1,
        Action::Fileclient(Fileclient::Chunked) => 4,
        Action::Quit | Action::StartSnapshot | Action::StopSnapshot | Action::Skip => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub action: Action,
}

/// A sorted, deduplicated id set with O(log n) membership, matching the
/// source's `IdRange`: cheap to build incrementally via `add`, then
/// `finalize`d once before any `has_id` query.
#[derive(Debug, Default, Clone)]
pub struct IdRange {
    ids: Vec<i64>,
    finalized: bool,
}

impl IdRange {
    pub fn new() -> Self {
        IdRange::default()
    }

    pub fn add(&mut self, id: i64) {
        assert!(!self.finalized, "IdRange::add after finalize");
        self.ids.push(id);
    }

    pub fn finalize(&mut self) {
        self.ids.sort_unstable();
        self.ids.dedup();
        self.finalized = true;
    }

    pub fn has_id(&self, id: i64) -> bool {
        assert!(self.finalized, "IdRange::has_id before finalize");
        self.ids.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

const MAX_RETRIES: u32 = 5;

struct QueueState {
    items: VecDeque<QueueItem>,
    /// `Quit`/`StopSnapshot` items pulled off the front while chunked
    /// fetches were still pending: no snapshot is released while any
    /// of its files is still being fetched.
    postponed: VecDeque<QueueItem>,
    skipping: bool,
    retry_counts: HashMap<i64, u32>,
    nok_ids: IdRange,
    partial_ids: IdRange,
}

pub enum EnqueueError {
    QueueFull,
}

pub struct DownloadScheduler {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl DownloadScheduler {
    pub fn new(capacity: usize) -> Self {
        DownloadScheduler {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                postponed: VecDeque::new(),
                skipping: false,
                retry_counts: HashMap::new(),
                nok_ids: IdRange::new(),
                partial_ids: IdRange::new(),
            }),
        }
    }

    fn queued_cost(state: &QueueState) -> usize {
        state.items.iter().map(|i| action_cost(i.action)).sum()
    }

    /// Non-blocking enqueue; the caller sleeps and retries on
    /// `QueueFull` (a bounded queue waits, sleeping 1s when full).
    pub fn try_enqueue(&self, item: QueueItem) -> Result<(), EnqueueError> {
        let mut state = self.state.lock().unwrap();
        if Self::queued_cost(&state) + action_cost(item.action) > self.capacity {
            return Err(EnqueueError::QueueFull);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Pops the next runnable item. A popped `Quit`/`StopSnapshot` is
    /// postponed instead of returned while any chunked fetch is still
    /// queued (`postponeQuitStop`); that item surfaces again once the
    /// queue drains of chunked work (`on_fileclient_finished`).
    pub fn pop(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().unwrap();
        loop {
            let item = state.items.pop_front()?;
            if matches!(item.action, Action::Quit | Action::StopSnapshot) && Self::has_pending_chunked(&state) {
                state.postponed.push_back(item);
                continue;
            }
            return Some(item);
        }
    }

    fn has_pending_chunked(state: &QueueState) -> bool {
        state
            .items
            .iter()
            .any(|i| matches!(i.action, Action::Fileclient(Fileclient::Chunked)))
    }

    /// Call after a chunked fetch completes (success or failure): if no
    /// chunked work remains queued, any postponed `Quit`/`StopSnapshot`
    /// is requeued at the front so it runs next.
    pub fn on_fileclient_finished(&self) {
        let mut state = self.state.lock().unwrap();
        if Self::has_pending_chunked(&state) {
            return;
        }
        while let Some(item) = state.postponed.pop_back() {
            state.items.push_front(item);
        }
    }

    pub fn skip(&self) {
        self.state.lock().unwrap().skipping = true;
    }

    pub fn is_skipping(&self) -> bool {
        self.state.lock().unwrap().skipping
    }

    /// Downgrades a failed chunked fetch to full (`preparePatchDownloadFiles`
    /// failed), requeuing it as early as possible — unless a full fetch
    /// for the same `id` is already queued further back, in which case
    /// that one will cover it (`insertFullQueueEarliest` /
    /// `hasFullQueuedAfter`).
    pub fn downgrade_to_full(&self, id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        let already_queued = state
            .items
            .iter()
            .any(|i| i.id == id && matches!(i.action, Action::Fileclient(Fileclient::Full)));
        if already_queued {
            return false;
        }
        state.items.push_front(QueueItem { id, action: Action::Fileclient(Fileclient::Full) });
        true
    }

    /// Records a retry attempt for `id`; returns whether another retry
    /// is still allowed (transport errors get up to `MAX_RETRIES`
    /// attempts inside this engine before the failure surfaces to the
    /// session state machine).
    pub fn record_retry(&self, id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        let count = state.retry_counts.entry(id).or_insert(0);
        *count += 1;
        *count <= MAX_RETRIES
    }

    pub fn record_nok(&self, id: i64) {
        self.state.lock().unwrap().nok_ids.add(id);
    }

    pub fn record_partial(&self, id: i64) {
        self.state.lock().unwrap().partial_ids.add(id);
    }

    /// Finalizes both outcome sets so `is_nok`/`is_partial` can query
    /// them; called once after the backup's file list is fully drained.
    pub fn finalize_outcomes(&self) {
        let mut state = self.state.lock().unwrap();
        state.nok_ids.finalize();
        state.partial_ids.finalize();
    }

    pub fn is_nok(&self, id: i64) -> bool {
        self.state.lock().unwrap().nok_ids.has_id(id)
    }

    pub fn is_partial(&self, id: i64) -> bool {
        self.state.lock().unwrap().partial_ids.has_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_items_cost_four_full_items_cost_one() {
        let sched = DownloadScheduler::new(5);
        sched.try_enqueue(QueueItem { id: 1, action: Action::Fileclient(Fileclient::Chunked) }).unwrap();
        let err = sched.try_enqueue(QueueItem { id: 2, action: Action::Fileclient(Fileclient::Full) });
        // 4 (chunked) + 1 (full) = 5, exactly at capacity, should fit.
        assert!(err.is_ok());
        let overflow = sched.try_enqueue(QueueItem { id: 3, action: Action::Fileclient(Fileclient::Full) });
        assert!(matches!(overflow, Err(EnqueueError::QueueFull)));
    }

    #[test]
    fn quit_is_postponed_while_chunked_work_is_queued() {
        let sched = DownloadScheduler::new(100);
        sched.try_enqueue(QueueItem { id: 1, action: Action::Fileclient(Fileclient::Chunked) }).unwrap();
        sched.try_enqueue(QueueItem { id: 2, action: Action::Quit }).unwrap();

        // Quit is behind the chunked item, so it pops first and is postponed.
        let first = sched.pop().unwrap();
        assert_eq!(first.action, Action::Fileclient(Fileclient::Chunked));

        sched.on_fileclient_finished();
        let second = sched.pop().unwrap();
        assert_eq!(second.action, Action::Quit);
    }

    #[test]
    fn quit_ahead_of_later_chunked_work_is_still_postponed() {
        let sched = DownloadScheduler::new(100);
        sched.try_enqueue(QueueItem { id: 1, action: Action::Quit }).unwrap();
        sched.try_enqueue(QueueItem { id: 2, action: Action::Fileclient(Fileclient::Chunked) }).unwrap();

        let first = sched.pop().unwrap();
        assert_eq!(first.action, Action::Fileclient(Fileclient::Chunked));
        sched.on_fileclient_finished();

        let second = sched.pop().unwrap();
        assert_eq!(second.action, Action::Quit);
    }

    #[test]
    fn skip_flag_is_observable() {
        let sched = DownloadScheduler::new(10);
        assert!(!sched.is_skipping());
        sched.skip();
        assert!(sched.is_skipping());
    }

    #[test]
    fn downgrade_inserts_full_item_at_front() {
        let sched = DownloadScheduler::new(100);
        sched.try_enqueue(QueueItem { id: 5, action: Action::Fileclient(Fileclient::Full) }).unwrap();
        assert!(sched.downgrade_to_full(42));

        let first = sched.pop().unwrap();
        assert_eq!(first.id, 42);
        assert_eq!(first.action, Action::Fileclient(Fileclient::Full));
    }

    #[test]
    fn downgrade_is_noop_when_full_already_queued() {
        let sched = DownloadScheduler::new(100);
        sched.try_enqueue(QueueItem { id: 42, action: Action::Fileclient(Fileclient::Full) }).unwrap();
        assert!(!sched.downgrade_to_full(42));
    }

    #[test]
    fn retry_is_allowed_up_to_five_times() {
        let sched = DownloadScheduler::new(10);
        for _ in 0..5 {
            assert!(sched.record_retry(1));
        }
        assert!(!sched.record_retry(1));
    }

    #[test]
    fn nok_and_partial_ids_are_queryable_after_finalize() {
        let sched = DownloadScheduler::new(10);
        sched.record_nok(7);
        sched.record_partial(9);
        sched.finalize_outcomes();
        assert!(sched.is_nok(7));
        assert!(!sched.is_nok(9));
        assert!(sched.is_partial(9));
        assert!(!sched.is_partial(7));
    }

    #[test]
    fn id_range_binary_search_matches_added_ids() {
        let mut range = IdRange::new();
        for id in [5, 1, 3, 1] {
            range.add(id);
        }
        range.finalize();
        assert_eq!(range.len(), 3);
        assert!(range.has_id(1));
        assert!(range.has_id(5));
        assert!(!range.has_id(2));
    }
}
