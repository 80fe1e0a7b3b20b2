//! Bounded playback queue for synthesized sentences.

use cadence_types::TraceContext;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Default number of sentences a session may have waiting for playback.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One sentence waiting to be spoken.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub text: String,
    /// The answer this sentence belongs to.
    pub generation_id: String,
    pub sequence: i32,
    pub trace: Option<TraceContext>,
}

/// Why an item was not queued. The rejected item is handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferError {
    /// The queue is at capacity.
    Full(QueueItem),
    /// A later sentence of the same generation has already been taken for
    /// playback.
    Late(QueueItem),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    last_taken: Option<(String, i32)>,
}

/// FIFO across generations, ascending by sequence within one generation.
///
/// Single consumer: [`PlaybackQueue::recv`] is meant to be awaited by one
/// pacing worker at a time.
#[derive(Debug)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `item` without blocking.
    pub fn offer(&self, item: QueueItem) -> Result<(), OfferError> {
        let Ok(mut state) = self.state.lock() else {
            return Err(OfferError::Full(item));
        };

        if let Some((generation, sequence)) = &state.last_taken {
            if *generation == item.generation_id && *sequence > item.sequence {
                return Err(OfferError::Late(item));
            }
        }
        if state.items.len() >= self.capacity {
            return Err(OfferError::Full(item));
        }

        let position = insert_position(&state.items, &item);
        state.items.insert(position, item);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Removes every item not belonging to `current_generation`. Returns the
    /// number removed.
    ///
    /// Best-effort load shedding: only the items present when the drain runs
    /// are considered.
    pub fn drain_stale(&self, current_generation: &str) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let before = state.items.len();
        state
            .items
            .retain(|item| item.generation_id == current_generation);
        before - state.items.len()
    }

    /// Takes the next item, waiting until one is available.
    pub async fn recv(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().ok()?;
        let item = state.items.pop_front()?;
        state.last_taken = Some((item.generation_id.clone(), item.sequence));
        Some(item)
    }
}

/// After the last queued item of the same generation whose sequence does not
/// exceed the new one; before the first of that generation otherwise; at the
/// back when the generation has nothing queued.
fn insert_position(items: &VecDeque<QueueItem>, item: &QueueItem) -> usize {
    if let Some(i) = items
        .iter()
        .rposition(|q| q.generation_id == item.generation_id && q.sequence <= item.sequence)
    {
        return i + 1;
    }
    items
        .iter()
        .position(|q| q.generation_id == item.generation_id)
        .unwrap_or(items.len())
}
