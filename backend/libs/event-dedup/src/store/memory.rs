use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{BatchTx, EventStore};
use crate::counters::{CounterDelta, Counters};
use crate::error::{DedupError, DedupResult};
use crate::model::{Event, EventKey, InsertOutcome, StoredEvent};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// In-process store with the same transactional contract as
/// [`super::PgEventStore`].
///
/// Inserted rows are held as pending under the owning batch until it
/// commits. Another batch inserting the same key waits for the owner to
/// finish, then sees either a committed row (conflict) or a free slot, the
/// way a unique index behaves under concurrent transactions. The wait is
/// bounded by `lock_wait`; on expiry the waiting batch fails.
///
/// Waits are tracked as edges of a wait-for graph. A wait that would close
/// a cycle fails at once with [`DedupError::Deadlock`], so only the batch
/// that closed it aborts and the others proceed once it rolls back.
#[derive(Clone)]
pub struct MemoryEventStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    released: Notify,
    next_tx: AtomicU64,
    failing_commits: AtomicUsize,
    lock_wait: Duration,
}

#[derive(Default)]
struct State {
    rows: HashMap<EventKey, Slot>,
    /// Waiting batch -> batch owning the key it waits for
    waiting_on: HashMap<u64, u64>,
    last_id: i64,
    counters: Option<Counters>,
}

struct Slot {
    /// Batch that inserted the row and has not committed yet
    owner: Option<u64>,
    event: StoredEvent,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                failing_commits: AtomicUsize::new(0),
                lock_wait,
            }),
        }
    }

    /// Make the next `n` commits fail and roll back (fault injection).
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.failing_commits.store(n, Ordering::SeqCst);
    }
}

impl State {
    /// Whether `waiter` waiting on `owner` would close a cycle.
    fn closes_cycle(&self, waiter: u64, owner: u64) -> bool {
        let mut current = owner;
        // Every hop visits a distinct batch unless there is already a cycle
        for _ in 0..=self.waiting_on.len() {
            if current == waiter {
                return true;
            }
            match self.waiting_on.get(&current) {
                Some(&next) => current = next,
                None => return false,
            }
        }
        false
    }
}

impl Shared {
    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn discard(&self, tx_id: u64, staged: &[EventKey]) {
        {
            let mut state = self.state.lock();
            state.waiting_on.remove(&tx_id);
            for key in staged {
                if state.rows.get(key).and_then(|slot| slot.owner) == Some(tx_id) {
                    state.rows.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }
}

struct MemoryBatchTx {
    shared: Arc<Shared>,
    tx_id: u64,
    staged: Vec<EventKey>,
    delta: Option<CounterDelta>,
    finished: bool,
}

impl Drop for MemoryBatchTx {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.discard(self.tx_id, &self.staged);
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn begin_batch(&self) -> DedupResult<Box<dyn BatchTx>> {
        let tx_id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryBatchTx {
            shared: Arc::clone(&self.shared),
            tx_id,
            staged: Vec::new(),
            delta: None,
            finished: false,
        }))
    }

    async fn ensure_counters(&self) -> DedupResult<bool> {
        let mut state = self.shared.state.lock();
        if state.counters.is_some() {
            return Ok(false);
        }
        state.counters = Some(Counters::zero(Utc::now()));
        Ok(true)
    }

    async fn counters(&self) -> DedupResult<Option<Counters>> {
        Ok(self.shared.state.lock().counters.clone())
    }

    async fn list_events(
        &self,
        topic: Option<&str>,
        limit: i64,
    ) -> DedupResult<Vec<StoredEvent>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.shared.state.lock();

        let mut events: Vec<StoredEvent> = state
            .rows
            .values()
            .filter(|slot| slot.owner.is_none())
            .filter(|slot| topic.map_or(true, |t| slot.event.topic == t))
            .map(|slot| slot.event.clone())
            .collect();

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn distinct_topics(&self) -> DedupResult<Vec<String>> {
        let state = self.shared.state.lock();
        let topics: BTreeSet<&str> = state
            .rows
            .values()
            .filter(|slot| slot.owner.is_none())
            .map(|slot| slot.event.topic.as_str())
            .collect();

        Ok(topics.into_iter().map(str::to_string).collect())
    }
}

#[async_trait]
impl BatchTx for MemoryBatchTx {
    async fn try_insert(&mut self, event: &Event) -> DedupResult<InsertOutcome> {
        let shared = Arc::clone(&self.shared);
        let key = event.key();
        let deadline = Instant::now() + shared.lock_wait;

        loop {
            // Registered before inspecting state so a release between the
            // check and the wait is not missed.
            let released = shared.released.notified();

            {
                let mut state = shared.state.lock();
                state.waiting_on.remove(&self.tx_id);

                match state.rows.get(&key).map(|slot| slot.owner) {
                    None => {
                        state.last_id += 1;
                        let stored = StoredEvent {
                            id: state.last_id,
                            topic: event.topic.clone(),
                            event_id: event.event_id.clone(),
                            source: event.source.clone(),
                            timestamp: event.timestamp,
                            payload: event.payload.clone(),
                            received_at: Utc::now(),
                        };
                        state.rows.insert(
                            key.clone(),
                            Slot {
                                owner: Some(self.tx_id),
                                event: stored,
                            },
                        );
                        self.staged.push(key);
                        return Ok(InsertOutcome::Accepted);
                    }
                    Some(None) => {
                        debug!(topic = %key.topic, event_id = %key.event_id, "Duplicate event (key already stored)");
                        return Ok(InsertOutcome::Conflict);
                    }
                    Some(Some(owner)) if owner == self.tx_id => {
                        debug!(topic = %key.topic, event_id = %key.event_id, "Duplicate event within batch");
                        return Ok(InsertOutcome::Conflict);
                    }
                    Some(Some(owner)) => {
                        if state.closes_cycle(self.tx_id, owner) {
                            debug!(
                                topic = %key.topic,
                                event_id = %key.event_id,
                                tx = self.tx_id,
                                owner,
                                "Deadlock detected, aborting waiter"
                            );
                            return Err(DedupError::Deadlock {
                                topic: key.topic,
                                event_id: key.event_id,
                            });
                        }
                        state.waiting_on.insert(self.tx_id, owner);
                    }
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                shared.state.lock().waiting_on.remove(&self.tx_id);
                return Err(DedupError::LockTimeout {
                    topic: key.topic,
                    event_id: key.event_id,
                });
            }
        }
    }

    async fn apply_delta(&mut self, delta: CounterDelta) -> DedupResult<()> {
        self.delta = Some(match self.delta {
            Some(staged) => staged.merge(delta),
            None => delta,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DedupResult<()> {
        let mut this = self;
        this.finished = true;

        if this.shared.take_commit_failure() {
            this.shared.discard(this.tx_id, &this.staged);
            return Err(DedupError::Unavailable(
                "commit rejected by storage".to_string(),
            ));
        }

        {
            let mut state = this.shared.state.lock();
            state.waiting_on.remove(&this.tx_id);
            for key in &this.staged {
                if let Some(slot) = state.rows.get_mut(key) {
                    slot.owner = None;
                }
            }
            if let Some(delta) = this.delta {
                let now = Utc::now();
                state
                    .counters
                    .get_or_insert_with(|| Counters::zero(now))
                    .apply(&delta, now);
            }
        }
        this.shared.released.notify_waiters();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DedupResult<()> {
        let mut this = self;
        this.finished = true;
        this.shared.discard(this.tx_id, &this.staged);
        Ok(())
    }
}
