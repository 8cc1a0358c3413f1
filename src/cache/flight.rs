//! Single-flight bookkeeping for concurrent misses.
//!
//! The first caller to miss on a key becomes the leader and holds a
//! [`FlightLease`]. Later callers become followers and wait on a watch
//! channel for the leader's serialized result. The entry is removed from the
//! table before the result is published, and again (if still present) when
//! the lease is dropped, so a crashed or cancelled leader never strands the
//! key.
//!
//! Every query run, led or not, also holds a [`RunGuard`]. An invalidation
//! marks the runs whose key it covers as stale and retires the matching
//! flights, so callers arriving after it start a fresh query and a stale run
//! never leaves its result in the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::keys::{CacheKey, KeyPattern};

/// `None` while in flight, `Some(None)` when the leader failed or its key was
/// invalidated, `Some(Some(payload))` on success.
type FlightState = Option<Option<Bytes>>;

const DRAIN_POLL: Duration = Duration::from_millis(10);

struct Slot {
    id: u64,
    outcome: watch::Receiver<FlightState>,
}

struct Run {
    key: CacheKey,
    stale: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct FlightTable {
    flights: DashMap<CacheKey, Slot>,
    runs: DashMap<u64, Run>,
    next_id: AtomicU64,
}

pub(crate) enum Flight {
    Leader(FlightLease),
    Follower(watch::Receiver<FlightState>),
}

impl FlightTable {
    /// Become the leader for `key`, or join the flight already running.
    pub(crate) fn join(self: &Arc<Self>, key: &CacheKey) -> Flight {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(slot) => Flight::Follower(slot.get().outcome.clone()),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, outcome) = watch::channel(None);
                vacant.insert(Slot { id, outcome });
                Flight::Leader(FlightLease {
                    table: Arc::clone(self),
                    key: key.clone(),
                    id,
                    sender: Some(sender),
                })
            }
        }
    }

    /// Wait for the leader. `None` means it failed or went away.
    pub(crate) async fn wait(mut outcome: watch::Receiver<FlightState>) -> Option<Bytes> {
        let published = outcome.wait_for(Option::is_some).await.ok()?;
        published.clone().flatten()
    }

    /// Register a query run for `key`. The run is tracked until the guard
    /// drops.
    pub(crate) fn start_run(self: &Arc<Self>, key: &CacheKey) -> RunGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stale = Arc::new(AtomicBool::new(false));
        self.runs.insert(
            id,
            Run {
                key: key.clone(),
                stale: Arc::clone(&stale),
            },
        );
        RunGuard {
            table: Arc::clone(self),
            id,
            stale,
        }
    }

    /// Mark runs under `pattern` stale and retire their flights. Returns how
    /// many runs were marked.
    ///
    /// Must happen before the store purge: a run that finishes its write
    /// after this call sees the mark and removes the entry again.
    pub(crate) fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let mut marked = 0;
        for run in self.runs.iter() {
            if pattern.matches(run.key.as_str()) {
                run.stale.store(true, Ordering::SeqCst);
                marked += 1;
            }
        }
        self.flights.retain(|key, _| !pattern.matches(key.as_str()));
        marked
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }

    /// Number of query runs in progress, led or not.
    pub(crate) fn running(&self) -> usize {
        self.runs.len()
    }

    /// Wait until no query is running, up to `grace`. Returns whether the
    /// table drained in time.
    pub(crate) async fn drain(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, async {
            while !self.runs.is_empty() || !self.flights.is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok()
    }

    fn release(&self, key: &CacheKey, id: u64) {
        self.flights.remove_if(key, |_, slot| slot.id == id);
    }
}

/// Leadership of one flight. Dropping it without calling
/// [`complete`](Self::complete) tells followers to compute on their own.
pub(crate) struct FlightLease {
    table: Arc<FlightTable>,
    key: CacheKey,
    id: u64,
    sender: Option<watch::Sender<FlightState>>,
}

impl FlightLease {
    pub(crate) fn complete(mut self, payload: Option<Bytes>) {
        self.table.release(&self.key, self.id);
        if let Some(sender) = self.sender.take() {
            // No receivers left is fine: nobody joined.
            let _ = sender.send(Some(payload));
        }
    }
}

impl Drop for FlightLease {
    fn drop(&mut self) {
        self.table.release(&self.key, self.id);
    }
}

/// One tracked query run.
pub(crate) struct RunGuard {
    table: Arc<FlightTable>,
    id: u64,
    stale: Arc<AtomicBool>,
}

impl RunGuard {
    /// True once an invalidation covered this run's key.
    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.table.runs.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CacheKey {
        let registry = Arc::new(crate::cache::registry::NamespaceRegistry::blog());
        crate::cache::keys::KeyBuilder::new(registry, false)
            .build(raw, &crate::cache::keys::QueryParams::new())
            .expect("key")
    }

    #[tokio::test]
    async fn followers_receive_the_leader_payload() {
        let table = Arc::new(FlightTable::default());
        let key = key("tag-list");

        let Flight::Leader(lease) = table.join(&key) else {
            panic!("first caller leads");
        };
        let Flight::Follower(outcome) = table.join(&key) else {
            panic!("second caller follows");
        };
        assert_eq!(table.len(), 1);

        let waiter = tokio::spawn(FlightTable::wait(outcome));
        lease.complete(Some(Bytes::from_static(b"[\"rust\"]")));

        assert_eq!(
            waiter.await.expect("join"),
            Some(Bytes::from_static(b"[\"rust\"]"))
        );
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers() {
        let table = Arc::new(FlightTable::default());
        let key = key("trending");

        let Flight::Leader(lease) = table.join(&key) else {
            panic!("first caller leads");
        };
        let Flight::Follower(outcome) = table.join(&key) else {
            panic!("second caller follows");
        };

        drop(lease);
        assert_eq!(FlightTable::wait(outcome).await, None);
        assert_eq!(table.len(), 0);
        assert!(matches!(table.join(&key), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn stale_lease_does_not_remove_a_newer_flight() {
        let table = Arc::new(FlightTable::default());
        let key = key("featured");

        let Flight::Leader(first) = table.join(&key) else {
            panic!("first caller leads");
        };
        table.release(&key, first.id);
        let Flight::Leader(_second) = table.join(&key) else {
            panic!("flight was released");
        };

        drop(first);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn invalidation_retires_matching_flights_and_marks_runs() {
        let table = Arc::new(FlightTable::default());
        let tags = key("tag-list");
        let trending = key("trending");

        let Flight::Leader(lease) = table.join(&tags) else {
            panic!("first caller leads");
        };
        let Flight::Follower(outcome) = table.join(&tags) else {
            panic!("second caller follows");
        };
        let run = table.start_run(&tags);
        let other_flight = table.join(&trending);
        let other_run = table.start_run(&trending);

        let pattern = KeyPattern::namespace("tag-list").expect("pattern");
        assert_eq!(table.invalidate(&pattern), 1);

        assert!(run.is_stale());
        assert!(!other_run.is_stale());
        assert_eq!(table.len(), 1);
        assert!(matches!(table.join(&tags), Flight::Leader(_)));

        lease.complete(None);
        assert_eq!(FlightTable::wait(outcome).await, None);
        drop(other_flight);
    }

    #[tokio::test]
    async fn finished_runs_leave_the_table() {
        let table = Arc::new(FlightTable::default());
        let run = table.start_run(&key("featured"));
        assert_eq!(table.running(), 1);
        drop(run);
        assert_eq!(table.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_a_flight_is_running() {
        let table = Arc::new(FlightTable::default());
        let key = key("tag-list");
        let lease = table.join(&key);

        assert!(!table.drain(Duration::from_millis(50)).await);
        drop(lease);
        assert!(table.drain(Duration::from_millis(50)).await);
    }
}
