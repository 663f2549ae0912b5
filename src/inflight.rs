use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;
use tokio::time::{interval_at, sleep_until, Instant, Interval, Sleep};
use tracing::debug;

use crate::pool::SocketId;

/// The 16-bit ID field bounds how many queries can be in flight.
pub const MAX_POSSIBLE_QUERIES: usize = u16::MAX as usize + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocateError {
    #[error("maximum number of outstanding requests reached")]
    Saturated,
    #[error("out of free query IDs")]
    NoFreeId,
}

/// A forwarded query awaiting its response.
pub struct InflightQuery {
    /// The pool socket the query left through.  The response must
    /// arrive on the same one.
    pub upstream_socket: SocketId,
    /// When the query becomes eligible for garbage collection.
    pub expiration: Instant,
    /// Where to return the response.
    pub client: SocketAddr,
    /// The raw question section as the client sent it.  The response
    /// must carry it byte for byte.
    pub question: Bytes,
    /// The ID the client used.  Restored before delivery; on the wire
    /// we replace it with a random one.
    pub original_query_id: u16,
}

enum TimerState {
    /// No outstanding queries, or expiration is disabled.
    Disarmed,
    /// Ticking every `min_gc_time` because the oldest query would
    /// expire sooner than that.
    Periodic(Interval),
    /// A one-shot set to exactly when the oldest query expires.
    Exact(Pin<Box<Sleep>>),
}

/// The table of forwarded queries: allocates the proxied IDs, keeps
/// the per-query state for response validation, and drives the garbage
/// collection timer the event loop waits on.
pub struct InflightTable {
    max_requests: usize,
    request_timeout: Duration,
    min_gc_time: Duration,
    debug_checks: bool,

    /// Proxied query ID -> forwarded query.  Ordered by ID, which
    /// `allocate_id` depends on.
    requests: BTreeMap<u16, InflightQuery>,
    /// (expiration, proxied query ID) pairs, oldest first.
    expirations: BTreeSet<(Instant, u16)>,
    timer: TimerState,
}

impl InflightTable {
    pub fn new(
        max_requests: usize,
        request_timeout: Duration,
        min_gc_time: Duration,
        debug_checks: bool,
    ) -> Self {
        Self {
            max_requests,
            request_timeout,
            min_gc_time,
            debug_checks,
            requests: BTreeMap::new(),
            expirations: BTreeSet::new(),
            timer: TimerState::Disarmed,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.requests.len()
    }

    /// Pick a random query ID not used by any ongoing request.  Does
    /// not reserve it; pair with `record` once the query is actually
    /// forwarded.
    pub fn allocate_id(&self, rng: &mut StdRng) -> Result<u16, AllocateError> {
        if self.max_requests != 0 && self.requests.len() >= self.max_requests {
            return Err(AllocateError::Saturated);
        }
        if self.requests.len() >= MAX_POSSIBLE_QUERIES {
            return Err(AllocateError::NoFreeId);
        }

        let k = rng.random_range(0..=u16::MAX as usize - self.requests.len()) as u16;
        let id = self.nth_free_id(k);

        if self.debug_checks {
            assert!(!self.requests.contains_key(&id));
            // `id` is the k-th free ID iff exactly `id - k` used IDs
            // precede it.
            let used_below = self.requests.keys().take_while(|&&used| used < id).count();
            assert_eq!(used_below, id as usize - k as usize);
        }

        Ok(id)
    }

    /// Select the k-th (0-indexed) free ID in a single pass over the
    /// used IDs in ascending order.
    fn nth_free_id(&self, k: u16) -> u16 {
        let mut k = k as u32;
        let mut next_free: u32 = 0;
        for &used in self.requests.keys() {
            let nfree = used as u32 - next_free;
            if k < nfree {
                break;
            }
            k -= nfree;
            next_free = used as u32 + 1;
        }
        (next_free + k) as u16
    }

    /// Called when a query was actually forwarded under `query_id`.
    pub fn record(
        &mut self,
        query_id: u16,
        upstream_socket: SocketId,
        client: SocketAddr,
        question: Bytes,
        original_query_id: u16,
    ) {
        let expiration = Instant::now() + self.request_timeout;
        let prev = self.requests.insert(
            query_id,
            InflightQuery {
                upstream_socket,
                expiration,
                client,
                question,
                original_query_id,
            },
        );
        debug_assert!(prev.is_none(), "query ID {query_id} already in flight");

        if self.request_timeout.is_zero() {
            return;
        }

        let was_empty = self.expirations.is_empty();
        self.expirations.insert((expiration, query_id));
        if was_empty {
            self.rearm_timer();
        }
    }

    /// The outstanding query identified by `query_id`, if any.
    pub fn lookup(&self, query_id: u16) -> Option<&InflightQuery> {
        self.requests.get(&query_id)
    }

    /// Called when a query is done and its state can be dropped.
    pub fn complete(&mut self, query_id: u16) {
        let Some(request) = self.requests.remove(&query_id) else {
            debug_assert!(false, "completing unknown query ID {query_id}");
            return;
        };

        if self.request_timeout.is_zero() {
            return;
        }

        let key = (request.expiration, query_id);
        let was_oldest = self.expirations.first() == Some(&key);
        let removed = self.expirations.remove(&key);
        debug_assert!(removed);

        if was_oldest {
            // The next garbage collection is due at a different time
            // now.
            self.rearm_timer();
        }
    }

    /// Called when the timer fires.  Drops every query expired at
    /// `now`, handing each to `on_expired` first.
    pub fn collect_expired(&mut self, now: Instant, mut on_expired: impl FnMut(&InflightQuery)) {
        debug_assert!(!self.request_timeout.is_zero());

        let mut removed_any = false;
        while let Some(&(expiration, query_id)) = self.expirations.first() {
            if expiration > now {
                break;
            }
            self.expirations.pop_first();
            if let Some(request) = self.requests.remove(&query_id) {
                debug!(query_id, "request timed out");
                on_expired(&request);
            }
            removed_any = true;
        }

        if removed_any {
            self.rearm_timer();
        }
    }

    /// Resolves when garbage collection is due.  Pends forever while
    /// the timer is disarmed.  Cancel safe.
    pub async fn gc_tick(&mut self) {
        match &mut self.timer {
            TimerState::Disarmed => std::future::pending().await,
            TimerState::Periodic(interval) => {
                interval.tick().await;
            }
            TimerState::Exact(sleep) => {
                sleep.as_mut().await;
                // One-shot; `collect_expired` re-arms as needed.
                self.timer = TimerState::Disarmed;
            }
        }
    }

    fn rearm_timer(&mut self) {
        let Some(&(oldest, _)) = self.expirations.first() else {
            self.timer = TimerState::Disarmed;
            return;
        };

        // `oldest` can be expired already, but then it will be
        // collected on the very next tick.
        let now = Instant::now();
        if !self.min_gc_time.is_zero() && oldest < now + self.min_gc_time {
            if matches!(self.timer, TimerState::Periodic(_)) {
                // Keep the existing cadence.
                return;
            }
            self.timer = TimerState::Periodic(interval_at(now + self.min_gc_time, self.min_gc_time));
        } else {
            self.timer = TimerState::Exact(Box::pin(sleep_until(oldest)));
        }
    }

    #[cfg(test)]
    fn timer_state(&self) -> &'static str {
        match self.timer {
            TimerState::Disarmed => "disarmed",
            TimerState::Periodic(_) => "periodic",
            TimerState::Exact(_) => "exact",
        }
    }

    #[cfg(test)]
    fn expiration_count(&self) -> usize {
        self.expirations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tokio::time::timeout;

    fn table(max_requests: usize, timeout_secs: u64, min_gc_secs: u64) -> InflightTable {
        InflightTable::new(
            max_requests,
            Duration::from_secs(timeout_secs),
            Duration::from_secs(min_gc_secs),
            true,
        )
    }

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn record(table: &mut InflightTable, query_id: u16) {
        table.record(query_id, 0, client(), Bytes::new(), query_id);
    }

    #[test]
    fn selects_the_nth_free_id() {
        let mut table = table(0, 0, 0);
        record(&mut table, 3);
        record(&mut table, 7);

        assert_eq!(table.nth_free_id(0), 0);
        assert_eq!(table.nth_free_id(2), 2);
        assert_eq!(table.nth_free_id(3), 4);
        assert_eq!(table.nth_free_id(6), 8);
    }

    #[test]
    fn allocate_never_returns_a_used_id() {
        let mut table = table(0, 0, 0);
        record(&mut table, 3);
        record(&mut table, 7);

        // The internal sanity checks re-verify every selection.
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..2000 {
            let id = table.allocate_id(&mut rng).unwrap();
            assert_ne!(id, 3);
            assert_ne!(id, 7);
        }
    }

    #[test]
    fn allocate_is_uniform_over_free_ids() {
        let table = table(0, 0, 0);
        let mut rng = StdRng::seed_from_u64(42);
        let mut buckets = [0u32; 16];
        for _ in 0..20_000 {
            let id = table.allocate_id(&mut rng).unwrap();
            buckets[(id >> 12) as usize] += 1;
        }
        // 20000 draws over 16 buckets: expect 1250 each, allow a wide
        // margin since the seed is fixed anyway.
        for &count in &buckets {
            assert!(
                (1050..=1450).contains(&count),
                "bucket count {count} outside tolerance"
            );
        }
    }

    #[test]
    fn allocate_saturates_at_max_requests() {
        let mut table = table(2, 0, 0);
        record(&mut table, 10);
        record(&mut table, 20);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(table.allocate_id(&mut rng), Err(AllocateError::Saturated));

        table.complete(10);
        assert!(table.allocate_id(&mut rng).is_ok());
    }

    #[test]
    fn allocate_runs_out_of_ids_at_the_id_space_boundary() {
        let mut table = table(0, 0, 0);
        for id in 0..=u16::MAX {
            record(&mut table, id);
        }
        assert_eq!(table.len(), MAX_POSSIBLE_QUERIES);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(table.allocate_id(&mut rng), Err(AllocateError::NoFreeId));
    }

    #[tokio::test]
    async fn complete_forgets_the_request() {
        let mut table = table(0, 15, 5);
        record(&mut table, 42);
        assert!(table.lookup(42).is_some());

        table.complete(42);
        assert!(table.lookup(42).is_none());
        assert_eq!(table.expiration_count(), 0);
        assert_eq!(table.timer_state(), "disarmed");
    }

    #[test]
    fn disabled_expiration_never_touches_the_index() {
        let mut table = table(0, 0, 5);
        record(&mut table, 1);
        record(&mut table, 2);
        assert_eq!(table.expiration_count(), 0);
        assert_eq!(table.timer_state(), "disarmed");

        table.complete(1);
        table.complete(2);
        assert_eq!(table.timer_state(), "disarmed");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_follows_the_oldest_expiration() {
        let mut table = table(0, 15, 5);
        record(&mut table, 1);
        // 15 s away is further than the coalescing interval.
        assert_eq!(table.timer_state(), "exact");

        tokio::time::advance(Duration::from_secs(2)).await;
        record(&mut table, 2);
        assert_eq!(table.timer_state(), "exact");

        // Past the first expiration but before the second.
        tokio::time::advance(Duration::from_millis(13_100)).await;
        let mut expired = Vec::new();
        table.collect_expired(Instant::now(), |req| expired.push(req.original_query_id));
        assert_eq!(expired, vec![1]);
        // The survivor expires in 1.9 s, sooner than the coalescing
        // interval.
        assert_eq!(table.timer_state(), "periodic");

        // Collecting again at the same instant is a no-op and keeps
        // the cadence.
        table.collect_expired(Instant::now(), |_| panic!("nothing left to expire"));
        assert_eq!(table.timer_state(), "periodic");

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut expired = Vec::new();
        table.collect_expired(Instant::now(), |req| expired.push(req.original_query_id));
        assert_eq!(expired, vec![2]);
        assert_eq!(table.timer_state(), "disarmed");
    }

    #[tokio::test(start_paused = true)]
    async fn completing_the_oldest_reprograms_the_timer() {
        let mut table = table(0, 15, 5);
        record(&mut table, 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        record(&mut table, 2);

        table.complete(1);
        assert_eq!(table.timer_state(), "exact");
        table.complete(2);
        assert_eq!(table.timer_state(), "disarmed");
    }

    #[tokio::test(start_paused = true)]
    async fn gc_tick_fires_at_the_exact_deadline() {
        let mut table = table(0, 15, 0);
        record(&mut table, 1);

        timeout(Duration::from_secs(16), table.gc_tick())
            .await
            .expect("timer should have fired");
        // One-shot: collection re-arms it.
        assert_eq!(table.timer_state(), "disarmed");
        let mut expired = Vec::new();
        table.collect_expired(Instant::now(), |req| expired.push(req.original_query_id));
        assert_eq!(expired, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_tick_pends_while_disarmed() {
        let mut table = table(0, 15, 5);
        assert!(timeout(Duration::from_secs(3600), table.gc_tick())
            .await
            .is_err());
    }
}
