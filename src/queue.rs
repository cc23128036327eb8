//! Bounded event queue with watermark-driven backpressure (C2).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::BusError;

/// Overflow strategy applied when [`BoundedEventQueue::put`] finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    DropOldest,
    RejectNew,
    AdaptiveRateLimit,
}

/// Snapshot of a queue's health counters.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
    pub total_rejected: u64,
    pub high_water_mark_hits: u64,
    pub last_high_water_mark: Option<DateTime<Utc>>,
    pub current_size: usize,
    pub max_size_reached: usize,
}

const RATE_LIMIT_STEP: Duration = Duration::from_millis(1);
const RATE_LIMIT_CAP: Duration = Duration::from_millis(100);

struct Inner<T> {
    items: VecDeque<T>,
    backpressure_active: bool,
    rate_limit_delay: Duration,
    metrics: QueueMetrics,
}

/// A FIFO of items with a hard size cap and a policy-driven overflow strategy.
///
/// Blocking `get` is implemented with a [`tokio::sync::Notify`] rather than a
/// condvar, matching this crate's async-first concurrency model; the queue's
/// own state is a plain `std::sync::Mutex` since every critical section here
/// is non-blocking and short.
pub struct BoundedEventQueue<T> {
    maxsize: usize,
    high_water: usize,
    low_water: usize,
    strategy: BackpressureStrategy,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    on_high_water: Option<Box<dyn Fn() + Send + Sync>>,
    on_low_water: Option<Box<dyn Fn() + Send + Sync>>,
}

pub struct BoundedEventQueueBuilder<T> {
    maxsize: usize,
    high_water: f64,
    low_water: f64,
    strategy: BackpressureStrategy,
    on_high_water: Option<Box<dyn Fn() + Send + Sync>>,
    on_low_water: Option<Box<dyn Fn() + Send + Sync>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for BoundedEventQueueBuilder<T> {
    fn default() -> Self {
        Self {
            maxsize: 10_000,
            high_water: 0.8,
            low_water: 0.5,
            strategy: BackpressureStrategy::DropOldest,
            on_high_water: None,
            on_low_water: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> BoundedEventQueueBuilder<T> {
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.maxsize = maxsize;
        self
    }

    pub fn watermarks(mut self, low: f64, high: f64) -> Self {
        self.low_water = low;
        self.high_water = high;
        self
    }

    pub fn strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn on_high_water(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_high_water = Some(Box::new(f));
        self
    }

    pub fn on_low_water(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_low_water = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<BoundedEventQueue<T>, BusError> {
        if !(0.0 < self.low_water && self.low_water < self.high_water && self.high_water <= 1.0) {
            return Err(BusError::InvalidWatermarks { low: self.low_water, high: self.high_water });
        }
        Ok(BoundedEventQueue {
            maxsize: self.maxsize,
            high_water: (self.maxsize as f64 * self.high_water) as usize,
            low_water: (self.maxsize as f64 * self.low_water) as usize,
            strategy: self.strategy,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                backpressure_active: false,
                rate_limit_delay: Duration::ZERO,
                metrics: QueueMetrics::default(),
            }),
            not_empty: Notify::new(),
            on_high_water: self.on_high_water,
            on_low_water: self.on_low_water,
        })
    }
}

impl<T> BoundedEventQueue<T> {
    pub fn builder() -> BoundedEventQueueBuilder<T> {
        BoundedEventQueueBuilder::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `item`. Returns `true` if accepted. May sleep (only) to honor
    /// an active adaptive rate limit delay.
    pub async fn put(&self, item: T) -> bool {
        if self.strategy == BackpressureStrategy::AdaptiveRateLimit {
            let delay = self.lock().rate_limit_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let mut guard = self.lock();
        if guard.items.len() >= self.maxsize {
            return self.handle_overflow(&mut guard, item);
        }
        self.insert(&mut guard, item);
        true
    }

    fn insert(&self, guard: &mut Inner<T>, item: T) {
        guard.items.push_back(item);
        guard.metrics.total_enqueued += 1;
        let size = guard.items.len();
        guard.metrics.current_size = size;
        guard.metrics.max_size_reached = guard.metrics.max_size_reached.max(size);

        if size >= self.high_water && !guard.backpressure_active {
            self.activate_backpressure(guard);
        }
        self.not_empty.notify_one();
    }

    fn handle_overflow(&self, guard: &mut Inner<T>, item: T) -> bool {
        if guard.items.len() < self.maxsize {
            self.insert(guard, item);
            return true;
        }
        match self.strategy {
            BackpressureStrategy::DropOldest => {
                guard.items.pop_front();
                guard.metrics.total_dropped += 1;
                self.insert(guard, item);
                true
            }
            BackpressureStrategy::RejectNew => {
                guard.metrics.total_rejected += 1;
                false
            }
            BackpressureStrategy::AdaptiveRateLimit => {
                guard.rate_limit_delay = (guard.rate_limit_delay + RATE_LIMIT_STEP).min(RATE_LIMIT_CAP);
                guard.metrics.total_rejected += 1;
                false
            }
        }
    }

    fn activate_backpressure(&self, guard: &mut Inner<T>) {
        guard.backpressure_active = true;
        guard.metrics.high_water_mark_hits += 1;
        guard.metrics.last_high_water_mark = Some(Utc::now());
        if let Some(cb) = &self.on_high_water {
            cb();
        }
    }

    fn deactivate_backpressure(&self, guard: &mut Inner<T>) {
        guard.backpressure_active = false;
        if self.strategy == BackpressureStrategy::AdaptiveRateLimit {
            guard.rate_limit_delay /= 2;
        }
        if let Some(cb) = &self.on_low_water {
            cb();
        }
    }

    /// Remove and return the next item, blocking until one is available.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.get_nowait() {
                return item;
            }
            self.not_empty.notified().await;
        }
    }

    pub fn get_nowait(&self) -> Option<T> {
        let mut guard = self.lock();
        let item = guard.items.pop_front()?;
        guard.metrics.total_dequeued += 1;
        let size = guard.items.len();
        guard.metrics.current_size = size;
        if size <= self.low_water && guard.backpressure_active {
            self.deactivate_backpressure(&mut guard);
        }
        Some(item)
    }

    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.maxsize
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.lock().backpressure_active
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.lock().metrics.clone()
    }

    /// Drain every currently-enqueued item matching `keep`, leaving items for
    /// which `keep` returns `false` (i.e. "put back") still queued, in their
    /// original relative order. Used by the dispatch loop to pull
    /// non-scheduled events while leaving not-yet-due scheduled events behind.
    pub fn drain_matching(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut guard = self.lock();
        let all: Vec<T> = guard.items.drain(..).collect();
        let (taken, kept): (Vec<T>, Vec<T>) = all.into_iter().partition(|item| keep(item));
        guard.items = VecDeque::from(kept);
        let size = guard.items.len();
        guard.metrics.current_size = size;
        guard.metrics.total_dequeued += taken.len() as u64;
        if size <= self.low_water && guard.backpressure_active {
            self.deactivate_backpressure(&mut guard);
        }
        taken
    }

    pub fn clear(&self) {
        let mut guard = self.lock();
        guard.items.clear();
        guard.metrics.current_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_watermarks() {
        let result = BoundedEventQueue::<i32>::builder().watermarks(0.9, 0.5).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let q = BoundedEventQueue::<i32>::builder().maxsize(4).build().unwrap();
        assert!(q.put(1).await);
        assert!(q.put(2).await);
        assert_eq!(q.get().await, 1);
        assert_eq!(q.get().await, 2);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_n() {
        let q = BoundedEventQueue::<i32>::builder()
            .maxsize(5)
            .strategy(BackpressureStrategy::DropOldest)
            .build()
            .unwrap();
        for i in 0..10 {
            q.put(i).await;
        }
        let metrics = q.metrics();
        assert_eq!(metrics.total_enqueued, 10);
        assert_eq!(metrics.total_dropped, 5);
        let mut remaining = Vec::new();
        while let Some(v) = q.get_nowait() {
            remaining.push(v);
        }
        assert_eq!(remaining, vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn reject_new_refuses_when_full() {
        let q = BoundedEventQueue::<i32>::builder()
            .maxsize(2)
            .strategy(BackpressureStrategy::RejectNew)
            .build()
            .unwrap();
        assert!(q.put(1).await);
        assert!(q.put(2).await);
        assert!(!q.put(3).await);
        assert_eq!(q.metrics().total_rejected, 1);
    }

    #[tokio::test]
    async fn maxsize_one_works_for_all_strategies() {
        for strategy in [
            BackpressureStrategy::DropOldest,
            BackpressureStrategy::RejectNew,
            BackpressureStrategy::AdaptiveRateLimit,
        ] {
            let q = BoundedEventQueue::<i32>::builder().maxsize(1).strategy(strategy).build().unwrap();
            assert!(q.put(1).await);
            assert!(q.size() <= 1);
            q.put(2).await;
            assert!(q.size() <= 1);
        }
    }

    #[tokio::test]
    async fn watermark_hysteresis() {
        let q = BoundedEventQueue::<i32>::builder()
            .maxsize(10)
            .watermarks(0.5, 0.8)
            .build()
            .unwrap();
        for i in 0..8 {
            q.put(i).await;
        }
        assert!(q.is_backpressure_active());
        for _ in 0..3 {
            q.get_nowait();
        }
        assert!(!q.is_backpressure_active());
    }

    #[tokio::test]
    async fn drain_matching_keeps_unmatched_items_queued() {
        let q = BoundedEventQueue::<i32>::builder().maxsize(10).build().unwrap();
        for i in 0..5 {
            q.put(i).await;
        }
        let taken = q.drain_matching(|v| v % 2 == 0);
        assert_eq!(taken, vec![0, 2, 4]);
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn get_blocks_until_item_available() {
        let q = Arc::new(BoundedEventQueue::<i32>::builder().maxsize(4).build().unwrap());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.put(42).await;
        let got = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(got, 42);
    }
}
