//! Progress aggregation for a task's concurrent stream fetches.
//!
//! Raw `(delta, instant)` samples from every stream of a task are folded into
//! one [`ProgressSnapshot`]. Rate is measured over a trailing window, and
//! publishing is coalesced to at most one snapshot per interval: samples in
//! between only update internal counters, they are never queued.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::task::TaskState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub state: TaskState,
    pub stage: String,
    pub bytes_received: u64,
    /// `None` until every constituent stream has a known size.
    pub bytes_total: Option<u64>,
    pub rate_bytes_per_sec: f64,
    pub eta_secs: Option<u64>,
}

impl ProgressSnapshot {
    pub fn for_state(state: TaskState) -> Self {
        Self {
            state,
            stage: state.label().to_string(),
            bytes_received: 0,
            bytes_total: None,
            rate_bytes_per_sec: 0.0,
            eta_secs: None,
        }
    }

    /// Same byte counters, new state. Rate and ETA are dropped.
    pub fn with_state(&self, state: TaskState) -> Self {
        Self {
            state,
            stage: state.label().to_string(),
            bytes_received: self.bytes_received,
            bytes_total: self.bytes_total,
            rate_bytes_per_sec: 0.0,
            eta_secs: None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => None,
            Some(total) => Some((self.bytes_received as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

pub type StreamSlot = usize;

#[derive(Debug, Clone, Default)]
struct StreamProgress {
    total: Option<u64>,
    position: u64,
    high_water: u64,
}

#[derive(Debug)]
pub struct ProgressAggregator {
    streams: Vec<StreamProgress>,
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    interval: Duration,
    first_sample: Option<Instant>,
    last_publish: Option<Instant>,
    item_index: usize,
    item_count: usize,
}

impl ProgressAggregator {
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self {
            streams: Vec::new(),
            samples: VecDeque::new(),
            window,
            interval,
            first_sample: None,
            last_publish: None,
            item_index: 0,
            item_count: 1,
        }
    }

    pub fn add_stream(&mut self, total: Option<u64>) -> StreamSlot {
        self.streams.push(StreamProgress {
            total,
            ..StreamProgress::default()
        });
        self.streams.len() - 1
    }

    pub fn set_item(&mut self, index: usize, count: usize) {
        self.item_index = index;
        self.item_count = count.max(1);
    }

    /// A size learned from the transfer itself replaces the declared one.
    pub fn set_total(&mut self, slot: StreamSlot, total: Option<u64>) {
        if let (Some(stream), Some(total)) = (self.streams.get_mut(slot), total) {
            stream.total = Some(total);
        }
    }

    /// The stream is being fetched again from byte zero. Reported bytes hold
    /// at the previous high-water mark until the new transfer passes it.
    pub fn restart_stream(&mut self, slot: StreamSlot) {
        if let Some(stream) = self.streams.get_mut(slot) {
            stream.position = 0;
        }
    }

    /// Records a sample; returns a snapshot when one is due for publishing.
    pub fn record(&mut self, slot: StreamSlot, delta: u64, now: Instant) -> Option<ProgressSnapshot> {
        if let Some(stream) = self.streams.get_mut(slot) {
            stream.position = stream.position.saturating_add(delta);
            stream.high_water = stream.high_water.max(stream.position);
        }
        if delta > 0 {
            self.first_sample.get_or_insert(now);
            self.samples.push_back((now, delta));
        }
        self.trim_window(now);
        let due = match self.last_publish {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if due {
            Some(self.publish(now))
        } else {
            None
        }
    }

    /// Marks a stream complete; its size becomes the number of bytes received.
    pub fn finish_stream(&mut self, slot: StreamSlot, now: Instant) -> ProgressSnapshot {
        if let Some(stream) = self.streams.get_mut(slot) {
            stream.high_water = stream.high_water.max(stream.position);
            stream.total = Some(stream.high_water);
        }
        self.publish(now)
    }

    /// Forces a snapshot regardless of the publish interval.
    pub fn publish(&mut self, now: Instant) -> ProgressSnapshot {
        self.last_publish = Some(now);
        self.snapshot(now)
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let bytes_received = self.bytes_received();
        let bytes_total = self.bytes_total();
        let rate = self.rate(now);
        let eta_secs = match bytes_total {
            Some(total) if rate > 0.0 => {
                Some((total.saturating_sub(bytes_received) as f64 / rate).ceil() as u64)
            }
            _ => None,
        };
        ProgressSnapshot {
            state: TaskState::Downloading,
            stage: self.stage_label(bytes_received, bytes_total, rate, eta_secs),
            bytes_received,
            bytes_total,
            rate_bytes_per_sec: rate,
            eta_secs,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.streams.iter().map(|stream| stream.high_water).sum()
    }

    pub fn bytes_total(&self) -> Option<u64> {
        self.streams
            .iter()
            .try_fold(0u64, |acc, stream| stream.total.map(|total| acc + total))
    }

    fn rate(&self, now: Instant) -> f64 {
        let Some(first) = self.first_sample else {
            return 0.0;
        };
        let bytes: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.window)
            .map(|(_, delta)| *delta)
            .sum();
        // Early on the window is not full yet; divide by what has elapsed.
        let span = now
            .saturating_duration_since(first)
            .min(self.window)
            .max(Duration::from_millis(50));
        bytes as f64 / span.as_secs_f64()
    }

    fn trim_window(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn stage_label(
        &self,
        received: u64,
        total: Option<u64>,
        rate: f64,
        eta_secs: Option<u64>,
    ) -> String {
        let mut parts = Vec::new();
        match total {
            Some(total) => parts.push(format!("{} / {}", format_bytes(received), format_bytes(total))),
            None => parts.push(format_bytes(received)),
        }
        if rate > 0.0 {
            parts.push(format!("{}/s", format_bytes(rate as u64)));
        }
        if let Some(eta) = eta_secs {
            parts.push(format!("ETA {}", format_eta(eta)));
        }
        let prefix = if self.item_count > 1 {
            format!("Downloading item {} of {}", self.item_index + 1, self.item_count)
        } else {
            "Downloading".to_string()
        };
        format!("{}: {}", prefix, parts.join(" · "))
    }
}

type PublishFn = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// An aggregator shared by the stream threads of one task.
///
/// Snapshots are handed to `publish` while the aggregator lock is held, so two
/// streams finishing at once can never deliver their snapshots out of order.
pub struct SharedProgress {
    inner: Mutex<ProgressAggregator>,
    publish: PublishFn,
}

impl SharedProgress {
    pub fn new<F>(aggregator: ProgressAggregator, publish: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        Self {
            inner: Mutex::new(aggregator),
            publish: Box::new(publish),
        }
    }

    pub fn add_stream(&self, total: Option<u64>) -> StreamSlot {
        match self.inner.lock() {
            Ok(mut agg) => agg.add_stream(total),
            Err(_) => 0,
        }
    }

    pub fn set_item(&self, index: usize, count: usize) {
        if let Ok(mut agg) = self.inner.lock() {
            agg.set_item(index, count);
        }
    }

    pub fn set_total(&self, slot: StreamSlot, total: Option<u64>) {
        if let Ok(mut agg) = self.inner.lock() {
            agg.set_total(slot, total);
        }
    }

    pub fn restart(&self, slot: StreamSlot) {
        if let Ok(mut agg) = self.inner.lock() {
            agg.restart_stream(slot);
        }
    }

    pub fn record(&self, slot: StreamSlot, delta: u64) {
        if let Ok(mut agg) = self.inner.lock() {
            if let Some(snapshot) = agg.record(slot, delta, Instant::now()) {
                (self.publish)(snapshot);
            }
        }
    }

    pub fn finish(&self, slot: StreamSlot) {
        if let Ok(mut agg) = self.inner.lock() {
            let snapshot = agg.finish_stream(slot, Instant::now());
            (self.publish)(snapshot);
        }
    }

    pub fn publish_now(&self) {
        if let Ok(mut agg) = self.inner.lock() {
            let snapshot = agg.publish(Instant::now());
            (self.publish)(snapshot);
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner
            .lock()
            .map(|agg| agg.bytes_received())
            .unwrap_or(0)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.0} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    let (minutes, secs) = (seconds / 60, seconds % 60);
    if minutes < 60 {
        return format!("{}m {}s", minutes, secs);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}
