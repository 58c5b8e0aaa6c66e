//! Thread-safe metrics collection
//!
//! Atomic counters for the message path and a mutex-protected window of
//! processing times. The health server exposes a [`MetricsSnapshot`] as JSON.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing time samples kept for percentiles
const MAX_TIMING_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Why a message was not published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Forwarding decision said drop (home network, malformed phyPayload)
    Filtered,
    /// Configuration changed while the message was in flight
    Stale,
    /// Topic could not be parsed
    Malformed,
    /// Payload was not a JSON object or could not be re-encoded
    Decode,
}

pub struct MetricsCollector {
    messages_received: AtomicU64,
    messages_forwarded: AtomicU64,
    dropped_filtered: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_decode: AtomicU64,
    publish_failures: AtomicU64,

    reconfigurations: AtomicU64,
    reconfiguration_failures: AtomicU64,
    connection_failures: AtomicU64,
    current_generation: AtomicU64,
    source_connected: AtomicBool,
    target_connected: AtomicBool,

    // microseconds
    processing_times: Mutex<Vec<u64>>,

    bridge_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
    last_message_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            dropped_filtered: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            dropped_decode: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            reconfigurations: AtomicU64::new(0),
            reconfiguration_failures: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            current_generation: AtomicU64::new(0),
            source_connected: AtomicBool::new(false),
            target_connected: AtomicBool::new(false),
            processing_times: Mutex::new(Vec::new()),
            bridge_state: Mutex::new("unconfigured".to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
            last_message_at: AtomicU64::new(0),
        }
    }

    // Message path
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn message_forwarded(&self, processing_time: Duration) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(processing_time);
    }

    pub fn message_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Filtered => &self.dropped_filtered,
            DropReason::Stale => &self.dropped_stale,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Decode => &self.dropped_decode,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_micros() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Configuration and connections
    pub fn reconfigured(&self, generation: u64) {
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
        self.current_generation.store(generation, Ordering::Relaxed);
    }

    pub fn reconfiguration_failed(&self) {
        self.reconfiguration_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Generation without counting a reconfiguration; 0 once nothing is active
    pub fn set_generation(&self, generation: u64) {
        self.current_generation.store(generation, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connections(&self, source: bool, target: bool) {
        self.source_connected.store(source, Ordering::Relaxed);
        self.target_connected.store(target, Ordering::Relaxed);
    }

    pub fn set_bridge_state(&self, state: &str) {
        if let Ok(mut current) = self.bridge_state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.to_string();
            }
        }
    }

    pub fn bridge_state(&self) -> String {
        self.bridge_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_forwarded,
            &self.dropped_filtered,
            &self.dropped_stale,
            &self.dropped_malformed,
            &self.dropped_decode,
            &self.publish_failures,
            &self.reconfigurations,
            &self.reconfiguration_failures,
            &self.connection_failures,
            &self.current_generation,
            &self.state_transitions,
            &self.last_message_at,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.source_connected.store(false, Ordering::Relaxed);
        self.target_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.bridge_state.lock() {
            *state = "unconfigured".to_string();
        }
    }

    fn processing_time_statistics(&self) -> ProcessingTimes {
        let Ok(times) = self.processing_times.lock() else {
            return ProcessingTimes::default();
        };
        if times.is_empty() {
            return ProcessingTimes::default();
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        ProcessingTimes {
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let dropped = DroppedMessages {
            filtered: self.dropped_filtered.load(Ordering::Relaxed),
            stale: self.dropped_stale.load(Ordering::Relaxed),
            malformed: self.dropped_malformed.load(Ordering::Relaxed),
            decode: self.dropped_decode.load(Ordering::Relaxed),
        };

        MetricsSnapshot {
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                forwarded: self.messages_forwarded.load(Ordering::Relaxed),
                dropped_total: dropped.total(),
                dropped,
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                last_message_at: self.last_message_at.load(Ordering::Relaxed),
                processing_time: self.processing_time_statistics(),
            },
            bridge: BridgeMetrics {
                state: self.bridge_state(),
                generation: self.current_generation.load(Ordering::Relaxed),
                reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
                reconfiguration_failures: self.reconfiguration_failures.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                source_connected: self.source_connected.load(Ordering::Relaxed),
                target_connected: self.target_connected.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub bridge: BridgeMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub forwarded: u64,
    pub dropped_total: u64,
    pub dropped: DroppedMessages,
    pub publish_failures: u64,
    pub last_message_at: u64,
    pub processing_time: ProcessingTimes,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroppedMessages {
    pub filtered: u64,
    pub stale: u64,
    pub malformed: u64,
    pub decode: u64,
}

impl DroppedMessages {
    pub fn total(&self) -> u64 {
        self.filtered + self.stale + self.malformed + self.decode
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingTimes {
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeMetrics {
    pub state: String,
    pub generation: u64,
    pub reconfigurations: u64,
    pub reconfiguration_failures: u64,
    pub connection_failures: u64,
    pub source_connected: bool,
    pub target_connected: bool,
    pub state_transitions: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
