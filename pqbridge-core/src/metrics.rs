// SPDX-License-Identifier: MIT
//
// PQ Sensor Bridge: Serial-to-MQTT Bridge over Post-Quantum TLS
// Copyright (c) 2025 PQ Sensor Bridge Contributors

//! Metrics collection and reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use parking_lot::RwLock;

const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Bridge metrics shared by the acquisition thread and the publisher
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Acquisition metrics
    frames_captured: AtomicU64,
    frames_overwritten: AtomicU64,
    read_errors: AtomicU64,

    // Publish metrics
    publishes_total: AtomicU64,
    publishes_failed: AtomicU64,
    bytes_published: AtomicU64,

    // Delivery latency tracking (milliseconds)
    delivery_latencies: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                frames_captured: AtomicU64::new(0),
                frames_overwritten: AtomicU64::new(0),
                read_errors: AtomicU64::new(0),
                publishes_total: AtomicU64::new(0),
                publishes_failed: AtomicU64::new(0),
                bytes_published: AtomicU64::new(0),
                delivery_latencies: RwLock::new(Vec::with_capacity(1024)),
            }),
        }
    }

    // Acquisition metrics
    pub fn record_capture(&self) {
        self.inner.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overwrite(&self) {
        self.inner.frames_overwritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.inner.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_captured(&self) -> u64 {
        self.inner.frames_captured.load(Ordering::Relaxed)
    }

    pub fn frames_overwritten(&self) -> u64 {
        self.inner.frames_overwritten.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.inner.read_errors.load(Ordering::Relaxed)
    }

    // Publish metrics
    pub fn record_publish(&self, bytes: usize, latency_millis: u64) {
        self.inner.publishes_total.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_published.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut latencies = self.inner.delivery_latencies.write();
        latencies.push(latency_millis);
        if latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.drain(0..MAX_LATENCY_SAMPLES / 2);
        }
    }

    pub fn record_publish_failure(&self) {
        self.inner.publishes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publishes_total(&self) -> u64 {
        self.inner.publishes_total.load(Ordering::Relaxed)
    }

    pub fn publishes_failed(&self) -> u64 {
        self.inner.publishes_failed.load(Ordering::Relaxed)
    }

    pub fn bytes_published(&self) -> u64 {
        self.inner.bytes_published.load(Ordering::Relaxed)
    }

    // Derived metrics
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let latencies = self.inner.delivery_latencies.read();
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// One-line summary for the shutdown log
    pub fn summary(&self) -> String {
        let mut line = format!(
            "uptime={}s captured={} overwritten={} read_errors={} published={} failed={} bytes={}",
            self.uptime_seconds(),
            self.frames_captured(),
            self.frames_overwritten(),
            self.read_errors(),
            self.publishes_total(),
            self.publishes_failed(),
            self.bytes_published(),
        );
        if let (Some(p50), Some(p99)) = (self.latency_p50(), self.latency_p99()) {
            line.push_str(&format!(" delivery_p50={}ms delivery_p99={}ms", p50, p99));
        }
        line
    }
}
