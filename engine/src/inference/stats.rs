//! Generation statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for generation requests and cross-device traffic
#[derive(Debug)]
pub struct InferenceStats {
    /// Requests that returned text
    pub requests_completed: AtomicU64,

    /// Requests that failed after every fallback
    pub requests_failed: AtomicU64,

    /// Requests turned away by the busy policy
    pub requests_rejected: AtomicU64,

    /// Pipelined loops abandoned for single-device generation
    pub pipeline_fallbacks: AtomicU64,

    /// Prompt tokens processed
    pub total_prompt_tokens: AtomicU64,

    /// Tokens generated
    pub total_tokens_generated: AtomicU64,

    /// Wall time spent generating, in milliseconds
    pub total_generation_time_ms: AtomicU64,

    /// Pipelined decode steps executed
    pub decode_steps: AtomicU64,

    /// Hidden-state copies between devices
    pub cross_device_transfers: AtomicU64,

    /// Bytes moved between devices
    pub total_transfer_bytes: AtomicU64,

    /// Time spent in cross-device copies, in microseconds
    pub total_transfer_time_us: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_rejected: u64,
    pub pipeline_fallbacks: u64,
    pub total_tokens_generated: u64,
    pub decode_steps: u64,
    pub cross_device_transfers: u64,
    pub total_transfer_bytes: u64,
    pub avg_tokens_per_second: f64,
    pub uptime: String,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceStats {
    pub fn new() -> Self {
        Self {
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            pipeline_fallbacks: AtomicU64::new(0),
            total_prompt_tokens: AtomicU64::new(0),
            total_tokens_generated: AtomicU64::new(0),
            total_generation_time_ms: AtomicU64::new(0),
            decode_steps: AtomicU64::new(0),
            cross_device_transfers: AtomicU64::new(0),
            total_transfer_bytes: AtomicU64::new(0),
            total_transfer_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_success(&self, prompt_tokens: usize, completion_tokens: usize, elapsed_ms: u64) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.total_prompt_tokens
            .fetch_add(prompt_tokens as u64, Ordering::Relaxed);
        self.total_tokens_generated
            .fetch_add(completion_tokens as u64, Ordering::Relaxed);
        self.total_generation_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.pipeline_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step(&self) {
        self.decode_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, bytes: usize, elapsed_us: u64) {
        self.cross_device_transfers.fetch_add(1, Ordering::Relaxed);
        self.total_transfer_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_transfer_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
    }

    /// Completed + failed
    pub fn total_requests(&self) -> u64 {
        self.requests_completed.load(Ordering::Relaxed) + self.requests_failed.load(Ordering::Relaxed)
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.requests_completed.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_tokens_per_second(&self) -> f64 {
        let total_time_s = self.total_generation_time_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        if total_time_s == 0.0 {
            return 0.0;
        }
        self.total_tokens_generated.load(Ordering::Relaxed) as f64 / total_time_s
    }

    /// Average cross-device copy latency in microseconds
    pub fn avg_transfer_latency_us(&self) -> f64 {
        let transfers = self.cross_device_transfers.load(Ordering::Relaxed);
        if transfers == 0 {
            return 0.0;
        }
        self.total_transfer_time_us.load(Ordering::Relaxed) as f64 / transfers as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        let seconds = self.uptime_seconds();
        let days = seconds / 86400;
        let hours = (seconds % 86400) / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;

        if days > 0 {
            format!("{}d {}h {}m {}s", days, hours, minutes, secs)
        } else if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            pipeline_fallbacks: self.pipeline_fallbacks.load(Ordering::Relaxed),
            total_tokens_generated: self.total_tokens_generated.load(Ordering::Relaxed),
            decode_steps: self.decode_steps.load(Ordering::Relaxed),
            cross_device_transfers: self.cross_device_transfers.load(Ordering::Relaxed),
            total_transfer_bytes: self.total_transfer_bytes.load(Ordering::Relaxed),
            avg_tokens_per_second: self.avg_tokens_per_second(),
            uptime: self.uptime_string(),
        }
    }

    /// Log a one-line summary
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();

        info!(
            requests_completed = snapshot.requests_completed,
            requests_failed = snapshot.requests_failed,
            requests_rejected = snapshot.requests_rejected,
            pipeline_fallbacks = snapshot.pipeline_fallbacks,
            total_tokens = snapshot.total_tokens_generated,
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            avg_tokens_per_second = format!("{:.2}", snapshot.avg_tokens_per_second),
            cross_device_transfers = snapshot.cross_device_transfers,
            avg_transfer_latency_us = format!("{:.1}", self.avg_transfer_latency_us()),
            uptime = %snapshot.uptime,
            "Inference statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats() {
        let stats = InferenceStats::new();
        assert_eq!(stats.total_requests(), 0);
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_transfer_latency_us(), 0.0);
    }

    #[test]
    fn test_record_success_and_failure() {
        let stats = InferenceStats::new();
        stats.record_success(10, 40, 2000);
        stats.record_failure();

        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.success_rate(), 0.5);
        assert_eq!(stats.avg_tokens_per_second(), 20.0);
    }

    #[test]
    fn test_record_transfer() {
        let stats = InferenceStats::new();
        stats.record_transfer(1024, 100);
        stats.record_transfer(1024, 300);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cross_device_transfers, 2);
        assert_eq!(snapshot.total_transfer_bytes, 2048);
        assert_eq!(stats.avg_transfer_latency_us(), 200.0);
    }

    #[test]
    fn test_uptime_string() {
        let stats = InferenceStats::new();
        assert!(stats.uptime_string().ends_with('s'));
    }
}
