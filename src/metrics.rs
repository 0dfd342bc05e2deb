//! Metrics collection for voxstream
//!
//! Tracks latency, token counts and error history for chat exchanges.
//! Used for diagnostics; a summary is logged at the end of every exchange.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of completed exchanges to retain in history
const MAX_EXCHANGE_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeMetrics {
    pub exchange_id: String,
    /// Unix timestamp when the send started (seconds)
    pub started_at: u64,
    /// Voice-originated exchange
    pub voice: bool,
    /// Send to first stream event, if any arrived
    pub time_to_first_event_ms: Option<u64>,
    /// Send to terminal outcome
    pub total_ms: u64,
    /// Token events that carried text
    pub tokens: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded exchanges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_exchanges: u64,
    pub successful_exchanges: u64,
    pub failed_exchanges: u64,
    /// Average time to first event (ms) across successful exchanges
    pub avg_time_to_first_event_ms: u64,
    /// Average total time (ms) across successful exchanges
    pub avg_total_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "stream", "audio")
    pub error_type: String,
    pub message: String,
    pub exchange_id: Option<String>,
}

struct ExchangeInProgress {
    exchange_id: Uuid,
    voice: bool,
    started_at: Instant,
    started_at_unix: u64,
    first_event: Option<Duration>,
    tokens: u64,
}

impl ExchangeInProgress {
    fn new(exchange_id: Uuid, voice: bool) -> Self {
        Self {
            exchange_id,
            voice,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            first_event: None,
            tokens: 0,
        }
    }

    fn to_metrics(&self, success: bool, error_message: Option<String>) -> ExchangeMetrics {
        ExchangeMetrics {
            exchange_id: self.exchange_id.to_string(),
            started_at: self.started_at_unix,
            voice: self.voice,
            time_to_first_event_ms: self.first_event.map(|d| d.as_millis() as u64),
            total_ms: self.started_at.elapsed().as_millis() as u64,
            tokens: self.tokens,
            success,
            error_message,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Collects and stores metrics for chat exchanges
pub struct MetricsCollector {
    /// Newest first
    history: VecDeque<ExchangeMetrics>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    current: Option<ExchangeInProgress>,
    total_exchanges: u64,
    successful_exchanges: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_EXCHANGE_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_exchanges: 0,
            successful_exchanges: 0,
        }
    }

    /// Start tracking a new exchange. An exchange still in progress is
    /// recorded as failed.
    pub fn start_exchange(&mut self, exchange_id: Uuid, voice: bool) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding in-progress exchange {} to start {}",
                old.exchange_id,
                exchange_id
            );
            let reason = "Discarded: new exchange started".to_string();
            let metrics = old.to_metrics(false, Some(reason));
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting exchange {}", exchange_id);
        self.current = Some(ExchangeInProgress::new(exchange_id, voice));
        self.total_exchanges += 1;
    }

    /// Note a stream event for the current exchange
    pub fn event_received(&mut self, is_token: bool) {
        if let Some(ref mut exchange) = self.current {
            if exchange.first_event.is_none() {
                let elapsed = exchange.started_at.elapsed();
                exchange.first_event = Some(elapsed);
                log::debug!(
                    "Metrics: first event for {} after {:?}",
                    exchange.exchange_id,
                    elapsed
                );
            }
            if is_token {
                exchange.tokens += 1;
            }
        }
    }

    pub fn exchange_completed(&mut self) {
        if let Some(exchange) = self.current.take() {
            let metrics = exchange.to_metrics(true, None);
            log::info!(
                "Metrics: exchange {} completed - total {}ms, first event {:?}ms, {} tokens",
                metrics.exchange_id,
                metrics.total_ms,
                metrics.time_to_first_event_ms,
                metrics.tokens
            );
            self.add_to_history(metrics);
            self.successful_exchanges += 1;
        }
    }

    pub fn exchange_failed(&mut self, error: String) {
        let exchange_id = self.current.as_ref().map(|c| c.exchange_id.to_string());

        if let Some(exchange) = self.current.take() {
            let metrics = exchange.to_metrics(false, Some(error.clone()));
            log::warn!(
                "Metrics: exchange {} failed after {}ms - {}",
                metrics.exchange_id,
                metrics.total_ms,
                error
            );
            self.add_to_history(metrics);
        }

        self.record_error("stream".to_string(), error, exchange_id);
    }

    /// Cancelled exchanges are not counted
    pub fn exchange_cancelled(&mut self) {
        if let Some(exchange) = self.current.take() {
            log::debug!("Metrics: exchange {} cancelled", exchange.exchange_id);
            self.total_exchanges = self.total_exchanges.saturating_sub(1);
        }
    }

    /// Record an error (not necessarily tied to an exchange)
    pub fn record_error(
        &mut self,
        error_type: String,
        message: String,
        exchange_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            exchange_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|c| c.success).collect();
        let count = successful.len() as u64;

        let (avg_first, avg_total) = if count > 0 {
            let sum_first: u64 = successful
                .iter()
                .map(|c| c.time_to_first_event_ms.unwrap_or(0))
                .sum();
            let sum_total: u64 = successful.iter().map(|c| c.total_ms).sum();
            (sum_first / count, sum_total / count)
        } else {
            (0, 0)
        };

        MetricsSummary {
            total_exchanges: self.total_exchanges,
            successful_exchanges: self.successful_exchanges,
            failed_exchanges: self
                .total_exchanges
                .saturating_sub(self.successful_exchanges),
            avg_time_to_first_event_ms: avg_first,
            avg_total_ms: avg_total,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Newest first
    pub fn get_history(&self) -> Vec<ExchangeMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Newest first
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_exchange(&self, exchange_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|c| c.exchange_id == exchange_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: ExchangeMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_EXCHANGE_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
