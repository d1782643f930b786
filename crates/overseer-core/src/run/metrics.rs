//! Running metrics totals for one run's output stream

use crate::run::pricing;
use crate::types::{MetricsSnapshot, StreamMessage};
use parking_lot::Mutex;
use std::time::Instant;

#[derive(Default)]
struct Totals {
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: u64,
    cache_read_input_tokens: u64,
    message_count: u64,
    cost_usd: f64,
    unpriced: bool,
}

/// Accumulates token and cost totals as records arrive
///
/// `record` holds the lock only long enough to add a handful of counters,
/// so snapshot readers never stall the streaming path. Cost is computed per
/// record from the pricing table; a record whose model is missing from the
/// table contributes zero cost and flips the `unpriced` flag instead of
/// raising.
pub struct MetricsAggregator {
    /// Used when a record carries no model of its own
    default_model: String,
    started: Instant,
    totals: Mutex<Totals>,
}

impl MetricsAggregator {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn record(&self, message: &StreamMessage) {
        let mut totals = self.totals.lock();
        totals.message_count += 1;

        let Some(usage) = &message.usage else { return };
        totals.input_tokens += usage.input_tokens;
        totals.output_tokens += usage.output_tokens;
        totals.cache_creation_input_tokens += usage.cache_creation_input_tokens;
        totals.cache_read_input_tokens += usage.cache_read_input_tokens;

        let model = message.model.as_deref().unwrap_or(&self.default_model);
        match pricing::rates_for(model) {
            Some(rates) => {
                totals.cost_usd += (usage.input_tokens as f64 * rates.input
                    + usage.output_tokens as f64 * rates.output
                    + usage.cache_creation_input_tokens as f64 * rates.cache_write
                    + usage.cache_read_input_tokens as f64 * rates.cache_read)
                    / 1_000_000.0;
            }
            None => totals.unpriced = true,
        }
    }

    /// Point-in-time totals
    pub fn snapshot(&self) -> MetricsSnapshot {
        let totals = self.totals.lock();
        MetricsSnapshot {
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            cache_creation_input_tokens: totals.cache_creation_input_tokens,
            cache_read_input_tokens: totals.cache_read_input_tokens,
            message_count: totals.message_count,
            parse_warnings: 0,
            cost_usd: totals.cost_usd,
            unpriced: totals.unpriced,
            duration_ms: Some(self.started.elapsed().as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenUsage;

    fn message(model: Option<&str>, input: u64, output: u64) -> StreamMessage {
        StreamMessage {
            kind: "assistant".to_string(),
            subtype: None,
            session_id: None,
            model: model.map(str::to_string),
            usage: Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            }),
            content: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_totals_accumulate() {
        let metrics = MetricsAggregator::new("sonnet");
        metrics.record(&message(None, 1000, 2000));
        metrics.record(&message(None, 500, 100));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.input_tokens, 1500);
        assert_eq!(snapshot.output_tokens, 2100);
        assert_eq!(snapshot.message_count, 2);
        // sonnet: $3/MTok in, $15/MTok out
        let expected = (1500.0 * 3.0 + 2100.0 * 15.0) / 1_000_000.0;
        assert!((snapshot.cost_usd - expected).abs() < 1e-12);
        assert!(!snapshot.unpriced);
    }

    #[test]
    fn test_record_model_overrides_default() {
        let metrics = MetricsAggregator::new("sonnet");
        metrics.record(&message(Some("opus"), 1_000_000, 0));

        // opus input rate, not sonnet's
        let snapshot = metrics.snapshot();
        assert!((snapshot.cost_usd - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_fails_closed() {
        let metrics = MetricsAggregator::new("some-future-model");
        metrics.record(&message(None, 10_000, 10_000));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cost_usd, 0.0);
        assert!(snapshot.unpriced);
        assert_eq!(snapshot.output_tokens, 10_000);
    }

    #[test]
    fn test_message_without_usage_counts_only() {
        let metrics = MetricsAggregator::new("sonnet");
        let mut msg = message(None, 0, 0);
        msg.usage = None;
        metrics.record(&msg);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.cost_usd, 0.0);
    }

    #[test]
    fn test_cache_tokens_priced() {
        let metrics = MetricsAggregator::new("sonnet");
        let mut msg = message(None, 0, 0);
        msg.usage = Some(TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_input_tokens: 1_000_000,
            cache_read_input_tokens: 1_000_000,
        });
        metrics.record(&msg);

        // cache write 1.25x input ($3.75), cache read 0.1x input ($0.30)
        let snapshot = metrics.snapshot();
        assert!((snapshot.cost_usd - 4.05).abs() < 1e-9);
    }
}
