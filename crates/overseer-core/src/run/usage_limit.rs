//! Usage-limit detection over the output stream
//!
//! The exact shape of a provider's throttling signal is provider-specific,
//! so detection is a pluggable predicate over parsed records rather than
//! hard-coded matching in the stream consumer. The default detector
//! recognizes `result` and `error` records whose content contains
//! "usage limit reached" (case-insensitive) with an optional
//! `|<unix-seconds>` suffix naming the reset time.

use crate::types::StreamMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Minutes until the assumed reset when the provider names no time
pub const DEFAULT_RESET_DELAY_MINUTES: i64 = 60;

/// A detected throttling condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLimitSignal {
    /// When the provider lifts the limit; defaulted when not communicated
    pub reset_time: chrono::DateTime<chrono::Utc>,
}

/// Predicate deciding whether a streamed record signals a usage limit
pub trait UsageLimitDetector: Send + Sync {
    fn detect(&self, message: &StreamMessage) -> Option<UsageLimitSignal>;
}

/// Default detector matching the provider's "usage limit reached" marker
#[derive(Debug, Default)]
pub struct MarkerDetector;

impl UsageLimitDetector for MarkerDetector {
    fn detect(&self, message: &StreamMessage) -> Option<UsageLimitSignal> {
        if message.kind != "result" && message.kind != "error" {
            return None;
        }
        let content = message.content.as_deref()?;
        if !content.to_ascii_lowercase().contains("usage limit reached") {
            return None;
        }

        let reset_time = content
            .rsplit_once('|')
            .and_then(|(_, suffix)| suffix.trim().parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                chrono::Utc::now() + chrono::Duration::minutes(DEFAULT_RESET_DELAY_MINUTES)
            });

        Some(UsageLimitSignal { reset_time })
    }
}

/// Latching wrapper around a detector: only the first detection for a run
/// fires, no matter how many limit records the stream still carries.
pub struct UsageLimitMonitor {
    detector: Arc<dyn UsageLimitDetector>,
    fired: AtomicBool,
}

impl UsageLimitMonitor {
    pub fn new(detector: Arc<dyn UsageLimitDetector>) -> Self {
        Self {
            detector,
            fired: AtomicBool::new(false),
        }
    }

    /// Run the detector over one record. Returns the signal only on the
    /// first detection.
    pub fn inspect(&self, message: &StreamMessage) -> Option<UsageLimitSignal> {
        let signal = self.detector.detect(message)?;
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Usage limit already latched, ignoring repeat signal");
            return None;
        }
        Some(signal)
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, content: &str) -> StreamMessage {
        StreamMessage {
            kind: kind.to_string(),
            subtype: None,
            session_id: None,
            model: None,
            usage: None,
            content: Some(content.to_string()),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_marker_with_epoch_suffix() {
        let msg = record("result", "Claude AI usage limit reached|1754340000");
        let signal = MarkerDetector.detect(&msg).unwrap();
        assert_eq!(signal.reset_time.timestamp(), 1754340000);
    }

    #[test]
    fn test_marker_without_time_defaults_an_hour_out() {
        let before = chrono::Utc::now();
        let msg = record("error", "usage limit reached, try again later");
        let signal = MarkerDetector.detect(&msg).unwrap();

        let delta = signal.reset_time - before;
        assert!(delta >= chrono::Duration::minutes(59));
        assert!(delta <= chrono::Duration::minutes(61));
    }

    #[test]
    fn test_marker_ignores_other_kinds_and_content() {
        // Same content on an assistant record is conversation, not a signal.
        assert!(MarkerDetector
            .detect(&record("assistant", "usage limit reached"))
            .is_none());
        assert!(MarkerDetector.detect(&record("result", "all done")).is_none());

        let mut no_content = record("result", "");
        no_content.content = None;
        assert!(MarkerDetector.detect(&no_content).is_none());
    }

    #[test]
    fn test_garbled_suffix_falls_back_to_default() {
        let before = chrono::Utc::now();
        let msg = record("result", "usage limit reached|soon-ish");
        let signal = MarkerDetector.detect(&msg).unwrap();
        assert!(signal.reset_time > before);
    }

    #[test]
    fn test_monitor_latches_on_first_detection() {
        let monitor = UsageLimitMonitor::new(Arc::new(MarkerDetector));
        let msg = record("result", "usage limit reached|1754340000");

        assert!(monitor.inspect(&msg).is_some());
        assert!(monitor.fired());
        // Repeat signals are swallowed.
        assert!(monitor.inspect(&msg).is_none());
        assert!(monitor.inspect(&msg).is_none());
    }

    #[test]
    fn test_monitor_passes_non_signals_through() {
        let monitor = UsageLimitMonitor::new(Arc::new(MarkerDetector));
        assert!(monitor.inspect(&record("assistant", "hello")).is_none());
        assert!(!monitor.fired());
    }
}
