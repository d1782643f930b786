//! Metrics snapshot published alongside run events

use serde::{Deserialize, Serialize};

/// Point-in-time totals derived from a run's output stream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub message_count: u64,
    pub parse_warnings: u64,
    /// Dollars, deterministic given model + token counts
    pub cost_usd: f64,
    /// True when usage arrived for a model missing from the pricing table;
    /// that usage contributed zero cost
    pub unpriced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
