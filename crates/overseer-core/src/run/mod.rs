//! Run orchestration: executor, event sink, metrics, usage-limit
//! monitoring, scheduling, and crash recovery

mod events;
mod executor;
mod metrics;
mod pricing;
mod recovery;
mod scheduler;
mod usage_limit;

pub use events::EventBus;
pub use executor::{Executor, DEFAULT_GRACE_PERIOD};
pub use metrics::MetricsAggregator;
pub use pricing::{rates_for, ModelRates};
pub use recovery::{recover, INTERRUPTED_REASON};
pub use scheduler::{Scheduler, DEFAULT_TICK};
pub use usage_limit::{
    MarkerDetector, UsageLimitDetector, UsageLimitMonitor, UsageLimitSignal,
    DEFAULT_RESET_DELAY_MINUTES,
};
