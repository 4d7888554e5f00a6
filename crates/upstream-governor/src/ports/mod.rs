//! Ports (trait boundaries) between the governor and the outside world.

pub mod outbound;

pub use outbound::{ManualTimeSource, MetricsSink, TimeSource, TokioTimeSource, UserLimiter};
