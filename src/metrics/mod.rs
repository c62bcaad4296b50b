pub mod busy;
pub mod names;
pub mod percentiles;
pub mod queue_time;
pub mod stats;
pub mod store;
pub mod stream;

pub use busy::BusyCalculator;
pub use queue_time::{QueueHeaders, QueueObservation, QueueTimeExtractor, WorkerBacklog};
pub use stats::{ApdexStats, ApdexZone, Stats};
pub use store::{MetricStore, StatsHandle};
