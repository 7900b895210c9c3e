pub mod compact;
pub mod statistics;

pub use compact::{compact_stats, CompactMetric, CompactModelSeries, CompactRow, MonthlyCompactor};
pub use statistics::{unaggregated_metrics, AggregateStatistics, GroupBy, PairAccumulator, RowMetrics, StatsRow};
