use crate::error::{ProcessingError, Result};
use crate::models::ObservationRecord;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    pub total_records: usize,
    pub kept_records: usize,
    pub missing_position: usize,
    pub missing_value: usize,
    pub outside_window: usize,
    /// Dropped rows per obstype
    pub dropped_by_obstype: HashMap<String, usize>,
}

impl QualityReport {
    pub fn dropped_records(&self) -> usize {
        self.total_records - self.kept_records
    }
}

/// Drops observation rows that cannot be matched
pub struct QualityFilter {
    window: Option<(NaiveDateTime, NaiveDateTime)>,
}

impl QualityFilter {
    pub fn new() -> Self {
        Self { window: None }
    }

    /// Keep only rows in `[day - delta, day + 24h + delta)`
    pub fn with_day_window(mut self, day: NaiveDate, delta: Duration) -> Result<Self> {
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ProcessingError::InvalidFormat(format!("Invalid day: {}", day)))?;
        if delta < Duration::zero() {
            return Err(ProcessingError::Config(format!(
                "time_delta must not be negative, got {}",
                delta
            )));
        }
        self.window = Some((midnight - delta, midnight + Duration::hours(24) + delta));
        Ok(self)
    }

    pub fn filter(&self, records: Vec<ObservationRecord>) -> (Vec<ObservationRecord>, QualityReport) {
        let mut report = QualityReport {
            total_records: records.len(),
            ..Default::default()
        };

        let kept: Vec<ObservationRecord> = records
            .into_iter()
            .filter(|record| {
                let keep = if record.lat.is_nan() || record.lon.is_nan() {
                    report.missing_position += 1;
                    false
                } else if record.value.is_nan() {
                    report.missing_value += 1;
                    false
                } else if let Some((start, end)) = self.window {
                    let inside = record.timestamp >= start && record.timestamp < end;
                    if !inside {
                        report.outside_window += 1;
                    }
                    inside
                } else {
                    true
                };
                if !keep {
                    *report
                        .dropped_by_obstype
                        .entry(record.obstype.clone())
                        .or_default() += 1;
                }
                keep
            })
            .collect();

        report.kept_records = kept.len();
        if report.dropped_records() > 0 {
            debug!(
                "Quality filter dropped {} of {} rows ({} without position, {} without value, {} outside window)",
                report.dropped_records(),
                report.total_records,
                report.missing_position,
                report.missing_value,
                report.outside_window
            );
        }

        (kept, report)
    }

    pub fn generate_summary(&self, report: &QualityReport) -> String {
        let mut summary = String::new();
        let share = |n: usize| {
            if report.total_records == 0 {
                0.0
            } else {
                100.0 * n as f64 / report.total_records as f64
            }
        };

        summary.push_str("=== Observation Quality Report ===\n");
        summary.push_str(&format!("Total Records: {}\n", report.total_records));
        summary.push_str(&format!(
            "Kept Records: {} ({:.1}%)\n",
            report.kept_records,
            share(report.kept_records)
        ));
        summary.push_str(&format!("Missing Position: {}\n", report.missing_position));
        summary.push_str(&format!("Missing Value: {}\n", report.missing_value));
        if self.window.is_some() {
            summary.push_str(&format!("Outside Time Window: {}\n", report.outside_window));
        }

        let mut by_obstype: Vec<_> = report.dropped_by_obstype.iter().collect();
        by_obstype.sort();
        for (obstype, count) in by_obstype {
            summary.push_str(&format!("  {}: {} dropped\n", obstype, count));
        }

        summary
    }
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self::new()
    }
}
