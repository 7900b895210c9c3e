use crate::error::{ProcessingError, Result};
use crate::models::ObservationRecord;
use crate::readers::ObservationReader;
use crate::utils::filename::{expand_date_template, substitute_key};
use chrono::NaiveDate;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Loads daily observation files for a date range concurrently
pub struct ConcurrentObservationLoader {
    template: String,
    file_not_found_ok: bool,
    round_minutes: bool,
    use_mmap: bool,
}

impl ConcurrentObservationLoader {
    /// `template` holds strftime tokens (typically `%Y%m%d`) and optionally
    /// the `%t` observation key placeholder
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            file_not_found_ok: false,
            round_minutes: false,
            use_mmap: false,
        }
    }

    pub fn with_obs_key(mut self, obs_key: &str) -> Self {
        self.template = substitute_key(&self.template, obs_key);
        self
    }

    pub fn with_file_not_found_ok(mut self, ok: bool) -> Self {
        self.file_not_found_ok = ok;
        self
    }

    pub fn with_round_minutes(mut self, round_minutes: bool) -> Self {
        self.round_minutes = round_minutes;
        self
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Daily file paths for `start..=end`
    pub fn daily_paths(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PathBuf>> {
        start
            .iter_days()
            .take_while(|day| *day <= end)
            .map(|day| {
                let midnight = day.and_hms_opt(0, 0, 0).ok_or_else(|| {
                    ProcessingError::InvalidFormat(format!("Invalid day: {}", day))
                })?;
                Ok(PathBuf::from(expand_date_template(&self.template, &midnight)?))
            })
            .collect()
    }

    /// Read every daily file of `start..=end`, one blocking task per file.
    /// Records come back in day order.
    pub async fn load_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ObservationRecord>> {
        let paths = self.daily_paths(start, end)?;
        let reader = Arc::new(self.reader());

        let handles: Vec<JoinHandle<Result<Option<Vec<ObservationRecord>>>>> = paths
            .into_iter()
            .map(|path| {
                let reader = reader.clone();
                let file_not_found_ok = self.file_not_found_ok;
                tokio::task::spawn_blocking(move || read_daily(&reader, &path, file_not_found_ok))
            })
            .collect();

        let mut records = Vec::new();
        let mut files = 0;
        for handle in handles {
            if let Some(day) = handle.await?? {
                files += 1;
                records.extend(day);
            }
        }

        info!("Loaded {} observations from {} files", records.len(), files);
        Ok(records)
    }

    /// Read a list of files with rayon; missing files follow `file_not_found_ok`
    pub fn load_paths(&self, paths: &[PathBuf]) -> Result<Vec<ObservationRecord>> {
        let reader = self.reader();
        let per_file = paths
            .par_iter()
            .map(|path| read_daily(&reader, path, self.file_not_found_ok))
            .collect::<Result<Vec<_>>>()?;

        Ok(per_file.into_iter().flatten().flatten().collect())
    }

    fn reader(&self) -> ObservationReader {
        ObservationReader::new()
            .with_mmap(self.use_mmap)
            .with_round_minutes(self.round_minutes)
    }
}

fn read_daily(
    reader: &ObservationReader,
    path: &Path,
    file_not_found_ok: bool,
) -> Result<Option<Vec<ObservationRecord>>> {
    if !path.is_file() {
        if file_not_found_ok {
            warn!("Observation file not found, skipping: {}", path.display());
            return Ok(None);
        }
        return Err(ProcessingError::MissingData(format!(
            "observation file {}",
            path.display()
        )));
    }
    reader.read_observations(path).map(Some)
}
