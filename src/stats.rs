//! Migration statistics.
//!
//! Each tier move produces one [`MigrationStatistics`] sample. Samples are fed
//! to a [`StatisticsAggregator`] owned by the caller and shared between workers
//! behind a mutex. Every `log_every` samples the window averages are logged and
//! the window restarts; lifetime totals keep counting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

const MB: f64 = 1024.0 * 1024.0;

/// Measurements for one tier move.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatistics {
    pub study_instance_uid: String,
    pub bytes: u64,
    pub files: u64,
    pub copy: Duration,
    pub db_update: Duration,
    pub delete: Duration,
    pub total: Duration,
}

impl MigrationStatistics {
    pub fn new(study_instance_uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            ..Self::default()
        }
    }

    /// Copy throughput in MB/s. Zero if nothing was timed.
    pub fn copy_speed_mb_per_sec(&self) -> f64 {
        let secs = self.copy.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / MB / secs
    }
}

/// Counters over the aggregator's whole lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsTotals {
    pub operations: u64,
    pub bytes: u64,
    pub files: u64,
}

/// Averages over one window of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AverageStatistics {
    pub samples: usize,
    pub bytes: f64,
    pub files: f64,
    pub copy: Duration,
    pub db_update: Duration,
    pub delete: Duration,
    pub total: Duration,
    pub copy_speed_mb_per_sec: f64,
}

pub struct StatisticsAggregator {
    log_every: usize,
    window: Vec<MigrationStatistics>,
    totals: StatisticsTotals,
}

pub type SharedStatistics = Arc<Mutex<StatisticsAggregator>>;

impl StatisticsAggregator {
    pub fn new(log_every: u32) -> Self {
        Self {
            log_every: (log_every as usize).max(1),
            window: Vec::new(),
            totals: StatisticsTotals::default(),
        }
    }

    pub fn shared(log_every: u32) -> SharedStatistics {
        Arc::new(Mutex::new(Self::new(log_every)))
    }

    /// Add a sample. Returns the window averages when the window fills.
    pub fn add(&mut self, sample: MigrationStatistics) -> Option<AverageStatistics> {
        self.totals.operations += 1;
        self.totals.bytes += sample.bytes;
        self.totals.files += sample.files;
        self.window.push(sample);

        if self.window.len() < self.log_every {
            return None;
        }

        let average = self.average();
        tracing::info!(
            samples = average.samples,
            avg_mb = average.bytes / MB,
            avg_files = average.files,
            avg_copy_ms = average.copy.as_millis() as u64,
            avg_db_update_ms = average.db_update.as_millis() as u64,
            avg_delete_ms = average.delete.as_millis() as u64,
            avg_total_ms = average.total.as_millis() as u64,
            avg_speed_mb_s = average.copy_speed_mb_per_sec,
            "tier migration averages"
        );
        self.window.clear();
        Some(average)
    }

    fn average(&self) -> AverageStatistics {
        let n = self.window.len().max(1);
        let sum = |f: fn(&MigrationStatistics) -> Duration| -> Duration {
            self.window.iter().map(f).sum::<Duration>() / n as u32
        };
        AverageStatistics {
            samples: self.window.len(),
            bytes: self.window.iter().map(|s| s.bytes as f64).sum::<f64>() / n as f64,
            files: self.window.iter().map(|s| s.files as f64).sum::<f64>() / n as f64,
            copy: sum(|s| s.copy),
            db_update: sum(|s| s.db_update),
            delete: sum(|s| s.delete),
            total: sum(|s| s.total),
            copy_speed_mb_per_sec: self
                .window
                .iter()
                .map(MigrationStatistics::copy_speed_mb_per_sec)
                .sum::<f64>()
                / n as f64,
        }
    }

    pub fn totals(&self) -> StatisticsTotals {
        self.totals
    }

    /// Samples in the current, not yet logged window.
    pub fn pending_samples(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: u64, copy_ms: u64) -> MigrationStatistics {
        MigrationStatistics {
            bytes,
            files: 10,
            copy: Duration::from_millis(copy_ms),
            total: Duration::from_millis(copy_ms * 2),
            ..MigrationStatistics::new("1.2.3")
        }
    }

    #[test]
    fn window_resets_after_log_every_samples() {
        let mut stats = StatisticsAggregator::new(3);
        assert!(stats.add(sample(100, 10)).is_none());
        assert!(stats.add(sample(200, 20)).is_none());
        let avg = stats.add(sample(300, 30)).unwrap();

        assert_eq!(avg.samples, 3);
        assert_eq!(avg.bytes, 200.0);
        assert_eq!(avg.copy, Duration::from_millis(20));
        assert_eq!(stats.pending_samples(), 0);
    }

    #[test]
    fn totals_survive_window_resets() {
        let mut stats = StatisticsAggregator::new(2);
        for _ in 0..5 {
            stats.add(sample(1000, 1));
        }
        assert_eq!(
            stats.totals(),
            StatisticsTotals {
                operations: 5,
                bytes: 5000,
                files: 50
            }
        );
        assert_eq!(stats.pending_samples(), 1);
    }

    #[test]
    fn speed_is_zero_without_copy_time() {
        assert_eq!(sample(1000, 0).copy_speed_mb_per_sec(), 0.0);
        let s = sample(2 * 1024 * 1024, 1000);
        assert!((s.copy_speed_mb_per_sec() - 2.0).abs() < 1e-9);
    }
}
