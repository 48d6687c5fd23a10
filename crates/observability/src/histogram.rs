//! Fixed-width latency histogram with an overflow bucket

use crate::{ObservabilityError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Most regular buckets a histogram may have
pub const MAX_BUCKETS: u64 = 10_000;

/// Layout of the latency histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramConfig {
    /// Upper end of the covered range; anything at or above lands in the overflow bucket
    pub range_ms: u64,
    /// Width of every regular bucket
    pub bucket_ms: u64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            range_ms: 1000,
            bucket_ms: 50,
        }
    }
}

impl HistogramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_ms == 0 {
            return Err(ObservabilityError::InvalidHistogram(
                "bucket_ms cannot be zero".to_string(),
            ));
        }
        let regular = self.range_ms.div_ceil(self.bucket_ms);
        if regular > MAX_BUCKETS {
            return Err(ObservabilityError::InvalidHistogram(format!(
                "at most {} buckets allowed, range_ms / bucket_ms gives {}",
                MAX_BUCKETS, regular
            )));
        }
        if self.range_ms < self.bucket_ms {
            return Err(ObservabilityError::InvalidHistogram(format!(
                "range_ms ({}) must be at least bucket_ms ({})",
                self.range_ms, self.bucket_ms
            )));
        }
        Ok(())
    }

    /// Number of regular (bounded) buckets
    pub fn regular_buckets(&self) -> usize {
        self.range_ms.div_ceil(self.bucket_ms) as usize
    }
}

/// One serialized histogram bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    pub bucket_start_ms: u64,
    /// `None` for the overflow bucket
    pub bucket_end_ms: Option<u64>,
    pub count: u64,
}

/// Latency histogram with atomic per-bucket counters
#[derive(Debug)]
pub struct LatencyHistogram {
    config: HistogramConfig,
    // Regular buckets followed by a single overflow bucket.
    buckets: Vec<AtomicU64>,
}

impl LatencyHistogram {
    pub fn new(config: HistogramConfig) -> Result<Self> {
        config.validate()?;
        let buckets = (0..=config.regular_buckets())
            .map(|_| AtomicU64::new(0))
            .collect();
        Ok(Self { config, buckets })
    }

    pub fn config(&self) -> HistogramConfig {
        self.config
    }

    fn index_for(&self, latency: Duration) -> usize {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        if ms >= self.config.range_ms {
            self.buckets.len() - 1
        } else {
            (ms / self.config.bucket_ms) as usize
        }
    }

    /// Count one observation, saturating at `u64::MAX`
    pub fn record(&self, latency: Duration) {
        let idx = self.index_for(latency);
        crate::metrics::saturating_add(&self.buckets[idx], 1);
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .fold(0u64, |acc, b| acc.saturating_add(b.load(Ordering::Relaxed)))
    }

    /// Copy the current counts out as serializable buckets
    pub fn buckets(&self) -> Vec<HistogramBucket> {
        let width = self.config.bucket_ms;
        let range = self.config.range_ms;
        let overflow = self.buckets.len() - 1;

        self.buckets
            .iter()
            .enumerate()
            .map(|(i, count)| {
                let start = i as u64 * width;
                if i == overflow {
                    HistogramBucket {
                        bucket_start_ms: range,
                        bucket_end_ms: None,
                        count: count.load(Ordering::Relaxed),
                    }
                } else {
                    HistogramBucket {
                        bucket_start_ms: start,
                        bucket_end_ms: Some((start + width).min(range)),
                        count: count.load(Ordering::Relaxed),
                    }
                }
            })
            .collect()
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        let config = HistogramConfig::default();
        Self {
            buckets: (0..=config.regular_buckets())
                .map(|_| AtomicU64::new(0))
                .collect(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_layout() {
        let hist = LatencyHistogram::new(HistogramConfig {
            range_ms: 100,
            bucket_ms: 30,
        })
        .unwrap();

        let buckets = hist.buckets();
        // 0-30, 30-60, 60-90, 90-100, overflow
        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets[3].bucket_start_ms, 90);
        assert_eq!(buckets[3].bucket_end_ms, Some(100));
        assert_eq!(buckets[4].bucket_start_ms, 100);
        assert_eq!(buckets[4].bucket_end_ms, None);
    }

    #[test]
    fn test_record_lands_in_expected_bucket() {
        let hist = LatencyHistogram::new(HistogramConfig::default()).unwrap();
        hist.record(Duration::from_millis(0));
        hist.record(Duration::from_millis(49));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_millis(999));
        hist.record(Duration::from_millis(1000));
        hist.record(Duration::from_secs(3600));

        let buckets = hist.buckets();
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].count, 1);
        assert_eq!(buckets[19].count, 1);
        assert_eq!(buckets[20].count, 2);
        assert_eq!(hist.total(), 6);
    }

    #[test]
    fn test_invalid_layouts_rejected() {
        assert!(LatencyHistogram::new(HistogramConfig {
            range_ms: 100,
            bucket_ms: 0,
        })
        .is_err());
        assert!(LatencyHistogram::new(HistogramConfig {
            range_ms: 10,
            bucket_ms: 20,
        })
        .is_err());
    }

    #[test]
    fn test_bucket_count_capped() {
        let huge = HistogramConfig {
            range_ms: 1_000_000_000_000,
            bucket_ms: 1,
        };
        assert!(matches!(
            huge.validate(),
            Err(ObservabilityError::InvalidHistogram(_))
        ));
        assert!(LatencyHistogram::new(huge).is_err());

        let widest = HistogramConfig {
            range_ms: MAX_BUCKETS,
            bucket_ms: 1,
        };
        assert!(widest.validate().is_ok());
        assert!(HistogramConfig {
            range_ms: MAX_BUCKETS + 1,
            bucket_ms: 1,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_overflow_bucket_serializes_null_end() {
        let hist = LatencyHistogram::new(HistogramConfig {
            range_ms: 10,
            bucket_ms: 10,
        })
        .unwrap();
        let json = serde_json::to_string(&hist.buckets()).unwrap();
        assert!(json.contains("\"bucketEndMs\":null"));
        assert!(json.contains("\"bucketStartMs\":0"));
    }
}
