/*! Limits and switches consumed by the scanner.

The scanner never loads configuration by itself, callers build a
[`ScanConfig`] (or deserialize one) and pass it to [`crate::Scanner::new`].
*/
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default ceiling for the sum of declared uncompressed sizes (512 MiB).
pub const DEFAULT_MAX_TOTAL_UNCOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

/// Default maximum ratio between declared uncompressed and compressed sizes.
///
/// Deflated XML rarely goes above 30x, repeated text can reach 100x.
pub const DEFAULT_MAX_COMPRESSION_RATIO: u64 = 100;

/// Default ceiling for the bytes materialized from a single part (64 MiB).
pub const DEFAULT_MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

/// Default soft deadline for a scan.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Default maximum number of parts admitted from the central directory.
pub const DEFAULT_MAX_PART_COUNT: u64 = 10_000;

/// Error returned by [`ScanConfig::validate`].
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required limit is zero.
    #[error("`{setting}` must be greater than zero")]
    ZeroLimit {
        /// Name of the offending setting.
        setting: &'static str,
    },
    /// The per-part ceiling is larger than the total ceiling.
    #[error(
        "`max_part_bytes` ({part}) is larger than \
         `max_total_uncompressed_bytes` ({total})"
    )]
    PartLargerThanTotal {
        /// Per-part ceiling.
        part: u64,
        /// Total ceiling.
        total: u64,
    },
}

/// Configuration for [`crate::Scanner`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Maximum sum of declared uncompressed sizes across all parts.
    pub max_total_uncompressed_bytes: u64,
    /// Maximum ratio between declared uncompressed and compressed sizes.
    pub max_compression_ratio: u64,
    /// Maximum number of bytes materialized from any single part.
    pub max_part_bytes: u64,
    /// Maximum number of parts admitted from the central directory.
    pub max_part_count: u64,
    /// Soft deadline, checked once per part and once per stream.
    #[serde(with = "millis")]
    pub deadline: Duration,
    /// Use the VBA project parser for confirming macros and finding
    /// auto-run triggers. Ignored when the `deep-macro-parsing` feature is
    /// not compiled in.
    pub deep_macro_parsing: bool,
    /// Number of results kept in the scanner's cache, 0 disables caching.
    pub cache_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_total_uncompressed_bytes: DEFAULT_MAX_TOTAL_UNCOMPRESSED_BYTES,
            max_compression_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            max_part_count: DEFAULT_MAX_PART_COUNT,
            deadline: DEFAULT_DEADLINE,
            deep_macro_parsing: true,
            cache_capacity: 0,
        }
    }
}

impl ScanConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum sum of declared uncompressed sizes.
    pub fn max_total_uncompressed_bytes(mut self, n: u64) -> Self {
        self.max_total_uncompressed_bytes = n;
        self
    }

    /// Sets the maximum compression ratio.
    pub fn max_compression_ratio(mut self, ratio: u64) -> Self {
        self.max_compression_ratio = ratio;
        self
    }

    /// Sets the maximum number of bytes materialized from a single part.
    pub fn max_part_bytes(mut self, n: u64) -> Self {
        self.max_part_bytes = n;
        self
    }

    /// Sets the maximum number of parts.
    pub fn max_part_count(mut self, n: u64) -> Self {
        self.max_part_count = n;
        self
    }

    /// Sets the soft deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Enables or disables the VBA project parser.
    pub fn deep_macro_parsing(mut self, yes: bool) -> Self {
        self.deep_macro_parsing = yes;
        self
    }

    /// Sets the number of results kept in the cache.
    pub fn cache_capacity(mut self, n: usize) -> Self {
        self.cache_capacity = n;
        self
    }

    /// Checks that every required limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_total_uncompressed_bytes", self.max_total_uncompressed_bytes),
            ("max_compression_ratio", self.max_compression_ratio),
            ("max_part_bytes", self.max_part_bytes),
            ("max_part_count", self.max_part_count),
        ];
        for (setting, value) in limits {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { setting });
            }
        }
        if self.deadline.is_zero() {
            return Err(ConfigError::ZeroLimit { setting: "deadline" });
        }
        if self.max_part_bytes > self.max_total_uncompressed_bytes {
            return Err(ConfigError::PartLargerThanTotal {
                part: self.max_part_bytes,
                total: self.max_total_uncompressed_bytes,
            });
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
