//! Configuration for bandwidth budgets.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::ConfigBuildError;

/// Default value for [`BudgetConfig::wait_chunk`].
pub const DEFAULT_WAIT_CHUNK: u64 = 8 * 1024;

/// Default value for [`BudgetConfig::max_chunk`].
pub const DEFAULT_MAX_CHUNK: u64 = 256 * 1024;

/// Limits for a single [`RateBudget`](crate::RateBudget).
///
/// The default is an unlimited budget.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct BudgetConfig {
    /// Maximum sustained rate, in bytes per second.
    ///
    /// Zero means "unlimited".
    #[builder(default)]
    pub(crate) bytes_per_sec: u64,

    /// Smallest grant worth handing out without waiting.
    ///
    /// If fewer than this many bytes are available, callers wait until this
    /// many are.
    #[builder(default = "DEFAULT_WAIT_CHUNK")]
    pub(crate) wait_chunk: u64,

    /// Largest single grant, and the size of the burst that a budget can
    /// bank while it is idle.
    #[builder(default = "DEFAULT_MAX_CHUNK")]
    pub(crate) max_chunk: u64,
}

impl BudgetConfigBuilder {
    /// Check that the chunk sizes make sense together.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let wait_chunk = self.wait_chunk.unwrap_or(DEFAULT_WAIT_CHUNK);
        let max_chunk = self.max_chunk.unwrap_or(DEFAULT_MAX_CHUNK);
        if wait_chunk == 0 {
            return Err(ConfigBuildError::Invalid {
                field: "wait_chunk".into(),
                problem: "must be greater than zero".into(),
            });
        }
        if max_chunk < wait_chunk {
            return Err(ConfigBuildError::Inconsistent {
                fields: vec!["wait_chunk".into(), "max_chunk".into()],
                problem: "max_chunk must be at least as large as wait_chunk".into(),
            });
        }
        Ok(())
    }
}

impl BudgetConfig {
    /// Return a new [`BudgetConfigBuilder`].
    pub fn builder() -> BudgetConfigBuilder {
        BudgetConfigBuilder::default()
    }

    /// Construct a checked configuration from its three parameters.
    pub fn new(
        bytes_per_sec: u64,
        wait_chunk: u64,
        max_chunk: u64,
    ) -> Result<Self, ConfigBuildError> {
        Self::builder()
            .bytes_per_sec(bytes_per_sec)
            .wait_chunk(wait_chunk)
            .max_chunk(max_chunk)
            .build()
    }

    /// Return a configuration with no rate limit at all.
    pub fn unlimited() -> Self {
        Self {
            bytes_per_sec: 0,
            wait_chunk: DEFAULT_WAIT_CHUNK,
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }

    /// Return the configured rate in bytes per second (zero for unlimited).
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Return the smallest grant we'll hand out without waiting.
    pub fn wait_chunk(&self) -> u64 {
        self.wait_chunk
    }

    /// Return the largest grant (and burst size).
    pub fn max_chunk(&self) -> u64 {
        self.max_chunk
    }

    /// Return true if this configuration imposes no limit.
    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Configuration for a [`Limiter`](crate::Limiter): one budget for each
/// direction of traffic.
#[derive(Debug, Clone, Builder, Eq, PartialEq, Default)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct LimiterConfig {
    /// Limits on bytes we read.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    pub(crate) download: BudgetConfig,

    /// Limits on bytes we write.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    pub(crate) upload: BudgetConfig,
}

impl LimiterConfig {
    /// Return a new [`LimiterConfigBuilder`].
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::default()
    }

    /// Return the limits applied to reads.
    pub fn download(&self) -> &BudgetConfig {
        &self.download
    }

    /// Return the limits applied to writes.
    pub fn upload(&self) -> &BudgetConfig {
        &self.upload
    }
}
