//! Heap configuration
//!
//! Every heuristic threshold the collector consults lives in
//! [`TuningConfig`]; nothing is hard-coded in the algorithms.

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::object::{Address, Generation};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Heap layout strategy; the two are mutually exclusive for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeapLayout {
    /// Per-generation segment lists with a single ephemeral segment
    #[default]
    Segments,
    /// Fixed-size regions owned by generations
    Regions,
}

/// Heuristic thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Budget growth per unit of survival ratio
    pub survival_growth: f64,
    /// Upper bound on a budget relative to its initial value
    pub max_budget_multiplier: f64,
    /// Free/allocated ratio above which compaction is considered
    pub fragmentation_ratio: f64,
    /// Minimum free bytes before fragmentation matters
    pub fragmentation_min_bytes: usize,
    /// Pinned survivor density above which fragmentation compaction is skipped
    pub pinned_density_limit: f64,
    /// Free/allocated ratio on the large object heap that triggers LOH compaction
    pub large_fragmentation_ratio: f64,
    /// A large allocation at least this fraction of the Large budget is a spike
    pub large_spike_ratio: f64,
    /// How far allocation may overrun a budget while a background cycle runs
    pub background_budget_overrun: f64,
    /// Empty segments each generation keeps committed after a collection
    pub retained_empty_segments: usize,
    /// Objects traced per read-lock acquisition by the background marker
    pub background_chunk: usize,
    /// Root count from which blocking mark fans out to worker threads
    pub parallel_mark_threshold: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            survival_growth: 2.0,
            max_budget_multiplier: 8.0,
            fragmentation_ratio: 0.3,
            fragmentation_min_bytes: MB,
            pinned_density_limit: 0.25,
            large_fragmentation_ratio: 0.5,
            large_spike_ratio: 0.25,
            background_budget_overrun: 2.0,
            retained_empty_segments: 1,
            background_chunk: 256,
            parallel_mark_threshold: 64,
        }
    }
}

/// Heap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Segment or region layout
    pub layout: HeapLayout,
    /// Number of logical heaps (server configuration when > 1)
    pub heap_count: usize,
    /// Worker threads for blocking mark
    pub gc_threads: usize,
    /// Allow background (concurrent) collection of the oldest generation
    pub concurrent: bool,
    /// Base of the managed address space
    pub address_space_base: usize,
    /// Size of the managed address space
    pub address_space_size: usize,
    /// Bytes covered by one card (power of two)
    pub card_size: usize,
    /// First segment size per generation
    pub initial_segment_size: usize,
    /// Cap on segment growth
    pub max_segment_size: usize,
    /// Region size in region layout
    pub region_size: usize,
    /// Commit step
    pub commit_granularity: usize,
    /// Requests at least this large go to the large object heap
    pub loh_threshold: usize,
    /// Initial budgets, indexed by `Generation::index`
    pub budgets: [usize; Generation::COUNT],
    /// Hard cap on committed heap bytes
    pub heap_hard_limit: Option<usize>,
    /// Capacity of the OOM history ring
    pub oom_history_capacity: usize,
    /// Verify heap invariants after every collection
    pub verify_heap: bool,
    /// Compact the large object heap on induced compacting collections
    pub compact_large_on_induced: bool,
    /// Heuristic thresholds
    pub tuning: TuningConfig,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            layout: HeapLayout::Segments,
            heap_count: 1,
            gc_threads: num_cpus::get().max(1),
            concurrent: true,
            address_space_base: 0x1000_0000,
            address_space_size: 1024 * MB,
            card_size: 256,
            initial_segment_size: 32 * MB,
            max_segment_size: 256 * MB,
            region_size: 4 * MB,
            commit_granularity: 64 * KB,
            loh_threshold: 85_000,
            budgets: [16 * MB, 8 * MB, 64 * MB, 32 * MB, 8 * MB],
            heap_hard_limit: None,
            oom_history_capacity: 4,
            verify_heap: cfg!(debug_assertions),
            compact_large_on_induced: false,
            tuning: TuningConfig::default(),
        }
    }
}

impl GcConfig {
    /// Region layout with otherwise default settings
    pub fn regions() -> Self {
        Self {
            layout: HeapLayout::Regions,
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> GcResult<Self> {
        let config: GcConfig =
            toml::from_str(text).map_err(|e| GcError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Initial budget of a generation
    pub fn budget(&self, generation: Generation) -> usize {
        self.budgets[generation.index()]
    }

    /// Base of the managed address space
    pub fn base(&self) -> Address {
        Address(self.address_space_base)
    }

    /// Check internal consistency
    pub fn validate(&self) -> GcResult<()> {
        if self.heap_count == 0 {
            return Err(GcError::invalid_config("heap_count must be at least 1"));
        }
        if self.gc_threads == 0 {
            return Err(GcError::invalid_config("gc_threads must be at least 1"));
        }
        if !self.card_size.is_power_of_two() || self.card_size < 64 {
            return Err(GcError::invalid_config(
                "card_size must be a power of two of at least 64",
            ));
        }
        if !self.commit_granularity.is_power_of_two() {
            return Err(GcError::invalid_config(
                "commit_granularity must be a power of two",
            ));
        }
        if self.address_space_base == 0 || self.address_space_base % self.commit_granularity != 0
        {
            return Err(GcError::invalid_config(
                "address_space_base must be non-zero and commit aligned",
            ));
        }
        if self.address_space_size == 0 {
            return Err(GcError::invalid_config("address_space_size must be non-zero"));
        }
        if self.region_size == 0 || self.region_size % self.commit_granularity != 0 {
            return Err(GcError::invalid_config(
                "region_size must be a multiple of commit_granularity",
            ));
        }
        if self.initial_segment_size == 0 || self.initial_segment_size > self.max_segment_size {
            return Err(GcError::invalid_config(
                "initial_segment_size must be non-zero and not exceed max_segment_size",
            ));
        }
        if self.budgets.contains(&0) {
            return Err(GcError::invalid_config("budgets must be non-zero"));
        }
        if self.oom_history_capacity == 0 {
            return Err(GcError::invalid_config(
                "oom_history_capacity must be at least 1",
            ));
        }
        let t = &self.tuning;
        for (name, ratio) in [
            ("fragmentation_ratio", t.fragmentation_ratio),
            ("pinned_density_limit", t.pinned_density_limit),
            ("large_fragmentation_ratio", t.large_fragmentation_ratio),
            ("large_spike_ratio", t.large_spike_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(GcError::invalid_config(format!(
                    "{name} must lie in [0, 1]"
                )));
            }
        }
        if t.max_budget_multiplier < 1.0 || t.background_budget_overrun < 1.0 {
            return Err(GcError::invalid_config(
                "budget multipliers must be at least 1.0",
            ));
        }
        if t.background_chunk == 0 {
            return Err(GcError::invalid_config("background_chunk must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget(Generation::Gen0), 16 * MB);
        assert_eq!(config.oom_history_capacity, 4);
    }

    #[test]
    fn test_invalid_card_size() {
        let config = GcConfig {
            card_size: 300,
            ..GcConfig::default()
        };
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_toml_overrides() {
        let config = GcConfig::from_toml_str(
            r#"
            layout = "regions"
            heap_count = 2
            concurrent = false

            [tuning]
            fragmentation_ratio = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.layout, HeapLayout::Regions);
        assert_eq!(config.heap_count, 2);
        assert!(!config.concurrent);
        assert_eq!(config.tuning.fragmentation_ratio, 0.5);
        assert_eq!(config.tuning.pinned_density_limit, 0.25);
        assert_eq!(config.card_size, 256);
    }

    #[test]
    fn test_toml_rejects_bad_values() {
        assert!(GcConfig::from_toml_str("heap_count = 0").is_err());
        assert!(GcConfig::from_toml_str("layout = \"pages\"").is_err());
    }
}
