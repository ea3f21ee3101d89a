//! GC statistics and collection summaries

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::object::Generation;
use crate::sweep::CompactionReason;

/// Why a collection ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionReason {
    /// A generation budget was exhausted by allocation
    AllocationBudget,
    /// Requested by the embedder
    Induced,
    /// Requested by the embedder, compaction forced
    InducedCompacting,
    /// External memory-pressure signal
    MemoryPressure,
    /// Last attempt before reporting an allocation failure
    LastGcBeforeOom,
    /// Background cycle of the oldest generation
    Background,
}

/// Outcome of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    /// Collection sequence number
    pub gc_index: u64,
    /// Highest generation collected
    pub condemned: Generation,
    /// Trigger
    pub reason: CollectionReason,
    /// Compaction reason, if the cycle compacted
    pub compaction: Option<CompactionReason>,
    /// Completed as a background cycle
    pub background: bool,
    /// A background cycle was cancelled to run this one
    pub aborted_background: bool,
    /// Objects reclaimed
    pub objects_freed: usize,
    /// Bytes reclaimed
    pub bytes_freed: usize,
    /// Objects promoted to an older generation
    pub objects_promoted: usize,
    /// Bytes promoted
    pub bytes_promoted: usize,
    /// Objects moved by compaction
    pub objects_relocated: usize,
    /// Entries moved to the finalization ready list
    pub finalizers_ready: usize,
    /// Dirty cards scanned as roots
    pub cards_scanned: usize,
    /// Dirty cards that held no cross-generation reference
    pub false_positive_cards: usize,
    /// Mutator pause
    pub pause: Duration,
}

impl CollectionSummary {
    pub(crate) fn new(gc_index: u64, condemned: Generation, reason: CollectionReason) -> Self {
        Self {
            gc_index,
            condemned,
            reason,
            compaction: None,
            background: false,
            aborted_background: false,
            objects_freed: 0,
            bytes_freed: 0,
            objects_promoted: 0,
            bytes_promoted: 0,
            objects_relocated: 0,
            finalizers_ready: 0,
            cards_scanned: 0,
            false_positive_cards: 0,
            pause: Duration::ZERO,
        }
    }
}

/// GC statistics
///
/// Tracks collector activity across the lifetime of a heap manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStats {
    /// Collections per tier (Gen0, Gen1, Gen2)
    pub collections: [u64; 3],
    /// Completed background cycles
    pub background_collections: u64,
    /// Background cycles cancelled in favour of a blocking collection
    pub background_aborts: u64,
    /// Collections that compacted
    pub compactions: u64,
    /// Total pause time
    pub total_pause: Duration,
    /// Longest pause
    pub max_pause: Duration,
    /// Total bytes allocated
    pub total_allocated: u64,
    /// Total bytes freed
    pub total_freed: u64,
    /// Total bytes promoted
    pub total_promoted: u64,
    /// Total objects relocated
    pub total_relocated: u64,
    /// Finalizers run to completion
    pub finalizers_run: u64,
    /// Finalizers that failed or panicked
    pub finalizer_faults: u64,
    /// Allocation failures reported to callers
    pub allocation_failures: u64,
    /// Bytes freed by the last collection
    pub last_collected: u64,
}

impl GcStats {
    /// Create new statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished collection
    pub fn record_collection(&mut self, summary: &CollectionSummary) {
        self.collections[summary.condemned.condemn_tier().index()] += 1;
        if summary.background {
            self.background_collections += 1;
        }
        if summary.compaction.is_some() {
            self.compactions += 1;
        }
        self.total_pause += summary.pause;
        self.max_pause = self.max_pause.max(summary.pause);
        self.total_freed += summary.bytes_freed as u64;
        self.total_promoted += summary.bytes_promoted as u64;
        self.total_relocated += summary.objects_relocated as u64;
        self.last_collected = summary.bytes_freed as u64;
    }

    /// Record allocation
    pub fn record_allocation(&mut self, bytes: u64) {
        self.total_allocated += bytes;
    }

    /// Total number of collections
    pub fn total_collections(&self) -> u64 {
        self.collections.iter().sum()
    }

    /// Collections of one tier
    pub fn collections_of(&self, generation: Generation) -> u64 {
        self.collections[generation.condemn_tier().index()]
    }

    /// Average pause
    pub fn avg_pause(&self) -> Duration {
        let n = self.total_collections();
        if n == 0 {
            return Duration::ZERO;
        }
        self.total_pause / n as u32
    }

    /// Reset statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
