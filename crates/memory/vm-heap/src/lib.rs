//! # VM Managed Heap Crate
//!
//! A generational, optionally concurrent managed-heap collector over a
//! simulated address space. Objects carry no payload: the heap tracks their
//! placement, generation and outgoing reference slots, which is all the
//! collector needs to decide liveness, promotion and relocation.
//!
//! ## Architecture
//!
//! ```text
//!   mutators ──allocate/write_ref──▶ HeapManager ──▶ SegmentAllocator ──▶ VirtualMemory
//!                                        │
//!            ┌──────────────┬────────────┼─────────────┬──────────────────┐
//!         CardTable     MarkEngine   SweepCompactor  FinalizationQueue  OomHistory
//!                      (+ background)
//!                                        │
//!                                 DiagnosticMirror ──▶ DiagnosticReader / DiagnosticSnapshot
//! ```
//!
//! ## Features
//!
//! - **generations**: Gen0/Gen1/Gen2 plus large- and pinned-object heaps with survival-tuned budgets
//! - **layouts**: classic segments (one ephemeral segment per heap) or fixed-size regions
//! - **card marking**: write barrier dirties cards for old-to-young stores
//! - **background mark**: concurrent tracing with allocate-black and cancellation
//! - **compaction**: sliding compaction with recorded reasons and expansion mechanisms
//! - **finalization**: per-generation queues with resurrection and fault isolation
//! - **diagnostics**: a versioned, lock-free field catalogue for out-of-process readers
//!
//! ## Usage
//!
//! ```ignore
//! use vm_heap::{GcConfig, Generation, HandleKind, HeapManager};
//!
//! let heap = HeapManager::new(GcConfig::default())?;
//! let obj = heap.allocate(64, Generation::Gen0)?;
//! heap.create_handle(HandleKind::Strong, obj)?;
//! heap.induce_collection(Generation::Gen0, vm_heap::CollectionReason::Induced)?;
//! ```

#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

pub mod card_table;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod finalize;
pub mod generation;
pub mod handles;
pub mod heap;
pub mod mark;
pub mod object;
pub mod oom;
pub mod segment;
pub mod stats;
pub mod sweep;
pub mod verify;
pub mod vmem;

// Re-export the mutator-facing surface
pub use config::{GcConfig, HeapLayout, TuningConfig};
pub use error::{GcError, GcResult};
pub use heap::{
    FinalizerReport, HeapCounters, HeapManager, InterestingDataPoint, MechanismBit, ObjectInfo,
};
pub use object::{Address, AllocRequest, Generation};
pub use stats::{CollectionReason, CollectionSummary, GcStats};

// Re-export collector building blocks
pub use card_table::CardTable;
pub use finalize::{FinalizableEntry, FinalizationQueue};
pub use handles::{HandleId, HandleKind};
pub use mark::{MarkEngine, MarkPhase};
pub use oom::{OomEvent, OomHistory, OomReason};
pub use segment::{SegmentAllocator, SegmentHandle};
pub use sweep::{CompactionReason, ExpansionMechanism, SweepCompactor};
pub use verify::HeapAnalysis;
pub use vmem::{SimulatedVirtualMemory, VirtualMemory};

// Re-export diagnostic export types
pub use diagnostics::{
    CapabilitySet, DiagnosticReader, DiagnosticSnapshot, FieldReading, FieldSource, FieldValue,
    Stability, TypeTag,
};
