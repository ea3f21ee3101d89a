//! 阻塞式回收
//!
//! 暂停（持有对象空间写锁）→ 标记 → 终结扫描 → 清除 → 可选压缩 →
//! 晋升 → 刷新卡表 → 校验。后台周期的最终暂停复用同一个回收尾段。

use std::collections::HashSet;
use std::time::Instant;

use super::{CollectorState, HeapManager, InterestingDataPoint, LogicalHeap, MechanismBit};
use crate::card_table::CardTable;
use crate::error::GcResult;
use crate::handles::HandleTable;
use crate::mark::{CardScan, MarkPhase, survives};
use crate::object::{Address, Generation, ObjectRecord, ObjectSpace, slot_address};
use crate::segment::SegmentAllocator;
use crate::stats::{CollectionReason, CollectionSummary};
use crate::sweep::{CompactionInputs, CompactionPlan, CompactionReason, decide_compaction};
use crate::verify::verify_heap;

type Liveness<'a> = &'a dyn Fn(Address, &ObjectRecord) -> bool;

impl HeapManager {
    /// 显式请求回收；`InducedCompacting` 强制压缩
    pub fn induce_collection(
        &self,
        generation: Generation,
        reason: CollectionReason,
    ) -> GcResult<CollectionSummary> {
        let mut state = self.state.lock();
        self.collect_locked(&mut state, generation, reason)
    }

    /// 阻塞回收；进行中的后台周期会被取消并升级为完全回收
    pub(crate) fn collect_locked(
        &self,
        state: &mut CollectorState,
        generation: Generation,
        reason: CollectionReason,
    ) -> GcResult<CollectionSummary> {
        let aborted = self.abort_background_locked(state, "blocking collection requested");
        let condemned = if aborted {
            Generation::Gen2
        } else {
            generation.condemn_tier()
        };

        let started = Instant::now();
        state.gc_index += 1;
        let mut summary = CollectionSummary::new(state.gc_index, condemned, reason);
        summary.aborted_background = aborted;

        let mut space = self.space.write();
        let roots = Self::roots(state);
        let ranges = Self::segment_ranges(state);
        let (outcome, scan) = state
            .mark
            .mark_blocking(&space, &roots, condemned, &self.cards, &ranges);
        summary.cards_scanned = outcome.cards_scanned;
        summary.false_positive_cards = outcome.false_positive_cards;
        Self::attribute_cards(state, &self.cards, &scan);

        let mut revived = Vec::new();
        for heap in state.heaps.iter_mut() {
            revived.extend(
                heap.finalization
                    .scan_unreachable(condemned, |a| survives(&space, a, condemned)),
            );
        }
        summary.finalizers_ready = revived.len();
        if !revived.is_empty() {
            state.mark.trace(&space, revived, condemned);
        }

        let live = |_: Address, r: &ObjectRecord| !r.generation.is_condemned_by(condemned) || r.is_marked();
        let consumed = (condemned != Generation::Gen2).then_some(scan.consumed.as_slice());
        self.reclaim(state, &mut space, condemned, &live, true, consumed, &mut summary)?;
        drop(space);

        state.sweeper.set_next_sweep_obj(Address::NULL);
        summary.pause = started.elapsed();
        self.finish_collection(state, &summary);
        Ok(summary)
    }

    /// 标记之后的共同尾段
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reclaim(
        &self,
        state: &mut CollectorState,
        space: &mut ObjectSpace,
        condemned: Generation,
        live: Liveness<'_>,
        allow_compaction: bool,
        consumed: Option<&[usize]>,
        summary: &mut CollectionSummary,
    ) -> GcResult<()> {
        let CollectorState {
            heaps,
            handles,
            sweeper,
            ..
        } = state;

        let weak = handles.clear_dead_weak(|a| space.get(a).is_some_and(|r| live(a, r)));
        if weak > 0 {
            log::trace!("cleared {weak} weak handle(s)");
        }

        let mut freed = vec![[0usize; Generation::COUNT]; heaps.len()];
        for (_, record) in sweeper.sweep_dead(space, |a, r| !live(a, r)) {
            freed[record.heap][record.generation.index()] += record.size;
            heaps[record.heap]
                .generations
                .record_freed(record.generation, record.size);
            summary.objects_freed += 1;
            summary.bytes_freed += record.size;
        }
        for heap in heaps.iter_mut() {
            for segment in heap.segments.segments_mut() {
                sweeper.rebuild_segment(segment, space);
            }
        }

        let pinned = pinned_set(handles, heaps);
        let mut survived = vec![[0usize; Generation::COUNT]; heaps.len()];
        let mut survivors = vec![(0usize, 0usize); heaps.len()];
        for (addr, record) in space.iter() {
            if !record.generation.is_condemned_by(condemned) {
                continue;
            }
            survived[record.heap][record.generation.index()] += record.size;
            survivors[record.heap].0 += 1;
            if record.pinned || pinned.contains(&addr) {
                survivors[record.heap].1 += 1;
            }
        }

        if allow_compaction {
            let mut plan = CompactionPlan::default();
            for (idx, heap) in heaps.iter_mut().enumerate() {
                let inputs = self.compaction_inputs(heap, condemned, summary.reason, survivors[idx]);
                let Some(why) = decide_compaction(&inputs, &self.config.tuning) else {
                    continue;
                };
                heap.counters.record_compaction(why);
                heap.counters.record_mechanism(MechanismBit::Compacted);
                summary.compaction.get_or_insert(why);

                let compact_large = matches!(
                    why,
                    CompactionReason::LargeObjectFragmentation | CompactionReason::LastGcBeforeOom
                ) || (why == CompactionReason::Induced && self.config.compact_large_on_induced);
                let movable = |addr: Address, r: &ObjectRecord| {
                    r.generation.is_condemned_by(condemned)
                        && !r.pinned
                        && !pinned.contains(&addr)
                        && match r.generation {
                            Generation::Pinned => false,
                            Generation::Large => compact_large,
                            _ => true,
                        }
                };

                let (objects_before, bytes_before) = (plan.moved_objects(), plan.moved_bytes);
                for segment in heap
                    .segments
                    .segments()
                    .filter(|s| s.owner() != Generation::Pinned)
                {
                    sweeper.plan_segment(segment, space, &movable, &mut plan);
                }
                heap.counters.add(
                    InterestingDataPoint::ObjectsRelocated,
                    (plan.moved_objects() - objects_before) as u64,
                );
                heap.counters.add(
                    InterestingDataPoint::BytesRelocated,
                    (plan.moved_bytes - bytes_before) as u64,
                );
            }

            if !plan.forwarding.is_empty() {
                sweeper.apply_compaction(&plan, space);
                handles.relocate(&plan.forwarding);
                for heap in heaps.iter_mut() {
                    heap.finalization.relocate(&plan.forwarding);
                    for segment in heap.segments.segments_mut() {
                        sweeper.rebuild_segment(segment, space);
                    }
                }
                summary.objects_relocated = plan.moved_objects();
                log::debug!(
                    "compacted {} object(s), {} byte(s) moved",
                    plan.moved_objects(),
                    plan.moved_bytes
                );
            }
        }

        // 先按本次存活率调整预算，再把晋升字节计入下一代
        for (idx, heap) in heaps.iter_mut().enumerate() {
            let mut survival = [0.0; Generation::COUNT];
            for g in Generation::ALL {
                let total = survived[idx][g.index()] + freed[idx][g.index()];
                if total > 0 {
                    survival[g.index()] = survived[idx][g.index()] as f64 / total as f64;
                }
            }
            heap.generations
                .finish_collection(condemned, &survival, &self.config.tuning);
            heap.counters
                .add(InterestingDataPoint::PinnedSurvivors, survivors[idx].1 as u64);
        }

        for (_, record) in space.iter_mut() {
            if !record.generation.is_ephemeral() || !record.generation.is_condemned_by(condemned) {
                continue;
            }
            let from = record.generation;
            let to = from.promoted();
            let table = &mut heaps[record.heap].generations;
            table.record_freed(from, record.size);
            table.record_promotion(to, record.size);
            heaps[record.heap]
                .counters
                .add(InterestingDataPoint::ObjectsPromoted, 1);
            record.generation = to;
            summary.objects_promoted += 1;
            summary.bytes_promoted += record.size;
        }
        for heap in heaps.iter_mut() {
            heap.finalization
                .sync_generations(|a| space.get(a).map(|r| r.generation));
            heap.segments.promote_regions(condemned)?;
        }

        self.decommit_empty(heaps, space)?;
        refresh_cards(&self.cards, space, condemned, consumed);

        if self.config.verify_heap || summary.compaction.is_some() {
            let allocators: Vec<&SegmentAllocator> = heaps.iter().map(|h| &h.segments).collect();
            if let Err(err) = verify_heap(space, &allocators) {
                log::error!("heap corrupted after gc #{}: {err}", summary.gc_index);
                std::process::abort();
            }
        }
        Ok(())
    }

    fn compaction_inputs(
        &self,
        heap: &LogicalHeap,
        condemned: Generation,
        reason: CollectionReason,
        (survivors, pinned_survivors): (usize, usize),
    ) -> CompactionInputs {
        let mut inputs = CompactionInputs {
            survivors,
            pinned_survivors,
            induced_compacting: reason == CollectionReason::InducedCompacting,
            last_gc_before_oom: reason == CollectionReason::LastGcBeforeOom,
            gen0_budget: heap.generations.budget(Generation::Gen0),
            full: condemned == Generation::Gen2,
            ..CompactionInputs::default()
        };
        for segment in heap.segments.segments() {
            match segment.owner() {
                Generation::Large => {
                    inputs.large_free_bytes += segment.free_bytes();
                    inputs.large_allocated_bytes += segment.used_bytes();
                }
                Generation::Pinned => {}
                owner if owner.is_condemned_by(condemned) => {
                    inputs.free_bytes += segment.free_bytes();
                    inputs.allocated_bytes += segment.used_bytes();
                }
                _ => {}
            }
        }
        inputs.ephemeral_available = heap
            .segments
            .ephemeral()
            .and_then(|h| heap.segments.get(h).ok())
            .map(|s| s.remaining() + s.free_bytes());
        inputs
    }

    /// 空段超出保留数量后解除提交；各代当前的分配段不动
    fn decommit_empty(&self, heaps: &mut [LogicalHeap], space: &ObjectSpace) -> GcResult<()> {
        let retained = self.config.tuning.retained_empty_segments;
        for heap in heaps.iter_mut() {
            let mut kept = 0;
            for generation in Generation::ALL {
                let active = heap.segments.alloc_segment(generation);
                for handle in heap.segments.owned_by(generation).to_vec() {
                    if Some(handle) == active {
                        continue;
                    }
                    let segment = heap.segments.get(handle)?;
                    if space
                        .starting_in(segment.start(), segment.reserved_end())
                        .next()
                        .is_some()
                    {
                        continue;
                    }
                    if kept < retained {
                        kept += 1;
                        continue;
                    }
                    heap.segments.decommit_if_empty(handle, space)?;
                }
            }
        }
        Ok(())
    }

    /// 卡片归属：按卡片起始地址所在的段找到逻辑堆
    fn attribute_cards(state: &mut CollectorState, cards: &CardTable, scan: &CardScan) {
        let heap_of = |heaps: &[LogicalHeap], idx: usize| {
            let (start, _) = cards.card_bounds(idx);
            heaps
                .iter()
                .position(|h| h.segments.segment_of(start).is_some())
                .unwrap_or(0)
        };
        for &idx in &scan.consumed {
            let heap = heap_of(&state.heaps, idx);
            state.heaps[heap]
                .counters
                .add(InterestingDataPoint::CardsScanned, 1);
        }
        for &idx in &scan.false_positives {
            let heap = heap_of(&state.heaps, idx);
            state.heaps[heap]
                .counters
                .add(InterestingDataPoint::FalsePositiveCards, 1);
        }
    }

    /// 记录统计、机制计数并发布诊断
    pub(crate) fn finish_collection(&self, state: &mut CollectorState, summary: &CollectionSummary) {
        for heap in state.heaps.iter_mut() {
            match summary.reason {
                CollectionReason::Induced | CollectionReason::InducedCompacting => {
                    heap.counters.record_mechanism(MechanismBit::Induced);
                }
                CollectionReason::LastGcBeforeOom => {
                    heap.counters.record_mechanism(MechanismBit::LastGcBeforeOom);
                }
                _ => {}
            }
            if summary.background {
                heap.counters.record_mechanism(MechanismBit::Background);
            }
        }
        state.stats.record_collection(summary);
        state.last_summary = Some(summary.clone());
        state.mark.set_phase(MarkPhase::Idle);
        self.publish(state);

        log::debug!(
            "gc #{} {:?} ({:?}): freed {} object(s) / {} byte(s), promoted {}, relocated {}, pause {:?}",
            summary.gc_index,
            summary.condemned,
            summary.reason,
            summary.objects_freed,
            summary.bytes_freed,
            summary.objects_promoted,
            summary.objects_relocated,
            summary.pause
        );
    }
}

fn pinned_set(handles: &HandleTable, heaps: &[LogicalHeap]) -> HashSet<Address> {
    let mut pinned = handles.pinned_targets();
    for heap in heaps {
        pinned.extend(heap.finalization.running().iter().copied());
    }
    pinned
}

fn dirty_younger(cards: &CardTable, space: &ObjectSpace, addr: Address, record: &ObjectRecord) {
    let tier = record.generation.tier();
    for (slot, target) in record.refs.iter().enumerate() {
        if !target.is_null() && space.get(*target).is_some_and(|t| t.generation.tier() < tier) {
            cards.mark_dirty(slot_address(addr, slot));
        }
    }
}

/// 回收后重建卡片：完全回收重算全部；部分回收只重算消耗过的卡片和年轻对象
fn refresh_cards(
    cards: &CardTable,
    space: &ObjectSpace,
    condemned: Generation,
    consumed: Option<&[usize]>,
) {
    match consumed {
        None => {
            cards.clear_all();
            for (addr, record) in space.iter() {
                dirty_younger(cards, space, addr, record);
            }
        }
        Some(consumed) => {
            for &idx in consumed {
                cards.clear_card(idx);
            }
            for &idx in consumed {
                let (start, end) = cards.card_bounds(idx);
                for addr in space.overlapping(start, end) {
                    if let Some(record) = space.get(addr) {
                        dirty_younger(cards, space, addr, record);
                    }
                }
            }
            let ceiling = condemned.tier() + 1;
            for (addr, record) in space.iter().filter(|(_, r)| r.generation.tier() <= ceiling) {
                dirty_younger(cards, space, addr, record);
            }
        }
    }
}
