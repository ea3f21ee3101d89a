//! 分配路径
//!
//! 预算检查 → 空闲链表 → 指针碰撞 → 段增长。失败时先做一次
//! 报告 OOM 前的完全回收并重试，仍失败才记录 OOM 事件。

use super::{CollectorState, HeapManager};
use crate::config::HeapLayout;
use crate::error::{GcError, GcResult};
use crate::object::{Address, AllocRequest, Generation, ObjectRecord};
use crate::oom::{OomEvent, OomReason};
use crate::segment::SegmentHandle;
use crate::stats::CollectionReason;
use crate::sweep::ExpansionMechanism;

impl HeapManager {
    /// 在当前线程对应的堆上分配
    pub fn allocate(&self, size: usize, generation: Generation) -> GcResult<Address> {
        self.allocate_with(AllocRequest::new(size).generation(generation))
    }

    /// 按请求分配
    pub fn allocate_with(&self, request: AllocRequest) -> GcResult<Address> {
        self.allocate_on(self.heap_for_current_thread(), request)
    }

    /// 在指定逻辑堆上分配
    pub fn allocate_on(&self, heap: usize, request: AllocRequest) -> GcResult<Address> {
        if heap >= self.config.heap_count {
            return Err(GcError::InvalidHeap(heap));
        }
        // 超出地址空间的请求不可能满足，直接记为 OOM
        let space = self.vmem.address_space().size;
        let Some(size) = request.effective_size().filter(|size| *size <= space) else {
            let target = self.target_generation(&request, usize::MAX);
            let mut state = self.state.lock();
            return Err(self.record_oom(
                &mut state,
                heap,
                OomReason::AddressSpaceExhausted,
                request.size,
                target,
            ));
        };
        let target = self.target_generation(&request, size);

        let mut state = self.state.lock();
        self.check_budget(&mut state, heap, target, size)?;

        let placed = match self.try_allocate(&mut state, heap, target, size) {
            Ok(placed) => placed,
            Err(first) => {
                log::debug!(
                    "heap {heap}: {size} bytes in {target:?} failed ({first:?}), collecting before reporting OOM"
                );
                self.collect_locked(&mut state, Generation::Gen2, CollectionReason::LastGcBeforeOom)?;
                match self.try_allocate(&mut state, heap, target, size) {
                    Ok(placed) => placed,
                    Err(reason) => return Err(self.record_oom(&mut state, heap, reason, size, target)),
                }
            }
        };
        Ok(self.install(&mut state, heap, placed, &request, target, size))
    }

    fn target_generation(&self, request: &AllocRequest, size: usize) -> Generation {
        match request.generation {
            Generation::Pinned => Generation::Pinned,
            Generation::Large => Generation::Large,
            _ if size >= self.config.loh_threshold => Generation::Large,
            requested => requested,
        }
    }

    /// 预算耗尽时触发回收；第 2 代且启用并发时改为启动后台周期，
    /// 已有周期时允许有限超支
    fn check_budget(
        &self,
        state: &mut CollectorState,
        heap: usize,
        target: Generation,
        size: usize,
    ) -> GcResult<()> {
        let Some(mut condemned) = state.heaps[heap].generations.generation_to_condemn(target, size) else {
            return Ok(());
        };

        // 追踪已结束的周期先完成，完成后的预算可能已足够
        if state
            .background
            .as_ref()
            .is_some_and(|c| c.shared.is_finished())
        {
            self.complete_background_locked(state)?;
            match state.heaps[heap].generations.generation_to_condemn(target, size) {
                Some(again) => condemned = again,
                None => return Ok(()),
            }
        }

        if state.background.is_some() {
            // 周期进行中允许超出预算一定比例，超过后取消周期改做阻塞回收
            let generation = state.heaps[heap].generations.get(target);
            let limit = (generation.budget as f64 * self.config.tuning.background_budget_overrun) as usize;
            if generation.allocated_since_gc.saturating_add(size) <= limit {
                return Ok(());
            }
            log::debug!("heap {heap}: {target:?} overran its budget during a background cycle");
        } else if condemned == Generation::Gen2
            && target.tier() == 2
            && self.config.concurrent
            && self.start_background_locked(state)?
        {
            return Ok(());
        }

        self.collect_locked(state, condemned, CollectionReason::AllocationBudget)?;
        Ok(())
    }

    fn try_allocate(
        &self,
        state: &mut CollectorState,
        heap: usize,
        target: Generation,
        size: usize,
    ) -> Result<(Address, SegmentHandle), OomReason> {
        if let Some(limit) = self.config.heap_hard_limit
            && self.space.read().total_bytes().saturating_add(size) > limit
        {
            return Err(OomReason::BudgetExceeded);
        }

        let logical = &mut state.heaps[heap];
        for handle in logical.segments.alloc_candidates(target) {
            if let Some(addr) = logical.segments.take_free(handle, size) {
                return Ok((addr, handle));
            }
        }

        if let Some(handle) = logical.segments.alloc_segment(target) {
            match logical.segments.bump(handle, size) {
                Ok(Some(addr)) => return Ok((addr, handle)),
                Ok(None) => {}
                Err(err) => {
                    log::debug!("heap {heap}: commit failed: {err}");
                    return Err(OomReason::CommitFailed);
                }
            }
        }

        let fragmented = logical.segments.free_bytes_for(target) >= size;
        let growth = match logical.segments.allocate_segment_or_region(target, size) {
            Ok(growth) => growth,
            Err(err) => {
                log::debug!("heap {heap}: cannot grow {target:?}: {err}");
                logical.counters.record_expansion(ExpansionMechanism::NoMemory);
                return Err(match err {
                    GcError::CommitFailed { .. } => OomReason::CommitFailed,
                    _ if fragmented => OomReason::Fragmentation,
                    _ => OomReason::AddressSpaceExhausted,
                });
            }
        };

        let spike = self.config.tuning.large_spike_ratio
            * logical.generations.budget(Generation::Large) as f64;
        let mechanism = if target == Generation::Large && size as f64 >= spike {
            ExpansionMechanism::LargeObjectSpike
        } else if fragmented {
            ExpansionMechanism::FragmentationGrowth
        } else if growth.reused {
            ExpansionMechanism::ReusedRegion
        } else if growth.new_ephemeral {
            ExpansionMechanism::NewEphemeralSegment
        } else if self.config.layout == HeapLayout::Regions {
            ExpansionMechanism::NewRegion
        } else {
            ExpansionMechanism::NewSegment
        };
        logical.counters.record_expansion(mechanism);

        match logical.segments.bump(growth.handle, size) {
            Ok(Some(addr)) => Ok((addr, growth.handle)),
            Ok(None) => Err(OomReason::AddressSpaceExhausted),
            Err(err) => {
                log::debug!("heap {heap}: commit failed in fresh segment: {err}");
                Err(OomReason::CommitFailed)
            }
        }
    }

    fn record_oom(
        &self,
        state: &mut CollectorState,
        heap: usize,
        reason: OomReason,
        size: usize,
        target: Generation,
    ) -> GcError {
        let event = OomEvent::new(reason, size, target, state.gc_index);
        state.heaps[heap].oom.record(event);
        state.stats.allocation_failures += 1;
        self.publish(state);
        let err = GcError::out_of_memory(reason, size, target);
        log::warn!("heap {heap}: {err}");
        err
    }

    fn install(
        &self,
        state: &mut CollectorState,
        heap: usize,
        (addr, segment): (Address, SegmentHandle),
        request: &AllocRequest,
        target: Generation,
        size: usize,
    ) -> Address {
        let mut record = ObjectRecord::new(size, target, heap, segment, request.ref_slots);
        record.finalizable = request.finalizable;
        record.pinned = request.pinned || target == Generation::Pinned;
        self.space.write().insert(addr, record);
        if let Some(cycle) = &state.background {
            cycle.shared.allocate_black(addr);
        }

        let logical = &mut state.heaps[heap];
        logical.generations.record_allocation(target, size);
        if request.finalizable {
            logical.finalization.register(addr, target);
        }
        state.stats.record_allocation(size as u64);
        self.publish_allocation(state, heap);
        addr
    }
}
