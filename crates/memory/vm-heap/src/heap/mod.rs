//! 托管堆管理器
//!
//! `HeapManager` 拥有全部逻辑堆、共享的对象空间、全进程卡表与后台标记状态。
//! 元数据由状态互斥锁保护；对象空间的读写锁就是赋值器暂停域：
//! 回收在整个暂停期间持有写锁，后台标记线程按块持有读锁。
//! 加锁顺序固定为 状态锁 → 对象空间锁。

mod alloc;
mod background;
mod collect;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::card_table::CardTable;
use crate::config::GcConfig;
use crate::diagnostics::{
    CapabilitySet, DiagnosticMirror, DiagnosticReader, DiagnosticSnapshot, FieldId, MAX_INTERNAL_ROOTS,
};
use crate::error::{GcError, GcResult};
use crate::finalize::{FinalizableEntry, FinalizationQueue};
use crate::generation::{GenerationState, GenerationTable};
use crate::handles::{HandleId, HandleKind, HandleTable};
use crate::mark::{MarkEngine, MarkPhase};
use crate::object::{Address, Generation, ObjectSpace, slot_address};
use crate::oom::{OomEvent, OomHistory};
use crate::segment::{SegmentAllocator, SegmentHandle};
use crate::stats::{CollectionSummary, GcStats};
use crate::sweep::{CompactionReason, ExpansionMechanism, SweepCompactor};
use crate::verify::{self, HeapAnalysis};
use crate::vmem::{SimulatedVirtualMemory, VirtualMemory};

use background::BackgroundCycle;

/// 每堆“关键机制”计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MechanismBit {
    /// 显式请求的回收
    Induced,
    /// 执行了压缩
    Compacted,
    /// 完成的后台回收
    Background,
    /// 被取消的后台回收
    BackgroundAborted,
    /// 报告 OOM 前的最后一次回收
    LastGcBeforeOom,
}

impl MechanismBit {
    /// 数量
    pub const COUNT: usize = 5;

    /// 计数下标
    pub fn index(self) -> usize {
        match self {
            MechanismBit::Induced => 0,
            MechanismBit::Compacted => 1,
            MechanismBit::Background => 2,
            MechanismBit::BackgroundAborted => 3,
            MechanismBit::LastGcBeforeOom => 4,
        }
    }
}

/// 每堆关键数据点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterestingDataPoint {
    /// 扫描的脏卡片
    CardsScanned,
    /// 误报卡片
    FalsePositiveCards,
    /// 固定的存活对象
    PinnedSurvivors,
    /// 移动的对象
    ObjectsRelocated,
    /// 移动的字节
    BytesRelocated,
    /// 晋升的对象
    ObjectsPromoted,
}

impl InterestingDataPoint {
    /// 数量
    pub const COUNT: usize = 6;

    /// 计数下标
    pub fn index(self) -> usize {
        match self {
            InterestingDataPoint::CardsScanned => 0,
            InterestingDataPoint::FalsePositiveCards => 1,
            InterestingDataPoint::PinnedSurvivors => 2,
            InterestingDataPoint::ObjectsRelocated => 3,
            InterestingDataPoint::BytesRelocated => 4,
            InterestingDataPoint::ObjectsPromoted => 5,
        }
    }
}

/// 每堆的原因/机制计数，在堆的生命周期内累积
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapCounters {
    /// 关键数据点
    pub data_points: [u64; InterestingDataPoint::COUNT],
    /// 压缩原因
    pub compact_reasons: [u64; CompactionReason::COUNT],
    /// 扩展机制
    pub expand_mechanisms: [u64; ExpansionMechanism::COUNT],
    /// 机制计数
    pub mechanism_bits: [u64; MechanismBit::COUNT],
}

impl HeapCounters {
    /// 累加数据点
    pub fn add(&mut self, point: InterestingDataPoint, amount: u64) {
        self.data_points[point.index()] += amount;
    }

    /// 记录压缩原因
    pub fn record_compaction(&mut self, reason: CompactionReason) {
        self.compact_reasons[reason.index()] += 1;
    }

    /// 记录扩展机制
    pub fn record_expansion(&mut self, mechanism: ExpansionMechanism) {
        self.expand_mechanisms[mechanism.index()] += 1;
    }

    /// 记录机制
    pub fn record_mechanism(&mut self, bit: MechanismBit) {
        self.mechanism_bits[bit.index()] += 1;
    }

    /// 数据点
    pub fn data_point(&self, point: InterestingDataPoint) -> u64 {
        self.data_points[point.index()]
    }

    /// 压缩原因计数
    pub fn compactions(&self, reason: CompactionReason) -> u64 {
        self.compact_reasons[reason.index()]
    }

    /// 扩展机制计数
    pub fn expansions(&self, mechanism: ExpansionMechanism) -> u64 {
        self.expand_mechanisms[mechanism.index()]
    }

    /// 机制计数
    pub fn mechanism(&self, bit: MechanismBit) -> u64 {
        self.mechanism_bits[bit.index()]
    }
}

/// 对象信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// 地址
    pub address: Address,
    /// 字节数
    pub size: usize,
    /// 当前代
    pub generation: Generation,
    /// 所属逻辑堆
    pub heap: usize,
    /// 所属段
    pub segment: SegmentHandle,
    /// 引用槽数量
    pub ref_slots: usize,
    /// 需要终结
    pub finalizable: bool,
    /// 固定
    pub pinned: bool,
}

/// 一轮终结器执行的结果
#[derive(Debug, Default)]
pub struct FinalizerReport {
    /// 成功执行的数量
    pub ran: usize,
    /// 失败的条目
    pub faults: Vec<GcError>,
}

/// 一个逻辑堆
#[derive(Debug)]
pub(crate) struct LogicalHeap {
    id: usize,
    generations: GenerationTable,
    segments: SegmentAllocator,
    finalization: FinalizationQueue,
    oom: OomHistory,
    counters: HeapCounters,
    internal_roots: Vec<Address>,
    heap_analyze_success: bool,
    saved_sweep_ephemeral: Option<(Address, Address)>,
}

impl LogicalHeap {
    fn new(id: usize, config: &GcConfig, vmem: Arc<dyn VirtualMemory>) -> Self {
        Self {
            id,
            generations: GenerationTable::new(config),
            segments: SegmentAllocator::new(config, vmem),
            finalization: FinalizationQueue::new(),
            oom: OomHistory::new(config.oom_history_capacity),
            counters: HeapCounters::default(),
            internal_roots: Vec::new(),
            heap_analyze_success: false,
            saved_sweep_ephemeral: None,
        }
    }

    fn alloc_pointer(&self) -> Address {
        self.segments
            .alloc_segment(Generation::Gen0)
            .and_then(|h| self.segments.get(h).ok())
            .map_or(Address::NULL, |s| s.allocated())
    }

    fn ephemeral_start(&self) -> Address {
        self.segments
            .ephemeral()
            .and_then(|h| self.segments.get(h).ok())
            .map_or(Address::NULL, |s| s.start())
    }
}

/// 状态锁保护的回收器状态
#[derive(Debug)]
pub(crate) struct CollectorState {
    heaps: Vec<LogicalHeap>,
    handles: HandleTable,
    mark: MarkEngine,
    background: Option<BackgroundCycle>,
    sweeper: SweepCompactor,
    gc_index: u64,
    stats: GcStats,
    last_summary: Option<CollectionSummary>,
}

/// 托管堆管理器
#[derive(Debug)]
pub struct HeapManager {
    config: GcConfig,
    vmem: Arc<dyn VirtualMemory>,
    cards: CardTable,
    write_watch: CardTable,
    watching: AtomicBool,
    space: Arc<RwLock<ObjectSpace>>,
    state: Mutex<CollectorState>,
    mirrors: Arc<[DiagnosticMirror]>,
    capabilities: CapabilitySet,
}

impl HeapManager {
    /// 在模拟虚拟内存上创建
    pub fn new(config: GcConfig) -> GcResult<Self> {
        config.validate()?;
        let vmem: Arc<dyn VirtualMemory> = Arc::new(SimulatedVirtualMemory::new(
            config.base(),
            config.address_space_size,
        ));
        Self::with_virtual_memory(config, vmem)
    }

    /// 使用外部提供的虚拟内存
    pub fn with_virtual_memory(config: GcConfig, vmem: Arc<dyn VirtualMemory>) -> GcResult<Self> {
        config.validate()?;
        let range = vmem.address_space();
        let heaps = (0..config.heap_count)
            .map(|id| LogicalHeap::new(id, &config, Arc::clone(&vmem)))
            .collect();
        let mirrors: Arc<[DiagnosticMirror]> = (0..config.heap_count)
            .map(|_| DiagnosticMirror::new(config.oom_history_capacity))
            .collect();

        log::info!(
            "managed heap: {} heap(s), {:?} layout, concurrent={}, {} gc thread(s), {} bytes of address space",
            config.heap_count,
            config.layout,
            config.concurrent,
            config.gc_threads,
            range.size
        );

        let manager = Self {
            cards: CardTable::new(range.start, range.size, config.card_size),
            write_watch: CardTable::new(range.start, range.size, config.card_size),
            watching: AtomicBool::new(false),
            space: Arc::new(RwLock::new(ObjectSpace::new())),
            state: Mutex::new(CollectorState {
                heaps,
                handles: HandleTable::new(),
                mark: MarkEngine::new(config.gc_threads, config.tuning.parallel_mark_threshold),
                background: None,
                sweeper: SweepCompactor::new(),
                gc_index: 0,
                stats: GcStats::new(),
                last_summary: None,
            }),
            capabilities: CapabilitySet::from_config(&config),
            mirrors,
            vmem,
            config,
        };
        manager.publish(&manager.state.lock());
        Ok(manager)
    }

    /// 配置
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// 逻辑堆数量
    pub fn heap_count(&self) -> usize {
        self.config.heap_count
    }

    /// 全进程卡表
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    /// 已提交字节
    pub fn committed_bytes(&self) -> usize {
        self.vmem.committed_bytes()
    }

    /// 存活对象数
    pub fn object_count(&self) -> usize {
        self.space.read().len()
    }

    /// 统计
    pub fn stats(&self) -> GcStats {
        self.state.lock().stats.clone()
    }

    /// 最近一次回收
    pub fn last_collection(&self) -> Option<CollectionSummary> {
        self.state.lock().last_summary.clone()
    }

    /// 当前线程分配所用堆的预算
    pub fn budget(&self, generation: Generation) -> usize {
        let heap = self.heap_for_current_thread();
        self.state.lock().heaps[heap].generations.budget(generation)
    }

    /// 指定堆的预算
    pub fn budget_on(&self, heap: usize, generation: Generation) -> GcResult<usize> {
        let state = self.state.lock();
        let heap = state.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap.generations.budget(generation))
    }

    /// 某代的状态
    pub fn generation_state(&self, heap: usize, generation: Generation) -> GcResult<GenerationState> {
        let state = self.state.lock();
        let heap = state.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap.generations.get(generation).clone())
    }

    /// OOM 历史（从旧到新）
    pub fn oom_history(&self, heap: usize) -> GcResult<Vec<OomEvent>> {
        let state = self.state.lock();
        let heap = state.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap.oom.iter().cloned().collect())
    }

    /// 原因/机制计数
    pub fn heap_counters(&self, heap: usize) -> GcResult<HeapCounters> {
        let state = self.state.lock();
        let heap = state.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap.counters.clone())
    }

    /// 段数量
    pub fn segment_count(&self, heap: usize) -> GcResult<usize> {
        let state = self.state.lock();
        let heap = state.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap.segments.count())
    }

    /// 当前标记阶段
    pub fn mark_phase(&self) -> MarkPhase {
        let state = self.state.lock();
        state
            .background
            .as_ref()
            .map_or(state.mark.phase(), |c| c.shared.phase())
    }

    /// 诊断读者（不加锁）
    pub fn diagnostics(&self) -> DiagnosticReader {
        DiagnosticReader::new(Arc::clone(&self.mirrors), self.capabilities)
    }

    /// 导出诊断快照
    pub fn export_snapshot(&self) -> GcResult<DiagnosticSnapshot> {
        self.diagnostics().snapshot()
    }

    fn heap_for_current_thread(&self) -> usize {
        if self.config.heap_count == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        (hasher.finish() % self.config.heap_count as u64) as usize
    }

    // ---- 赋值器接口 ----

    /// 写引用槽（含写屏障）
    pub fn write_ref(&self, object: Address, slot: usize, target: Address) -> GcResult<()> {
        let mut space = self.space.write();
        let target_tier = if target.is_null() {
            None
        } else {
            Some(
                space
                    .get(target)
                    .ok_or(GcError::InvalidAddress(target))?
                    .generation
                    .tier(),
            )
        };
        let record = space.get_mut(object).ok_or(GcError::InvalidAddress(object))?;
        let source_tier = record.generation.tier();
        let cell = record
            .refs
            .get_mut(slot)
            .ok_or(GcError::InvalidSlot { object, slot })?;
        *cell = target;

        let field = slot_address(object, slot);
        if target_tier.is_some_and(|t| source_tier > t) {
            self.cards.mark_dirty(field);
        }
        if self.watching.load(Ordering::Acquire) {
            self.write_watch.mark_dirty(field);
        }
        Ok(())
    }

    /// 读引用槽
    pub fn read_ref(&self, object: Address, slot: usize) -> GcResult<Option<Address>> {
        let space = self.space.read();
        let record = space.get(object).ok_or(GcError::InvalidAddress(object))?;
        let target = *record
            .refs
            .get(slot)
            .ok_or(GcError::InvalidSlot { object, slot })?;
        Ok((!target.is_null()).then_some(target))
    }

    /// 创建句柄
    pub fn create_handle(&self, kind: HandleKind, target: Address) -> GcResult<HandleId> {
        let mut state = self.state.lock();
        if !target.is_null() && !self.space.read().contains(target) {
            return Err(GcError::InvalidAddress(target));
        }
        Ok(state.handles.create(kind, target))
    }

    /// 释放句柄
    pub fn free_handle(&self, id: HandleId) -> GcResult<()> {
        self.state.lock().handles.free(id)
    }

    /// 句柄目标；弱句柄的目标死亡后为 `None`
    pub fn handle_target(&self, id: HandleId) -> GcResult<Option<Address>> {
        self.state.lock().handles.target(id)
    }

    /// 登记终结（已登记时不重复）
    pub fn register_for_finalization(&self, object: Address) -> GcResult<()> {
        let mut state = self.state.lock();
        let mut space = self.space.write();
        let record = space.get_mut(object).ok_or(GcError::InvalidAddress(object))?;
        record.finalizable = true;
        let queue = &mut state.heaps[record.heap].finalization;
        if !queue.is_registered(object) {
            queue.register(object, record.generation);
        }
        Ok(())
    }

    /// 取消终结；返回对象是否仍在待终结队列中
    pub fn suppress_finalize(&self, object: Address) -> GcResult<bool> {
        let mut state = self.state.lock();
        let mut space = self.space.write();
        let record = space.get_mut(object).ok_or(GcError::InvalidAddress(object))?;
        record.finalizable = false;
        Ok(state.heaps[record.heap].finalization.suppress(object))
    }

    /// 对象信息
    pub fn object_info(&self, object: Address) -> Option<ObjectInfo> {
        let space = self.space.read();
        space.get(object).map(|r| ObjectInfo {
            address: object,
            size: r.size,
            generation: r.generation,
            heap: r.heap,
            segment: r.segment,
            ref_slots: r.refs.len(),
            finalizable: r.finalizable,
            pinned: r.pinned,
        })
    }

    /// 对象是否存活
    pub fn is_alive(&self, object: Address) -> bool {
        self.space.read().contains(object)
    }

    /// 执行就绪的终结器
    ///
    /// 在锁外逐个调用 `finalizer`；返回 `Err` 或 panic 的条目记为故障并跳过，
    /// 不影响其它条目。执行完毕的对象在下一次回收时被回收。
    pub fn run_finalizers<F>(&self, mut finalizer: F) -> FinalizerReport
    where
        F: FnMut(&FinalizableEntry) -> Result<(), String>,
    {
        let batch: Vec<(usize, FinalizableEntry)> = {
            let mut state = self.state.lock();
            state
                .heaps
                .iter_mut()
                .flat_map(|h| {
                    let id = h.id;
                    h.finalization
                        .take_ready(usize::MAX)
                        .into_iter()
                        .map(move |e| (id, e))
                })
                .collect()
        };

        let mut report = FinalizerReport::default();
        for (heap, entry) in &batch {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| finalizer(entry))) {
                Ok(Ok(())) => {
                    report.ran += 1;
                    continue;
                }
                Ok(Err(message)) => message,
                Err(payload) => panic_message(payload.as_ref()),
            };
            let fault = GcError::FinalizerFault {
                object: entry.object,
                message,
            };
            log::warn!("heap {heap}: {fault}");
            report.faults.push(fault);
        }

        let mut state = self.state.lock();
        for (heap, entry) in &batch {
            state.heaps[*heap].finalization.finish_running(entry.object);
        }
        state.stats.finalizers_run += report.ran as u64;
        state.stats.finalizer_faults += report.faults.len() as u64;
        self.publish(&state);
        report
    }

    /// 从根遍历堆并记录根数组
    pub fn analyze_heap(&self) -> HeapAnalysis {
        let mut state = self.state.lock();
        let roots = Self::roots(&state);
        let space = self.space.read();
        let analysis = verify::analyze_heap(&space, &roots, MAX_INTERNAL_ROOTS);
        for heap in state.heaps.iter_mut() {
            heap.internal_roots.clear();
            heap.heap_analyze_success = analysis.success;
        }
        for root in &roots {
            if let Some(record) = space.get(*root) {
                let list = &mut state.heaps[record.heap].internal_roots;
                if list.len() < MAX_INTERNAL_ROOTS {
                    list.push(*root);
                }
            }
        }
        drop(space);
        self.publish(&state);
        log::debug!(
            "heap analysis: {} roots, {} reachable objects, success={}",
            analysis.root_count,
            analysis.reachable_objects,
            analysis.success
        );
        analysis
    }

    /// 关闭：取消后台周期并释放全部段
    pub fn shutdown(self) -> GcResult<()> {
        let mut state = self.state.lock();
        self.abort_background_locked(&mut state, "heap shutdown");
        for heap in state.heaps.iter_mut() {
            heap.segments.release_all()?;
        }
        *self.space.write() = ObjectSpace::new();
        log::info!(
            "managed heap shut down after {} collection(s)",
            state.stats.total_collections()
        );
        Ok(())
    }

    // ---- 内部工具 ----

    fn roots(state: &CollectorState) -> Vec<Address> {
        let mut roots = state.handles.roots();
        for heap in &state.heaps {
            roots.extend(heap.finalization.roots());
        }
        roots
    }

    fn segment_ranges(state: &CollectorState) -> Vec<(Address, Address)> {
        state
            .heaps
            .iter()
            .flat_map(|h| h.segments.segments().map(|s| (s.start(), s.allocated())))
            .collect()
    }

    /// 分配后只刷新分配相关的字段
    fn publish_allocation(&self, state: &CollectorState, heap: usize) {
        let logical = &state.heaps[heap];
        let allocated = Generation::ALL.map(|g| logical.generations.get(g).allocated_since_gc as u64);
        let mut w = self.mirrors[heap].begin();
        w.set_address(FieldId::AllocAllocated, logical.alloc_pointer());
        w.set_address(FieldId::EphemeralHeapSegment, logical.ephemeral_start());
        w.set_array(FieldId::GenerationAllocated, &allocated);
        w.set(FieldId::SegmentCount, logical.segments.count() as u64);
    }

    /// 发布全部诊断字段
    fn publish(&self, state: &CollectorState) {
        let cycle = state.background.as_ref();
        let bounds = cycle.map(|c| c.shared.bounds());
        let phase = cycle.map_or(state.mark.phase(), |c| c.shared.phase());
        let mark_array = cycle.map_or(0, |c| c.shared.bitmap().storage_address());

        for (heap, mirror) in state.heaps.iter().zip(self.mirrors.iter()) {
            mirror.set_cycle_active(cycle.is_some());
            let oom: Vec<u64> = heap.oom.iter().flat_map(|e| e.encode()).collect();
            let roots: Vec<u64> = heap.internal_roots.iter().map(|a| a.as_usize() as u64).collect();
            let budgets = Generation::ALL.map(|g| heap.generations.budget(g) as u64);
            let allocated = Generation::ALL.map(|g| heap.generations.get(g).allocated_since_gc as u64);
            let (saved_seg, saved_start) = heap
                .saved_sweep_ephemeral
                .unwrap_or((Address::NULL, Address::NULL));

            let mut w = mirror.begin();
            w.set_address(FieldId::AllocAllocated, heap.alloc_pointer());
            w.set_address(FieldId::EphemeralHeapSegment, heap.ephemeral_start());
            w.set(
                FieldId::FinalizeQueue,
                std::ptr::from_ref(&heap.finalization) as usize as u64,
            );
            w.set_array(FieldId::OomInfo, &oom);
            w.set_array(FieldId::InterestingDataPerHeap, &heap.counters.data_points);
            w.set_array(FieldId::CompactReasonsPerHeap, &heap.counters.compact_reasons);
            w.set_array(FieldId::ExpandMechanismsPerHeap, &heap.counters.expand_mechanisms);
            w.set_array(FieldId::InterestingMechanismBitsPerHeap, &heap.counters.mechanism_bits);
            w.set_array(FieldId::InternalRootArray, &roots);
            w.set(FieldId::InternalRootArrayIndex, roots.len() as u64);
            w.set_flag(FieldId::HeapAnalyzeSuccess, heap.heap_analyze_success);
            w.set(FieldId::CardTable, self.cards.storage_address() as u64);
            w.set(FieldId::MarkArray, mark_array as u64);
            w.set_address(FieldId::NextSweepObj, state.sweeper.next_sweep_obj());
            w.set_address(
                FieldId::BackgroundSavedLowestAddress,
                bounds.map_or(Address::NULL, |b| b.low),
            );
            w.set_address(
                FieldId::BackgroundSavedHighestAddress,
                bounds.map_or(Address::NULL, |b| b.high),
            );
            w.set_address(FieldId::SavedSweepEphemeralSeg, saved_seg);
            w.set_address(FieldId::SavedSweepEphemeralStart, saved_start);
            w.set(FieldId::GcIndex, state.gc_index);
            w.set(FieldId::MarkPhase, phase as u64);
            w.set_array(FieldId::GenerationBudgets, &budgets);
            w.set_array(FieldId::GenerationAllocated, &allocated);
            w.set(FieldId::SegmentCount, heap.segments.count() as u64);
            w.set(FieldId::FinalizeReadyCount, heap.finalization.ready_count() as u64);
            w.set(FieldId::ConcurrentMarkAborts, state.stats.background_aborts);
            w.set(FieldId::OomTotal, heap.oom.total_recorded());
        }
    }
}

impl Drop for HeapManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(mut cycle) = state.background.take() {
            cycle.shared.request_abort();
            if let Some(thread) = cycle.take_thread()
                && thread.join().is_err()
            {
                log::warn!("background mark thread panicked during drop");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "finalizer panicked".to_string()
    }
}
