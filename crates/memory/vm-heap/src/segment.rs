//! 段/区域分配器
//!
//! 段模式下第 0、1 代共享唯一的短暂段，其它代按倍增大小追加段；
//! 区域模式下每一代拥有一组固定大小的区域，空区域回到解除提交的空闲池。
//! 段以句柄（arena 下标）寻址，段不持有指向堆的反向指针。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{GcConfig, HeapLayout};
use crate::error::{GcError, GcResult};
use crate::object::{Address, Generation, MIN_OBJECT_SIZE, ObjectSpace, align_up};
use crate::vmem::{AddressRange, VirtualMemory};

/// 段句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentHandle(pub u32);

/// 段种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// 可变大小的段
    Segment,
    /// 固定大小（或其整数倍）的区域
    Region,
}

/// 空闲区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpan {
    /// 起始地址
    pub start: Address,
    /// 字节数
    pub size: usize,
}

impl FreeSpan {
    /// 结束地址（不含）
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }
}

/// 堆段
#[derive(Debug, Clone)]
pub struct HeapSegment {
    handle: SegmentHandle,
    kind: SegmentKind,
    range: AddressRange,
    committed: usize,
    allocated: Address,
    owner: Generation,
    free_spans: Vec<FreeSpan>,
}

impl HeapSegment {
    /// 句柄
    pub fn handle(&self) -> SegmentHandle {
        self.handle
    }

    /// 种类
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// 起始地址
    pub fn start(&self) -> Address {
        self.range.start
    }

    /// 预留结束地址
    pub fn reserved_end(&self) -> Address {
        self.range.end()
    }

    /// 预留区间
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// 分配指针
    pub fn allocated(&self) -> Address {
        self.allocated
    }

    /// 已提交结束地址
    pub fn committed_end(&self) -> Address {
        self.range.start.offset(self.committed)
    }

    /// 已提交字节
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// 所属代
    pub fn owner(&self) -> Generation {
        self.owner
    }

    /// 空闲链表
    pub fn free_spans(&self) -> &[FreeSpan] {
        &self.free_spans
    }

    /// 空闲链表字节
    pub fn free_bytes(&self) -> usize {
        self.free_spans.iter().map(|s| s.size).sum()
    }

    /// 已分配字节（分配指针以下）
    pub fn used_bytes(&self) -> usize {
        self.allocated.distance_from(self.range.start)
    }

    /// 分配指针之后还可用的字节
    pub fn remaining(&self) -> usize {
        self.range.end().distance_from(self.allocated)
    }

    /// 地址是否落在预留区间
    pub fn contains(&self, addr: Address) -> bool {
        self.range.contains(addr)
    }

    /// 清除之后重置分配指针与空闲链表
    pub fn reset(&mut self, allocated: Address, free_spans: Vec<FreeSpan>) {
        debug_assert!(allocated >= self.range.start && allocated <= self.committed_end());
        self.allocated = allocated;
        self.free_spans = free_spans;
    }
}

/// 新段的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGrowth {
    /// 新段句柄
    pub handle: SegmentHandle,
    /// 是否复用了空闲池中的区域
    pub reused: bool,
    /// 是否替换了短暂段
    pub new_ephemeral: bool,
}

/// 段分配器（每个逻辑堆一个）
#[derive(Debug)]
pub struct SegmentAllocator {
    layout: HeapLayout,
    vmem: Arc<dyn VirtualMemory>,
    slots: Vec<Option<HeapSegment>>,
    owned: [Vec<SegmentHandle>; Generation::COUNT],
    grown: [u32; Generation::COUNT],
    ephemeral: Option<SegmentHandle>,
    free_regions: Vec<AddressRange>,
    initial_segment_size: usize,
    max_segment_size: usize,
    region_size: usize,
    commit_granularity: usize,
}

impl SegmentAllocator {
    /// 按配置创建
    pub fn new(config: &GcConfig, vmem: Arc<dyn VirtualMemory>) -> Self {
        Self {
            layout: config.layout,
            vmem,
            slots: Vec::new(),
            owned: Default::default(),
            grown: [0; Generation::COUNT],
            ephemeral: None,
            free_regions: Vec::new(),
            initial_segment_size: config.initial_segment_size,
            max_segment_size: config.max_segment_size,
            region_size: config.region_size,
            commit_granularity: config.commit_granularity,
        }
    }

    /// 布局
    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    /// 查找段
    pub fn get(&self, handle: SegmentHandle) -> GcResult<&HeapSegment> {
        self.slots
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(GcError::InvalidSegment(handle.0))
    }

    /// 可变查找段
    pub fn get_mut(&mut self, handle: SegmentHandle) -> GcResult<&mut HeapSegment> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(GcError::InvalidSegment(handle.0))
    }

    /// 所有存活段
    pub fn segments(&self) -> impl Iterator<Item = &HeapSegment> {
        self.slots.iter().flatten()
    }

    /// 所有存活段（可变）
    pub fn segments_mut(&mut self) -> impl Iterator<Item = &mut HeapSegment> {
        self.slots.iter_mut().flatten()
    }

    /// 段数量
    pub fn count(&self) -> usize {
        self.segments().count()
    }

    /// 某代拥有的段
    pub fn owned_by(&self, generation: Generation) -> &[SegmentHandle] {
        &self.owned[generation.index()]
    }

    /// 短暂段（仅段模式）
    pub fn ephemeral(&self) -> Option<SegmentHandle> {
        self.ephemeral
    }

    /// 某代当前的分配段
    pub fn alloc_segment(&self, generation: Generation) -> Option<SegmentHandle> {
        match (self.layout, generation) {
            (HeapLayout::Segments, Generation::Gen0 | Generation::Gen1) => self.ephemeral,
            _ => self.owned[generation.index()].last().copied(),
        }
    }

    /// 某代可用于分配的段（空闲链表查找范围）
    pub fn alloc_candidates(&self, generation: Generation) -> Vec<SegmentHandle> {
        match (self.layout, generation) {
            (HeapLayout::Segments, Generation::Gen0 | Generation::Gen1) => {
                self.ephemeral.into_iter().collect()
            }
            _ => self.owned[generation.index()].clone(),
        }
    }

    /// 某代可分配段上的空闲字节
    pub fn free_bytes_for(&self, generation: Generation) -> usize {
        self.alloc_candidates(generation)
            .into_iter()
            .filter_map(|h| self.get(h).ok())
            .map(HeapSegment::free_bytes)
            .sum()
    }

    /// 地址所在段
    pub fn segment_of(&self, addr: Address) -> Option<SegmentHandle> {
        self.segments().find(|s| s.contains(addr)).map(|s| s.handle)
    }

    /// 最低起始地址与最高分配指针
    pub fn bounds(&self) -> Option<(Address, Address)> {
        let low = self.segments().map(HeapSegment::start).min()?;
        let high = self.segments().map(HeapSegment::allocated).max()?;
        Some((low, high))
    }

    /// 已提交字节
    pub fn committed_bytes(&self) -> usize {
        self.segments().map(HeapSegment::committed).sum()
    }

    fn next_segment_size(&self, generation: Generation, min_size: usize) -> usize {
        match self.layout {
            HeapLayout::Segments => {
                let shift = self.grown[generation.index()].min(16);
                let grown = self
                    .initial_segment_size
                    .saturating_mul(1usize << shift)
                    .min(self.max_segment_size);
                align_up(grown.max(min_size), self.commit_granularity)
            }
            HeapLayout::Regions => {
                if min_size <= self.region_size {
                    self.region_size
                } else {
                    align_up(min_size, self.region_size)
                }
            }
        }
    }

    /// 为某代获取新段或区域，至少容纳 `min_size` 字节
    pub fn allocate_segment_or_region(
        &mut self,
        generation: Generation,
        min_size: usize,
    ) -> GcResult<SegmentGrowth> {
        let owner = match (self.layout, generation) {
            (HeapLayout::Segments, Generation::Gen1) => Generation::Gen0,
            _ => generation,
        };
        let size = self.next_segment_size(owner, min_size);

        let (range, kind, reused) = match self.layout {
            HeapLayout::Segments => {
                let range = self.vmem.reserve(size, self.commit_granularity)?;
                (range, SegmentKind::Segment, false)
            }
            HeapLayout::Regions => {
                if size == self.region_size
                    && let Some(range) = self.free_regions.pop()
                {
                    (range, SegmentKind::Region, true)
                } else {
                    let range = self.vmem.reserve(size, self.region_size)?;
                    (range, SegmentKind::Region, false)
                }
            }
        };

        let handle = SegmentHandle(self.slots.len() as u32);
        self.slots.push(Some(HeapSegment {
            handle,
            kind,
            range,
            committed: 0,
            allocated: range.start,
            owner,
            free_spans: Vec::new(),
        }));
        self.grown[owner.index()] += 1;

        let mut new_ephemeral = false;
        if self.layout == HeapLayout::Segments && owner == Generation::Gen0 {
            // 旧短暂段交给第 2 代
            if let Some(old) = self.ephemeral.replace(handle) {
                self.retag(old, Generation::Gen2)?;
            }
            new_ephemeral = true;
        }
        self.owned[owner.index()].push(handle);

        log::debug!(
            "segment {} for {:?}: {} bytes at {}{}",
            handle.0,
            owner,
            range.size,
            range.start,
            if reused { " (reused)" } else { "" }
        );
        Ok(SegmentGrowth {
            handle,
            reused,
            new_ephemeral,
        })
    }

    /// 指针碰撞分配；段空间不足返回 `Ok(None)`，提交失败返回错误
    pub fn bump(&mut self, handle: SegmentHandle, size: usize) -> GcResult<Option<Address>> {
        let granularity = self.commit_granularity;
        let vmem = Arc::clone(&self.vmem);
        let segment = self.get_mut(handle)?;
        let start = segment.allocated;
        let end = start.offset(size);
        if end > segment.reserved_end() {
            return Ok(None);
        }
        if end > segment.committed_end() {
            let target = align_up(end.as_usize(), granularity).min(segment.reserved_end().as_usize());
            let grow = AddressRange::new(
                segment.committed_end(),
                target - segment.committed_end().as_usize(),
            );
            vmem.commit(grow)?;
            segment.committed += grow.size;
        }
        segment.allocated = end;
        Ok(Some(start))
    }

    /// 空闲链表首次适配
    pub fn take_free(&mut self, handle: SegmentHandle, size: usize) -> Option<Address> {
        let segment = self.get_mut(handle).ok()?;
        let idx = segment.free_spans.iter().position(|s| s.size >= size)?;
        let span = segment.free_spans[idx];
        let rest = span.size - size;
        if rest >= MIN_OBJECT_SIZE {
            segment.free_spans[idx] = FreeSpan {
                start: span.start.offset(size),
                size: rest,
            };
        } else {
            segment.free_spans.remove(idx);
        }
        Some(span.start)
    }

    /// 更换段的所属代
    pub fn retag(&mut self, handle: SegmentHandle, owner: Generation) -> GcResult<()> {
        let old = self.get(handle)?.owner;
        if old == owner {
            return Ok(());
        }
        self.owned[old.index()].retain(|h| *h != handle);
        self.owned[owner.index()].push(handle);
        self.get_mut(handle)?.owner = owner;
        Ok(())
    }

    /// 区域模式：被回收的短暂区域整体晋升
    pub fn promote_regions(&mut self, condemned: Generation) -> GcResult<()> {
        if self.layout != HeapLayout::Regions {
            return Ok(());
        }
        if condemned.condemn_tier().tier() >= 1 {
            for handle in self.owned[Generation::Gen1.index()].clone() {
                self.retag(handle, Generation::Gen2)?;
            }
        }
        for handle in self.owned[Generation::Gen0.index()].clone() {
            self.retag(handle, Generation::Gen1)?;
        }
        Ok(())
    }

    /// 段内没有对象时解除提交并移除；返回是否移除
    pub fn decommit_if_empty(
        &mut self,
        handle: SegmentHandle,
        space: &ObjectSpace,
    ) -> GcResult<bool> {
        if self.ephemeral == Some(handle) {
            return Ok(false);
        }
        let segment = self.get(handle)?;
        if space
            .starting_in(segment.start(), segment.reserved_end())
            .next()
            .is_some()
        {
            return Ok(false);
        }
        let (range, committed, kind, owner) =
            (segment.range, segment.committed, segment.kind, segment.owner);

        if committed > 0 {
            self.vmem.decommit(AddressRange::new(range.start, committed))?;
        }
        if kind == SegmentKind::Region && range.size == self.region_size {
            self.free_regions.push(range);
        } else {
            self.vmem.release(range)?;
        }
        self.owned[owner.index()].retain(|h| *h != handle);
        self.slots[handle.0 as usize] = None;
        log::debug!("segment {} decommitted ({} bytes)", handle.0, committed);
        Ok(true)
    }

    /// 空闲区域池大小
    pub fn free_region_count(&self) -> usize {
        self.free_regions.len()
    }

    /// 释放全部段
    pub fn release_all(&mut self) -> GcResult<()> {
        for slot in self.slots.iter_mut() {
            if let Some(segment) = slot.take() {
                if segment.committed > 0 {
                    self.vmem
                        .decommit(AddressRange::new(segment.range.start, segment.committed))?;
                }
                self.vmem.release(segment.range)?;
            }
        }
        for range in self.free_regions.drain(..) {
            self.vmem.release(range)?;
        }
        self.owned = Default::default();
        self.ephemeral = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectRecord;
    use crate::vmem::SimulatedVirtualMemory;

    const MB: usize = 1024 * 1024;

    fn config(layout: HeapLayout) -> GcConfig {
        GcConfig {
            layout,
            address_space_size: 256 * MB,
            initial_segment_size: 4 * MB,
            max_segment_size: 16 * MB,
            region_size: MB,
            ..GcConfig::default()
        }
    }

    fn allocator(layout: HeapLayout) -> SegmentAllocator {
        let cfg = config(layout);
        let vmem: Arc<dyn VirtualMemory> = Arc::new(SimulatedVirtualMemory::new(
            cfg.base(),
            cfg.address_space_size,
        ));
        SegmentAllocator::new(&cfg, vmem)
    }

    #[test]
    fn test_segments_grow_and_single_ephemeral() {
        let mut alloc = allocator(HeapLayout::Segments);
        let first = alloc.allocate_segment_or_region(Generation::Gen0, 64).unwrap();
        assert!(first.new_ephemeral);
        let second = alloc.allocate_segment_or_region(Generation::Gen0, 64).unwrap();
        assert_eq!(alloc.ephemeral(), Some(second.handle));

        // 旧短暂段归第 2 代，新段更大
        let old = alloc.get(first.handle).unwrap();
        assert_eq!(old.owner(), Generation::Gen2);
        let new = alloc.get(second.handle).unwrap();
        assert!(new.range().size > old.range().size);
        assert_eq!(alloc.alloc_segment(Generation::Gen1), Some(second.handle));
    }

    #[test]
    fn test_bump_commits_on_demand() {
        let mut alloc = allocator(HeapLayout::Segments);
        let seg = alloc
            .allocate_segment_or_region(Generation::Gen2, 64)
            .unwrap()
            .handle;
        let a = alloc.bump(seg, 1024).unwrap().unwrap();
        let b = alloc.bump(seg, 1024).unwrap().unwrap();
        assert_eq!(b, a.offset(1024));
        let s = alloc.get(seg).unwrap();
        assert!(s.committed() >= 2048);
        assert!(alloc.bump(seg, 64 * MB).unwrap().is_none());
    }

    #[test]
    fn test_take_free_splits_span() {
        let mut alloc = allocator(HeapLayout::Segments);
        let seg = alloc
            .allocate_segment_or_region(Generation::Gen2, 64)
            .unwrap()
            .handle;
        let base = alloc.bump(seg, 4096).unwrap().unwrap();
        let allocated = alloc.get(seg).unwrap().allocated();
        alloc.get_mut(seg).unwrap().reset(
            allocated,
            vec![FreeSpan {
                start: base,
                size: 256,
            }],
        );
        assert_eq!(alloc.take_free(seg, 100), Some(base));
        assert_eq!(alloc.get(seg).unwrap().free_bytes(), 156);
        assert_eq!(alloc.take_free(seg, 200), None);
    }

    #[test]
    fn test_regions_reuse_free_pool() {
        let mut alloc = allocator(HeapLayout::Regions);
        assert_eq!(alloc.ephemeral(), None);
        let r = alloc.allocate_segment_or_region(Generation::Gen0, 64).unwrap();
        assert_eq!(alloc.get(r.handle).unwrap().range().size, MB);
        let space = ObjectSpace::new();
        assert!(alloc.decommit_if_empty(r.handle, &space).unwrap());
        assert_eq!(alloc.free_region_count(), 1);
        assert!(alloc.get(r.handle).is_err());

        let again = alloc.allocate_segment_or_region(Generation::Gen0, 64).unwrap();
        assert!(again.reused);

        let large = alloc
            .allocate_segment_or_region(Generation::Large, 3 * MB + 1)
            .unwrap();
        assert_eq!(alloc.get(large.handle).unwrap().range().size, 4 * MB);
    }

    #[test]
    fn test_decommit_keeps_occupied_segment() {
        let mut alloc = allocator(HeapLayout::Regions);
        let r = alloc
            .allocate_segment_or_region(Generation::Gen0, 64)
            .unwrap()
            .handle;
        let addr = alloc.bump(r, 64).unwrap().unwrap();
        let mut space = ObjectSpace::new();
        space.insert(addr, ObjectRecord::new(64, Generation::Gen0, 0, r, 0));
        assert!(!alloc.decommit_if_empty(r, &space).unwrap());

        alloc.promote_regions(Generation::Gen0).unwrap();
        assert_eq!(alloc.owned_by(Generation::Gen1), &[r]);
        assert!(alloc.owned_by(Generation::Gen0).is_empty());
    }
}
