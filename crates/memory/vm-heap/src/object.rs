//! 对象模型：地址、代、对象记录与对象空间
//!
//! 引擎不保存对象负载，只保存大小、代、所属段以及引用槽。
//! 对象空间按地址有序，供卡表扫描、清除和压缩按区间遍历。

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::segment::SegmentHandle;

/// 指针宽度
pub const POINTER_SIZE: usize = 8;
/// 对象头大小（方法表指针 + 同步块）
pub const OBJECT_HEADER_SIZE: usize = 16;
/// 最小对象大小
pub const MIN_OBJECT_SIZE: usize = 24;
/// 对象对齐
pub const OBJECT_ALIGNMENT: usize = 8;

/// 模拟虚拟地址；0 表示空引用
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address(pub usize);

impl Address {
    /// 空地址
    pub const NULL: Address = Address(0);

    /// 是否为空
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 原始数值
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// 偏移
    #[inline]
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// 与另一地址的距离（self >= other）
    #[inline]
    pub fn distance_from(self, other: Address) -> usize {
        self.0 - other.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 按对齐向上取整
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 按对齐向上取整，溢出返回 `None`
#[inline]
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

/// 代
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Generation {
    /// 第 0 代（新生代）
    Gen0,
    /// 第 1 代
    Gen1,
    /// 第 2 代（最高代）
    Gen2,
    /// 大对象堆
    Large,
    /// 固定对象堆
    Pinned,
}

impl Generation {
    /// 代的数量
    pub const COUNT: usize = 5;

    /// 全部代，按表索引排列
    pub const ALL: [Generation; Generation::COUNT] = [
        Generation::Gen0,
        Generation::Gen1,
        Generation::Gen2,
        Generation::Large,
        Generation::Pinned,
    ];

    /// 表索引
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Generation::Gen0 => 0,
            Generation::Gen1 => 1,
            Generation::Gen2 => 2,
            Generation::Large => 3,
            Generation::Pinned => 4,
        }
    }

    /// 由表索引还原
    pub fn from_index(index: usize) -> Option<Generation> {
        Generation::ALL.get(index).copied()
    }

    /// 逻辑代龄：大对象堆与固定对象堆与第 2 代同级
    #[inline]
    pub fn tier(self) -> u8 {
        match self {
            Generation::Gen0 => 0,
            Generation::Gen1 => 1,
            _ => 2,
        }
    }

    /// 存活后晋升到的代（只升不降）
    #[inline]
    pub fn promoted(self) -> Generation {
        match self {
            Generation::Gen0 => Generation::Gen1,
            Generation::Gen1 => Generation::Gen2,
            other => other,
        }
    }

    /// 回收请求归一化到 Gen0/Gen1/Gen2
    #[inline]
    pub fn condemn_tier(self) -> Generation {
        match self {
            Generation::Gen0 => Generation::Gen0,
            Generation::Gen1 => Generation::Gen1,
            _ => Generation::Gen2,
        }
    }

    /// 是否被对 `condemned` 的回收所覆盖
    #[inline]
    pub fn is_condemned_by(self, condemned: Generation) -> bool {
        self.tier() <= condemned.condemn_tier().tier()
    }

    /// 是否为短暂代
    #[inline]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Generation::Gen0 | Generation::Gen1)
    }
}

/// 分配请求：对象模型向引擎声明的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// 请求字节数
    pub size: usize,
    /// 代提示
    pub generation: Generation,
    /// 引用槽数量
    pub ref_slots: usize,
    /// 是否需要终结
    pub finalizable: bool,
    /// 是否固定（不可移动）
    pub pinned: bool,
}

impl AllocRequest {
    /// 新建第 0 代请求
    pub fn new(size: usize) -> Self {
        Self {
            size,
            generation: Generation::Gen0,
            ref_slots: 0,
            finalizable: false,
            pinned: false,
        }
    }

    /// 设置代提示
    pub fn generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    /// 设置引用槽数量
    pub fn ref_slots(mut self, slots: usize) -> Self {
        self.ref_slots = slots;
        self
    }

    /// 标记为需要终结
    pub fn finalizable(mut self) -> Self {
        self.finalizable = true;
        self
    }

    /// 标记为固定
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// 实际占用字节：对齐、容纳对象头与引用槽、不小于最小对象
    ///
    /// 大小无法在地址宽度内表示时返回 `None`。
    pub fn effective_size(&self) -> Option<usize> {
        let needed = self
            .ref_slots
            .checked_mul(POINTER_SIZE)?
            .checked_add(OBJECT_HEADER_SIZE)?;
        checked_align_up(self.size.max(needed).max(MIN_OBJECT_SIZE), OBJECT_ALIGNMENT)
    }
}

/// 引用槽的字段地址
#[inline]
pub fn slot_address(object: Address, slot: usize) -> Address {
    object.offset(OBJECT_HEADER_SIZE + slot * POINTER_SIZE)
}

/// 对象记录
#[derive(Debug)]
pub struct ObjectRecord {
    /// 字节数
    pub size: usize,
    /// 当前代
    pub generation: Generation,
    /// 所属逻辑堆
    pub heap: usize,
    /// 所属段
    pub segment: SegmentHandle,
    /// 引用槽（NULL 表示空）
    pub refs: Vec<Address>,
    /// 需要终结
    pub finalizable: bool,
    /// 分配时固定
    pub pinned: bool,
    /// 阻塞式标记位
    mark: AtomicBool,
}

impl ObjectRecord {
    /// 新建记录
    pub fn new(
        size: usize,
        generation: Generation,
        heap: usize,
        segment: SegmentHandle,
        ref_slots: usize,
    ) -> Self {
        Self {
            size,
            generation,
            heap,
            segment,
            refs: vec![Address::NULL; ref_slots],
            finalizable: false,
            pinned: false,
            mark: AtomicBool::new(false),
        }
    }

    /// 置标记位；返回是否由本次调用首次标记
    #[inline]
    pub fn try_mark(&self) -> bool {
        !self.mark.swap(true, Ordering::AcqRel)
    }

    /// 是否已标记
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire)
    }

    /// 清除标记位
    #[inline]
    pub fn clear_mark(&self) {
        self.mark.store(false, Ordering::Release);
    }

    /// 非空引用
    pub fn references(&self) -> impl Iterator<Item = Address> + '_ {
        self.refs.iter().copied().filter(|a| !a.is_null())
    }
}

/// 对象空间：所有堆共享的有序对象表
#[derive(Debug, Default)]
pub struct ObjectSpace {
    objects: BTreeMap<Address, ObjectRecord>,
    total_bytes: usize,
}

impl ObjectSpace {
    /// 新建空对象空间
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入对象
    pub fn insert(&mut self, addr: Address, record: ObjectRecord) {
        self.total_bytes += record.size;
        if let Some(old) = self.objects.insert(addr, record) {
            self.total_bytes -= old.size;
        }
    }

    /// 移除对象
    pub fn remove(&mut self, addr: Address) -> Option<ObjectRecord> {
        let record = self.objects.remove(&addr)?;
        self.total_bytes -= record.size;
        Some(record)
    }

    /// 查找对象
    #[inline]
    pub fn get(&self, addr: Address) -> Option<&ObjectRecord> {
        self.objects.get(&addr)
    }

    /// 可变查找
    #[inline]
    pub fn get_mut(&mut self, addr: Address) -> Option<&mut ObjectRecord> {
        self.objects.get_mut(&addr)
    }

    /// 是否存在
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.objects.contains_key(&addr)
    }

    /// 对象数量
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// 对象总字节
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// 按地址顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (Address, &ObjectRecord)> {
        self.objects.iter().map(|(a, r)| (*a, r))
    }

    /// 按地址顺序可变遍历
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Address, &mut ObjectRecord)> {
        self.objects.iter_mut().map(|(a, r)| (*a, r))
    }

    /// 起始地址落在 [start, end) 内的对象
    pub fn starting_in(
        &self,
        start: Address,
        end: Address,
    ) -> impl Iterator<Item = (Address, &ObjectRecord)> {
        self.objects
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(a, r)| (*a, r))
    }

    /// 与 [start, end) 有交集的对象（含起点在 start 之前、跨入区间的对象）
    pub fn overlapping(&self, start: Address, end: Address) -> Vec<Address> {
        let mut result = Vec::new();
        if let Some((addr, record)) = self.objects.range(..start).next_back()
            && addr.offset(record.size) > start
        {
            result.push(*addr);
        }
        result.extend(self.starting_in(start, end).map(|(a, _)| a));
        result
    }

    /// 清除所有标记位
    pub fn clear_marks(&self) {
        for record in self.objects.values() {
            record.clear_mark();
        }
    }

    /// 依谓词批量移除，返回被移除的 (地址, 记录)
    pub fn remove_where<F>(&mut self, mut dead: F) -> Vec<(Address, ObjectRecord)>
    where
        F: FnMut(Address, &ObjectRecord) -> bool,
    {
        let victims: Vec<Address> = self
            .objects
            .iter()
            .filter(|(a, r)| dead(**a, r))
            .map(|(a, _)| *a)
            .collect();
        victims
            .into_iter()
            .filter_map(|a| self.remove(a).map(|r| (a, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: usize) -> ObjectRecord {
        ObjectRecord::new(size, Generation::Gen0, 0, SegmentHandle(0), 1)
    }

    #[test]
    fn test_generation_tiers() {
        assert_eq!(Generation::Gen0.promoted(), Generation::Gen1);
        assert_eq!(Generation::Gen1.promoted(), Generation::Gen2);
        assert_eq!(Generation::Large.promoted(), Generation::Large);
        assert!(Generation::Gen0.is_condemned_by(Generation::Gen0));
        assert!(!Generation::Gen1.is_condemned_by(Generation::Gen0));
        assert!(Generation::Large.is_condemned_by(Generation::Gen2));
        assert!(!Generation::Pinned.is_condemned_by(Generation::Gen1));
        for g in Generation::ALL {
            assert_eq!(Generation::from_index(g.index()), Some(g));
        }
    }

    #[test]
    fn test_effective_size() {
        assert_eq!(AllocRequest::new(1).effective_size(), Some(MIN_OBJECT_SIZE));
        assert_eq!(AllocRequest::new(30).effective_size(), Some(32));
        assert_eq!(AllocRequest::new(24).ref_slots(4).effective_size(), Some(48));
    }

    #[test]
    fn test_effective_size_overflow() {
        assert_eq!(AllocRequest::new(usize::MAX - 3).effective_size(), None);
        assert_eq!(AllocRequest::new(64).ref_slots(usize::MAX / 4).effective_size(), None);
        assert_eq!(
            AllocRequest::new(64).ref_slots(usize::MAX / POINTER_SIZE).effective_size(),
            None
        );
        assert_eq!(checked_align_up(usize::MAX, 8), None);
        assert_eq!(checked_align_up(13, 8), Some(16));
    }

    #[test]
    fn test_mark_bit() {
        let r = record(32);
        assert!(r.try_mark());
        assert!(!r.try_mark());
        assert!(r.is_marked());
        r.clear_mark();
        assert!(!r.is_marked());
    }

    #[test]
    fn test_overlapping_lookup() {
        let mut space = ObjectSpace::new();
        space.insert(Address(0x1000), record(0x200));
        space.insert(Address(0x1200), record(0x40));
        space.insert(Address(0x1400), record(0x40));

        let hits = space.overlapping(Address(0x1100), Address(0x1300));
        assert_eq!(hits, vec![Address(0x1000), Address(0x1200)]);
        assert_eq!(space.total_bytes(), 0x280);

        let removed = space.remove_where(|a, _| a == Address(0x1200));
        assert_eq!(removed.len(), 1);
        assert_eq!(space.len(), 2);
        assert_eq!(space.total_bytes(), 0x240);
    }
}
