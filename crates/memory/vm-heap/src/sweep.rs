//! 清除与压缩
//!
//! 清除：移除死亡对象后，按存活对象的位置重建每个段的空闲链表
//! （相邻空隙天然合并，小于最小对象的空隙丢弃，分配指针回退到最后一个存活对象）。
//! 结果只取决于对象位置，因此重复清除结果相同。
//!
//! 压缩：先完整计算转发表，再一次性应用：把可移动对象滑向段内低地址，
//! 并改写所有引用。固定对象和未被回收的对象原地不动。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::TuningConfig;
use crate::object::{Address, MIN_OBJECT_SIZE, ObjectRecord, ObjectSpace};
use crate::segment::{FreeSpan, HeapSegment};

/// 压缩原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompactionReason {
    /// 报告 OOM 之前的最后一次回收
    LastGcBeforeOom,
    /// 显式要求压缩
    Induced,
    /// 短暂段剩余空间不足一个第 0 代预算
    LowEphemeralSpace,
    /// 碎片率过高
    HighFragmentation,
    /// 大对象堆碎片率过高
    LargeObjectFragmentation,
}

impl CompactionReason {
    /// 种类数
    pub const COUNT: usize = 5;

    /// 计数数组下标
    pub fn index(self) -> usize {
        match self {
            CompactionReason::LastGcBeforeOom => 0,
            CompactionReason::Induced => 1,
            CompactionReason::LowEphemeralSpace => 2,
            CompactionReason::HighFragmentation => 3,
            CompactionReason::LargeObjectFragmentation => 4,
        }
    }
}

impl fmt::Display for CompactionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 堆扩展方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpansionMechanism {
    /// 新段
    NewSegment,
    /// 新的短暂段
    NewEphemeralSegment,
    /// 新区域
    NewRegion,
    /// 复用空闲池中的区域
    ReusedRegion,
    /// 大对象分配突增
    LargeObjectSpike,
    /// 空闲空间足够但不连续
    FragmentationGrowth,
    /// 无法扩展
    NoMemory,
}

impl ExpansionMechanism {
    /// 种类数
    pub const COUNT: usize = 7;

    /// 计数数组下标
    pub fn index(self) -> usize {
        match self {
            ExpansionMechanism::NewSegment => 0,
            ExpansionMechanism::NewEphemeralSegment => 1,
            ExpansionMechanism::NewRegion => 2,
            ExpansionMechanism::ReusedRegion => 3,
            ExpansionMechanism::LargeObjectSpike => 4,
            ExpansionMechanism::FragmentationGrowth => 5,
            ExpansionMechanism::NoMemory => 6,
        }
    }
}

/// 压缩决策的输入
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionInputs {
    /// 清除后被回收区域的空闲链表字节
    pub free_bytes: usize,
    /// 被回收区域的已分配字节
    pub allocated_bytes: usize,
    /// 存活对象数
    pub survivors: usize,
    /// 存活的固定对象数
    pub pinned_survivors: usize,
    /// 显式要求压缩
    pub induced_compacting: bool,
    /// 报告 OOM 之前的最后一次回收
    pub last_gc_before_oom: bool,
    /// 段模式下短暂段的可用字节
    pub ephemeral_available: Option<usize>,
    /// 第 0 代预算
    pub gen0_budget: usize,
    /// 完全回收
    pub full: bool,
    /// 大对象堆空闲字节
    pub large_free_bytes: usize,
    /// 大对象堆已分配字节
    pub large_allocated_bytes: usize,
}

impl CompactionInputs {
    /// 碎片率
    pub fn fragmentation_ratio(&self) -> f64 {
        ratio(self.free_bytes, self.allocated_bytes)
    }

    /// 固定对象密度
    pub fn pinned_density(&self) -> f64 {
        ratio(self.pinned_survivors, self.survivors)
    }

    /// 大对象堆碎片率
    pub fn large_fragmentation_ratio(&self) -> f64 {
        ratio(self.large_free_bytes, self.large_allocated_bytes)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// 压缩决策
pub fn decide_compaction(inputs: &CompactionInputs, tuning: &TuningConfig) -> Option<CompactionReason> {
    if inputs.last_gc_before_oom {
        return Some(CompactionReason::LastGcBeforeOom);
    }
    if inputs.induced_compacting {
        return Some(CompactionReason::Induced);
    }
    if let Some(available) = inputs.ephemeral_available
        && available < inputs.gen0_budget
    {
        return Some(CompactionReason::LowEphemeralSpace);
    }
    if inputs.fragmentation_ratio() >= tuning.fragmentation_ratio
        && inputs.free_bytes >= tuning.fragmentation_min_bytes
        && inputs.pinned_density() <= tuning.pinned_density_limit
    {
        return Some(CompactionReason::HighFragmentation);
    }
    if inputs.full
        && inputs.large_fragmentation_ratio() >= tuning.large_fragmentation_ratio
        && inputs.large_free_bytes >= tuning.fragmentation_min_bytes
    {
        return Some(CompactionReason::LargeObjectFragmentation);
    }
    None
}

/// 单个段的清除结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    /// 新的分配指针
    pub allocated: Address,
    /// 空闲链表
    pub free_spans: Vec<FreeSpan>,
    /// 存活字节
    pub live_bytes: usize,
}

/// 按存活对象位置计算段的空闲链表
pub fn plan_sweep(segment: &HeapSegment, space: &ObjectSpace) -> SweepPlan {
    let mut cursor = segment.start();
    let mut free_spans = Vec::new();
    let mut live_bytes = 0;
    for (addr, record) in space.starting_in(segment.start(), segment.allocated()) {
        if addr > cursor {
            let gap = addr.distance_from(cursor);
            if gap >= MIN_OBJECT_SIZE {
                free_spans.push(FreeSpan { start: cursor, size: gap });
            }
        }
        cursor = cursor.max(addr.offset(record.size));
        live_bytes += record.size;
    }
    SweepPlan {
        allocated: cursor,
        free_spans,
        live_bytes,
    }
}

/// 压缩计划
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// 旧地址 → 新地址
    pub forwarding: HashMap<Address, Address>,
    /// 移动字节
    pub moved_bytes: usize,
}

impl CompactionPlan {
    /// 移动对象数
    pub fn moved_objects(&self) -> usize {
        self.forwarding.len()
    }
}

/// 清除/压缩器
#[derive(Debug, Default)]
pub struct SweepCompactor {
    next_sweep_obj: Address,
    swept_objects: u64,
}

impl SweepCompactor {
    /// 新建
    pub fn new() -> Self {
        Self::default()
    }

    /// 后台清除游标
    pub fn next_sweep_obj(&self) -> Address {
        self.next_sweep_obj
    }

    /// 设置后台清除游标
    pub fn set_next_sweep_obj(&mut self, addr: Address) {
        self.next_sweep_obj = addr;
    }

    /// 累计清除对象数
    pub fn swept_objects(&self) -> u64 {
        self.swept_objects
    }

    /// 移除死亡对象
    pub fn sweep_dead<F>(&mut self, space: &mut ObjectSpace, is_dead: F) -> Vec<(Address, ObjectRecord)>
    where
        F: FnMut(Address, &ObjectRecord) -> bool,
    {
        let dead = space.remove_where(is_dead);
        self.swept_objects += dead.len() as u64;
        dead
    }

    /// 重建段的空闲链表与分配指针
    pub fn rebuild_segment(&mut self, segment: &mut HeapSegment, space: &ObjectSpace) -> SweepPlan {
        let plan = plan_sweep(segment, space);
        segment.reset(plan.allocated, plan.free_spans.clone());
        plan
    }

    /// 为一个段计算滑动压缩，结果并入 `plan`
    pub fn plan_segment<F>(
        &self,
        segment: &HeapSegment,
        space: &ObjectSpace,
        movable: F,
        plan: &mut CompactionPlan,
    ) where
        F: Fn(Address, &ObjectRecord) -> bool,
    {
        let mut cursor = segment.start();
        for (addr, record) in space.starting_in(segment.start(), segment.allocated()) {
            if movable(addr, record) {
                if cursor < addr {
                    plan.forwarding.insert(addr, cursor);
                    plan.moved_bytes += record.size;
                }
                cursor = cursor.offset(record.size);
            } else {
                cursor = addr.offset(record.size);
            }
        }
    }

    /// 应用压缩：移动对象记录并改写所有引用槽
    pub fn apply_compaction(&mut self, plan: &CompactionPlan, space: &mut ObjectSpace) {
        if plan.forwarding.is_empty() {
            return;
        }
        let moved: Vec<(Address, ObjectRecord)> = plan
            .forwarding
            .iter()
            .filter_map(|(&from, _)| space.remove(from).map(|r| (from, r)))
            .collect();
        for (from, record) in moved {
            if let Some(&to) = plan.forwarding.get(&from) {
                space.insert(to, record);
            }
        }
        for (_, record) in space.iter_mut() {
            for slot in record.refs.iter_mut() {
                if let Some(&to) = plan.forwarding.get(slot) {
                    *slot = to;
                }
            }
        }
    }
}
