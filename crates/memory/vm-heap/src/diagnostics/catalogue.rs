//! 诊断字段目录
//!
//! 目录只追加不修改：字段按名称和类型寻址，新版本只在末尾增加条目。
//! 每个条目声明所需能力；能力缺失时读取结果为 `Missing`，而不是 0 或空指针。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{GcConfig, HeapLayout};

/// 目录版本；版本 1 为前 18 个字段
pub const CATALOGUE_VERSION: u32 = 2;

/// 内部根数组最多记录的条目
pub const MAX_INTERNAL_ROOTS: usize = 64;

/// 字段标识（即目录下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum FieldId {
    /// 当前分配指针
    AllocAllocated,
    /// 短暂段
    EphemeralHeapSegment,
    /// 终结队列
    FinalizeQueue,
    /// OOM 历史
    OomInfo,
    /// 关键数据点计数
    InterestingDataPerHeap,
    /// 压缩原因计数
    CompactReasonsPerHeap,
    /// 扩展机制计数
    ExpandMechanismsPerHeap,
    /// 机制位计数
    InterestingMechanismBitsPerHeap,
    /// 堆分析记录的根
    InternalRootArray,
    /// 根数组下标
    InternalRootArrayIndex,
    /// 堆分析是否成功
    HeapAnalyzeSuccess,
    /// 卡表
    CardTable,
    /// 后台标记位图
    MarkArray,
    /// 后台清除进度
    NextSweepObj,
    /// 后台周期最低地址
    BackgroundSavedLowestAddress,
    /// 后台周期最高地址
    BackgroundSavedHighestAddress,
    /// 后台清除开始时的短暂段
    SavedSweepEphemeralSeg,
    /// 后台清除开始时的短暂段分配指针
    SavedSweepEphemeralStart,
    /// 回收序号
    GcIndex,
    /// 标记阶段
    MarkPhase,
    /// 各代预算
    GenerationBudgets,
    /// 各代自上次回收以来的分配量
    GenerationAllocated,
    /// 段数量
    SegmentCount,
    /// 终结就绪条目数
    FinalizeReadyCount,
    /// 后台标记取消次数
    ConcurrentMarkAborts,
    /// OOM 总次数
    OomTotal,
}

impl FieldId {
    /// 字段总数
    pub const COUNT: usize = 26;

    /// 目录下标
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// 目录条目
    #[inline]
    pub fn descriptor(self) -> &'static FieldDescriptor {
        &CATALOGUE[self.index()]
    }
}

/// 类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// 对象地址
    Address,
    /// 无符号计数
    Size,
    /// 布尔
    Bool,
    /// 标记阶段
    Phase,
    /// 指向段
    SegmentRef,
    /// 指向终结队列
    FinalizeQueueRef,
    /// 指向卡表存储
    CardTableRef,
    /// 指向标记位图存储
    MarkArrayRef,
    /// OOM 事件（定长字组）
    OomEvent,
}

impl TypeTag {
    /// 名称
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Address => "address",
            TypeTag::Size => "size",
            TypeTag::Bool => "bool",
            TypeTag::Phase => "phase",
            TypeTag::SegmentRef => "segment*",
            TypeTag::FinalizeQueueRef => "finalize_queue*",
            TypeTag::CardTableRef => "card_table*",
            TypeTag::MarkArrayRef => "mark_array*",
            TypeTag::OomEvent => "oom_event",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 条目形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldShape {
    /// 直接值
    Direct,
    /// 指向堆内结构的指针
    Pointer,
    /// 定长数组
    FixedArray(usize),
    /// 变长数组，每个元素占 `element_words` 个字
    VarArray {
        /// 每元素字数
        element_words: usize,
    },
}

/// 能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// 启用后台回收
    BackgroundGc,
    /// 段布局（非区域）
    Segments,
}

/// 运行时能力集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// 后台回收
    pub background_gc: bool,
    /// 段布局
    pub segments: bool,
}

impl CapabilitySet {
    /// 由配置推导
    pub fn from_config(config: &GcConfig) -> Self {
        Self {
            background_gc: config.concurrent,
            segments: config.layout == HeapLayout::Segments,
        }
    }

    /// 是否具备某能力
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::BackgroundGc => self.background_gc,
            Capability::Segments => self.segments,
        }
    }

    /// 是否满足全部要求
    pub fn satisfies(&self, requires: &[Capability]) -> bool {
        requires.iter().all(|c| self.has(*c))
    }
}

/// 目录条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// 字段标识
    pub id: FieldId,
    /// 名称
    pub name: &'static str,
    /// 类型
    pub type_tag: TypeTag,
    /// 形态
    pub shape: FieldShape,
    /// 所需能力
    pub requires: &'static [Capability],
    /// 是否可能在读取过程中变化
    pub volatile: bool,
    /// 首次出现的目录版本
    pub since: u32,
}

const NONE: &[Capability] = &[];
const BGC: &[Capability] = &[Capability::BackgroundGc];
const SEG: &[Capability] = &[Capability::Segments];
const BGC_SEG: &[Capability] = &[Capability::BackgroundGc, Capability::Segments];

const fn field(
    id: FieldId,
    name: &'static str,
    type_tag: TypeTag,
    shape: FieldShape,
    requires: &'static [Capability],
    volatile: bool,
    since: u32,
) -> FieldDescriptor {
    FieldDescriptor {
        id,
        name,
        type_tag,
        shape,
        requires,
        volatile,
        since,
    }
}

use FieldShape::{Direct, FixedArray, Pointer};

/// 完整目录，按 `FieldId` 顺序排列
pub static CATALOGUE: [FieldDescriptor; FieldId::COUNT] = [
    field(FieldId::AllocAllocated, "alloc_allocated", TypeTag::Address, Direct, NONE, true, 1),
    field(FieldId::EphemeralHeapSegment, "ephemeral_heap_segment", TypeTag::SegmentRef, Pointer, SEG, false, 1),
    field(FieldId::FinalizeQueue, "finalize_queue", TypeTag::FinalizeQueueRef, Pointer, NONE, false, 1),
    field(
        FieldId::OomInfo,
        "oom_info",
        TypeTag::OomEvent,
        FieldShape::VarArray {
            element_words: crate::oom::OomEvent::WORDS,
        },
        NONE,
        false,
        1,
    ),
    field(FieldId::InterestingDataPerHeap, "interesting_data_per_heap", TypeTag::Size, FixedArray(6), NONE, false, 1),
    field(FieldId::CompactReasonsPerHeap, "compact_reasons_per_heap", TypeTag::Size, FixedArray(5), NONE, false, 1),
    field(FieldId::ExpandMechanismsPerHeap, "expand_mechanisms_per_heap", TypeTag::Size, FixedArray(7), NONE, false, 1),
    field(
        FieldId::InterestingMechanismBitsPerHeap,
        "interesting_mechanism_bits_per_heap",
        TypeTag::Size,
        FixedArray(5),
        NONE,
        false,
        1,
    ),
    field(
        FieldId::InternalRootArray,
        "internal_root_array",
        TypeTag::Address,
        FieldShape::VarArray { element_words: 1 },
        NONE,
        false,
        1,
    ),
    field(FieldId::InternalRootArrayIndex, "internal_root_array_index", TypeTag::Size, Direct, NONE, false, 1),
    field(FieldId::HeapAnalyzeSuccess, "heap_analyze_success", TypeTag::Bool, Direct, NONE, false, 1),
    field(FieldId::CardTable, "card_table", TypeTag::CardTableRef, Pointer, NONE, false, 1),
    field(FieldId::MarkArray, "mark_array", TypeTag::MarkArrayRef, Pointer, BGC, true, 1),
    field(FieldId::NextSweepObj, "next_sweep_obj", TypeTag::Address, Direct, BGC, true, 1),
    field(
        FieldId::BackgroundSavedLowestAddress,
        "background_saved_lowest_address",
        TypeTag::Address,
        Direct,
        BGC,
        true,
        1,
    ),
    field(
        FieldId::BackgroundSavedHighestAddress,
        "background_saved_highest_address",
        TypeTag::Address,
        Direct,
        BGC,
        true,
        1,
    ),
    field(FieldId::SavedSweepEphemeralSeg, "saved_sweep_ephemeral_seg", TypeTag::SegmentRef, Pointer, BGC_SEG, true, 1),
    field(
        FieldId::SavedSweepEphemeralStart,
        "saved_sweep_ephemeral_start",
        TypeTag::Address,
        Direct,
        BGC_SEG,
        true,
        1,
    ),
    field(FieldId::GcIndex, "gc_index", TypeTag::Size, Direct, NONE, false, 2),
    field(FieldId::MarkPhase, "mark_phase", TypeTag::Phase, Direct, NONE, true, 2),
    field(FieldId::GenerationBudgets, "generation_budgets", TypeTag::Size, FixedArray(5), NONE, false, 2),
    field(FieldId::GenerationAllocated, "generation_allocated", TypeTag::Size, FixedArray(5), NONE, true, 2),
    field(FieldId::SegmentCount, "segment_count", TypeTag::Size, Direct, NONE, false, 2),
    field(FieldId::FinalizeReadyCount, "finalize_ready_count", TypeTag::Size, Direct, NONE, false, 2),
    field(FieldId::ConcurrentMarkAborts, "concurrent_mark_aborts", TypeTag::Size, Direct, NONE, false, 2),
    field(FieldId::OomTotal, "oom_total", TypeTag::Size, Direct, NONE, false, 2),
];

/// 按名称查找
pub fn lookup(name: &str) -> Option<&'static FieldDescriptor> {
    CATALOGUE.iter().find(|d| d.name == name)
}

/// 某个字段在镜像中占用的字数
pub(crate) fn capacity_words(descriptor: &FieldDescriptor, oom_capacity: usize) -> usize {
    match descriptor.shape {
        FieldShape::Direct | FieldShape::Pointer => 1,
        FieldShape::FixedArray(n) => n,
        FieldShape::VarArray { element_words } => {
            let elements = match descriptor.id {
                FieldId::OomInfo => oom_capacity,
                _ => MAX_INTERNAL_ROOTS,
            };
            element_words * elements
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_order_matches_ids() {
        for (i, d) in CATALOGUE.iter().enumerate() {
            assert_eq!(d.id.index(), i, "{} out of place", d.name);
        }
        assert_eq!(CATALOGUE[0].name, "alloc_allocated");
        assert_eq!(CATALOGUE[17].name, "saved_sweep_ephemeral_start");
        assert!(CATALOGUE[..18].iter().all(|d| d.since == 1));
        assert!(CATALOGUE[18..].iter().all(|d| d.since == CATALOGUE_VERSION));
    }

    #[test]
    fn test_names_are_unique() {
        for d in &CATALOGUE {
            assert_eq!(lookup(d.name).map(|x| x.id), Some(d.id));
        }
        assert!(lookup("no_such_field").is_none());
    }

    #[test]
    fn test_capabilities() {
        let regions = CapabilitySet::from_config(&GcConfig::regions());
        assert!(!regions.segments);
        assert!(!regions.satisfies(FieldId::SavedSweepEphemeralSeg.descriptor().requires));
        assert!(!regions.satisfies(FieldId::EphemeralHeapSegment.descriptor().requires));
        assert!(regions.satisfies(FieldId::MarkArray.descriptor().requires));

        let blocking = CapabilitySet {
            background_gc: false,
            segments: true,
        };
        assert!(!blocking.satisfies(FieldId::NextSweepObj.descriptor().requires));
        assert!(blocking.satisfies(FieldId::EphemeralHeapSegment.descriptor().requires));
    }

    #[test]
    fn test_capacity_words() {
        assert_eq!(capacity_words(FieldId::OomInfo.descriptor(), 4), 20);
        assert_eq!(capacity_words(FieldId::InternalRootArray.descriptor(), 4), MAX_INTERNAL_ROOTS);
        assert_eq!(capacity_words(FieldId::ExpandMechanismsPerHeap.descriptor(), 4), 7);
        assert_eq!(capacity_words(FieldId::GcIndex.descriptor(), 4), 1);
    }
}
