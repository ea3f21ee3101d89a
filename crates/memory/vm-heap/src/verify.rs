//! 堆校验与堆分析
//!
//! 校验：对象互不重叠、位于所属段的已分配范围内、所有引用都指向存活对象。
//! 分析：从根出发遍历可达对象（不触碰标记位），记录根数组供诊断读取。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::object::{Address, ObjectSpace};
use crate::segment::SegmentAllocator;

/// 校验整个对象空间；`allocators` 以堆下标索引
pub fn verify_heap(space: &ObjectSpace, allocators: &[&SegmentAllocator]) -> GcResult<()> {
    let mut prev_end = Address::NULL;
    for (addr, record) in space.iter() {
        if addr < prev_end {
            return Err(GcError::invariant(format!(
                "object {addr} overlaps the previous object ending at {prev_end}"
            )));
        }
        let end = addr.offset(record.size);
        prev_end = end;

        let allocator = allocators.get(record.heap).ok_or_else(|| {
            GcError::invariant(format!("object {addr} names unknown heap {}", record.heap))
        })?;
        let segment = allocator.get(record.segment).map_err(|_| {
            GcError::invariant(format!(
                "object {addr} names a released segment {}",
                record.segment.0
            ))
        })?;
        if addr < segment.start() || end > segment.allocated() {
            return Err(GcError::invariant(format!(
                "object {addr}..{end} lies outside segment {} ({}..{})",
                record.segment.0,
                segment.start(),
                segment.allocated()
            )));
        }
        if let Some(target) = record.references().find(|t| !space.contains(*t)) {
            return Err(GcError::invariant(format!(
                "object {addr} references {target}, which is not a live object"
            )));
        }
    }
    Ok(())
}

/// 堆分析结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapAnalysis {
    /// 分析是否成功（可达对象的引用全部有效）
    pub success: bool,
    /// 记录的根（截断到容量）
    pub roots: Vec<Address>,
    /// 根总数
    pub root_count: usize,
    /// 可达对象数
    pub reachable_objects: usize,
    /// 可达字节数
    pub reachable_bytes: usize,
    /// 不可达对象数
    pub unreachable_objects: usize,
    /// 失败原因
    pub error: Option<String>,
}

/// 从根遍历可达对象
pub fn analyze_heap(space: &ObjectSpace, roots: &[Address], max_recorded_roots: usize) -> HeapAnalysis {
    let mut analysis = HeapAnalysis {
        success: true,
        roots: roots.iter().copied().take(max_recorded_roots).collect(),
        root_count: roots.len(),
        ..HeapAnalysis::default()
    };

    let mut seen = HashSet::new();
    let mut stack: Vec<Address> = roots.to_vec();
    while let Some(addr) = stack.pop() {
        if !seen.insert(addr) {
            continue;
        }
        let Some(record) = space.get(addr) else {
            analysis.success = false;
            analysis.error = Some(format!("dangling reference to {addr}"));
            continue;
        };
        analysis.reachable_objects += 1;
        analysis.reachable_bytes += record.size;
        stack.extend(record.references());
    }
    analysis.unreachable_objects = space.len().saturating_sub(analysis.reachable_objects);
    analysis
}
