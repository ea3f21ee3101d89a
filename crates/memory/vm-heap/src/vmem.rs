//! 虚拟内存提供者
//!
//! 堆只通过 [`VirtualMemory`] 预留、提交、解除提交和释放地址区间。
//! [`SimulatedVirtualMemory`] 在一段模拟地址空间上记账，并支持注入失败，
//! 用于测试 OOM 路径。

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::object::{Address, align_up, checked_align_up};

/// 地址区间 [start, start + size)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// 起始地址
    pub start: Address,
    /// 字节数
    pub size: usize,
}

impl AddressRange {
    /// 新建区间
    pub fn new(start: Address, size: usize) -> Self {
        Self { start, size }
    }

    /// 结束地址（不含）
    #[inline]
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    /// 是否包含地址
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// 虚拟内存提供者接口
pub trait VirtualMemory: Send + Sync + fmt::Debug {
    /// 预留地址空间（不提交）
    fn reserve(&self, size: usize, alignment: usize) -> GcResult<AddressRange>;
    /// 提交区间
    fn commit(&self, range: AddressRange) -> GcResult<()>;
    /// 解除提交（保留预留）
    fn decommit(&self, range: AddressRange) -> GcResult<()>;
    /// 释放预留
    fn release(&self, range: AddressRange) -> GcResult<()>;
    /// 可管理的完整地址空间
    fn address_space(&self) -> AddressRange;
    /// 当前已提交字节
    fn committed_bytes(&self) -> usize;
}

#[derive(Debug)]
struct SimulatedState {
    next: usize,
    released: Vec<AddressRange>,
    reserved: usize,
    committed: usize,
    commit_limit: Option<usize>,
    failing_commits: usize,
    failing_reserves: usize,
}

/// 模拟虚拟内存
#[derive(Debug)]
pub struct SimulatedVirtualMemory {
    space: AddressRange,
    state: Mutex<SimulatedState>,
}

impl SimulatedVirtualMemory {
    /// 在 [base, base + size) 上创建
    pub fn new(base: Address, size: usize) -> Self {
        Self {
            space: AddressRange::new(base, size),
            state: Mutex::new(SimulatedState {
                next: base.as_usize(),
                released: Vec::new(),
                reserved: 0,
                committed: 0,
                commit_limit: None,
                failing_commits: 0,
                failing_reserves: 0,
            }),
        }
    }

    /// 设置提交上限（字节）
    pub fn set_commit_limit(&self, limit: Option<usize>) {
        self.state.lock().commit_limit = limit;
    }

    /// 让接下来的 `count` 次提交失败
    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().failing_commits = count;
    }

    /// 让接下来的 `count` 次预留失败
    pub fn fail_next_reserves(&self, count: usize) {
        self.state.lock().failing_reserves = count;
    }

    /// 当前已预留字节
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reserved
    }
}

impl VirtualMemory for SimulatedVirtualMemory {
    fn reserve(&self, size: usize, alignment: usize) -> GcResult<AddressRange> {
        let mut state = self.state.lock();
        if state.failing_reserves > 0 {
            state.failing_reserves -= 1;
            return Err(GcError::ReserveFailed { size });
        }

        // 先复用已释放的区间（首次适配）
        let fit = |r: &AddressRange| {
            let start = checked_align_up(r.start.as_usize(), alignment)?;
            let end = start.checked_add(size)?;
            (end <= r.end().as_usize()).then_some((start, end))
        };
        let reuse = state
            .released
            .iter()
            .enumerate()
            .find_map(|(idx, r)| fit(r).map(|(start, end)| (idx, start, end)));
        if let Some((idx, start, tail_start)) = reuse {
            let hole = state.released.swap_remove(idx);
            let head = start - hole.start.as_usize();
            if head > 0 {
                state.released.push(AddressRange::new(hole.start, head));
            }
            if tail_start < hole.end().as_usize() {
                state.released.push(AddressRange::new(
                    Address(tail_start),
                    hole.end().as_usize() - tail_start,
                ));
            }
            state.reserved += size;
            return Ok(AddressRange::new(Address(start), size));
        }

        let start = align_up(state.next, alignment);
        match start.checked_add(size) {
            Some(end) if end <= self.space.end().as_usize() => {
                state.next = end;
                state.reserved += size;
                Ok(AddressRange::new(Address(start), size))
            }
            _ => Err(GcError::ReserveFailed { size }),
        }
    }

    fn commit(&self, range: AddressRange) -> GcResult<()> {
        let mut state = self.state.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(GcError::CommitFailed {
                start: range.start,
                size: range.size,
            });
        }
        if let Some(limit) = state.commit_limit
            && state.committed + range.size > limit
        {
            return Err(GcError::CommitFailed {
                start: range.start,
                size: range.size,
            });
        }
        state.committed += range.size;
        Ok(())
    }

    fn decommit(&self, range: AddressRange) -> GcResult<()> {
        let mut state = self.state.lock();
        state.committed = state.committed.saturating_sub(range.size);
        Ok(())
    }

    fn release(&self, range: AddressRange) -> GcResult<()> {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(range.size);
        state.released.push(range);
        Ok(())
    }

    fn address_space(&self) -> AddressRange {
        self.space
    }

    fn committed_bytes(&self) -> usize {
        self.state.lock().committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_reserve_is_aligned_and_bounded() {
        let vm = SimulatedVirtualMemory::new(Address(0x1000_0000), 8 * MB);
        let a = vm.reserve(3 * MB, MB).unwrap();
        let b = vm.reserve(3 * MB, MB).unwrap();
        assert_eq!(a.start.as_usize() % MB, 0);
        assert!(b.start >= a.end());
        assert!(matches!(
            vm.reserve(4 * MB, MB),
            Err(GcError::ReserveFailed { .. })
        ));
        assert_eq!(vm.reserved_bytes(), 6 * MB);
    }

    #[test]
    fn test_release_is_reused() {
        let vm = SimulatedVirtualMemory::new(Address(0x1000_0000), 4 * MB);
        let a = vm.reserve(2 * MB, MB).unwrap();
        let _b = vm.reserve(2 * MB, MB).unwrap();
        vm.release(a).unwrap();
        let c = vm.reserve(MB, MB).unwrap();
        assert_eq!(c.start, a.start);
    }

    #[test]
    fn test_oversized_reserve_skips_released_holes() {
        let vm = SimulatedVirtualMemory::new(Address(0x1000_0000), 4 * MB);
        let a = vm.reserve(2 * MB, MB).unwrap();
        vm.release(a).unwrap();
        assert!(matches!(
            vm.reserve(usize::MAX - MB, MB),
            Err(GcError::ReserveFailed { .. })
        ));
        // 释放的区间仍可复用
        let b = vm.reserve(2 * MB, MB).unwrap();
        assert_eq!(b.start, a.start);
    }

    #[test]
    fn test_commit_failures() {
        let vm = SimulatedVirtualMemory::new(Address(0x1000_0000), 4 * MB);
        let a = vm.reserve(2 * MB, MB).unwrap();
        vm.fail_next_commits(1);
        assert!(vm.commit(a).is_err());
        assert!(vm.commit(a).is_ok());
        assert_eq!(vm.committed_bytes(), 2 * MB);

        vm.set_commit_limit(Some(3 * MB));
        let b = vm.reserve(2 * MB, MB).unwrap();
        assert!(vm.commit(b).is_err());
        vm.decommit(a).unwrap();
        assert!(vm.commit(b).is_ok());
    }
}
