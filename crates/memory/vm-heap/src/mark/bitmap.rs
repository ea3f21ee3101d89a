//! 后台标记位图
//!
//! 覆盖 [low, high)，每 8 字节粒度一位。置位用 `fetch_or`（AcqRel），
//! 读取用 Acquire，后台线程与暂停中的回收器看到一致的标记。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::{Address, OBJECT_ALIGNMENT};

/// 标记位图
#[derive(Debug)]
pub struct MarkBitmap {
    low: usize,
    high: usize,
    words: Vec<AtomicU64>,
}

impl MarkBitmap {
    /// 覆盖 [low, high)
    pub fn new(low: Address, high: Address) -> Self {
        let span = high.as_usize().saturating_sub(low.as_usize());
        let bits = span.div_ceil(OBJECT_ALIGNMENT);
        Self {
            low: low.as_usize(),
            high: high.as_usize().max(low.as_usize()),
            words: (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn locate(&self, addr: Address) -> Option<(usize, u64)> {
        let a = addr.as_usize();
        if a < self.low || a >= self.high {
            return None;
        }
        let bit = (a - self.low) / OBJECT_ALIGNMENT;
        Some((bit / 64, 1u64 << (bit % 64)))
    }

    /// 是否覆盖该地址
    #[inline]
    pub fn covers(&self, addr: Address) -> bool {
        self.locate(addr).is_some()
    }

    /// 置位；返回是否由本次调用首次置位（覆盖范围外返回 false）
    #[inline]
    pub fn set(&self, addr: Address) -> bool {
        match self.locate(addr) {
            Some((word, mask)) => self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0,
            None => false,
        }
    }

    /// 是否已置位
    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.locate(addr)
            .map(|(word, mask)| self.words[word].load(Ordering::Acquire) & mask != 0)
            .unwrap_or(false)
    }

    /// 已置位数量
    pub fn marked_count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Acquire).count_ones()))
            .sum()
    }

    /// 清空
    pub fn clear(&self) {
        for w in &self.words {
            w.store(0, Ordering::Release);
        }
    }

    /// 位图存储的位置，供诊断导出
    pub fn storage_address(&self) -> usize {
        self.words.as_ptr() as usize
    }
}
