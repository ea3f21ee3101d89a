//! 卡表（Card Table）
//!
//! 整个托管地址空间按 2 的幂大小划分为卡片，每张卡片一个原子字节。
//! 写屏障在老对象写入指向更年轻对象的引用时以 Release CAS 置脏，
//! 回收器以 Acquire 读取，保证扫描能看到屏障之前的写入。
//! 后台标记期间同一结构还用作写监视表，记录所有引用写入。

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::object::Address;

/// 卡表
#[derive(Debug)]
pub struct CardTable {
    /// 卡表数据
    cards: Vec<AtomicU8>,
    /// 覆盖的起始地址
    base: usize,
    /// 覆盖的字节数
    covered: usize,
    /// 每张卡片覆盖的字节数（2 的幂）
    card_size: usize,
    /// log2(card_size)
    card_size_shift: u32,
    /// 脏卡片数量
    dirty_count: AtomicU64,
}

impl CardTable {
    /// 创建覆盖 [base, base + covered) 的卡表
    pub fn new(base: Address, covered: usize, card_size: usize) -> Self {
        assert!(
            card_size.is_power_of_two(),
            "card_size must be a power of 2"
        );
        let num_cards = covered.div_ceil(card_size);
        Self {
            cards: (0..num_cards).map(|_| AtomicU8::new(0)).collect(),
            base: base.as_usize(),
            covered,
            card_size,
            card_size_shift: card_size.trailing_zeros(),
            dirty_count: AtomicU64::new(0),
        }
    }

    /// 地址对应的卡片下标
    #[inline]
    pub fn card_index(&self, addr: Address) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base)?;
        if offset >= self.covered {
            return None;
        }
        Some(offset >> self.card_size_shift)
    }

    /// 卡片覆盖的地址区间
    #[inline]
    pub fn card_bounds(&self, index: usize) -> (Address, Address) {
        let start = self.base + (index << self.card_size_shift);
        (Address(start), Address(start + self.card_size))
    }

    /// 置脏（lock-free）；返回是否由本次调用置脏
    #[inline]
    pub fn mark_dirty(&self, addr: Address) -> bool {
        let Some(idx) = self.card_index(addr) else {
            return false;
        };
        let card = &self.cards[idx];
        if card.load(Ordering::Relaxed) != 0 {
            return false;
        }
        match card.compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => {
                self.dirty_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// 地址所在卡片是否为脏
    #[inline]
    pub fn is_dirty(&self, addr: Address) -> bool {
        self.card_index(addr)
            .map(|idx| self.is_card_dirty(idx))
            .unwrap_or(false)
    }

    /// 卡片是否为脏
    #[inline]
    pub fn is_card_dirty(&self, index: usize) -> bool {
        self.cards
            .get(index)
            .map(|c| c.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// [start, end) 内的脏卡片下标
    pub fn dirty_cards_in(&self, start: Address, end: Address) -> Vec<usize> {
        let Some(first) = self.card_index(start) else {
            return Vec::new();
        };
        let last = self
            .card_index(Address(end.as_usize().saturating_sub(1)))
            .unwrap_or(self.cards.len() - 1);
        (first..=last).filter(|&i| self.is_card_dirty(i)).collect()
    }

    /// 清除一张卡片；返回之前是否为脏
    pub fn clear_card(&self, index: usize) -> bool {
        let Some(card) = self.cards.get(index) else {
            return false;
        };
        if card.swap(0, Ordering::AcqRel) != 0 {
            self.dirty_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// 清除 [start, end) 覆盖的卡片
    pub fn clear_range(&self, start: Address, end: Address) {
        for idx in self.dirty_cards_in(start, end) {
            self.clear_card(idx);
        }
    }

    /// 清除所有脏标记
    pub fn clear_all(&self) {
        for card in &self.cards {
            card.store(0, Ordering::Release);
        }
        self.dirty_count.store(0, Ordering::Relaxed);
    }

    /// 所有脏卡片的下标区间
    pub fn dirty_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = None;

        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Acquire) != 0 {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(s) = start.take() {
                ranges.push(s..i);
            }
        }
        if let Some(s) = start {
            ranges.push(s..self.cards.len());
        }
        ranges
    }

    /// 所有脏卡片下标
    pub fn dirty_cards(&self) -> Vec<usize> {
        self.dirty_ranges().into_iter().flatten().collect()
    }

    /// 脏卡片数量
    #[inline]
    pub fn dirty_count(&self) -> u64 {
        self.dirty_count.load(Ordering::Relaxed)
    }

    /// 卡片总数
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// 每张卡片大小
    pub fn card_size(&self) -> usize {
        self.card_size
    }

    /// 卡表存储的位置，供诊断导出
    pub fn storage_address(&self) -> usize {
        self.cards.as_ptr() as usize
    }

    /// 统计信息
    pub fn stats(&self) -> CardTableStats {
        CardTableStats {
            total_cards: self.cards.len(),
            dirty_cards: self.dirty_count(),
            card_size: self.card_size,
            covered_bytes: self.covered,
        }
    }
}

/// 卡表统计信息
#[derive(Debug, Clone, Copy)]
pub struct CardTableStats {
    /// 总卡片数
    pub total_cards: usize,
    /// 脏卡片数
    pub dirty_cards: u64,
    /// 每张卡片大小（字节）
    pub card_size: usize,
    /// 覆盖字节数
    pub covered_bytes: usize,
}

impl CardTableStats {
    /// 脏卡片占比
    pub fn dirty_ratio(&self) -> f64 {
        if self.total_cards == 0 {
            return 0.0;
        }
        self.dirty_cards as f64 / self.total_cards as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Address = Address(0x10_0000);

    #[test]
    fn test_card_table_creation() {
        let table = CardTable::new(BASE, 1024 * 1024, 256);
        assert_eq!(table.len(), 4096);
        assert_eq!(table.dirty_count(), 0);
        assert_eq!(table.card_size(), 256);
    }

    #[test]
    fn test_mark_dirty_relative_to_base() {
        let table = CardTable::new(BASE, 1024, 256);
        assert!(table.mark_dirty(BASE.offset(300)));
        assert!(table.is_dirty(BASE.offset(256)));
        assert!(!table.is_dirty(BASE));
        // 覆盖范围之外
        assert!(!table.mark_dirty(Address(0x10)));
        assert!(!table.mark_dirty(BASE.offset(1024)));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_mark_same_card_twice() {
        let table = CardTable::new(BASE, 1024, 256);
        assert!(table.mark_dirty(BASE.offset(10)));
        assert!(!table.mark_dirty(BASE.offset(20)));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_dirty_cards_in_and_clear() {
        let table = CardTable::new(BASE, 4096, 256);
        table.mark_dirty(BASE.offset(512));
        table.mark_dirty(BASE.offset(1024));
        table.mark_dirty(BASE.offset(3000));

        assert_eq!(table.dirty_cards_in(BASE, BASE.offset(1100)), vec![2, 4]);
        assert_eq!(table.card_bounds(2), (BASE.offset(512), BASE.offset(768)));

        table.clear_range(BASE, BASE.offset(1100));
        assert_eq!(table.dirty_count(), 1);
        assert!(table.clear_card(11));
        assert!(!table.clear_card(11));
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_dirty_ranges() {
        let table = CardTable::new(BASE, 4096, 512);
        table.mark_dirty(BASE.offset(1024));
        table.mark_dirty(BASE.offset(1536));
        table.mark_dirty(BASE.offset(2048));
        assert_eq!(table.dirty_ranges(), vec![2..5]);
        assert_eq!(table.dirty_cards(), vec![2, 3, 4]);
    }

    #[test]
    fn test_concurrent_marking() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(CardTable::new(BASE, 1024 * 1024, 256));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..100 {
                        // 相邻线程有一半卡片重叠
                        table.mark_dirty(BASE.offset((t * 50 + i) * 256));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.dirty_count(), 450);
        assert_eq!(table.dirty_cards().len(), 450);
    }

    #[test]
    fn test_stats() {
        let table = CardTable::new(BASE, 4096, 512);
        table.mark_dirty(BASE.offset(512));
        table.mark_dirty(BASE.offset(1024));
        table.mark_dirty(BASE.offset(1536));
        let stats = table.stats();
        assert_eq!(stats.total_cards, 8);
        assert_eq!(stats.dirty_cards, 3);
        assert!((stats.dirty_ratio() - 0.375).abs() < 0.001);
    }
}
