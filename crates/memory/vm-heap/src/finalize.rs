//! 终结队列
//!
//! 待终结条目按代分段、按分配顺序排列。标记结束后，不可达的条目
//! 移入就绪链表，由回收器重新标记为存活；就绪与正在执行的条目都是根。
//! 终结器在回收器锁之外执行，单个条目的失败不影响其它条目。

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::object::{Address, Generation};

/// 终结条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizableEntry {
    /// 对象地址
    pub object: Address,
    /// 登记时对象所在的代
    pub generation: Generation,
}

/// 终结统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationStats {
    /// 登记次数
    pub registered: u64,
    /// 撤销次数
    pub suppressed: u64,
    /// 移入就绪链表次数
    pub made_ready: u64,
}

/// 终结队列（每个逻辑堆一个）
#[derive(Debug, Default)]
pub struct FinalizationQueue {
    pending: [VecDeque<FinalizableEntry>; Generation::COUNT],
    ready: VecDeque<FinalizableEntry>,
    running: Vec<Address>,
    stats: FinalizationStats,
}

impl FinalizationQueue {
    /// 新建
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记对象
    pub fn register(&mut self, object: Address, generation: Generation) {
        self.pending[generation.index()].push_back(FinalizableEntry { object, generation });
        self.stats.registered += 1;
    }

    /// 撤销登记；返回是否找到
    pub fn suppress(&mut self, object: Address) -> bool {
        for queue in self.pending.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| e.object == object) {
                queue.remove(pos);
                self.stats.suppressed += 1;
                return true;
            }
        }
        false
    }

    /// 是否在待终结队列中
    pub fn is_registered(&self, object: Address) -> bool {
        self.pending
            .iter()
            .any(|q| q.iter().any(|e| e.object == object))
    }

    /// 将被回收代中不可达的条目移入就绪链表，按代内顺序；返回这些对象
    pub fn scan_unreachable<F>(&mut self, condemned: Generation, is_live: F) -> Vec<Address>
    where
        F: Fn(Address) -> bool,
    {
        let mut newly_ready = Vec::new();
        for g in Generation::ALL {
            if !g.is_condemned_by(condemned) {
                continue;
            }
            let queue = std::mem::take(&mut self.pending[g.index()]);
            let (dead, live): (VecDeque<_>, VecDeque<_>) =
                queue.into_iter().partition(|e| !is_live(e.object));
            self.pending[g.index()] = live;
            newly_ready.extend(dead.iter().map(|e| e.object));
            self.ready.extend(dead);
        }
        self.stats.made_ready += newly_ready.len() as u64;
        newly_ready
    }

    /// 按对象当前所在代重新分段，保持相对顺序（老条目在前）
    pub fn sync_generations<F>(&mut self, generation_of: F)
    where
        F: Fn(Address) -> Option<Generation>,
    {
        let order = [
            Generation::Gen2,
            Generation::Gen1,
            Generation::Gen0,
            Generation::Large,
            Generation::Pinned,
        ];
        let mut rebuilt: [VecDeque<FinalizableEntry>; Generation::COUNT] = Default::default();
        for g in order {
            for mut entry in std::mem::take(&mut self.pending[g.index()]) {
                let current = generation_of(entry.object).unwrap_or(entry.generation);
                entry.generation = current;
                rebuilt[current.index()].push_back(entry);
            }
        }
        self.pending = rebuilt;
    }

    /// 压缩后更新地址
    pub fn relocate(&mut self, forwarding: &HashMap<Address, Address>) {
        let entries = self
            .pending
            .iter_mut()
            .flat_map(|q| q.iter_mut())
            .chain(self.ready.iter_mut());
        for entry in entries {
            if let Some(&to) = forwarding.get(&entry.object) {
                entry.object = to;
            }
        }
        for obj in self.running.iter_mut() {
            if let Some(&to) = forwarding.get(obj) {
                *obj = to;
            }
        }
    }

    /// 就绪与正在执行的对象：作为根
    pub fn roots(&self) -> Vec<Address> {
        self.ready
            .iter()
            .map(|e| e.object)
            .chain(self.running.iter().copied())
            .collect()
    }

    /// 取出最多 `max` 个就绪条目，转为执行中
    pub fn take_ready(&mut self, max: usize) -> Vec<FinalizableEntry> {
        let n = max.min(self.ready.len());
        let batch: Vec<_> = self.ready.drain(..n).collect();
        self.running.extend(batch.iter().map(|e| e.object));
        batch
    }

    /// 条目执行结束（无论成败），对象不再被队列保活
    pub fn finish_running(&mut self, object: Address) {
        if let Some(pos) = self.running.iter().position(|o| *o == object) {
            self.running.swap_remove(pos);
        }
    }

    /// 正在执行终结器的对象
    pub fn running(&self) -> &[Address] {
        &self.running
    }

    /// 某代待终结条目数
    pub fn pending_count(&self, generation: Generation) -> usize {
        self.pending[generation.index()].len()
    }

    /// 待终结条目总数
    pub fn total_pending(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    /// 就绪条目数
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// 就绪链表（按顺序）
    pub fn ready_entries(&self) -> impl Iterator<Item = &FinalizableEntry> {
        self.ready.iter()
    }

    /// 统计
    pub fn stats(&self) -> &FinalizationStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_moves_to_ready_in_order() {
        let mut queue = FinalizationQueue::new();
        for i in 1..=4 {
            queue.register(Address(i * 0x100), Generation::Gen0);
        }
        queue.register(Address(0x900), Generation::Gen2);

        let ready = queue.scan_unreachable(Generation::Gen0, |a| a == Address(0x200));
        assert_eq!(ready, vec![Address(0x100), Address(0x300), Address(0x400)]);
        assert_eq!(queue.pending_count(Generation::Gen0), 1);
        // 未被回收的代不受影响
        assert_eq!(queue.pending_count(Generation::Gen2), 1);
        assert_eq!(queue.roots().len(), 3);
    }

    #[test]
    fn test_take_ready_and_finish() {
        let mut queue = FinalizationQueue::new();
        queue.register(Address(0x100), Generation::Gen0);
        queue.register(Address(0x200), Generation::Gen0);
        queue.scan_unreachable(Generation::Gen0, |_| false);

        let batch = queue.take_ready(1);
        assert_eq!(batch[0].object, Address(0x100));
        assert_eq!(queue.ready_count(), 1);
        assert_eq!(queue.roots().len(), 2);
        queue.finish_running(Address(0x100));
        assert_eq!(queue.roots(), vec![Address(0x200)]);
    }

    #[test]
    fn test_suppress_and_sync() {
        let mut queue = FinalizationQueue::new();
        queue.register(Address(0x100), Generation::Gen0);
        queue.register(Address(0x200), Generation::Gen0);
        queue.register(Address(0x300), Generation::Gen1);
        assert!(queue.suppress(Address(0x200)));
        assert!(!queue.suppress(Address(0x200)));

        queue.sync_generations(|a| Some(if a == Address(0x100) { Generation::Gen1 } else { Generation::Gen2 }));
        assert_eq!(queue.pending_count(Generation::Gen1), 1);
        assert_eq!(queue.pending_count(Generation::Gen2), 1);
        assert!(queue.is_registered(Address(0x100)));
    }

    #[test]
    fn test_relocate() {
        let mut queue = FinalizationQueue::new();
        queue.register(Address(0x100), Generation::Gen0);
        queue.register(Address(0x200), Generation::Gen0);
        queue.scan_unreachable(Generation::Gen0, |a| a == Address(0x100));
        let forwarding = HashMap::from([(Address(0x100), Address(0x40)), (Address(0x200), Address(0x80))]);
        queue.relocate(&forwarding);
        assert!(queue.is_registered(Address(0x40)));
        assert_eq!(queue.roots(), vec![Address(0x80)]);
    }
}
