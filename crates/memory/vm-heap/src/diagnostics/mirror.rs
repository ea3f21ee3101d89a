//! 诊断镜像
//!
//! 每个逻辑堆一份原子字镜像。回收器（单写者，持有状态锁）发布，
//! 读者不加锁：先后读取序号，序号为奇数或前后不一致说明读取期间有发布。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use super::catalogue::{CATALOGUE, FieldId, FieldShape, capacity_words};
use crate::object::Address;

const READ_ATTEMPTS: usize = 4;

#[derive(Debug)]
struct MirrorCell {
    len: AtomicUsize,
    words: Box<[AtomicU64]>,
    element_words: usize,
}

/// 一个逻辑堆的诊断镜像
#[derive(Debug)]
pub struct DiagnosticMirror {
    seq: AtomicU64,
    cycle_active: AtomicBool,
    cells: Vec<MirrorCell>,
}

impl DiagnosticMirror {
    /// 按目录分配存储；`oom_capacity` 决定 OOM 历史的容量
    pub fn new(oom_capacity: usize) -> Self {
        let cells = CATALOGUE
            .iter()
            .map(|d| {
                let capacity = capacity_words(d, oom_capacity);
                let (len, element_words) = match d.shape {
                    FieldShape::VarArray { element_words } => (0, element_words),
                    _ => (capacity, 1),
                };
                MirrorCell {
                    len: AtomicUsize::new(len),
                    words: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
                    element_words,
                }
            })
            .collect();
        Self {
            seq: AtomicU64::new(0),
            cycle_active: AtomicBool::new(false),
            cells,
        }
    }

    /// 开始一次发布；写者在 drop 时结束
    pub fn begin(&self) -> MirrorWriter<'_> {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        MirrorWriter { mirror: self }
    }

    /// 发布序号（偶数表示没有进行中的发布）
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// 标记后台周期是否进行中
    pub fn set_cycle_active(&self, active: bool) {
        self.cycle_active.store(active, Ordering::Release);
    }

    /// 后台周期是否进行中
    pub fn cycle_active(&self) -> bool {
        self.cycle_active.load(Ordering::Acquire)
    }

    /// 读取字段的字；第二个值表示读取期间没有发布
    pub fn load(&self, id: FieldId) -> (Vec<u64>, bool) {
        let cell = &self.cells[id.index()];
        let mut words = Vec::new();
        for _ in 0..READ_ATTEMPTS {
            let before = self.seq.load(Ordering::Acquire);
            let len = cell.len.load(Ordering::Relaxed).min(cell.words.len());
            words = cell.words[..len]
                .iter()
                .map(|w| w.load(Ordering::Relaxed))
                .collect();
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before % 2 == 0 && before == after {
                return (words, true);
            }
            std::hint::spin_loop();
        }
        (words, false)
    }
}

/// 发布守卫
#[derive(Debug)]
pub struct MirrorWriter<'a> {
    mirror: &'a DiagnosticMirror,
}

impl MirrorWriter<'_> {
    /// 写入单字字段
    pub fn set(&mut self, id: FieldId, value: u64) {
        if let Some(word) = self.mirror.cells[id.index()].words.first() {
            word.store(value, Ordering::Relaxed);
        }
    }

    /// 写入地址字段
    pub fn set_address(&mut self, id: FieldId, addr: Address) {
        self.set(id, addr.as_usize() as u64);
    }

    /// 写入布尔字段
    pub fn set_flag(&mut self, id: FieldId, value: bool) {
        self.set(id, u64::from(value));
    }

    /// 写入数组字段；超出容量的部分截断，变长数组按整元素截断
    pub fn set_array(&mut self, id: FieldId, values: &[u64]) {
        let cell = &self.mirror.cells[id.index()];
        let mut len = values.len().min(cell.words.len());
        len -= len % cell.element_words;
        for (word, value) in cell.words.iter().zip(&values[..len]) {
            word.store(*value, Ordering::Relaxed);
        }
        cell.len.store(len, Ordering::Relaxed);
    }
}

impl Drop for MirrorWriter<'_> {
    fn drop(&mut self) {
        self.mirror.seq.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_publish_and_load() {
        let mirror = DiagnosticMirror::new(4);
        {
            let mut w = mirror.begin();
            w.set(FieldId::GcIndex, 7);
            w.set_flag(FieldId::HeapAnalyzeSuccess, true);
            w.set_array(FieldId::OomInfo, &[1, 2, 3, 4, 5, 6, 7]);
            // 写入期间读者看到不一致
            assert!(!mirror.load(FieldId::GcIndex).1);
        }
        assert_eq!(mirror.sequence(), 2);
        assert_eq!(mirror.load(FieldId::GcIndex), (vec![7], true));
        assert_eq!(mirror.load(FieldId::HeapAnalyzeSuccess).0, vec![1]);
        // 不足一个元素的尾部被丢弃
        assert_eq!(mirror.load(FieldId::OomInfo).0, vec![1, 2, 3, 4, 5]);
        assert_eq!(mirror.load(FieldId::CompactReasonsPerHeap).0, vec![0; 5]);
    }

    #[test]
    fn test_array_truncated_to_capacity() {
        let mirror = DiagnosticMirror::new(1);
        mirror.begin().set_array(FieldId::OomInfo, &[9; 20]);
        assert_eq!(mirror.load(FieldId::OomInfo).0.len(), 5);
    }

    #[test]
    fn test_concurrent_reader_never_sees_torn_consistent_value() {
        let mirror = Arc::new(DiagnosticMirror::new(4));
        let writer = {
            let mirror = Arc::clone(&mirror);
            thread::spawn(move || {
                for i in 0..2000u64 {
                    mirror.begin().set_array(FieldId::GenerationBudgets, &[i; 5]);
                }
            })
        };
        for _ in 0..2000 {
            let (words, consistent) = mirror.load(FieldId::GenerationBudgets);
            if consistent {
                assert!(words.windows(2).all(|w| w[0] == w[1]));
            }
        }
        writer.join().unwrap();
    }
}
