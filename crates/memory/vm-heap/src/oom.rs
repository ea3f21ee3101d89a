//! OOM 诊断：固定容量环形缓冲
//!
//! 记录最近若干次分配失败的原因与上下文，插入 O(1)，满时淘汰最旧的事件。

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::object::Generation;

/// 分配失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OomReason {
    /// 超出硬性上限
    BudgetExceeded,
    /// 空闲空间足够但不连续
    Fragmentation,
    /// 地址空间耗尽
    AddressSpaceExhausted,
    /// 提交失败
    CommitFailed,
}

impl OomReason {
    /// 诊断编码
    pub fn code(self) -> u64 {
        match self {
            OomReason::BudgetExceeded => 1,
            OomReason::Fragmentation => 2,
            OomReason::AddressSpaceExhausted => 3,
            OomReason::CommitFailed => 4,
        }
    }

    /// 由诊断编码还原
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(OomReason::BudgetExceeded),
            2 => Some(OomReason::Fragmentation),
            3 => Some(OomReason::AddressSpaceExhausted),
            4 => Some(OomReason::CommitFailed),
            _ => None,
        }
    }
}

impl fmt::Display for OomReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OomReason::BudgetExceeded => "budget exceeded",
            OomReason::Fragmentation => "fragmentation",
            OomReason::AddressSpaceExhausted => "address space exhausted",
            OomReason::CommitFailed => "commit failed",
        };
        f.write_str(text)
    }
}

/// 一次分配失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OomEvent {
    /// 时间
    pub timestamp: DateTime<Utc>,
    /// 原因
    pub reason: OomReason,
    /// 请求字节
    pub requested_size: usize,
    /// 目标代
    pub generation: Generation,
    /// 失败时的回收序号
    pub gc_index: u64,
}

impl OomEvent {
    /// 诊断导出时每个事件占用的字数
    pub const WORDS: usize = 5;

    /// 新建（当前时间）
    pub fn new(reason: OomReason, requested_size: usize, generation: Generation, gc_index: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            reason,
            requested_size,
            generation,
            gc_index,
        }
    }

    /// 编码为诊断字
    pub fn encode(&self) -> [u64; Self::WORDS] {
        [
            self.reason.code(),
            self.requested_size as u64,
            self.generation.index() as u64,
            self.gc_index,
            self.timestamp.timestamp_millis() as u64,
        ]
    }

    /// 由诊断字解码
    pub fn decode(words: &[u64]) -> Option<Self> {
        let words: [u64; Self::WORDS] = words.try_into().ok()?;
        let [reason, size, generation, gc_index, millis] = words;
        Some(Self {
            timestamp: Utc.timestamp_millis_opt(millis as i64).single()?,
            reason: OomReason::from_code(reason)?,
            requested_size: size as usize,
            generation: Generation::from_index(generation as usize)?,
            gc_index,
        })
    }
}

/// OOM 历史环
#[derive(Debug, Clone)]
pub struct OomHistory {
    slots: Vec<Option<OomEvent>>,
    head: usize,
    len: usize,
    total: u64,
}

impl OomHistory {
    /// 指定容量创建
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
            total: 0,
        }
    }

    /// 记录事件
    pub fn record(&mut self, event: OomEvent) {
        let capacity = self.slots.len();
        self.slots[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        self.len = (self.len + 1).min(capacity);
        self.total += 1;
    }

    /// 从旧到新遍历
    pub fn iter(&self) -> impl Iterator<Item = &OomEvent> {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len).filter_map(move |i| self.slots[(start + i) % capacity].as_ref())
    }

    /// 最近一次事件
    pub fn latest(&self) -> Option<&OomEvent> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.slots.len();
        self.slots[(self.head + capacity - 1) % capacity].as_ref()
    }

    /// 当前事件数
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 容量
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 累计记录次数
    pub fn total_recorded(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(size: usize) -> OomEvent {
        OomEvent::new(OomReason::CommitFailed, size, Generation::Gen0, 0)
    }

    #[test]
    fn test_ring_keeps_latest() {
        let mut history = OomHistory::new(4);
        for size in 1..=6 {
            history.record(event(size));
        }
        let sizes: Vec<usize> = history.iter().map(|e| e.requested_size).collect();
        assert_eq!(sizes, vec![3, 4, 5, 6]);
        assert_eq!(history.latest().map(|e| e.requested_size), Some(6));
        assert_eq!(history.total_recorded(), 6);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_partial_fill() {
        let mut history = OomHistory::new(4);
        assert!(history.latest().is_none());
        history.record(event(10));
        history.record(event(20));
        let sizes: Vec<usize> = history.iter().map(|e| e.requested_size).collect();
        assert_eq!(sizes, vec![10, 20]);
    }

    #[test]
    fn test_encode_decode() {
        let e = OomEvent::new(OomReason::Fragmentation, 4096, Generation::Large, 7);
        let decoded = OomEvent::decode(&e.encode()).unwrap();
        assert_eq!(decoded.reason, OomReason::Fragmentation);
        assert_eq!(decoded.requested_size, 4096);
        assert_eq!(decoded.generation, Generation::Large);
        assert_eq!(decoded.gc_index, 7);
        assert_eq!(
            decoded.timestamp.timestamp_millis(),
            e.timestamp.timestamp_millis()
        );
        assert!(OomEvent::decode(&[0, 1, 2]).is_none());
    }
}
