//! 标记引擎
//!
//! 阶段：Idle → MarkRoots → Trace → (仅后台) FinalPause → Done。
//! 阻塞式标记使用对象自身的原子标记位，可在多个工作线程间并行追踪；
//! 部分回收（第 0/1 代）把脏卡片上老对象的引用作为额外的根。

pub mod background;
pub mod bitmap;

use serde::{Deserialize, Serialize};

use crate::card_table::CardTable;
use crate::object::{Address, Generation, ObjectSpace};

pub use background::{BackgroundBounds, BackgroundShared};
pub use bitmap::MarkBitmap;

/// 标记阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MarkPhase {
    /// 空闲
    Idle = 0,
    /// 扫描根
    MarkRoots = 1,
    /// 追踪
    Trace = 2,
    /// 最终暂停
    FinalPause = 3,
    /// 完成
    Done = 4,
}

impl MarkPhase {
    /// 从 u8 还原
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MarkPhase::MarkRoots,
            2 => MarkPhase::Trace,
            3 => MarkPhase::FinalPause,
            4 => MarkPhase::Done,
            _ => MarkPhase::Idle,
        }
    }
}

/// 卡片扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardScan {
    /// 从脏卡片得到的根
    pub seeds: Vec<Address>,
    /// 扫描过的卡片
    pub consumed: Vec<usize>,
    /// 不含指向被回收代引用的卡片
    pub false_positives: Vec<usize>,
}

/// 一次标记的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOutcome {
    /// 标记对象数
    pub marked_objects: usize,
    /// 标记字节数
    pub marked_bytes: usize,
    /// 扫描的脏卡片数
    pub cards_scanned: usize,
    /// 误报卡片数
    pub false_positive_cards: usize,
}

/// 标记引擎
#[derive(Debug)]
pub struct MarkEngine {
    phase: MarkPhase,
    workers: usize,
    parallel_threshold: usize,
}

impl MarkEngine {
    /// 创建
    pub fn new(workers: usize, parallel_threshold: usize) -> Self {
        Self {
            phase: MarkPhase::Idle,
            workers: workers.max(1),
            parallel_threshold,
        }
    }

    /// 当前阶段
    pub fn phase(&self) -> MarkPhase {
        self.phase
    }

    /// 设置阶段
    pub fn set_phase(&mut self, phase: MarkPhase) {
        self.phase = phase;
    }

    /// 阻塞式标记：调用者必须已暂停赋值器
    pub fn mark_blocking(
        &mut self,
        space: &ObjectSpace,
        roots: &[Address],
        condemned: Generation,
        cards: &CardTable,
        ranges: &[(Address, Address)],
    ) -> (MarkOutcome, CardScan) {
        self.phase = MarkPhase::MarkRoots;
        space.clear_marks();

        let mut seeds: Vec<Address> = roots.to_vec();
        let scan = if condemned.condemn_tier() < Generation::Gen2 {
            scan_cards(space, condemned, cards, ranges)
        } else {
            CardScan::default()
        };
        seeds.extend_from_slice(&scan.seeds);

        self.phase = MarkPhase::Trace;
        let (marked_objects, marked_bytes) = self.trace(space, seeds, condemned);
        self.phase = MarkPhase::Done;

        let outcome = MarkOutcome {
            marked_objects,
            marked_bytes,
            cards_scanned: scan.consumed.len(),
            false_positive_cards: scan.false_positives.len(),
        };
        log::debug!(
            "mark {:?}: {} objects ({} bytes), {} cards ({} false positives)",
            condemned,
            marked_objects,
            marked_bytes,
            outcome.cards_scanned,
            outcome.false_positive_cards
        );
        (outcome, scan)
    }

    /// 从 `seeds` 追踪被回收代的对象；返回 (新标记对象数, 字节数)
    pub fn trace(
        &self,
        space: &ObjectSpace,
        seeds: Vec<Address>,
        condemned: Generation,
    ) -> (usize, usize) {
        if self.workers == 1 || seeds.len() < self.parallel_threshold.max(2) {
            return trace_serial(space, seeds, condemned);
        }

        let chunk = seeds.len().div_ceil(self.workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = seeds
                .chunks(chunk)
                .map(|part| {
                    let part = part.to_vec();
                    scope.spawn(move || trace_serial(space, part, condemned))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(counts) => counts,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .fold((0, 0), |(o, b), (o2, b2)| (o + o2, b + b2))
        })
    }
}

/// 对象在阻塞式标记后是否存活
#[inline]
pub fn survives(space: &ObjectSpace, addr: Address, condemned: Generation) -> bool {
    space
        .get(addr)
        .map(|r| !r.generation.is_condemned_by(condemned) || r.is_marked())
        .unwrap_or(false)
}

fn trace_serial(
    space: &ObjectSpace,
    mut stack: Vec<Address>,
    condemned: Generation,
) -> (usize, usize) {
    let (mut objects, mut bytes) = (0, 0);
    while let Some(addr) = stack.pop() {
        let Some(record) = space.get(addr) else {
            continue;
        };
        if !record.generation.is_condemned_by(condemned) || !record.try_mark() {
            continue;
        }
        objects += 1;
        bytes += record.size;
        stack.extend(record.references());
    }
    (objects, bytes)
}

/// 扫描 `ranges` 内的脏卡片：未被回收的对象指向被回收代的引用成为根
pub fn scan_cards(
    space: &ObjectSpace,
    condemned: Generation,
    cards: &CardTable,
    ranges: &[(Address, Address)],
) -> CardScan {
    let mut scan = CardScan::default();
    for &(start, end) in ranges {
        for idx in cards.dirty_cards_in(start, end) {
            let (card_start, card_end) = cards.card_bounds(idx);
            let mut useful = false;
            for addr in space.overlapping(card_start, card_end) {
                let Some(record) = space.get(addr) else {
                    continue;
                };
                if record.generation.is_condemned_by(condemned) {
                    continue;
                }
                for target in record.references() {
                    if space
                        .get(target)
                        .is_some_and(|t| t.generation.is_condemned_by(condemned))
                    {
                        scan.seeds.push(target);
                        useful = true;
                    }
                }
            }
            if !useful {
                scan.false_positives.push(idx);
            }
            scan.consumed.push(idx);
        }
    }
    scan
}
